use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::continuation::EscalationTicket;
use crate::errors::{AppError, AppResult};
use crate::platform::PlatformProfile;

pub const CONTACTS_SCOPE: &str = "https://www.googleapis.com/auth/contacts";
pub const AUTH_COMPLETE_MESSAGE: &str = "AUTH_COMPLETE";

pub const OUTCOME_PARAM: &str = "contactsAuth";
pub const TICKET_PARAM: &str = "ticketToken";
pub const SUBJECT_PARAM: &str = "subjectId";
const RETURN_PARAM: &str = "returnTo";
const MODE_PARAM: &str = "mode";
const SCOPE_PARAM: &str = "scope";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Denied,
}

impl AuthOutcome {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" | "granted" => Some(AuthOutcome::Success),
            "denied" | "cancelled" | "error" => Some(AuthOutcome::Denied),
            _ => None,
        }
    }
}

/// Result handed back by the identity provider, via URL parameters or a window message.
#[derive(Clone)]
pub struct ReturnSignal {
    pub outcome: AuthOutcome,
    pub token: Option<SecretString>,
    pub subject_id: Option<String>,
}

impl ReturnSignal {
    pub fn denied(subject_id: impl Into<String>) -> Self {
        Self {
            outcome: AuthOutcome::Denied,
            token: None,
            subject_id: Some(subject_id.into()),
        }
    }

    /// Reads the redirect-return parameters. `None` when the URL carries no outcome.
    pub fn from_url(url: &Url) -> Option<Self> {
        let mut outcome = None;
        let mut token = None;
        let mut subject_id = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                OUTCOME_PARAM => outcome = AuthOutcome::parse(&value),
                TICKET_PARAM if !value.is_empty() => {
                    token = Some(SecretString::new(value.into_owned().into()))
                }
                SUBJECT_PARAM if !value.is_empty() => subject_id = Some(value.into_owned()),
                _ => {}
            }
        }
        outcome.map(|outcome| Self {
            outcome,
            token,
            subject_id,
        })
    }
}

impl fmt::Debug for ReturnSignal {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ReturnSignal")
            .field("outcome", &self.outcome)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("subject_id", &self.subject_id)
            .finish()
    }
}

/// Returns `url` without the escalation return parameters.
pub fn strip_return_params(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| {
            !matches!(key.as_ref(), OUTCOME_PARAM | TICKET_PARAM | SUBJECT_PARAM)
        })
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut cleaned = url.clone();
    if kept.is_empty() {
        cleaned.set_query(None);
    } else {
        cleaned.query_pairs_mut().clear().extend_pairs(kept);
    }
    cleaned
}

/// Message posted to the opener window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMessage {
    pub origin: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthCompletePayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    subject_id: Option<String>,
}

/// Live message listener. Dropping it unregisters the listener on the host.
pub struct MessageSubscription {
    receiver: mpsc::UnboundedReceiver<WindowMessage>,
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl MessageSubscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<WindowMessage>,
        teardown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            teardown: Some(Box::new(teardown)),
        }
    }

    pub async fn recv(&mut self) -> Option<WindowMessage> {
        self.receiver.recv().await
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        self.receiver.close();
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

pub trait PopupWindow: Send + Sync {
    fn is_closed(&self) -> bool;
    fn close(&self);
}

/// The page or shell hosting the app.
pub trait BrowserHost: Send + Sync {
    fn user_agent(&self) -> String;
    fn window_available(&self) -> bool;
    fn current_url(&self) -> AppResult<Url>;
    /// `None` when the popup was blocked.
    fn open_popup(&self, url: &Url) -> Option<Arc<dyn PopupWindow>>;
    fn subscribe_messages(&self) -> MessageSubscription;
    /// Full navigation; the running process is expected to be torn down.
    fn navigate(&self, url: &Url) -> AppResult<()>;
    /// Rewrites the address bar without reloading.
    fn replace_url(&self, url: &Url) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStrategy {
    Popup,
    Redirect,
}

impl EscalationStrategy {
    fn mode(&self) -> &'static str {
        match self {
            EscalationStrategy::Popup => "popup",
            EscalationStrategy::Redirect => "redirect",
        }
    }
}

pub enum EscalationHandle {
    Popup(PopupWatch),
    Redirected,
}

impl EscalationHandle {
    pub fn strategy(&self) -> EscalationStrategy {
        match self {
            EscalationHandle::Popup(_) => EscalationStrategy::Popup,
            EscalationHandle::Redirected => EscalationStrategy::Redirect,
        }
    }
}

#[derive(Clone)]
pub struct Escalator {
    host: Arc<dyn BrowserHost>,
    auth_endpoint: Url,
    popup_return_url: String,
    app_origin: String,
    poll_interval: Duration,
}

impl Escalator {
    pub fn new(config: &AppConfig, host: Arc<dyn BrowserHost>) -> AppResult<Self> {
        let auth_endpoint = Url::parse(&config.auth_initiation_endpoint).map_err(|err| {
            AppError::Config(format!("invalid authorization endpoint: {err}"))
        })?;
        Ok(Self {
            host,
            auth_endpoint,
            popup_return_url: config.popup_return_url.clone(),
            app_origin: config.app_origin.clone(),
            poll_interval: config.popup_poll_interval(),
        })
    }

    pub fn host(&self) -> &Arc<dyn BrowserHost> {
        &self.host
    }

    pub fn authorization_url(
        &self,
        ticket: &EscalationTicket,
        strategy: EscalationStrategy,
        return_to: &str,
    ) -> Url {
        let mut url = self.auth_endpoint.clone();
        url.query_pairs_mut()
            .append_pair(TICKET_PARAM, ticket.auth_token.expose_secret())
            .append_pair(SUBJECT_PARAM, &ticket.subject_id)
            .append_pair(SCOPE_PARAM, CONTACTS_SCOPE)
            .append_pair(MODE_PARAM, strategy.mode())
            .append_pair(RETURN_PARAM, return_to);
        url
    }

    /// Sends the user to the identity provider. The ticket must already be persisted.
    pub fn begin(
        &self,
        ticket: &EscalationTicket,
        profile: &PlatformProfile,
    ) -> AppResult<EscalationHandle> {
        if profile.can_use_popup {
            // Listen before opening so an instant reply cannot be missed.
            let subscription = self.host.subscribe_messages();
            let url =
                self.authorization_url(ticket, EscalationStrategy::Popup, &self.popup_return_url);
            match self.host.open_popup(&url) {
                Some(popup) => {
                    info!(
                        target: "escalation",
                        subject = %ticket.subject_id,
                        "authorization popup opened"
                    );
                    return Ok(EscalationHandle::Popup(PopupWatch {
                        popup,
                        subscription,
                        expected_origin: self.app_origin.clone(),
                        subject_id: ticket.subject_id.clone(),
                        poll_interval: self.poll_interval,
                    }));
                }
                None => {
                    warn!(
                        target: "escalation",
                        "authorization popup blocked; falling back to redirect"
                    );
                    drop(subscription);
                }
            }
        }
        self.redirect(ticket)
    }

    fn redirect(&self, ticket: &EscalationTicket) -> AppResult<EscalationHandle> {
        let return_to = strip_return_params(&self.host.current_url()?);
        let url = self.authorization_url(ticket, EscalationStrategy::Redirect, return_to.as_str());
        info!(
            target: "escalation",
            subject = %ticket.subject_id,
            "redirecting to authorization endpoint"
        );
        self.host.navigate(&url)?;
        Ok(EscalationHandle::Redirected)
    }
}

/// An open authorization popup and the listener waiting on it.
pub struct PopupWatch {
    popup: Arc<dyn PopupWindow>,
    subscription: MessageSubscription,
    expected_origin: String,
    subject_id: String,
    poll_interval: Duration,
}

impl PopupWatch {
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Resolves on the first completion message or when the user closes the popup.
    pub async fn wait(mut self) -> ReturnSignal {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let signal = loop {
            tokio::select! {
                biased;
                message = self.subscription.recv() => match message {
                    Some(message) => {
                        if let Some(signal) = self.accept(message) {
                            break signal;
                        }
                    }
                    None => {
                        warn!(target: "escalation", "message channel closed before completion");
                        break ReturnSignal::denied(self.subject_id.clone());
                    }
                },
                _ = ticker.tick() => {
                    if self.popup.is_closed() {
                        info!(target: "escalation", "authorization popup closed without completing");
                        break ReturnSignal::denied(self.subject_id.clone());
                    }
                }
            }
        };

        let PopupWatch {
            popup,
            subscription,
            ..
        } = self;
        drop(subscription);
        if !popup.is_closed() {
            popup.close();
        }
        signal
    }

    fn accept(&self, message: WindowMessage) -> Option<ReturnSignal> {
        if message.origin.trim_end_matches('/') != self.expected_origin {
            debug!(target: "escalation", origin = %message.origin, "ignoring foreign-origin message");
            return None;
        }
        let payload: AuthCompletePayload = serde_json::from_value(message.data).ok()?;
        if payload.kind != AUTH_COMPLETE_MESSAGE {
            return None;
        }
        if let Some(subject) = &payload.subject_id {
            if subject != &self.subject_id {
                debug!(target: "escalation", "ignoring completion for another subject");
                return None;
            }
        }
        Some(ReturnSignal {
            outcome: if payload.success {
                AuthOutcome::Success
            } else {
                AuthOutcome::Denied
            },
            token: payload
                .token
                .filter(|t| !t.is_empty())
                .map(|t| SecretString::new(t.into())),
            subject_id: Some(payload.subject_id.unwrap_or_else(|| self.subject_id.clone())),
        })
    }
}
