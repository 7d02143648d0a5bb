//! Two-phase contact save: the first-party store, then the address book.
//!
//! The primary store is called at most once per gesture and the secondary
//! store only after it succeeded. A permission failure on the secondary store
//! is routed by platform: escalate for the missing scope, export a vCard, or
//! report a retryable failure. Escalations park an [`EscalationTicket`] that is
//! consumed either by [`SaveOrchestrator::complete_pending`] (popup) or by
//! [`SaveOrchestrator::resume_on_load`] after a full redirect.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::continuation::{ContinuationStore, EscalationTicket};
use crate::escalation::{
    strip_return_params, AuthOutcome, EscalationHandle, EscalationStrategy, Escalator, PopupWatch,
    ReturnSignal,
};
use crate::model::{ContactRecord, FailureReason, SaveOutcome, SaveReport};
use crate::permission::PermissionClassifier;
use crate::platform::{PermissionRoute, PlatformProfile};
use crate::stores::{PrimaryStore, SecondarySaveOptions, SecondaryStore};
use crate::telemetry::TelemetryClient;
use crate::vcard::{file_name_for, DocumentOpener, PortableDocumentGenerator, VCARD_MIME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    PrimarySaving,
    PrimarySaved,
    SecondaryAttempting,
    SecondarySaved,
    EscalationPending,
    SecondaryFailedOther,
    Resolved,
}

impl SaveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveState::Idle => "idle",
            SaveState::PrimarySaving => "primary_saving",
            SaveState::PrimarySaved => "primary_saved",
            SaveState::SecondaryAttempting => "secondary_attempting",
            SaveState::SecondarySaved => "secondary_saved",
            SaveState::EscalationPending => "escalation_pending",
            SaveState::SecondaryFailedOther => "secondary_failed_other",
            SaveState::Resolved => "resolved",
        }
    }
}

impl fmt::Display for SaveState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub primary: Arc<dyn PrimaryStore>,
    pub secondary: Arc<dyn SecondaryStore>,
    pub classifier: Arc<dyn PermissionClassifier>,
    pub continuation: ContinuationStore,
    pub escalator: Escalator,
    pub documents: PortableDocumentGenerator,
    pub opener: Arc<dyn DocumentOpener>,
    pub telemetry: Option<TelemetryClient>,
}

/// Result of a user-initiated save. `pending` is set only while an
/// authorization popup is open; pass it to [`SaveOrchestrator::complete_pending`].
pub struct SaveAttempt {
    pub report: SaveReport,
    pub pending: Option<PendingEscalation>,
}

pub struct PendingEscalation {
    record: ContactRecord,
    primary: SaveOutcome,
    ticket: EscalationTicket,
    watch: PopupWatch,
}

impl PendingEscalation {
    pub fn subject_id(&self) -> &str {
        self.watch.subject_id()
    }
}

pub struct SaveOrchestrator {
    primary: Arc<dyn PrimaryStore>,
    secondary: Arc<dyn SecondaryStore>,
    classifier: Arc<dyn PermissionClassifier>,
    continuation: ContinuationStore,
    escalator: Escalator,
    documents: PortableDocumentGenerator,
    opener: Arc<dyn DocumentOpener>,
    telemetry: Option<TelemetryClient>,
    staleness_window: chrono::Duration,
    state: Mutex<SaveState>,
}

impl SaveOrchestrator {
    pub fn new(config: &AppConfig, parts: Collaborators) -> Self {
        Self {
            primary: parts.primary,
            secondary: parts.secondary,
            classifier: parts.classifier,
            continuation: parts.continuation,
            escalator: parts.escalator,
            documents: parts.documents,
            opener: parts.opener,
            telemetry: parts.telemetry,
            staleness_window: config.staleness_window(),
            state: Mutex::new(SaveState::Idle),
        }
    }

    pub fn state(&self) -> SaveState {
        *self.state.lock()
    }

    pub fn continuation(&self) -> &ContinuationStore {
        &self.continuation
    }

    /// Runs the primary save and, if it succeeds, the secondary save.
    pub async fn attempt_contact_save(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
    ) -> SaveAttempt {
        self.enter(SaveState::PrimarySaving);
        let primary = match self.primary.save(record, auth_token).await {
            Ok(outcome) => outcome,
            Err(err) => SaveOutcome::failed(err.to_string()),
        };
        if !primary.success {
            warn!(
                target: "save_orchestrator",
                subject = %record.subject_id,
                error = primary.error_message(),
                "primary save failed; secondary not attempted"
            );
            self.enter(SaveState::Resolved);
            return self.finish(record, SaveReport::primary_failed(primary), None);
        }
        self.enter(SaveState::PrimarySaved);

        self.enter(SaveState::SecondaryAttempting);
        let secondary = self
            .secondary_save(record, auth_token, SecondarySaveOptions::default())
            .await;
        if secondary.success {
            self.record_secondary(record, true, false, false);
            self.enter(SaveState::SecondarySaved);
            self.enter(SaveState::Resolved);
            return self.finish(record, SaveReport::secondary_saved(primary, secondary), None);
        }

        if !self.classifier.is_permission_error(secondary.error_message()) {
            self.record_secondary(record, false, false, false);
            self.enter(SaveState::SecondaryFailedOther);
            self.enter(SaveState::Resolved);
            let report = SaveReport::secondary_failed(primary, Some(secondary), FailureReason::Other);
            return self.finish(record, report, None);
        }
        self.record_secondary(record, false, true, false);

        let host = self.escalator.host();
        let profile = PlatformProfile::detect(&host.user_agent(), host.window_available());
        debug!(
            target: "save_orchestrator",
            os = ?profile.os_family,
            embedded = profile.is_embedded_shell,
            popup = profile.can_use_popup,
            "routing permission failure"
        );
        match profile.permission_route() {
            PermissionRoute::Escalate => {
                self.escalate(record, auth_token, primary, secondary, &profile)
            }
            PermissionRoute::ExportDocument => {
                let report = self.export_document(record, primary, secondary).await;
                self.enter(SaveState::Resolved);
                self.finish(record, report, None)
            }
            PermissionRoute::Upsell => {
                self.enter(SaveState::Resolved);
                let report =
                    SaveReport::secondary_failed(primary, Some(secondary), FailureReason::Permission);
                self.finish(record, report, None)
            }
        }
    }

    /// Waits for the authorization popup and finishes the deferred secondary save.
    pub async fn complete_pending(&self, pending: PendingEscalation) -> SaveReport {
        let PendingEscalation {
            record,
            primary,
            ticket,
            watch,
        } = pending;
        let signal = watch.wait().await;

        let current = match self.continuation.read_ticket() {
            Ok(current) => current,
            Err(err) => {
                warn!(target: "save_orchestrator", ?err, "continuation store unreadable");
                self.clear_ticket();
                None
            }
        };
        let owned = current.as_ref().is_some_and(|stored| {
            stored.subject_id == ticket.subject_id
                && stored.created_at.timestamp_millis() == ticket.created_at.timestamp_millis()
        });
        if !owned {
            info!(
                target: "save_orchestrator",
                subject = %record.subject_id,
                "escalation superseded before the popup finished"
            );
            self.enter(SaveState::Resolved);
            let report = SaveReport::secondary_failed(primary, None, FailureReason::Cancelled);
            return self.finish_subject(&record.subject_id, report);
        }

        self.resolve_ticket(ticket, Some(signal), Some(record), primary)
            .await
            .unwrap_or_else(|| {
                SaveReport::secondary_failed(SaveOutcome::ok(), None, FailureReason::Cancelled)
            })
    }

    /// Startup check for a redirect round trip. Returns a final report when a
    /// parked ticket was consumed, `None` when there is nothing to resume.
    pub async fn resume_on_load(&self) -> Option<SaveReport> {
        let signal = match self.escalator.host().current_url() {
            Ok(url) => {
                let signal = ReturnSignal::from_url(&url);
                let cleaned = strip_return_params(&url);
                if cleaned != url {
                    if let Err(err) = self.escalator.host().replace_url(&cleaned) {
                        warn!(target: "save_orchestrator", ?err, "failed to clean return url");
                    }
                }
                signal
            }
            Err(err) => {
                warn!(target: "save_orchestrator", ?err, "current url unavailable");
                None
            }
        };

        let ticket = match self.continuation.read_ticket() {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                if signal.is_some() {
                    debug!(target: "save_orchestrator", "return signal without a parked ticket");
                }
                return None;
            }
            Err(err) => {
                warn!(target: "save_orchestrator", ?err, "continuation store unreadable");
                return None;
            }
        };
        self.resolve_ticket(ticket, signal, None, SaveOutcome::ok())
            .await
    }

    /// One more secondary attempt after an upsell. Never escalates.
    pub async fn retry_secondary_save(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
    ) -> SaveReport {
        if let Ok(Some(ticket)) = self.continuation.read_ticket() {
            if ticket.subject_id == record.subject_id {
                self.clear_ticket();
            }
        }
        self.enter(SaveState::SecondaryAttempting);
        let report = self
            .final_secondary(record, auth_token, SaveOutcome::ok())
            .await;
        self.finish_subject(&record.subject_id, report)
    }

    pub async fn generate_portable_document(&self, record: &ContactRecord) -> String {
        self.documents.generate(record).await.to_text()
    }

    fn escalate(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
        primary: SaveOutcome,
        secondary: SaveOutcome,
        profile: &PlatformProfile,
    ) -> SaveAttempt {
        let ticket = EscalationTicket::new(auth_token.clone(), record.subject_id.clone());
        if let Err(err) = self.continuation.write_ticket(&ticket) {
            warn!(target: "save_orchestrator", ?err, "could not park escalation ticket");
            self.enter(SaveState::Resolved);
            let report =
                SaveReport::secondary_failed(primary, Some(secondary), FailureReason::Permission);
            return self.finish(record, report, None);
        }

        // A redirect tears the process down, so queued events go out first.
        if let Some(telemetry) = &self.telemetry {
            let intended = if profile.can_use_popup { "popup" } else { "redirect" };
            telemetry.escalation_started(&record.subject_id, intended);
            if let Err(err) = telemetry.flush() {
                warn!(target: "telemetry", ?err, "failed to flush before escalation");
            }
        }

        let handle = match self.escalator.begin(&ticket, profile) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "save_orchestrator", ?err, "escalation could not start");
                self.clear_ticket();
                self.enter(SaveState::Resolved);
                let report =
                    SaveReport::secondary_failed(primary, Some(secondary), FailureReason::Permission);
                return self.finish(record, report, None);
            }
        };
        self.enter(SaveState::EscalationPending);
        if handle.strategy() == EscalationStrategy::Redirect && profile.can_use_popup {
            debug!(target: "save_orchestrator", "popup blocked; escalation continued by redirect");
        }

        let report = SaveReport::pending(primary.clone(), secondary);
        let pending = match handle {
            EscalationHandle::Popup(watch) => Some(PendingEscalation {
                record: record.clone(),
                primary,
                ticket,
                watch,
            }),
            EscalationHandle::Redirected => None,
        };
        self.finish(record, report, pending)
    }

    async fn export_document(
        &self,
        record: &ContactRecord,
        primary: SaveOutcome,
        secondary: SaveOutcome,
    ) -> SaveReport {
        let document = self.documents.generate(record).await;
        match self
            .opener
            .open_document(&file_name_for(record), VCARD_MIME, &document.to_text())
        {
            Ok(location) => {
                info!(
                    target: "save_orchestrator",
                    subject = %record.subject_id,
                    "contact exported as vcard"
                );
                if let Some(telemetry) = &self.telemetry {
                    telemetry.document_exported(
                        &record.subject_id,
                        &format!("{:?}", document.photo()).to_lowercase(),
                    );
                }
                SaveReport::skipped(primary, secondary, Some(location))
            }
            Err(err) => {
                warn!(target: "save_orchestrator", ?err, "vcard hand-off failed");
                SaveReport::secondary_failed(primary, Some(secondary), FailureReason::Permission)
            }
        }
    }

    async fn resolve_ticket(
        &self,
        ticket: EscalationTicket,
        signal: Option<ReturnSignal>,
        record: Option<ContactRecord>,
        primary: SaveOutcome,
    ) -> Option<SaveReport> {
        let subject_id = ticket.subject_id.clone();
        let Some(signal) = signal else {
            if !ticket.is_stale(self.staleness_window, Utc::now()) {
                debug!(target: "save_orchestrator", "fresh ticket without return signal; leaving it");
                return None;
            }
            info!(target: "save_orchestrator", subject = %subject_id, "abandoned escalation ticket");
            return Some(self.abandon(&subject_id, primary, "stale"));
        };

        if signal
            .subject_id
            .as_deref()
            .is_some_and(|returned| returned != subject_id)
        {
            warn!(target: "save_orchestrator", "return signal for another subject");
            return Some(self.abandon(&subject_id, primary, "mismatch"));
        }

        match signal.outcome {
            AuthOutcome::Denied => {
                self.clear_ticket();
                self.note_resolution(&subject_id, "denied");
                self.enter(SaveState::Resolved);
                let report = SaveReport::secondary_failed(primary, None, FailureReason::Denied);
                Some(self.finish_subject(&subject_id, report))
            }
            AuthOutcome::Success => {
                self.clear_ticket();
                self.note_resolution(&subject_id, "success");
                let token = signal.token.unwrap_or(ticket.auth_token);
                let record = match record {
                    Some(record) => record,
                    None => match self.primary.load(&subject_id, &token).await {
                        Ok(Some(record)) => record,
                        Ok(None) | Err(_) => {
                            warn!(
                                target: "save_orchestrator",
                                subject = %subject_id,
                                "saved contact could not be reloaded for resume"
                            );
                            self.enter(SaveState::Resolved);
                            let report = SaveReport::secondary_failed(
                                primary,
                                Some(SaveOutcome::failed("contact could not be reloaded")),
                                FailureReason::Other,
                            );
                            return Some(self.finish_subject(&subject_id, report));
                        }
                    },
                };
                self.enter(SaveState::SecondaryAttempting);
                let report = self.final_secondary(&record, &token, primary).await;
                Some(self.finish_subject(&subject_id, report))
            }
        }
    }

    /// Secondary-only save whose outcome is final.
    async fn final_secondary(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
        primary: SaveOutcome,
    ) -> SaveReport {
        let secondary = self
            .secondary_save(record, auth_token, SecondarySaveOptions { only_secondary: true })
            .await;
        if secondary.success {
            self.record_secondary(record, true, false, true);
            self.enter(SaveState::SecondarySaved);
            self.enter(SaveState::Resolved);
            return SaveReport::secondary_saved(primary, secondary);
        }
        let permission = self.classifier.is_permission_error(secondary.error_message());
        self.record_secondary(record, false, permission, true);
        self.enter(SaveState::SecondaryFailedOther);
        self.enter(SaveState::Resolved);
        let reason = if permission {
            FailureReason::Permission
        } else {
            FailureReason::Other
        };
        SaveReport::secondary_failed(primary, Some(secondary), reason)
    }

    async fn secondary_save(
        &self,
        record: &ContactRecord,
        auth_token: &SecretString,
        options: SecondarySaveOptions,
    ) -> SaveOutcome {
        match self.secondary.save(record, auth_token, options).await {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => {
                warn!(
                    target: "save_orchestrator",
                    subject = %record.subject_id,
                    error = outcome.error_message(),
                    "secondary save rejected"
                );
                outcome
            }
            Err(err) => {
                warn!(
                    target: "save_orchestrator",
                    subject = %record.subject_id,
                    error = %err,
                    "secondary save failed"
                );
                SaveOutcome::failed(err.to_string())
            }
        }
    }

    fn abandon(&self, subject_id: &str, primary: SaveOutcome, why: &str) -> SaveReport {
        self.clear_ticket();
        self.note_resolution(subject_id, why);
        self.enter(SaveState::Resolved);
        let report = SaveReport::secondary_failed(primary, None, FailureReason::Cancelled);
        self.finish_subject(subject_id, report)
    }

    fn clear_ticket(&self) {
        if let Err(err) = self.continuation.clear_ticket() {
            warn!(target: "save_orchestrator", ?err, "failed to clear escalation ticket");
        }
    }

    fn enter(&self, next: SaveState) {
        let mut state = self.state.lock();
        debug!(
            target: "save_orchestrator",
            from = state.as_str(),
            to = next.as_str(),
            "state transition"
        );
        *state = next;
    }

    fn record_secondary(&self, record: &ContactRecord, success: bool, permission: bool, resumed: bool) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.secondary_result(&record.subject_id, success, permission, resumed);
        }
    }

    fn note_resolution(&self, subject_id: &str, outcome: &str) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.escalation_resolved(subject_id, outcome);
        }
    }

    fn finish(
        &self,
        record: &ContactRecord,
        report: SaveReport,
        pending: Option<PendingEscalation>,
    ) -> SaveAttempt {
        SaveAttempt {
            report: self.finish_subject(&record.subject_id, report),
            pending,
        }
    }

    fn finish_subject(&self, subject_id: &str, report: SaveReport) -> SaveReport {
        info!(
            target: "save_orchestrator",
            success = report.success,
            secondary = ?report.secondary_status,
            reason = report.reason.map(|r| r.as_str()),
            "save finished"
        );
        if let Some(telemetry) = &self.telemetry {
            telemetry.contact_save(subject_id, &report);
        }
        report
    }
}
