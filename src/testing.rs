//! In-process doubles for the host shell and the remote stores.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use crate::errors::{AppError, AppResult};
use crate::escalation::{BrowserHost, MessageSubscription, PopupWindow, WindowMessage};
use crate::model::{ContactRecord, SaveOutcome};
use crate::photo::{PhotoError, PhotoSource};
use crate::stores::{PrimaryStore, SecondarySaveOptions, SecondaryStore};
use crate::vcard::DocumentOpener;

type Listeners = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<WindowMessage>>>>;

pub struct FakeHost {
    user_agent: String,
    url: Mutex<Url>,
    pub window_available: AtomicBool,
    pub block_popups: AtomicBool,
    pub navigations: Mutex<Vec<Url>>,
    pub replacements: Mutex<Vec<Url>>,
    pub opened_popups: Mutex<Vec<Url>>,
    /// Runs inside `navigate`, before the page would unload.
    pub navigate_hook: Mutex<Option<Box<dyn Fn(&Url) + Send>>>,
    popups: Mutex<Vec<Arc<FakePopup>>>,
    listeners: Listeners,
    next_listener: AtomicU64,
}

impl FakeHost {
    pub fn new(user_agent: &str, url: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            url: Mutex::new(Url::parse(url).expect("valid test url")),
            window_available: AtomicBool::new(true),
            block_popups: AtomicBool::new(false),
            navigations: Mutex::new(Vec::new()),
            replacements: Mutex::new(Vec::new()),
            opened_popups: Mutex::new(Vec::new()),
            navigate_hook: Mutex::new(None),
            popups: Mutex::new(Vec::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Simulates the page being loaded again at `url`.
    pub fn load(&self, url: &str) {
        *self.url.lock() = Url::parse(url).expect("valid test url");
    }

    pub fn url(&self) -> Url {
        self.url.lock().clone()
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn post_message(&self, origin: &str, data: serde_json::Value) {
        for sender in self.listeners.lock().values() {
            let _ = sender.send(WindowMessage {
                origin: origin.to_string(),
                data: data.clone(),
            });
        }
    }

    pub fn last_popup(&self) -> Option<Arc<FakePopup>> {
        self.popups.lock().last().cloned()
    }
}

impl BrowserHost for FakeHost {
    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn window_available(&self) -> bool {
        self.window_available.load(Ordering::SeqCst)
    }

    fn current_url(&self) -> AppResult<Url> {
        Ok(self.url())
    }

    fn open_popup(&self, url: &Url) -> Option<Arc<dyn PopupWindow>> {
        if self.block_popups.load(Ordering::SeqCst) {
            return None;
        }
        self.opened_popups.lock().push(url.clone());
        let popup = Arc::new(FakePopup::default());
        self.popups.lock().push(popup.clone());
        Some(popup)
    }

    fn subscribe_messages(&self) -> MessageSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(id, sender);
        let listeners = Arc::clone(&self.listeners);
        MessageSubscription::new(receiver, move || {
            listeners.lock().remove(&id);
        })
    }

    fn navigate(&self, url: &Url) -> AppResult<()> {
        if let Some(hook) = self.navigate_hook.lock().as_ref() {
            hook(url);
        }
        self.navigations.lock().push(url.clone());
        Ok(())
    }

    fn replace_url(&self, url: &Url) -> AppResult<()> {
        self.replacements.lock().push(url.clone());
        *self.url.lock() = url.clone();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePopup {
    closed: AtomicBool,
}

impl PopupWindow for FakePopup {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakePrimary {
    outcome: SaveOutcome,
    calls: AtomicUsize,
    saved: Mutex<HashMap<String, ContactRecord>>,
}

impl FakePrimary {
    pub fn succeeding() -> Self {
        Self::with_outcome(SaveOutcome::ok())
    }

    pub fn failing(message: &str) -> Self {
        Self::with_outcome(SaveOutcome::failed(message))
    }

    fn with_outcome(outcome: SaveOutcome) -> Self {
        Self {
            outcome,
            calls: AtomicUsize::new(0),
            saved: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrimaryStore for FakePrimary {
    async fn save(&self, record: &ContactRecord, _auth_token: &SecretString) -> AppResult<SaveOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.outcome.success {
            self.saved
                .lock()
                .insert(record.subject_id.clone(), record.clone());
        }
        Ok(self.outcome.clone())
    }

    async fn load(
        &self,
        subject_id: &str,
        _auth_token: &SecretString,
    ) -> AppResult<Option<ContactRecord>> {
        Ok(self.saved.lock().get(subject_id).cloned())
    }
}

/// Replays scripted results in order, then succeeds.
#[derive(Default)]
pub struct FakeSecondary {
    script: Mutex<VecDeque<Result<SaveOutcome, String>>>,
    calls: Mutex<Vec<(String, SecondarySaveOptions)>>,
}

impl FakeSecondary {
    pub fn scripted<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<SaveOutcome, String>>,
    {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Token and options used for each call.
    pub fn call_log(&self) -> Vec<(String, SecondarySaveOptions)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SecondaryStore for FakeSecondary {
    async fn save(
        &self,
        _record: &ContactRecord,
        auth_token: &SecretString,
        options: SecondarySaveOptions,
    ) -> AppResult<SaveOutcome> {
        self.calls
            .lock()
            .push((auth_token.expose_secret().to_string(), options));
        match self.script.lock().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(AppError::Io(io::Error::new(io::ErrorKind::Other, message))),
            None => Ok(SaveOutcome::ok()),
        }
    }
}

/// Photo source with one scripted answer per tier.
#[derive(Clone, Default)]
pub struct ScriptedPhotos {
    bytes: Arc<Mutex<Option<Result<Vec<u8>, PhotoError>>>>,
    data_uri: Arc<Mutex<Option<Result<String, PhotoError>>>>,
    data_uri_calls: Arc<AtomicUsize>,
}

impl ScriptedPhotos {
    pub fn with_bytes(result: Result<Vec<u8>, PhotoError>) -> Self {
        let photos = Self::default();
        *photos.bytes.lock() = Some(result);
        photos
    }

    pub fn and_data_uri(self, result: Result<String, PhotoError>) -> Self {
        *self.data_uri.lock() = Some(result);
        self
    }

    pub fn data_uri_calls(&self) -> usize {
        self.data_uri_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhotoSource for ScriptedPhotos {
    async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, PhotoError> {
        self.bytes
            .lock()
            .take()
            .unwrap_or_else(|| Err(PhotoError::Http("unscripted".into())))
    }

    async fn fetch_data_uri(&self, _url: &str) -> Result<String, PhotoError> {
        self.data_uri_calls.fetch_add(1, Ordering::SeqCst);
        self.data_uri
            .lock()
            .take()
            .unwrap_or_else(|| Err(PhotoError::Http("unscripted".into())))
    }
}

#[derive(Default)]
pub struct RecordingOpener {
    pub documents: Mutex<Vec<(String, String)>>,
}

impl DocumentOpener for RecordingOpener {
    fn open_document(&self, file_name: &str, _mime: &str, contents: &str) -> AppResult<String> {
        self.documents
            .lock()
            .push((file_name.to_string(), contents.to_string()));
        Ok(format!("memory://{file_name}"))
    }
}
