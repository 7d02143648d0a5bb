use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::model::SaveReport;

pub const BUFFER_FILE_NAME: &str = "telemetry-buffer.jsonl";

/// Buffered JSONL sink for save-flow events. Subjects are recorded as hashes.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<TelemetryEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(BUFFER_FILE_NAME);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: Value) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(TelemetryEvent::new(name.into(), payload));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    /// Like [`record`](Self::record) but only logs failures.
    pub fn note(&self, name: &str, payload: Value) {
        if let Err(err) = self.record(name, payload) {
            warn!(target: "telemetry", event = name, ?err, "failed to record telemetry event");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn contact_save(&self, subject_id: &str, report: &SaveReport) {
        self.note(
            "contact_save",
            json!({
                "subject": hash_subject(subject_id),
                "success": report.success,
                "secondaryStatus": report.secondary_status,
                "reason": report.reason.map(|r| r.as_str()),
                "upsell": report.upsell,
                "exported": report.exported_document.is_some(),
            }),
        );
    }

    pub fn secondary_result(&self, subject_id: &str, success: bool, permission: bool, resumed: bool) {
        self.note(
            "secondary_result",
            json!({
                "subject": hash_subject(subject_id),
                "success": success,
                "permission": permission,
                "resumed": resumed,
            }),
        );
    }

    pub fn escalation_started(&self, subject_id: &str, strategy: &str) {
        self.note(
            "escalation_started",
            json!({ "subject": hash_subject(subject_id), "strategy": strategy }),
        );
    }

    pub fn escalation_resolved(&self, subject_id: &str, outcome: &str) {
        self.note(
            "escalation_resolved",
            json!({ "subject": hash_subject(subject_id), "outcome": outcome }),
        );
    }

    pub fn document_exported(&self, subject_id: &str, photo: &str) {
        self.note(
            "document_exported",
            json!({ "subject": hash_subject(subject_id), "photo": photo }),
        );
    }

    fn persist_locked(&self, queue: &mut Vec<TelemetryEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for event in queue.iter() {
            let line = serde_json::to_vec(event)?;
            incoming += (line.len() + 1) as u64;
            encoded.push(line);
        }

        let current = fs::metadata(&self.buffer_path).map(|m| m.len()).unwrap_or(0);
        let mut options = OpenOptions::new();
        options.create(true);
        if current + incoming > self.max_file_bytes {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options.open(&self.buffer_path)?;
        for line in &encoded {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl TelemetryEvent {
    fn new(name: String, payload: Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}

pub fn hash_subject(subject_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"subject:");
    hasher.update(subject_id.as_bytes());
    STANDARD_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureReason, SaveOutcome};
    use tempfile::tempdir;

    fn config(batch_size: usize, max_bytes: u64) -> AppConfig {
        let mut config = AppConfig::for_origin("https://app.example");
        config.telemetry_batch_size = batch_size;
        config.telemetry_buffer_max_bytes = max_bytes;
        config
    }

    #[test]
    fn batches_until_threshold() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &config(2, 4096)).unwrap();
        client.record("first", json!({})).unwrap();
        assert_eq!(client.queue_depth(), 1);
        client.record("second", json!({})).unwrap();
        assert_eq!(client.queue_depth(), 0);

        let buffer = fs::read_to_string(client.buffer_path()).unwrap();
        assert_eq!(buffer.lines().count(), 2);
    }

    #[test]
    fn save_events_never_carry_raw_subject() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &config(1, 4096)).unwrap();
        let report = SaveReport::secondary_failed(
            SaveOutcome::ok(),
            Some(SaveOutcome::failed("403")),
            FailureReason::Denied,
        );
        client.contact_save("user-42@example.com", &report);

        let buffer = fs::read_to_string(client.buffer_path()).unwrap();
        assert!(buffer.contains("contact_save"));
        assert!(buffer.contains("\"reason\":\"denied\""));
        assert!(!buffer.contains("user-42@example.com"));
        assert!(buffer.contains(&hash_subject("user-42@example.com")));
    }

    #[test]
    fn truncates_when_buffer_would_overflow() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &config(1, 200)).unwrap();
        for idx in 0..10 {
            client
                .record("big", json!({ "payload": "0123456789abcdef0123456789abcdef", "idx": idx }))
                .unwrap();
        }
        let size = fs::metadata(client.buffer_path()).unwrap().len();
        assert!(size <= 200, "buffer grew to {size}");
        let buffer = fs::read_to_string(client.buffer_path()).unwrap();
        assert!(buffer.contains("\"idx\":9"));
    }

    #[test]
    fn disabled_client_drops_events() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &config(1, 4096)).unwrap();
        client.set_enabled(false);
        client.record("ignored", json!({})).unwrap();
        client.flush().unwrap();
        assert!(fs::read_to_string(client.buffer_path()).unwrap().is_empty());
    }
}
