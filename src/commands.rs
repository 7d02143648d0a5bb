use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PublicAppConfig;
use crate::model::{ContactRecord, SaveReport};
use crate::ContactRelay;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHealth {
    pub continuation_path: String,
    pub exports_dir: String,
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
    pub escalation_pending: bool,
    pub save_state: String,
    pub config: PublicAppConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveContactPayload {
    pub record: ContactRecord,
    pub auth_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEventPayload {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub flush: bool,
}

/// Saves a contact. A popup escalation is awaited here, so the report is
/// final unless the page is being redirected for authorization.
pub async fn save_contact(
    relay: &ContactRelay,
    payload: SaveContactPayload,
) -> Result<SaveReport, String> {
    let token = SecretString::new(payload.auth_token.into());
    let attempt = relay
        .orchestrator()
        .attempt_contact_save(&payload.record, &token)
        .await;
    Ok(match attempt.pending {
        Some(pending) => relay.orchestrator().complete_pending(pending).await,
        None => attempt.report,
    })
}

pub async fn retry_secondary_save(
    relay: &ContactRelay,
    payload: SaveContactPayload,
) -> Result<SaveReport, String> {
    let token = SecretString::new(payload.auth_token.into());
    Ok(relay
        .orchestrator()
        .retry_secondary_save(&payload.record, &token)
        .await)
}

/// Called once when the page loads, before any save gesture is handled.
pub async fn resume_escalation(relay: &ContactRelay) -> Result<Option<SaveReport>, String> {
    Ok(relay.orchestrator().resume_on_load().await)
}

pub async fn export_contact(relay: &ContactRelay, record: ContactRecord) -> Result<String, String> {
    Ok(relay.orchestrator().generate_portable_document(&record).await)
}

pub async fn relay_health(relay: &ContactRelay) -> Result<RelayHealth, String> {
    relay.health().map_err(|err| err.to_string())
}

pub async fn record_telemetry_event(
    relay: &ContactRelay,
    payload: TelemetryEventPayload,
) -> Result<(), String> {
    relay
        .record_telemetry_event(payload.name, payload.payload, payload.flush)
        .map_err(|err| err.to_string())
}

pub fn parse_save_payload(raw: &str) -> Result<SaveContactPayload, String> {
    serde_json::from_str(raw).map_err(|err| format!("invalid save payload: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_save_payload() {
        let payload = parse_save_payload(
            r#"{"record":{"subjectId":"s-1","displayName":"Sam Doe","photoUrl":"https://cdn.example/s.jpg"},"authToken":"tok"}"#,
        )
        .unwrap();
        assert_eq!(payload.record.subject_id, "s-1");
        assert_eq!(payload.record.photo_url.as_deref(), Some("https://cdn.example/s.jpg"));
        assert_eq!(payload.auth_token, "tok");

        assert!(parse_save_payload(r#"{"record":{}}"#)
            .err()
            .is_some_and(|err| err.starts_with("invalid save payload")));
    }

    #[test]
    fn telemetry_payload_defaults() {
        let payload: TelemetryEventPayload = serde_json::from_str(r#"{"name":"ui_opened"}"#).unwrap();
        assert_eq!(payload.name, "ui_opened");
        assert!(payload.payload.is_null());
        assert!(!payload.flush);
    }
}
