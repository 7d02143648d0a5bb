use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

use crate::permission::DEFAULT_PERMISSION_KEYWORDS;

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_STALENESS_SECS: u64 = 30 * 60;
const DEFAULT_PHOTO_SOFT_LIMIT: usize = 200 * 1024;
const DEFAULT_PHOTO_HARD_LIMIT: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub primary_store_endpoint: String,
    pub people_api_base: String,
    pub auth_initiation_endpoint: String,
    pub popup_return_url: String,
    pub app_origin: String,
    pub escalation_staleness_secs: u64,
    pub popup_poll_interval_ms: u64,
    pub photo_fetch_timeout_secs: u64,
    pub photo_soft_limit_bytes: usize,
    pub photo_hard_limit_bytes: usize,
    pub permission_keywords: Vec<String>,
    pub continuation_db_file: String,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAppConfig {
    pub primary_store_endpoint: String,
    pub auth_initiation_endpoint: String,
    pub app_origin: String,
    pub escalation_staleness_secs: u64,
    pub popup_poll_interval_ms: u64,
    pub photo_fetch_timeout_secs: u64,
    pub photo_hard_limit_bytes: usize,
    pub permission_keyword_count: usize,
    pub telemetry_enabled_by_default: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let app_origin = env::var("APP_ORIGIN")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let base = Self::for_origin(&app_origin);
        Self {
            primary_store_endpoint: env::var("PRIMARY_STORE_ENDPOINT")
                .unwrap_or(base.primary_store_endpoint),
            people_api_base: env::var("PEOPLE_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(base.people_api_base),
            auth_initiation_endpoint: env::var("AUTH_INITIATION_ENDPOINT")
                .unwrap_or(base.auth_initiation_endpoint),
            popup_return_url: env::var("POPUP_RETURN_URL").unwrap_or(base.popup_return_url),
            escalation_staleness_secs: parse_u64(
                "ESCALATION_STALENESS_SECS",
                base.escalation_staleness_secs,
            )
            .max(1),
            popup_poll_interval_ms: parse_u64("POPUP_POLL_INTERVAL_MS", base.popup_poll_interval_ms)
                .max(10),
            photo_fetch_timeout_secs: parse_u64(
                "PHOTO_FETCH_TIMEOUT_SECS",
                base.photo_fetch_timeout_secs,
            )
            .max(1),
            photo_soft_limit_bytes: parse_usize("PHOTO_SOFT_LIMIT_BYTES", base.photo_soft_limit_bytes),
            photo_hard_limit_bytes: parse_usize("PHOTO_HARD_LIMIT_BYTES", base.photo_hard_limit_bytes),
            permission_keywords: parse_list("PERMISSION_KEYWORDS")
                .unwrap_or(base.permission_keywords),
            continuation_db_file: env::var("CONTINUATION_DB_FILE")
                .unwrap_or(base.continuation_db_file),
            telemetry_enabled_by_default: parse_bool(
                "TELEMETRY_ENABLED",
                base.telemetry_enabled_by_default,
            ),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", base.telemetry_batch_size)
                .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                base.telemetry_buffer_max_bytes,
            ),
            app_origin: base.app_origin,
        }
    }

    /// Built-in defaults with every endpoint rooted at `app_origin`.
    pub fn for_origin(app_origin: &str) -> Self {
        let app_origin = app_origin.trim_end_matches('/').to_string();
        Self {
            primary_store_endpoint: format!("{app_origin}/api/contacts"),
            people_api_base: "https://people.googleapis.com/v1".to_string(),
            auth_initiation_endpoint: format!("{app_origin}/auth/incremental"),
            popup_return_url: format!("{app_origin}/auth/popup-complete"),
            escalation_staleness_secs: DEFAULT_STALENESS_SECS,
            popup_poll_interval_ms: 500,
            photo_fetch_timeout_secs: 12,
            photo_soft_limit_bytes: DEFAULT_PHOTO_SOFT_LIMIT,
            photo_hard_limit_bytes: DEFAULT_PHOTO_HARD_LIMIT,
            permission_keywords: DEFAULT_PERMISSION_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            continuation_db_file: "continuation.db".to_string(),
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            app_origin,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            primary_store_endpoint: self.primary_store_endpoint.clone(),
            auth_initiation_endpoint: self.auth_initiation_endpoint.clone(),
            app_origin: self.app_origin.clone(),
            escalation_staleness_secs: self.escalation_staleness_secs,
            popup_poll_interval_ms: self.popup_poll_interval_ms,
            photo_fetch_timeout_secs: self.photo_fetch_timeout_secs,
            photo_hard_limit_bytes: self.photo_hard_limit_bytes,
            permission_keyword_count: self.permission_keywords.len(),
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
        }
    }

    /// Saturates at `Duration::MAX` for values chrono cannot represent.
    pub fn staleness_window(&self) -> chrono::Duration {
        i64::try_from(self.escalation_staleness_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn popup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.popup_poll_interval_ms)
    }

    pub fn photo_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.photo_fetch_timeout_secs)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
