pub mod commands;
pub mod config;
pub mod continuation;
pub mod errors;
pub mod escalation;
pub mod model;
pub mod orchestrator;
pub mod permission;
pub mod photo;
pub mod platform;
pub mod stores;
pub mod telemetry;
pub mod vcard;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::commands::RelayHealth;
use crate::config::AppConfig;
use crate::continuation::{ContinuationStore, SqliteContinuation};
use crate::errors::{AppError, AppResult};
use crate::escalation::{BrowserHost, Escalator};
use crate::orchestrator::{Collaborators, SaveOrchestrator};
use crate::permission::KeywordPermissionClassifier;
use crate::photo::HttpPhotoSource;
use crate::stores::{HttpPrimaryStore, PeopleContactsStore};
use crate::telemetry::TelemetryClient;
use crate::vcard::{FileDocumentOpener, PortableDocumentGenerator};

pub use crate::model::{ContactRecord, SaveOutcome, SaveReport, SocialEntry};

const EXPORTS_DIR: &str = "exports";

/// Application state handed to the command layer.
pub struct ContactRelay {
    config: AppConfig,
    orchestrator: SaveOrchestrator,
    telemetry: TelemetryClient,
    continuation_path: PathBuf,
    exports_dir: PathBuf,
}

impl ContactRelay {
    /// Builds the relay from environment configuration.
    pub fn initialize<P: AsRef<Path>>(data_dir: P, host: Arc<dyn BrowserHost>) -> AppResult<Self> {
        init_tracing();
        Self::with_config(AppConfig::from_env(), data_dir, host)
    }

    pub fn with_config<P: AsRef<Path>>(
        config: AppConfig,
        data_dir: P,
        host: Arc<dyn BrowserHost>,
    ) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let backend = SqliteContinuation::open(data_dir, &config.continuation_db_file)?;
        let continuation_path = backend.path().to_path_buf();
        let telemetry = TelemetryClient::new(data_dir, &config)?;
        let photos = HttpPhotoSource::new(&config)
            .map_err(|err| AppError::Config(format!("photo client unavailable: {err}")))?;
        let exports_dir = data_dir.join(EXPORTS_DIR);

        let orchestrator = SaveOrchestrator::new(
            &config,
            Collaborators {
                primary: Arc::new(HttpPrimaryStore::new(&config)?),
                secondary: Arc::new(PeopleContactsStore::new(&config)?),
                classifier: Arc::new(KeywordPermissionClassifier::new(&config.permission_keywords)),
                continuation: ContinuationStore::new(Arc::new(backend)),
                escalator: Escalator::new(&config, host)?,
                documents: PortableDocumentGenerator::new(&config, Arc::new(photos)),
                opener: Arc::new(FileDocumentOpener::new(&exports_dir)),
                telemetry: Some(telemetry.clone()),
            },
        );

        if let Err(err) = telemetry.record(
            "app_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "telemetry_enabled": config.telemetry_enabled_by_default,
            }),
        ) {
            warn!(?err, "failed to queue telemetry bootstrap event");
        }
        info!(
            target: "contact_relay",
            continuation = %continuation_path.display(),
            "contact relay ready"
        );

        Ok(Self {
            config,
            orchestrator,
            telemetry,
            continuation_path,
            exports_dir,
        })
    }

    pub fn orchestrator(&self) -> &SaveOrchestrator {
        &self.orchestrator
    }

    pub fn health(&self) -> AppResult<RelayHealth> {
        let ticket = self.orchestrator.continuation().read_ticket()?;
        Ok(RelayHealth {
            continuation_path: self.continuation_path.to_string_lossy().to_string(),
            exports_dir: self.exports_dir.to_string_lossy().to_string(),
            telemetry_buffer_path: self.telemetry.buffer_path().to_string_lossy().to_string(),
            telemetry_queue_depth: self.telemetry.queue_depth(),
            escalation_pending: ticket.is_some(),
            save_state: self.orchestrator.state().as_str().to_string(),
            config: self.config.public_profile(),
        })
    }

    pub fn record_telemetry_event(&self, name: String, payload: Value, flush: bool) -> AppResult<()> {
        self.telemetry.record(name, payload)?;
        if flush {
            self.telemetry.flush()?;
        }
        Ok(())
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,contact_relay_lib=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
