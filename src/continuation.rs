use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::AppResult;

pub const TICKET_TOKEN_KEY: &str = "ticket.token";
pub const TICKET_SUBJECT_KEY: &str = "ticket.subjectId";
pub const TICKET_CREATED_AT_KEY: &str = "ticket.createdAt";

const TICKET_KEYS: [&str; 3] = [TICKET_TOKEN_KEY, TICKET_SUBJECT_KEY, TICKET_CREATED_AT_KEY];

/// A secondary save parked while the user grants the missing scope.
#[derive(Clone)]
pub struct EscalationTicket {
    pub auth_token: SecretString,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
}

impl EscalationTicket {
    pub fn new(auth_token: SecretString, subject_id: impl Into<String>) -> Self {
        Self {
            auth_token,
            subject_id: subject_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_stale(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > window
    }

    pub fn matches_token(&self, token: &str) -> bool {
        self.auth_token.expose_secret() == token
    }
}

impl fmt::Debug for EscalationTicket {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EscalationTicket")
            .field("auth_token", &"[REDACTED]")
            .field("subject_id", &self.subject_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Raw key/value area that survives a full page reload.
pub trait ContinuationBackend: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    /// Writes every entry or none of them.
    fn set_all(&self, entries: &[(&str, String)]) -> AppResult<()>;
    fn clear(&self, keys: &[&str]) -> AppResult<()>;
}

/// Sole owner of the ticket keys. At most one ticket exists at a time.
#[derive(Clone)]
pub struct ContinuationStore {
    backend: Arc<dyn ContinuationBackend>,
}

impl ContinuationStore {
    pub fn new(backend: Arc<dyn ContinuationBackend>) -> Self {
        Self { backend }
    }

    pub fn read_ticket(&self) -> AppResult<Option<EscalationTicket>> {
        let token = self.backend.get(TICKET_TOKEN_KEY)?;
        let subject = self.backend.get(TICKET_SUBJECT_KEY)?;
        let created = self.backend.get(TICKET_CREATED_AT_KEY)?;

        let ticket = match (token, subject, created) {
            (Some(token), Some(subject_id), Some(created)) => created
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|created_at| EscalationTicket {
                    auth_token: SecretString::new(token.into()),
                    subject_id,
                    created_at,
                }),
            (None, None, None) => return Ok(None),
            _ => None,
        };

        if ticket.is_none() {
            warn!(
                target: "continuation_store",
                "discarding incomplete escalation ticket"
            );
            self.clear_ticket()?;
        }
        Ok(ticket)
    }

    /// Replaces any outstanding ticket.
    pub fn write_ticket(&self, ticket: &EscalationTicket) -> AppResult<()> {
        if let Some(previous) = self.backend.get(TICKET_SUBJECT_KEY)? {
            debug!(
                target: "continuation_store",
                previous_subject = %previous,
                "overwriting outstanding escalation ticket"
            );
        }
        self.backend.set_all(&[
            (TICKET_TOKEN_KEY, ticket.auth_token.expose_secret().to_string()),
            (TICKET_SUBJECT_KEY, ticket.subject_id.clone()),
            (
                TICKET_CREATED_AT_KEY,
                ticket.created_at.timestamp_millis().to_string(),
            ),
        ])
    }

    pub fn clear_ticket(&self) -> AppResult<()> {
        self.backend.clear(&TICKET_KEYS)
    }
}

#[derive(Clone, Default)]
pub struct MemoryContinuation {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryContinuation {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }
}

impl ContinuationBackend for MemoryContinuation {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set_all(&self, entries: &[(&str, String)]) -> AppResult<()> {
        let mut store = self.entries.lock();
        for (key, value) in entries {
            store.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn clear(&self, keys: &[&str]) -> AppResult<()> {
        let mut store = self.entries.lock();
        for key in keys {
            store.remove(*key);
        }
        Ok(())
    }
}

pub struct SqliteContinuation {
    connection: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteContinuation {
    pub fn open<P: AsRef<Path>>(data_dir: P, file_name: &str) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(file_name);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(&path, flags)?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS continuation_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
            );
            "#,
        )?;
        info!(
            target: "continuation_store",
            path = %path.display(),
            "continuation store opened"
        );
        Ok(Self {
            connection: Mutex::new(connection),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ContinuationBackend for SqliteContinuation {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.connection.lock();
        let value = conn
            .query_row(
                "SELECT value FROM continuation_state WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_all(&self, entries: &[(&str, String)]) -> AppResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO continuation_state (key, value, updated_at)
                VALUES (?1, ?2, DATETIME('now'))
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                (key, value.as_str()),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self, keys: &[&str]) -> AppResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM continuation_state WHERE key = ?1", [key])?;
        }
        tx.commit()?;
        Ok(())
    }
}
