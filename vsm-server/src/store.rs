//! SQLite persistence: WAL mode, 3 tables.
//!
//! Schema: devices (current merged record), diffs (what each uplink
//! changed), errors (translator failures). Records are stored as JSON.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use vsm_core::{DeviceState, VsmError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS diffs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    diff TEXT NOT NULL,
    timestamp REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_diffs_device ON diffs(device_id);
CREATE INDEX IF NOT EXISTS idx_errors_device ON errors(device_id);
CREATE INDEX IF NOT EXISTS idx_devices_updated ON devices(updated_at);
"#;

fn now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record for device {0}")]
    NotFound(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for VsmError {
    fn from(e: StoreError) -> Self {
        VsmError::Store(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRow {
    pub device_id: String,
    pub state: DeviceState,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRow {
    pub device_id: String,
    pub message: String,
    pub timestamp: f64,
}

/// SQLite database holding device records.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Database { conn })
    }

    /// Open in-memory database (for testing).
    #[cfg(test)]
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    pub fn fetch(&self, device_id: &str) -> Result<DeviceState, StoreError> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM devices WHERE device_id = ?1",
                params![device_id],
                |r| r.get(0),
            )
            .optional()?;

        match text {
            Some(t) => Ok(serde_json::from_str(&t)?),
            None => Err(StoreError::NotFound(device_id.to_string())),
        }
    }

    /// Replace the device record and append the diff that produced it.
    pub fn put(&mut self, device_id: &str, state: &DeviceState, diff: &Value) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(state)?;
        let diff_json = serde_json::to_string(diff)?;
        let ts = now();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO devices (device_id, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(device_id) DO UPDATE SET
                 state = excluded.state,
                 updated_at = excluded.updated_at",
            params![device_id, state_json, ts],
        )?;
        tx.execute(
            "INSERT INTO diffs (device_id, diff, timestamp) VALUES (?1, ?2, ?3)",
            params![device_id, diff_json, ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn put_error(&mut self, device_id: &str, message: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO errors (device_id, message, timestamp) VALUES (?1, ?2, ?3)",
            params![device_id, message, now()],
        )?;
        Ok(())
    }

    /// All device records, most recently updated first.
    pub fn list(&self) -> Result<Vec<DeviceRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT device_id, state, updated_at FROM devices ORDER BY updated_at DESC")?;
        let raw = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(device_id, state, updated_at)| {
                Ok(DeviceRow {
                    device_id,
                    state: serde_json::from_str(&state)?,
                    updated_at,
                })
            })
            .collect()
    }

    pub fn errors(&self, device_id: &str) -> Result<Vec<ErrorRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, message, timestamp FROM errors WHERE device_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![device_id], |r| {
                Ok(ErrorRow {
                    device_id: r.get(0)?,
                    message: r.get(1)?,
                    timestamp: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_diffs(&self, device_id: &str) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM diffs WHERE device_id = ?1",
            params![device_id],
            |r| r.get(0),
        )?)
    }
}

// ---------------------------------------------------------------------------
// Async store interface
// ---------------------------------------------------------------------------

/// Durable device state, as seen by the uplink processor and HTTP API.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn fetch(&self, device_id: &str) -> Result<DeviceState, StoreError>;
    async fn put(&self, device_id: &str, state: &DeviceState, diff: &Value) -> Result<(), StoreError>;
    async fn put_error(&self, device_id: &str, message: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<DeviceRow>, StoreError>;
}

/// [`StateStore`] over a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        SqliteStore { db: Mutex::new(db) }
    }

    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn errors(&self, device_id: &str) -> Result<Vec<ErrorRow>, StoreError> {
        self.db().errors(device_id)
    }

    pub fn count_diffs(&self, device_id: &str) -> Result<i64, StoreError> {
        self.db().count_diffs(device_id)
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn fetch(&self, device_id: &str) -> Result<DeviceState, StoreError> {
        self.db().fetch(device_id)
    }

    async fn put(&self, device_id: &str, state: &DeviceState, diff: &Value) -> Result<(), StoreError> {
        self.db().put(device_id, state, diff)
    }

    async fn put_error(&self, device_id: &str, message: &str) -> Result<(), StoreError> {
        self.db().put_error(device_id, message)
    }

    async fn list(&self) -> Result<Vec<DeviceRow>, StoreError> {
        self.db().list()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
