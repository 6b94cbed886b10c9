//! SQLite-backed store for pairing sessions, clients, and activity log
//!
//! A single bundled-SQLite connection guarded by an async mutex. Store I/O
//! failures are surfaced to the caller, never retried here.

use crate::model::{
    ActivityLogEntry, Client, ClientId, ClientPatch, NewClient, PairingSession,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unique constraint violated on {0}")]
    Duplicate(String),
    #[error("configuration directory not found")]
    NoConfigDir,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pairing_sessions (
    id          TEXT PRIMARY KEY,
    pin         TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL,
    used        INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pairing_sessions_pin ON pairing_sessions(pin);

CREATE TABLE IF NOT EXISTS clients (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    device_type TEXT NOT NULL,
    public_key  TEXT NOT NULL UNIQUE,
    certificate TEXT NOT NULL,
    paired_at   INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    metadata    TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS activity_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id   TEXT,
    action      TEXT NOT NULL,
    details     TEXT,
    ip          TEXT,
    timestamp   INTEGER NOT NULL
);
"#;

/// Durable store shared by the pairing manager and the realtime server
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened store at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests and ephemeral deployments)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Default database path (~/.config/homelink/homelink.db)
    pub fn default_path() -> StoreResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        Ok(config_dir.join("homelink").join("homelink.db"))
    }

    // ------------------------------------------------------------------
    // Pairing sessions
    // ------------------------------------------------------------------

    /// Insert a new pairing session for `pin`
    pub async fn create_pairing_session(
        &self,
        pin: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<PairingSession> {
        let session = PairingSession {
            id: Uuid::new_v4(),
            pin: pin.to_string(),
            created_at: Utc::now(),
            expires_at,
            used: false,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pairing_sessions (id, pin, created_at, expires_at, used)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                session.id.to_string(),
                session.pin,
                session.created_at.timestamp_millis(),
                session.expires_at.timestamp_millis(),
            ],
        )?;
        debug!("Created pairing session {}", session.id);
        Ok(session)
    }

    /// Fetch the newest unused session for `pin`, if any
    pub async fn get_pairing_session(&self, pin: &str) -> StoreResult<Option<PairingSession>> {
        let conn = self.conn.lock().await;
        let session = conn
            .query_row(
                "SELECT id, pin, created_at, expires_at, used
                 FROM pairing_sessions
                 WHERE pin = ?1 AND used = 0
                 ORDER BY expires_at DESC
                 LIMIT 1",
                [pin],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Whether an unused, unexpired session currently holds this PIN value
    pub async fn has_live_pairing_session(
        &self,
        pin: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pairing_sessions
             WHERE pin = ?1 AND used = 0 AND expires_at >= ?2",
            params![pin, now.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Atomically consume the live session for `pin`.
    ///
    /// The expiry guard is part of the UPDATE so a session cannot be consumed
    /// after it lapses between the caller's check and this statement. Returns
    /// the number of rows affected; zero means the completion must fail.
    pub async fn mark_pairing_session_used(
        &self,
        pin: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE pairing_sessions SET used = 1
             WHERE pin = ?1 AND used = 0 AND expires_at >= ?2",
            params![pin, now.timestamp_millis()],
        )?;
        Ok(rows)
    }

    /// Delete sessions that are expired or already consumed
    pub async fn clean_expired_pairing_sessions(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM pairing_sessions WHERE expires_at < ?1 OR used = 1",
            params![now.timestamp_millis()],
        )?;
        if removed > 0 {
            debug!("Swept {} pairing session(s)", removed);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Insert a new client; fails with `Duplicate` if the public key is taken
    pub async fn create_client(&self, new: NewClient) -> StoreResult<Client> {
        let client = Client {
            id: new.id,
            name: new.name,
            device_type: new.device_type,
            public_key: new.public_key,
            certificate: new.certificate,
            paired_at: new.paired_at,
            last_seen: new.paired_at,
            is_active: true,
            metadata: new.metadata,
        };
        let metadata = serde_json::to_string(&client.metadata)?;
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO clients
             (id, name, device_type, public_key, certificate, paired_at, last_seen, is_active, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                client.id.to_string(),
                client.name,
                client.device_type.as_str(),
                client.public_key,
                client.certificate,
                client.paired_at.timestamp_millis(),
                client.last_seen.timestamp_millis(),
                metadata,
            ],
        );
        match result {
            Ok(_) => {
                info!("Created client {}", client.id);
                Ok(client)
            }
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::Duplicate("public_key".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a client by ID
    pub async fn get_client(&self, id: &ClientId) -> StoreResult<Option<Client>> {
        let conn = self.conn.lock().await;
        let client = conn
            .query_row(
                "SELECT id, name, device_type, public_key, certificate,
                        paired_at, last_seen, is_active, metadata
                 FROM clients WHERE id = ?1",
                [id.to_string()],
                row_to_client,
            )
            .optional()?;
        Ok(client)
    }

    /// Get a client by public key
    pub async fn get_client_by_public_key(&self, key: &str) -> StoreResult<Option<Client>> {
        let conn = self.conn.lock().await;
        let client = conn
            .query_row(
                "SELECT id, name, device_type, public_key, certificate,
                        paired_at, last_seen, is_active, metadata
                 FROM clients WHERE public_key = ?1",
                [key],
                row_to_client,
            )
            .optional()?;
        Ok(client)
    }

    /// List all clients, newest pairing first
    pub async fn list_clients(&self) -> StoreResult<Vec<Client>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, device_type, public_key, certificate,
                    paired_at, last_seen, is_active, metadata
             FROM clients ORDER BY paired_at DESC",
        )?;
        let clients = stmt
            .query_map([], row_to_client)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clients)
    }

    /// Apply a partial update; returns whether a row was touched
    pub async fn update_client(&self, id: &ClientId, patch: &ClientPatch) -> StoreResult<bool> {
        let metadata = patch
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE clients SET
                 name = COALESCE(?1, name),
                 last_seen = COALESCE(?2, last_seen),
                 is_active = COALESCE(?3, is_active),
                 metadata = COALESCE(?4, metadata)
             WHERE id = ?5",
            params![
                patch.name,
                patch.last_seen.map(|t| t.timestamp_millis()),
                patch.is_active,
                metadata,
                id.to_string(),
            ],
        )?;
        Ok(rows > 0)
    }

    /// Hard-delete a client (administrative action only)
    pub async fn delete_client(&self, id: &ClientId) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute("DELETE FROM clients WHERE id = ?1", [id.to_string()])?;
        if rows > 0 {
            info!("Deleted client {}", id);
        }
        Ok(rows > 0)
    }

    /// Number of paired clients
    pub async fn client_count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------

    /// Append an entry to the audit trail
    pub async fn log_activity(
        &self,
        client_id: Option<ClientId>,
        action: &str,
        details: Option<&str>,
        ip: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO activity_log (client_id, action, details, ip, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                client_id.map(|id| id.to_string()),
                action,
                details,
                ip,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Most recent audit entries, newest first
    pub async fn recent_activity(&self, limit: usize) -> StoreResult<Vec<ActivityLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, client_id, action, details, ip, timestamp
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit as i64], row_to_activity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<PairingSession> {
    let id: String = row.get(0)?;
    Ok(PairingSession {
        id: parse_uuid(0, &id)?,
        pin: row.get(1)?,
        created_at: parse_millis(2, row.get(2)?)?,
        expires_at: parse_millis(3, row.get(3)?)?,
        used: row.get(4)?,
    })
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    let id: String = row.get(0)?;
    let device_type: String = row.get(2)?;
    let metadata: String = row.get(8)?;
    Ok(Client {
        id: ClientId(parse_uuid(0, &id)?),
        name: row.get(1)?,
        device_type: device_type.parse().unwrap_or_default(),
        public_key: row.get(3)?,
        certificate: row.get(4)?,
        paired_at: parse_millis(5, row.get(5)?)?,
        last_seen: parse_millis(6, row.get(6)?)?,
        is_active: row.get(7)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    })
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityLogEntry> {
    let client_id: Option<String> = row.get(1)?;
    let client_id = match client_id {
        Some(s) => Some(ClientId(parse_uuid(1, &s)?)),
        None => None,
    };
    Ok(ActivityLogEntry {
        id: row.get(0)?,
        client_id,
        action: row.get(2)?,
        details: row.get(3)?,
        ip: row.get(4)?,
        timestamp: parse_millis(5, row.get(5)?)?,
    })
}
