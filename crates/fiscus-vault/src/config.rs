//! SQLite-backed vault configuration store.
//!
//! One record per installation, created at first run, never deleted while
//! the vault exists. The record carries everything needed to re-derive the
//! wrapping key and unwrap the DEK — KDF parameters, the wrapped DEK, the
//! device-binding flag — plus non-security preferences and the auto-lock
//! timeout.
//!
//! Fields that change together change *atomically*: password rotation
//! writes the new KDF parameters and the new wrapped DEK in a single
//! statement, so a concurrent reader can never observe parameters that do
//! not match the wrapped key next to them.
//!
//! Schema migration is automatic: [`ConfigStore::open`] creates or
//! upgrades the database as needed. The audit log shares the same
//! database file (see [`crate::audit`]).

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, VaultError};
use crate::kdf::KdfParams;
use crate::keys::WrappedKey;

/// Default auto-lock window for new vaults, in minutes.
pub const DEFAULT_LOCK_TIMEOUT_MINUTES: u32 = 15;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The persisted vault configuration record.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// KDF algorithm and cost parameters that produced the wrapping key.
    pub kdf_params: KdfParams,

    /// The DEK wrapped under the wrapping key. Valid only against
    /// `kdf_params` and `device_key_enabled` as persisted alongside it.
    pub wrapped_dek: WrappedKey,

    /// Whether a device-bound secret participates in the wrapping key.
    pub device_key_enabled: bool,

    /// Inactivity window before the session auto-locks.
    pub lock_timeout_minutes: u32,

    /// Non-security preferences riding the same record.
    pub preferences: serde_json::Map<String, serde_json::Value>,

    /// When the vault was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last modified.
    pub updated_at: DateTime<Utc>,
}

impl VaultConfig {
    /// A fresh first-run record with default preferences and timeout.
    pub fn new(kdf_params: KdfParams, wrapped_dek: WrappedKey, device_key_enabled: bool) -> Self {
        let now = Utc::now();
        Self {
            kdf_params,
            wrapped_dek,
            device_key_enabled,
            lock_timeout_minutes: DEFAULT_LOCK_TIMEOUT_MINUTES,
            preferences: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Durable single-record store for [`VaultConfig`].
///
/// The connection is shared with the audit log and guarded by a mutex;
/// every critical section is a single short statement or transaction.
pub struct ConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigStore {
    /// Open (or create) the vault database at `path`.
    ///
    /// Runs schema migrations for the config record and the audit log.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening vault database");

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        tracing::info!("vault database ready");
        Ok(store)
    }

    /// Open an in-memory vault database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Shared connection handle for the audit log.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Configure SQLite pragmas for performance and safety.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    /// Run database schema migrations.
    fn run_migrations(&self) -> Result<()> {
        tracing::debug!("running vault schema migrations");

        self.lock_conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS vault_config (
                id                   INTEGER PRIMARY KEY CHECK (id = 1),
                kdf_params           TEXT NOT NULL,
                wrapped_dek          BLOB NOT NULL,
                device_key_enabled   INTEGER NOT NULL,
                lock_timeout_minutes INTEGER NOT NULL,
                preferences          TEXT NOT NULL DEFAULT '{}',
                created_at           INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                kind      TEXT NOT NULL,
                detail    TEXT,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);",
        )?;

        tracing::debug!("vault schema migrations complete");
        Ok(())
    }

    // -- Record access ------------------------------------------------------

    /// Read the current configuration, or `None` before first-run setup.
    pub fn load(&self) -> Result<Option<VaultConfig>> {
        let conn = self.lock_conn();

        let row = conn
            .query_row(
                "SELECT kdf_params, wrapped_dek, device_key_enabled, lock_timeout_minutes,
                        preferences, created_at, updated_at
                 FROM vault_config WHERE id = 1",
                [],
                |row| {
                    Ok(ConfigRow {
                        kdf_params: row.get(0)?,
                        wrapped_dek: row.get(1)?,
                        device_key_enabled: row.get(2)?,
                        lock_timeout_minutes: row.get(3)?,
                        preferences: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kdf_params: KdfParams = serde_json::from_str(&row.kdf_params)?;
        let preferences = serde_json::from_str(&row.preferences)?;

        Ok(Some(VaultConfig {
            kdf_params,
            wrapped_dek: WrappedKey::from_bytes(row.wrapped_dek),
            device_key_enabled: row.device_key_enabled,
            lock_timeout_minutes: row.lock_timeout_minutes,
            preferences,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }))
    }

    /// Persist the first-run configuration record.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::ConfigurationError`] if a record already
    /// exists — the vault is initialized exactly once.
    pub fn create(&self, config: &VaultConfig) -> Result<()> {
        let kdf_json = serde_json::to_string(&config.kdf_params)?;
        let prefs_json = serde_json::to_string(&config.preferences)?;

        let conn = self.lock_conn();
        let result = conn.execute(
            "INSERT INTO vault_config
                (id, kdf_params, wrapped_dek, device_key_enabled, lock_timeout_minutes,
                 preferences, created_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                kdf_json,
                config.wrapped_dek.as_bytes(),
                config.device_key_enabled,
                config.lock_timeout_minutes,
                prefs_json,
                config.created_at.timestamp(),
                config.updated_at.timestamp(),
            ],
        );

        match result {
            Ok(_) => {
                tracing::info!(
                    kdf = config.kdf_params.algorithm_name(),
                    device_key_enabled = config.device_key_enabled,
                    "created vault configuration"
                );
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(VaultError::ConfigurationError {
                    reason: "vault is already initialized".into(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the fields that define the wrapping: KDF
    /// parameters, wrapped DEK, and the device-binding flag.
    ///
    /// These three change together during password rotation and binding
    /// changes; a single statement guarantees no reader ever sees a
    /// mismatched intermediate state.
    pub fn update_wrapping(
        &self,
        kdf_params: &KdfParams,
        wrapped_dek: &WrappedKey,
        device_key_enabled: bool,
    ) -> Result<()> {
        let kdf_json = serde_json::to_string(kdf_params)?;

        let conn = self.lock_conn();
        let rows = conn.execute(
            "UPDATE vault_config
             SET kdf_params = ?1, wrapped_dek = ?2, device_key_enabled = ?3, updated_at = ?4
             WHERE id = 1",
            params![
                kdf_json,
                wrapped_dek.as_bytes(),
                device_key_enabled,
                Utc::now().timestamp(),
            ],
        )?;

        if rows == 0 {
            return Err(VaultError::VaultUnavailable);
        }

        tracing::info!(
            kdf = kdf_params.algorithm_name(),
            device_key_enabled,
            "updated vault wrapping"
        );
        Ok(())
    }

    /// Update the auto-lock timeout.
    pub fn set_lock_timeout(&self, minutes: u32) -> Result<()> {
        let conn = self.lock_conn();
        let rows = conn.execute(
            "UPDATE vault_config SET lock_timeout_minutes = ?1, updated_at = ?2 WHERE id = 1",
            params![minutes, Utc::now().timestamp()],
        )?;

        if rows == 0 {
            return Err(VaultError::VaultUnavailable);
        }

        tracing::info!(minutes, "updated lock timeout");
        Ok(())
    }

    // -- Preferences --------------------------------------------------------

    /// Read a non-security preference value.
    pub fn get_preference(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let config = self.load()?.ok_or(VaultError::VaultUnavailable)?;
        Ok(config.preferences.get(key).cloned())
    }

    /// Write a non-security preference value.
    pub fn set_preference(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let config = self.load()?.ok_or(VaultError::VaultUnavailable)?;

        let mut preferences = config.preferences;
        preferences.insert(key.to_string(), value);
        let prefs_json = serde_json::to_string(&preferences)?;

        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vault_config SET preferences = ?1, updated_at = ?2 WHERE id = 1",
            params![prefs_json, Utc::now().timestamp()],
        )?;

        tracing::debug!(key, "updated preference");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row type (avoid leaking rusqlite details)
// ---------------------------------------------------------------------------

struct ConfigRow {
    kdf_params: String,
    wrapped_dek: Vec<u8>,
    device_key_enabled: bool,
    lock_timeout_minutes: u32,
    preferences: String,
    created_at: i64,
    updated_at: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
