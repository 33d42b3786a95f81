//! Append-only audit log of security-relevant events.
//!
//! Every entry is `{ kind, optional non-secret detail, timestamp }` —
//! never key material, never a password, never a reason string that could
//! narrow down *why* an authentication failed.
//!
//! Recording is fire-and-forget: [`AuditLog::record`] never returns an
//! error, never blocks on anything slower than a local SQLite insert, and
//! never fails the calling operation. A vault that cannot write its audit
//! trail still locks and unlocks; the failure is traced and dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The kind of security-relevant event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// First-run setup completed.
    VaultCreated,
    /// A session was opened with a valid password (and device key, if bound).
    UnlockSucceeded,
    /// An unlock attempt failed. No cause is recorded.
    UnlockFailed,
    /// The session was locked explicitly.
    Locked,
    /// The session was locked by the inactivity timer.
    AutoLocked,
    /// The vault password was rotated.
    PasswordChanged,
    /// The auto-lock window was changed.
    LockTimeoutChanged,
    /// Device binding was turned on.
    DeviceBindingEnabled,
    /// Device binding was turned off.
    DeviceBindingDisabled,
    /// The recovery key was disclosed after password re-verification.
    RecoveryKeyRevealed,
}

impl AuditEventKind {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VaultCreated => "vault_created",
            Self::UnlockSucceeded => "unlock_succeeded",
            Self::UnlockFailed => "unlock_failed",
            Self::Locked => "locked",
            Self::AutoLocked => "auto_locked",
            Self::PasswordChanged => "password_changed",
            Self::LockTimeoutChanged => "lock_timeout_changed",
            Self::DeviceBindingEnabled => "device_binding_enabled",
            Self::DeviceBindingDisabled => "device_binding_disabled",
            Self::RecoveryKeyRevealed => "recovery_key_revealed",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vault_created" => Some(Self::VaultCreated),
            "unlock_succeeded" => Some(Self::UnlockSucceeded),
            "unlock_failed" => Some(Self::UnlockFailed),
            "locked" => Some(Self::Locked),
            "auto_locked" => Some(Self::AutoLocked),
            "password_changed" => Some(Self::PasswordChanged),
            "lock_timeout_changed" => Some(Self::LockTimeoutChanged),
            "device_binding_enabled" => Some(Self::DeviceBindingEnabled),
            "device_binding_disabled" => Some(Self::DeviceBindingDisabled),
            "recovery_key_revealed" => Some(Self::RecoveryKeyRevealed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Database row ID.
    pub id: i64,

    /// What happened.
    pub kind: AuditEventKind,

    /// Optional non-secret context (e.g. the KDF algorithm selected).
    pub detail: Option<String>,

    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append-only writer/reader over the `audit_log` table.
///
/// Shares the configuration store's database (the table is created by the
/// store's migrations).
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog {
    /// Create an audit log over the same database as `store`.
    pub fn new(store: &ConfigStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event. Never fails the caller.
    pub fn record(&self, kind: AuditEventKind) {
        self.record_with_detail(kind, None);
    }

    /// Append an event with optional non-secret detail. Never fails the
    /// caller; insert errors are traced and dropped.
    pub fn record_with_detail(&self, kind: AuditEventKind, detail: Option<&str>) {
        let result = self.lock_conn().execute(
            "INSERT INTO audit_log (kind, detail, timestamp) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), detail, Utc::now().timestamp()],
        );

        match result {
            Ok(_) => tracing::debug!(kind = %kind, "audit event recorded"),
            Err(e) => tracing::warn!(kind = %kind, error = %e, "failed to record audit event"),
        }
    }

    /// Read the most recent `limit` events, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<AuditEvent>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, kind, detail, timestamp FROM audit_log
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, kind, detail, ts) = row?;
            let Some(kind) = AuditEventKind::parse(&kind) else {
                // A row written by a newer version; skip rather than fail.
                tracing::debug!(kind, "skipping unknown audit event kind");
                continue;
            };
            events.push(AuditEvent {
                id,
                kind,
                detail,
                timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
            });
        }

        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
