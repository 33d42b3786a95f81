//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], which is the
//! single error type returned by every public API in this crate.
//!
//! Cryptographic failure reasons are deliberately coarse. Wrong password,
//! wrong device key, and a tampered wrapped key all surface as
//! [`VaultError::AuthenticationFailed`] with no further detail — exposing
//! *which* input was wrong would hand an attacker an oracle. Configuration
//! errors, by contrast, carry full detail because they indicate a deployment
//! or programming defect, not a security-sensitive input.

/// Unified error type for the Fiscus vault core.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Lifecycle errors ---------------------------------------------------
    /// No vault configuration exists yet (first-run setup has not happened).
    #[error("vault is not initialized")]
    VaultUnavailable,

    /// An operation that needs the DEK was attempted without an active
    /// session.
    #[error("vault is locked")]
    VaultLocked,

    // -- Authentication errors ----------------------------------------------
    /// Password or device-key verification failed.
    ///
    /// Deliberately undifferentiated: wrong password, wrong device key, and
    /// a corrupted wrapped key are indistinguishable to the caller. This is
    /// a security property of the design, not missing diagnostics.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// AEAD authentication failed on a specific record or file.
    ///
    /// Distinct from [`AuthenticationFailed`](Self::AuthenticationFailed)
    /// because it can occur mid-session on corrupted data. The message never
    /// reveals whether the key, nonce, or ciphertext was at fault.
    #[error("decryption failed — data could not be read")]
    DecryptionFailed,

    // -- Key management errors ----------------------------------------------
    /// The preferred KDF algorithm cannot run on this host. Auto-recovered
    /// via fallback parameters where possible; surfaced only when the
    /// fallback also fails or the persisted parameters demand it.
    #[error("key derivation algorithm unavailable: {reason}")]
    UnsupportedKdf { reason: String },

    /// Device binding is enabled but the device secret is unavailable on
    /// this host (new machine, cleared credential store). Recoverable —
    /// routes toward the recovery-key flow.
    #[error("device key unavailable")]
    DeviceKeyUnavailable,

    /// A key-derivation attempt exceeded its time budget.
    #[error("unlock attempt timed out")]
    Timeout,

    /// Invalid key length or malformed parameters. A programmer or
    /// deployment defect; propagates with full detail.
    #[error("configuration error: {reason}")]
    ConfigurationError { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem (file store, keychain file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
