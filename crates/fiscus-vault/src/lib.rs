//! Encrypted key management and crypto sessions for a personal finance vault.
//!
//! All user data is encrypted at rest under a single random data-encryption
//! key (DEK). The DEK itself is stored only in wrapped (encrypted) form,
//! under a key derived from the user's password — optionally combined with
//! a per-device secret held in the host keychain. Changing the password
//! re-wraps the DEK without touching any encrypted data.
//!
//! # Modules
//!
//! - [`crypto`] — AES-256-GCM encryption/decryption of buffers and JSON.
//! - [`kdf`] — password key derivation (Argon2id, PBKDF2 fallback).
//! - [`keys`] — secret key type, DEK wrapping, key combination.
//! - [`keychain`] — device-bound secret storage.
//! - [`config`] — SQLite-backed vault configuration.
//! - [`session`] — unlock/lock lifecycle with inactivity auto-lock.
//! - [`files`] — encrypted per-file blob storage.
//! - [`audit`] — append-only log of security-relevant events.
//! - [`error`] — unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fiscus_vault::audit::AuditLog;
//! use fiscus_vault::config::ConfigStore;
//! use fiscus_vault::keychain::{DeviceKeychain, FileKeychain};
//! use fiscus_vault::session::SessionManager;
//!
//! # async fn example() -> fiscus_vault::error::Result<()> {
//! let store = Arc::new(ConfigStore::open("data/vault.db")?);
//! let keychain = Arc::new(FileKeychain::new("data/device.key"));
//! let audit = Arc::new(AuditLog::new(&store));
//!
//! let session = SessionManager::new(store, keychain as Arc<dyn DeviceKeychain>, audit);
//!
//! // First run: create the vault, then open a session.
//! session.initialize("correct horse battery staple").await?;
//! session.unlock("correct horse battery staple").await?;
//!
//! // Components obtain key material only through the session.
//! let dek = session.require_dek().await?;
//! let blob = fiscus_vault::crypto::encrypt(b"payload", dek.as_bytes())?;
//! # let _ = blob;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod files;
pub mod kdf;
pub mod keychain;
pub mod keys;
pub mod session;

// Re-export the most commonly used types at the crate root for convenience.
pub use audit::{AuditEvent, AuditEventKind, AuditLog};
pub use config::{ConfigStore, VaultConfig};
pub use error::{Result, VaultError};
pub use files::VaultFileStore;
pub use kdf::KdfParams;
pub use keychain::{DeviceKeychain, FileKeychain};
pub use keys::{SecretKey, WrappedKey};
pub use session::SessionManager;
