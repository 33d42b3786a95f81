//! Device keychain adapter for the device-bound secret.
//!
//! When device binding is enabled, a random secret is generated once per
//! installation and stored in host-level secure storage, outside the vault
//! database. It acts as a second factor in the wrapping key: the vault
//! cannot be opened with the password alone on a machine that does not
//! hold the secret.
//!
//! Absence of the secret is an *expected, recoverable* condition — binding
//! was never enabled, or the user is on a new machine or has cleared the
//! credential store. The adapter therefore returns `Ok(None)` for the
//! absent case rather than an error; callers that require the secret map
//! `None` to [`VaultError::DeviceKeyUnavailable`] and route toward the
//! recovery-key flow.
//!
//! [`FileKeychain`] is the cross-platform backend: the secret is stored
//! encrypted under a key derived from machine-specific data (hostname,
//! username, application salt), with file mode 0600 on Unix. This is a
//! compromise — anyone with full access to the same machine account can
//! reconstruct the machine-derived key — but it keeps the secret out of
//! the vault file and out of backups of the vault directory.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::kdf::{self, KdfParams};
use crate::keys::SecretKey;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over platform-specific storage of the device-bound secret.
///
/// Implementations must be `Send + Sync` so the session manager can be
/// shared across async tasks.
pub trait DeviceKeychain: Send + Sync {
    /// Retrieve the device secret, or `None` if it has never been stored
    /// or is unavailable on this host.
    fn get_device_key(&self) -> Result<Option<SecretKey>>;

    /// Store (or overwrite) the device secret.
    fn set_device_key(&self, key: &SecretKey) -> Result<()>;

    /// Cheap presence check: whether a secret is *stored*, without
    /// decrypting it. A stored secret may still be unusable on this host
    /// (e.g. a file copied from another machine);
    /// [`get_device_key`](Self::get_device_key) is authoritative.
    fn has_device_key(&self) -> Result<bool>;

    /// Delete the stored secret. Deleting an absent secret is a no-op.
    fn delete_device_key(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File-based backend
// ---------------------------------------------------------------------------

/// Application salt mixed into the machine-derived key. Changing this
/// invalidates every previously stored device secret.
const APP_SALT: &[u8] = b"fiscus-vault-device-keychain-v1";

/// Iteration count for the machine-derived key. The input has very little
/// entropy, so the cost mainly buys time against casual extraction.
const MACHINE_KEY_ITERATIONS: u32 = 600_000;

/// File-based keychain that stores the device secret encrypted with a
/// machine-derived key.
///
/// The key file layout (binary):
/// ```text
/// [12 bytes: AES-256-GCM nonce]
/// [remaining: AES-256-GCM ciphertext + 16-byte tag]
/// ```
pub struct FileKeychain {
    /// Path to the encrypted device secret file.
    key_file: PathBuf,
}

impl FileKeychain {
    /// Create a file-based keychain that stores the secret at `key_file`.
    ///
    /// The file itself is created on
    /// [`set_device_key`](DeviceKeychain::set_device_key).
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
        }
    }

    /// Default key file location: `<data_dir>/device.key`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("device.key")
    }

    /// Derive an encryption key from machine-specific data.
    ///
    /// Combines the hostname, username, and the application salt into a
    /// deterministic 256-bit key unique per machine/user combination.
    fn machine_derived_key(&self) -> Result<SecretKey> {
        let hostname = Self::get_hostname();
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".into());

        let material = format!("{hostname}\x1f{username}");
        let params = KdfParams::Pbkdf2Sha256 {
            iterations: MACHINE_KEY_ITERATIONS,
            salt: APP_SALT.to_vec(),
        };

        kdf::derive_kek(&material, &params)
    }

    /// Get the system hostname, falling back to "unknown-host".
    fn get_hostname() -> String {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .or_else(|_| std::env::var("HOSTNAME"))
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown-host".into())
        }

        #[cfg(not(unix))]
        {
            std::env::var("COMPUTERNAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "unknown-host".into())
        }
    }
}

impl DeviceKeychain for FileKeychain {
    fn get_device_key(&self) -> Result<Option<SecretKey>> {
        if !self.key_file.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&self.key_file)?;
        let machine_key = self.machine_derived_key()?;

        // A file we cannot decrypt (copied from another machine, corrupted
        // store) counts as absent: the condition is recoverable via the
        // recovery-key flow, not fatal.
        match crypto::decrypt(&data, machine_key.as_bytes()) {
            Ok(plaintext) => {
                let key = SecretKey::try_from_slice(&plaintext)?;
                tracing::debug!("retrieved device secret from file keychain");
                Ok(Some(key))
            }
            Err(VaultError::DecryptionFailed) => {
                tracing::warn!(
                    path = %self.key_file.display(),
                    "device secret file present but not readable on this machine"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn set_device_key(&self, key: &SecretKey) -> Result<()> {
        let machine_key = self.machine_derived_key()?;
        let blob = crypto::encrypt(key.as_bytes(), machine_key.as_bytes())?;

        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&self.key_file, &blob)?;

        // Restrict file permissions on Unix (owner read/write only).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.key_file, perms)?;
        }

        tracing::info!(path = %self.key_file.display(), "stored device secret in file keychain");
        Ok(())
    }

    fn has_device_key(&self) -> Result<bool> {
        // Presence of the file only; readability is get_device_key's call.
        Ok(self.key_file.exists())
    }

    fn delete_device_key(&self) -> Result<()> {
        if self.key_file.exists() {
            std::fs::remove_file(&self.key_file)?;
            tracing::info!(path = %self.key_file.display(), "deleted device secret from file keychain");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend (tests)
// ---------------------------------------------------------------------------

/// Keychain held entirely in memory. Useful for tests and for simulating a
/// host where the secret has gone missing.
#[derive(Default)]
pub struct MemoryKeychain {
    key: Mutex<Option<SecretKey>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceKeychain for MemoryKeychain {
    fn get_device_key(&self) -> Result<Option<SecretKey>> {
        let guard = self.key.lock().expect("keychain mutex poisoned");
        Ok(guard.as_ref().map(SecretKey::duplicate))
    }

    fn set_device_key(&self, key: &SecretKey) -> Result<()> {
        let mut guard = self.key.lock().expect("keychain mutex poisoned");
        *guard = Some(key.duplicate());
        Ok(())
    }

    fn has_device_key(&self) -> Result<bool> {
        let guard = self.key.lock().expect("keychain mutex poisoned");
        Ok(guard.is_some())
    }

    fn delete_device_key(&self) -> Result<()> {
        let mut guard = self.key.lock().expect("keychain mutex poisoned");
        *guard = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
