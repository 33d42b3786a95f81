//! Encrypted file storage keyed by opaque identifiers.
//!
//! One ciphertext blob per stored file, named by its identifier under a
//! configurable storage root. The store never touches session state: every
//! operation takes the key explicitly, obtained by the caller via
//! [`SessionManager::require_dek`](crate::session::SessionManager::require_dek).
//!
//! Writes are atomic (tempfile in the same directory, then rename), so a
//! crash mid-write leaves either the old blob or the new one, never a
//! torn file. The plaintext buffer is *consumed* by [`VaultFileStore::write`]
//! and zeroized when it drops.
//!
//! An orphaned ciphertext — left behind when its metadata record was
//! deleted first — is harmless: it cannot be decrypted without the DEK.
//! [`VaultFileStore::sweep_orphans`] removes such blobs opportunistically;
//! its failures are never fatal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::keys::SecretKey;

/// File extension for stored ciphertext blobs.
const BLOB_EXTENSION: &str = "fvault";

/// Encrypted per-file storage under a single root directory.
pub struct VaultFileStore {
    root: PathBuf,
}

impl VaultFileStore {
    /// Create a store rooted at `root`. The directory is created on the
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an identifier to its blob path, rejecting anything that could
    /// escape the storage root.
    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(VaultError::ConfigurationError {
                reason: format!("invalid file identifier: {id:?}"),
            });
        }
        Ok(self.root.join(format!("{id}.{BLOB_EXTENSION}")))
    }

    /// Encrypt `plaintext` and write it atomically under `id`.
    ///
    /// The plaintext buffer is consumed; it is zeroized when this function
    /// returns, success or failure.
    pub fn write(&self, id: &str, plaintext: Zeroizing<Vec<u8>>, key: &SecretKey) -> Result<()> {
        let path = self.path_for(id)?;
        let blob = crypto::encrypt(&plaintext, key.as_bytes())?;
        drop(plaintext);

        std::fs::create_dir_all(&self.root)?;

        // Tempfile in the same directory so the rename is atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        std::io::Write::write_all(&mut tmp, &blob)?;
        tmp.persist(&path).map_err(|e| VaultError::Io(e.error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        tracing::debug!(id, blob_len = blob.len(), "wrote encrypted file");
        Ok(())
    }

    /// Read and decrypt the blob stored under `id` with an explicitly
    /// supplied key.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Io`] (`NotFound`) when no blob exists for `id`.
    /// - [`VaultError::DecryptionFailed`] on any corruption or wrong key —
    ///   the whole file fails, plaintext is never silently truncated.
    pub fn read(&self, id: &str, key: &SecretKey) -> Result<Zeroizing<Vec<u8>>> {
        let path = self.path_for(id)?;
        let blob = std::fs::read(&path)?;

        let plaintext = Zeroizing::new(crypto::decrypt(&blob, key.as_bytes())?);
        tracing::debug!(id, plaintext_len = plaintext.len(), "read encrypted file");
        Ok(plaintext)
    }

    /// Check whether a blob exists for `id`.
    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.path_for(id)?.exists())
    }

    /// Remove the blob stored under `id`. Best-effort: a missing blob is
    /// not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(id, "removed encrypted file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Opportunistically delete blobs whose identifiers are no longer
    /// referenced by any metadata record.
    ///
    /// Returns the number of blobs removed. Never fails: an unreadable
    /// directory or a blob that cannot be deleted is traced and skipped —
    /// an orphan is undecryptable without the DEK and therefore harmless.
    pub fn sweep_orphans(&self, known_ids: &HashSet<String>) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(error = %e, "orphan sweep skipped, storage root unreadable");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if known_ids.contains(stem) {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(id = stem, "removed orphaned ciphertext");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(id = stem, error = %e, "failed to remove orphaned ciphertext");
                }
            }
        }

        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
