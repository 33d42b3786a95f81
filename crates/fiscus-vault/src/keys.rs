//! Secret key types, DEK wrapping, and the wrapping-key combiner.
//!
//! Every piece of key material in the vault — the data-encryption key
//! (DEK), the password-derived key-encryption key (KEK), the device key,
//! and the combined wrapping key — is a [`SecretKey`]: an owned 32-byte
//! buffer that is zeroized exactly once, on drop.
//!
//! [`SecretKey`] deliberately does not implement `Clone`. Code that needs
//! the same bytes in two places must call [`SecretKey::duplicate`], making
//! every copy explicit. This turns the classic zero-after-use aliasing bug
//! (zeroing a buffer that another retained reference still reads) into an
//! ownership error the compiler rejects.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// SecretKey
// ---------------------------------------------------------------------------

/// A 256-bit secret key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    /// Generate a fresh random key from the system CSPRNG.
    pub fn generate() -> Result<Self> {
        let buf = crypto::random_bytes(KEY_LEN)?;
        Self::try_from_slice(&buf)
    }

    /// Wrap raw bytes that are already known to be key material.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Construct from a slice, rejecting any length other than [`KEY_LEN`].
    pub fn try_from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] =
            slice
                .try_into()
                .map_err(|_| VaultError::ConfigurationError {
                    reason: format!("key must be {} bytes, got {}", KEY_LEN, slice.len()),
                })?;
        Ok(Self { bytes })
    }

    /// Borrow the raw key bytes for an immediate cryptographic operation.
    ///
    /// Avoid storing or logging this value.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Explicitly copy the key material.
    ///
    /// This is the only way to get the same bytes into two owners. Each
    /// copy is zeroized independently when it is dropped, so duplicating
    /// *before* a consuming operation is always safe, while aliasing is
    /// impossible.
    pub fn duplicate(&self) -> Self {
        Self { bytes: self.bytes }
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecretKey {
    /// Constant-time comparison via `ring`.
    fn eq(&self, other: &Self) -> bool {
        ring::constant_time::verify_slices_are_equal(&self.bytes, &other.bytes).is_ok()
    }
}

impl Eq for SecretKey {}

// ---------------------------------------------------------------------------
// WrappedKey
// ---------------------------------------------------------------------------

/// The DEK encrypted under a wrapping key: `nonce || ciphertext+tag`.
///
/// A `WrappedKey` is meaningful only together with the exact
/// [`KdfParams`](crate::kdf::KdfParams) and device-key state that produced
/// its wrapping key; the configuration store persists them side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    blob: Vec<u8>,
}

impl WrappedKey {
    /// Reconstruct from the persisted blob.
    pub fn from_bytes(blob: Vec<u8>) -> Self {
        Self { blob }
    }

    /// The persisted form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }
}

/// Encrypt (wrap) the DEK under the wrapping key.
pub fn wrap_key(dek: &SecretKey, wrapping: &SecretKey) -> Result<WrappedKey> {
    let blob = crypto::encrypt(dek.as_bytes(), wrapping.as_bytes())?;
    Ok(WrappedKey { blob })
}

/// Decrypt (unwrap) the DEK with the wrapping key.
///
/// # Errors
///
/// Returns [`VaultError::DecryptionFailed`] when authentication fails —
/// whether from a wrong wrapping key or a tampered blob is deliberately
/// not distinguishable. Callers in the unlock path collapse this further
/// into [`VaultError::AuthenticationFailed`].
pub fn unwrap_key(wrapped: &WrappedKey, wrapping: &SecretKey) -> Result<SecretKey> {
    let mut plaintext = crypto::decrypt(&wrapped.blob, wrapping.as_bytes())?;
    let key = SecretKey::try_from_slice(&plaintext);
    plaintext.zeroize();
    key
}

// ---------------------------------------------------------------------------
// Key combiner
// ---------------------------------------------------------------------------

/// Combine the password-derived KEK with an optional device key into the
/// wrapping key.
///
/// With device binding enabled the combination is
/// `HMAC-SHA256(key = KEK, message = device_key)` — a one-way keyed hash,
/// so compromising either component alone is insufficient to reconstruct
/// the wrapping key. HMAC-SHA256 output is exactly [`KEY_LEN`] bytes.
///
/// With binding disabled the wrapping key is an explicit
/// [`duplicate`](SecretKey::duplicate) of the KEK, never an alias: the KEK
/// buffer is dropped (and zeroized) right after wrapping, while the
/// wrapping key may outlive it.
pub fn combine_keys(kek: &SecretKey, device_key: Option<&SecretKey>) -> SecretKey {
    match device_key {
        Some(device) => {
            let mac_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, kek.as_bytes());
            let tag = ring::hmac::sign(&mac_key, device.as_bytes());
            let mut bytes = [0u8; KEY_LEN];
            bytes.copy_from_slice(tag.as_ref());
            SecretKey::from_bytes(bytes)
        }
        None => kek.duplicate(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let dek = SecretKey::generate().unwrap();
        let wrapping = SecretKey::generate().unwrap();

        let wrapped = wrap_key(&dek, &wrapping).unwrap();
        let unwrapped = unwrap_key(&wrapped, &wrapping).unwrap();

        assert_eq!(unwrapped, dek);
    }

    #[test]
    fn unwrap_with_wrong_key_fails() {
        let dek = SecretKey::generate().unwrap();
        let wrapping = SecretKey::generate().unwrap();
        let other = SecretKey::generate().unwrap();

        let wrapped = wrap_key(&dek, &wrapping).unwrap();
        let result = unwrap_key(&wrapped, &other);

        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn unwrap_tampered_blob_fails() {
        let dek = SecretKey::generate().unwrap();
        let wrapping = SecretKey::generate().unwrap();

        let wrapped = wrap_key(&dek, &wrapping).unwrap();
        let mut blob = wrapped.as_bytes().to_vec();
        blob[20] ^= 0x01;

        let result = unwrap_key(&WrappedKey::from_bytes(blob), &wrapping);
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn combine_with_device_key_is_deterministic() {
        let kek = SecretKey::generate().unwrap();
        let device = SecretKey::generate().unwrap();

        let combined1 = combine_keys(&kek, Some(&device));
        let combined2 = combine_keys(&kek, Some(&device));

        assert_eq!(combined1, combined2);
    }

    #[test]
    fn combine_differs_from_both_components() {
        let kek = SecretKey::generate().unwrap();
        let device = SecretKey::generate().unwrap();

        let combined = combine_keys(&kek, Some(&device));

        assert_ne!(combined, kek);
        assert_ne!(combined, device);
    }

    #[test]
    fn combine_sensitive_to_either_component() {
        let kek = SecretKey::generate().unwrap();
        let device1 = SecretKey::generate().unwrap();
        let device2 = SecretKey::generate().unwrap();
        let kek2 = SecretKey::generate().unwrap();

        let base = combine_keys(&kek, Some(&device1));

        assert_ne!(base, combine_keys(&kek, Some(&device2)));
        assert_ne!(base, combine_keys(&kek2, Some(&device1)));
    }

    #[test]
    fn combine_without_device_key_copies_kek() {
        let kek = SecretKey::generate().unwrap();

        let combined = combine_keys(&kek, None);

        // Same bytes, independent buffer — the KEK can be dropped while the
        // wrapping key lives on.
        assert_eq!(combined, kek);
        drop(kek);
        assert_eq!(combined.as_bytes().len(), KEY_LEN);
    }

    #[test]
    fn secret_key_debug_redacts() {
        let key = SecretKey::generate().unwrap();
        let output = format!("{key:?}");

        assert!(output.contains("REDACTED"));
        let key_hex = hex::encode(&key.as_bytes()[..4]);
        assert!(!output.contains(&key_hex));
    }

    #[test]
    fn try_from_slice_rejects_wrong_length() {
        let result = SecretKey::try_from_slice(&[0u8; 16]);
        assert!(matches!(
            result,
            Err(VaultError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn duplicate_is_independent() {
        let key = SecretKey::generate().unwrap();
        let copy = key.duplicate();

        assert_eq!(copy, key);
        drop(key);
        // The copy survives the original's zeroization.
        assert_ne!(copy.as_bytes(), &[0u8; KEY_LEN]);
    }
}
