//! AES-256-GCM authenticated encryption primitives using the `ring` crate.
//!
//! This module provides the AEAD operations every other part of the vault
//! builds on:
//!
//! - **Buffer encryption**: [`encrypt`] / [`decrypt`] over flat byte
//!   buffers, producing a self-describing `nonce || ciphertext+tag` blob
//!   that needs no side channel to decrypt later.
//! - **Structured encryption**: [`encrypt_json`] / [`decrypt_json`] for
//!   serde-serializable records. Deserialization only happens *after* the
//!   authentication tag has verified — a tampered or truncated ciphertext
//!   fails before any parsing is attempted.
//! - **Random generation**: cryptographically secure random bytes via
//!   `ring`'s [`SystemRandom`].
//!
//! # Security Notes
//!
//! - Nonces are generated randomly for each encryption operation. With a
//!   96-bit nonce and random generation, the probability of a collision is
//!   negligible for up to ~2^32 encryptions under the same key. Identical
//!   plaintexts therefore never produce identical ciphertexts.
//! - Decryption failure is reported as one generic
//!   [`VaultError::DecryptionFailed`] regardless of cause. Wrong key,
//!   flipped bit, and mismatched nonce are indistinguishable by design.
//! - A key of any length other than [`KEY_LEN`] is rejected with
//!   [`VaultError::ConfigurationError`] before any cryptographic work.

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes. The single required key length
/// for every AEAD operation in this crate.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of KDF salts in bytes.
pub const SALT_LEN: usize = 32;

/// AES-256-GCM algorithm from `ring`.
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations. Since we
/// generate a fresh random nonce per encryption call, this wrapper ensures
/// each sealing key is used exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Key length validation
// ---------------------------------------------------------------------------

/// Reject any key that is not exactly [`KEY_LEN`] bytes.
///
/// Runs before any cryptographic work so that a misconfigured caller fails
/// loudly with a [`VaultError::ConfigurationError`] instead of producing
/// undecryptable output.
fn check_key_len(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(VaultError::ConfigurationError {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Buffer encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with AES-256-GCM under the given 256-bit `key`.
///
/// Returns a self-describing blob laid out as:
/// ```text
/// [12 bytes: nonce][remaining: ciphertext + 16-byte tag]
/// ```
/// The nonce is randomly generated per call; the tag is appended by `ring`.
///
/// # Errors
///
/// Returns [`VaultError::ConfigurationError`] for a wrong-length key, or
/// [`VaultError::DecryptionFailed`]'s counterpart on internal `ring`
/// failures (reported as a configuration error since they indicate a
/// broken environment, not tampered data).
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    check_key_len(key)?;

    let rng = SystemRandom::new();

    // Generate a random 96-bit nonce.
    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| VaultError::ConfigurationError {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key =
        UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::ConfigurationError {
            reason: "failed to create AES-256-GCM key".into(),
        })?;

    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    // `ring` encrypts in-place and appends the authentication tag. Reserve
    // the nonce prefix up front so the output is one contiguous blob.
    let mut blob = Vec::with_capacity(NONCE_LEN_BYTES + plaintext.len() + TAG_LEN);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(plaintext);

    let (_, in_out) = blob.split_at_mut(NONCE_LEN_BYTES);
    let tag = sealing_key
        .seal_in_place_separate_tag(Aad::empty(), in_out)
        .map_err(|_| VaultError::ConfigurationError {
            reason: "AEAD seal failed".into(),
        })?;
    blob.extend_from_slice(tag.as_ref());

    tracing::trace!(
        plaintext_len = plaintext.len(),
        blob_len = blob.len(),
        "encrypted buffer"
    );

    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt`] using the given 256-bit `key`.
///
/// # Errors
///
/// Returns [`VaultError::ConfigurationError`] for a wrong-length key, or
/// [`VaultError::DecryptionFailed`] for *any* authentication failure —
/// wrong key, corrupted ciphertext, truncated blob. The cause is never
/// differentiated.
pub fn decrypt(blob: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    check_key_len(key)?;

    // Minimum size: nonce (12) + tag (16).
    if blob.len() < NONCE_LEN_BYTES + TAG_LEN {
        return Err(VaultError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN_BYTES);
    let mut nonce = [0u8; NONCE_LEN_BYTES];
    nonce.copy_from_slice(nonce_bytes);

    let unbound_key =
        UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::ConfigurationError {
            reason: "failed to create AES-256-GCM key".into(),
        })?;

    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::DecryptionFailed)?;

    let result = plaintext.to_vec();

    tracing::trace!(
        blob_len = blob.len(),
        plaintext_len = result.len(),
        "decrypted buffer"
    );

    Ok(result)
}

// ---------------------------------------------------------------------------
// Structured encryption
// ---------------------------------------------------------------------------

/// Serialize `value` to JSON bytes and encrypt the result.
///
/// The intermediate plaintext buffer is zeroized once the ciphertext has
/// been produced.
pub fn encrypt_json<T: serde::Serialize>(value: &T, key: &[u8]) -> Result<Vec<u8>> {
    let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
    encrypt(&plaintext, key)
}

/// Decrypt a blob produced by [`encrypt_json`] and deserialize the result.
///
/// Deserialization is only attempted after the authentication tag has
/// verified, so a tampered blob fails with
/// [`VaultError::DecryptionFailed`], never a parse error on attacker-
/// controlled bytes.
pub fn decrypt_json<T: serde::de::DeserializeOwned>(blob: &[u8], key: &[u8]) -> Result<T> {
    let plaintext = Zeroizing::new(decrypt(blob, key)?);
    let value = serde_json::from_slice(&plaintext)?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`VaultError::ConfigurationError`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| VaultError::ConfigurationError {
            reason: "failed to generate random bytes".into(),
        })?;
    Ok(buf)
}

/// Generate a random KDF salt of [`SALT_LEN`] bytes.
pub fn random_salt() -> Result<Vec<u8>> {
    random_bytes(SALT_LEN)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();
        let plaintext = b"hello, fiscus vault!";

        let blob = encrypt(plaintext, &key).unwrap();
        let decrypted = decrypt(&blob, &key).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();

        let blob = encrypt(b"", &key).unwrap();
        assert_eq!(blob.len(), NONCE_LEN_BYTES + TAG_LEN);

        let decrypted = decrypt(&blob, &key).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn large_plaintext_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();
        let plaintext = vec![0xAB_u8; 1_000_000]; // 1 MB

        let blob = encrypt(&plaintext, &key).unwrap();
        let decrypted = decrypt(&blob, &key).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn same_plaintext_different_ciphertexts() {
        let key = random_bytes(KEY_LEN).unwrap();
        let plaintext = b"identical input";

        let blob1 = encrypt(plaintext, &key).unwrap();
        let blob2 = encrypt(plaintext, &key).unwrap();

        // Fresh random nonce per call.
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key1 = random_bytes(KEY_LEN).unwrap();
        let key2 = random_bytes(KEY_LEN).unwrap();

        let blob = encrypt(b"secret data", &key1).unwrap();
        let result = decrypt(&blob, &key2);

        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn any_single_bit_flip_fails_authentication() {
        let key = random_bytes(KEY_LEN).unwrap();
        let blob = encrypt(b"bit flip resistance", &key).unwrap();

        for byte_idx in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[byte_idx] ^= 0x01;

            let result = decrypt(&tampered, &key);
            assert!(
                matches!(result, Err(VaultError::DecryptionFailed)),
                "flip at byte {byte_idx} did not fail authentication"
            );
        }
    }

    #[test]
    fn truncated_blob_fails() {
        let key = random_bytes(KEY_LEN).unwrap();
        let blob = encrypt(b"some data", &key).unwrap();

        let result = decrypt(&blob[..blob.len() - 1], &key);
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));

        // Too short to even contain nonce + tag.
        let result = decrypt(&blob[..8], &key);
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn invalid_key_length_rejected_before_crypto() {
        let short_key = vec![0u8; 16]; // AES-128, not AES-256
        let long_key = vec![0u8; 64];

        assert!(matches!(
            encrypt(b"test", &short_key),
            Err(VaultError::ConfigurationError { .. })
        ));
        assert!(matches!(
            encrypt(b"test", &long_key),
            Err(VaultError::ConfigurationError { .. })
        ));
        assert!(matches!(
            decrypt(b"irrelevant", &short_key),
            Err(VaultError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn json_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();
        let value = serde_json::json!({
            "account": "checking",
            "balance_cents": 123_456,
            "tags": ["groceries", "recurring"],
        });

        let blob = encrypt_json(&value, &key).unwrap();
        let decrypted: serde_json::Value = decrypt_json(&blob, &key).unwrap();

        assert_eq!(decrypted, value);
    }

    #[test]
    fn tampered_json_fails_before_deserialization() {
        let key = random_bytes(KEY_LEN).unwrap();
        let value = serde_json::json!({ "secret": "value" });

        let mut blob = encrypt_json(&value, &key).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;

        // Authentication fails; the error is DecryptionFailed, never a
        // serialization error from parsing garbage plaintext.
        let result: Result<serde_json::Value> = decrypt_json(&blob, &key);
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn random_salt_has_expected_length() {
        let salt = random_salt().unwrap();
        assert_eq!(salt.len(), SALT_LEN);
    }
}
