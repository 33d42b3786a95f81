//! Password key derivation with algorithm fallback.
//!
//! Turns a low-entropy password into a 256-bit key-encryption key (KEK),
//! expensive enough to resist offline brute force. Two algorithms are
//! supported:
//!
//! - **Argon2id** (preferred): memory-hard, resistant to GPU attacks.
//! - **PBKDF2-HMAC-SHA256** (fallback): usable on hosts where the
//!   memory-hard cost cannot be satisfied.
//!
//! Parameters are a tagged enum, so derivation dispatch is exhaustive —
//! adding an algorithm requires updating both [`KdfParams`] and
//! [`derive_kek`], and the serialized tag keeps older vaults openable.
//!
//! Fallback policy: callers try [`KdfParams::default_params`] first; on an
//! [`UnsupportedKdf`](VaultError::UnsupportedKdf) failure specifically
//! (never a wrong password — passwords are not verifiable at this layer)
//! they retry with [`KdfParams::fallback_params`] and persist whichever
//! parameters actually produced the key. A vault must never end up with
//! parameters that don't match the algorithm that wrapped its DEK.

use argon2::Argon2;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{self, KEY_LEN};
use crate::error::{Result, VaultError};
use crate::keys::SecretKey;

/// Argon2id cost parameters: 64 MiB, 3 iterations, single lane.
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 1;

/// PBKDF2 iteration count — 600,000 per OWASP 2023 recommendation for
/// HMAC-SHA256.
const PBKDF2_ITERATIONS: u32 = 600_000;

/// PBKDF2 algorithm: HMAC-SHA256.
static PBKDF2_ALG: ring::pbkdf2::Algorithm = ring::pbkdf2::PBKDF2_HMAC_SHA256;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// KDF algorithm tag plus algorithm-specific cost parameters and salt.
///
/// Immutable once persisted, except on explicit password change. The serde
/// tag doubles as the format version: a vault written under either variant
/// stays openable as long as the variant exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum KdfParams {
    /// Memory-hard Argon2id (preferred).
    Argon2id {
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        salt: Vec<u8>,
    },
    /// PBKDF2-HMAC-SHA256 (fallback).
    Pbkdf2Sha256 { iterations: u32, salt: Vec<u8> },
}

impl KdfParams {
    /// Default parameters for the preferred algorithm, with a fresh salt.
    pub fn default_params() -> Result<Self> {
        Ok(Self::Argon2id {
            memory_kib: ARGON2_MEMORY_KIB,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
            salt: crypto::random_salt()?,
        })
    }

    /// Fallback parameters for hosts where the preferred algorithm is
    /// unavailable, with a fresh salt.
    pub fn fallback_params() -> Result<Self> {
        Ok(Self::Pbkdf2Sha256 {
            iterations: PBKDF2_ITERATIONS,
            salt: crypto::random_salt()?,
        })
    }

    /// The algorithm tag as stored, for logging and audit detail.
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::Argon2id { .. } => "argon2id",
            Self::Pbkdf2Sha256 { .. } => "pbkdf2_sha256",
        }
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive a 256-bit KEK from `password` under the given parameters.
///
/// Dispatch is an exhaustive match over [`KdfParams`].
///
/// # Errors
///
/// - [`VaultError::ConfigurationError`] for malformed parameters (bad cost
///   values, empty/short salt) — a corrupted config or programming defect.
/// - [`VaultError::UnsupportedKdf`] when the algorithm cannot run with the
///   requested cost on this host. Callers decide whether a fallback retry
///   is legal (it is only when *choosing* parameters, never when opening
///   an existing wrapped key).
pub fn derive_kek(password: &str, params: &KdfParams) -> Result<SecretKey> {
    match params {
        KdfParams::Argon2id {
            memory_kib,
            iterations,
            parallelism,
            salt,
        } => derive_argon2id(password, *memory_kib, *iterations, *parallelism, salt),
        KdfParams::Pbkdf2Sha256 { iterations, salt } => {
            derive_pbkdf2(password, *iterations, salt)
        }
    }
}

/// Try the preferred algorithm, falling back on platform-support failure.
///
/// Returns the derived KEK together with the parameters that actually
/// produced it; those parameters are what the caller must persist. Only
/// [`VaultError::UnsupportedKdf`] triggers the retry — every other error
/// propagates unchanged, and a failure of the fallback itself is surfaced
/// as-is.
pub fn derive_with_fallback(password: &str) -> Result<(SecretKey, KdfParams)> {
    derive_with_fallback_using(password, derive_kek)
}

/// The fallback policy, generic over the primary derivation.
///
/// `derive_with_fallback` plugs in [`derive_kek`]; taking the primary as a
/// parameter keeps the retry branch reachable without a host that actually
/// rejects the memory-hard cost.
fn derive_with_fallback_using(
    password: &str,
    primary: impl Fn(&str, &KdfParams) -> Result<SecretKey>,
) -> Result<(SecretKey, KdfParams)> {
    let params = KdfParams::default_params()?;
    match primary(password, &params) {
        Ok(kek) => Ok((kek, params)),
        Err(VaultError::UnsupportedKdf { reason }) => {
            tracing::warn!(
                reason = %reason,
                "preferred KDF unavailable, retrying with fallback parameters"
            );
            let fallback = KdfParams::fallback_params()?;
            let kek = derive_kek(password, &fallback)?;
            Ok((kek, fallback))
        }
        Err(e) => Err(e),
    }
}

fn derive_argon2id(
    password: &str,
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
    salt: &[u8],
) -> Result<SecretKey> {
    if salt.len() < 16 {
        return Err(VaultError::ConfigurationError {
            reason: format!("argon2 salt must be at least 16 bytes, got {}", salt.len()),
        });
    }

    let params = argon2::Params::new(memory_kib, iterations, parallelism, Some(KEY_LEN))
        .map_err(|e| VaultError::ConfigurationError {
            reason: format!("invalid argon2 parameters: {e}"),
        })?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    // A failure here with valid parameters means the host could not satisfy
    // the memory-hard cost; that is the fallback trigger, not an auth verdict.
    let mut out = [0u8; KEY_LEN];
    match argon2.hash_password_into(password.as_bytes(), salt, &mut out) {
        Ok(()) => {
            let kek = SecretKey::from_bytes(out);
            out.zeroize();
            Ok(kek)
        }
        Err(e) => {
            out.zeroize();
            Err(VaultError::UnsupportedKdf {
                reason: format!("argon2id derivation unavailable: {e}"),
            })
        }
    }
}

fn derive_pbkdf2(password: &str, iterations: u32, salt: &[u8]) -> Result<SecretKey> {
    let iterations =
        std::num::NonZeroU32::new(iterations).ok_or_else(|| VaultError::ConfigurationError {
            reason: "pbkdf2 iteration count must be non-zero".into(),
        })?;

    let mut out = [0u8; KEY_LEN];
    ring::pbkdf2::derive(PBKDF2_ALG, iterations, salt, password.as_bytes(), &mut out);

    let kek = SecretKey::from_bytes(out);
    out.zeroize();
    Ok(kek)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
