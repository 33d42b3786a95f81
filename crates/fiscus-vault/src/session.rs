//! In-memory cryptographic session with auto-lock.
//!
//! The [`SessionManager`] is the single choke point between the persisted,
//! encrypted world and code that needs the data-encryption key (DEK).
//! It is an explicitly constructed, process-wide context — injected into
//! whatever needs it, never ambient global state — holding one
//! Locked/Unlocked state shared by all concurrent callers.
//!
//! # State machine
//!
//! `Locked → (unlock) → Unlocked → (lock / timeout / shutdown) → Locked`
//!
//! Unlock and lock are mutually exclusive: both run under the session
//! mutex, so a second unlock arriving mid-flight queues behind the first,
//! and an explicit `lock()` issued while an unlock is in flight runs after
//! it and still leaves the system cleanly Locked — the superseded
//! session's DEK is dropped (and thereby zeroized), never leaked into a
//! later session.
//!
//! # Error collapse
//!
//! Wrong password, wrong device key, and a corrupted wrapped DEK all
//! surface from [`SessionManager::unlock`] as one undifferentiated
//! [`VaultError::AuthenticationFailed`]. This collapse trades
//! diagnosability for security — a caller (or an attacker driving the UI)
//! must not be able to learn *which* secret input was wrong. It is a
//! deliberate property of the design, preserved on purpose; do not "fix"
//! it by adding more specific messages. Two conditions stay distinct
//! because they are not secret-dependent: a missing device secret
//! ([`VaultError::DeviceKeyUnavailable`], which routes the user to the
//! recovery-key flow) and a KDF algorithm the host cannot run
//! ([`VaultError::UnsupportedKdf`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::audit::{AuditEventKind, AuditLog};
use crate::config::{ConfigStore, VaultConfig};
use crate::error::{Result, VaultError};
use crate::kdf::{self, KdfParams};
use crate::keychain::DeviceKeychain;
use crate::keys::{SecretKey, combine_keys, unwrap_key, wrap_key};

/// Default time budget for a single key-derivation attempt.
pub const DEFAULT_KDF_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

enum SessionState {
    Locked,
    Unlocked {
        /// The unwrapped DEK, cached for the lifetime of the session.
        dek: SecretKey,
        /// Identifies which unlock/activity event armed the current timer;
        /// a stale auto-lock task must not lock a newer session.
        epoch: u64,
        /// The single pending auto-lock task for this session.
        timer: JoinHandle<()>,
    },
}

struct SessionInner {
    store: Arc<ConfigStore>,
    keychain: Arc<dyn DeviceKeychain>,
    audit: Arc<AuditLog>,
    state: Mutex<SessionState>,
    epoch: AtomicU64,
    lock_timeout_ms: AtomicU64,
    kdf_timeout: Duration,
}

/// Process-wide cryptographic session manager.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Build a session manager over the given store, keychain, and audit
    /// log. The session starts Locked.
    pub fn new(
        store: Arc<ConfigStore>,
        keychain: Arc<dyn DeviceKeychain>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                keychain,
                audit,
                state: Mutex::new(SessionState::Locked),
                epoch: AtomicU64::new(0),
                lock_timeout_ms: AtomicU64::new(
                    u64::from(crate::config::DEFAULT_LOCK_TIMEOUT_MINUTES) * 60_000,
                ),
                kdf_timeout: DEFAULT_KDF_TIMEOUT,
            }),
        }
    }

    /// Override the per-attempt key-derivation time budget.
    pub fn with_kdf_timeout(mut self, timeout: Duration) -> Self {
        // Only callable before the manager is shared; Arc::get_mut enforces it.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.kdf_timeout = timeout;
        }
        self
    }

    // -- Lifecycle ----------------------------------------------------------

    /// First-run setup: generate a random DEK, derive a wrapping key from
    /// `password` (preferred KDF with fallback), wrap, and persist the
    /// configuration. Device binding starts disabled. The session remains
    /// Locked; call [`unlock`](Self::unlock) afterwards.
    ///
    /// # Errors
    ///
    /// [`VaultError::ConfigurationError`] if the vault is already
    /// initialized.
    pub async fn initialize(&self, password: &str) -> Result<()> {
        let _guard = self.inner.state.lock().await;

        if self.inner.store.load()?.is_some() {
            return Err(VaultError::ConfigurationError {
                reason: "vault is already initialized".into(),
            });
        }

        let (kek, params) = self.derive_with_fallback_blocking(password).await?;
        let dek = SecretKey::generate()?;

        let wrapping = combine_keys(&kek, None);
        drop(kek);
        let wrapped = wrap_key(&dek, &wrapping)?;

        let config = VaultConfig::new(params, wrapped, false);
        self.inner.store.create(&config)?;
        self.inner
            .lock_timeout_ms
            .store(u64::from(config.lock_timeout_minutes) * 60_000, Ordering::SeqCst);

        self.inner.audit.record_with_detail(
            AuditEventKind::VaultCreated,
            Some(config.kdf_params.algorithm_name()),
        );
        tracing::info!(
            kdf = config.kdf_params.algorithm_name(),
            "vault initialized"
        );
        Ok(())
    }

    /// Unlock the session with the vault password.
    ///
    /// Derives the KEK with the *persisted* parameters (on the blocking
    /// pool, under a per-attempt timeout), combines it with the device key
    /// when binding is enabled, and unwraps the DEK. On success the DEK is
    /// cached and the inactivity timer starts. On any failure the state
    /// stays Locked and no partial session exists.
    ///
    /// Unlocking an already-unlocked session counts as activity and
    /// succeeds without re-deriving — the password is *not* re-verified
    /// in that case, so `unlock` is not a re-authentication gate. Flows
    /// that must re-prove the password while a session is open
    /// ([`change_password`](Self::change_password),
    /// [`reveal_recovery_key`](Self::reveal_recovery_key)) verify it
    /// themselves.
    pub async fn unlock(&self, password: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        if matches!(*state, SessionState::Unlocked { .. }) {
            self.reschedule_timer(&mut state);
            return Ok(());
        }

        let config = self.inner.store.load()?.ok_or(VaultError::VaultUnavailable)?;
        self.inner.lock_timeout_ms.store(
            u64::from(config.lock_timeout_minutes) * 60_000,
            Ordering::SeqCst,
        );

        let result = self.try_unwrap_dek(password, &config).await;
        let dek = match result {
            Ok(dek) => dek,
            Err(e) => {
                self.inner.audit.record(AuditEventKind::UnlockFailed);
                tracing::info!("unlock failed");
                return Err(e);
            }
        };

        let epoch = self.next_epoch();
        let timer = Self::spawn_autolock(Arc::clone(&self.inner), epoch, self.lock_timeout());
        *state = SessionState::Unlocked { dek, epoch, timer };

        self.inner.audit.record(AuditEventKind::UnlockSucceeded);
        tracing::info!("session unlocked");
        Ok(())
    }

    /// Lock the session. Idempotent; usable from any trigger (explicit
    /// action, shutdown hook). The cached DEK is zeroized on release and
    /// the pending auto-lock task is cancelled.
    pub async fn lock(&self) {
        let mut state = self.inner.state.lock().await;
        Self::transition_to_locked(&mut state, &self.inner.audit, AuditEventKind::Locked);
    }

    /// Return an owned copy of the DEK, or fail if the vault is locked.
    ///
    /// This is the single choke point through which every other component
    /// obtains key material. Each successful call counts as activity and
    /// resets the inactivity timer. The returned copy is zeroized when the
    /// caller drops it; the cached original is unaffected.
    pub async fn require_dek(&self) -> Result<SecretKey> {
        let mut state = self.inner.state.lock().await;
        match &*state {
            SessionState::Locked => Err(VaultError::VaultLocked),
            SessionState::Unlocked { dek, .. } => {
                let copy = dek.duplicate();
                self.reschedule_timer(&mut state);
                Ok(copy)
            }
        }
    }

    /// Boolean gate for protected views.
    pub async fn is_authenticated(&self) -> bool {
        matches!(*self.inner.state.lock().await, SessionState::Unlocked { .. })
    }

    /// Adjust the inactivity window without requiring re-unlock. Persists
    /// the new value and, if the session is unlocked, re-arms the timer
    /// with the new window.
    pub async fn update_lock_timeout(&self, minutes: u32) -> Result<()> {
        if minutes == 0 {
            return Err(VaultError::ConfigurationError {
                reason: "lock timeout must be at least one minute".into(),
            });
        }

        let mut state = self.inner.state.lock().await;
        self.inner.store.set_lock_timeout(minutes)?;
        self.inner
            .lock_timeout_ms
            .store(u64::from(minutes) * 60_000, Ordering::SeqCst);

        if matches!(*state, SessionState::Unlocked { .. }) {
            self.reschedule_timer(&mut state);
        }

        self.inner
            .audit
            .record_with_detail(AuditEventKind::LockTimeoutChanged, Some(&minutes.to_string()));
        Ok(())
    }

    // -- Password rotation & device binding ---------------------------------

    /// Rotate the vault password.
    ///
    /// Unwraps the DEK with the old wrapping key, derives fresh parameters
    /// for the new password (preferred KDF with fallback), re-wraps the
    /// *same* DEK, and persists parameters and wrapped key atomically.
    /// Data encrypted under the DEK is untouched — only the envelope
    /// changes. The session state (locked or unlocked) is preserved.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        let _guard = self.inner.state.lock().await;

        let config = self.inner.store.load()?.ok_or(VaultError::VaultUnavailable)?;
        let dek = self.try_unwrap_dek(old_password, &config).await?;

        let (new_kek, new_params) = self.derive_with_fallback_blocking(new_password).await?;
        let device_key = if config.device_key_enabled {
            self.inner
                .keychain
                .get_device_key()?
                .ok_or(VaultError::DeviceKeyUnavailable)
                .map(Some)?
        } else {
            None
        };

        let new_wrapping = combine_keys(&new_kek, device_key.as_ref());
        drop(new_kek);
        let new_wrapped = wrap_key(&dek, &new_wrapping)?;

        self.inner
            .store
            .update_wrapping(&new_params, &new_wrapped, config.device_key_enabled)?;

        self.inner.audit.record_with_detail(
            AuditEventKind::PasswordChanged,
            Some(new_params.algorithm_name()),
        );
        tracing::info!(kdf = new_params.algorithm_name(), "vault password changed");
        Ok(())
    }

    /// Enable device binding: generate the device secret, store it in the
    /// host keychain, and re-wrap the DEK with the combined key. Re-verifies
    /// the password first. A no-op if binding is already enabled.
    pub async fn enable_device_binding(&self, password: &str) -> Result<()> {
        let _guard = self.inner.state.lock().await;

        let config = self.inner.store.load()?.ok_or(VaultError::VaultUnavailable)?;
        if config.device_key_enabled {
            tracing::debug!("device binding already enabled");
            return Ok(());
        }

        let kek = self.derive_kek_blocking(password, config.kdf_params.clone()).await?;
        let wrapping = combine_keys(&kek, None);
        let dek = unwrap_key(&config.wrapped_dek, &wrapping).map_err(Self::collapse_unwrap)?;

        let device_key = SecretKey::generate()?;
        self.inner.keychain.set_device_key(&device_key)?;

        let new_wrapping = combine_keys(&kek, Some(&device_key));
        drop(kek);
        let new_wrapped = wrap_key(&dek, &new_wrapping)?;

        self.inner
            .store
            .update_wrapping(&config.kdf_params, &new_wrapped, true)?;

        self.inner.audit.record(AuditEventKind::DeviceBindingEnabled);
        tracing::info!("device binding enabled");
        Ok(())
    }

    /// Disable device binding: re-wrap the DEK under the KEK alone and
    /// remove the device secret from the host keychain. Re-verifies the
    /// password first. A no-op if binding is already disabled.
    pub async fn disable_device_binding(&self, password: &str) -> Result<()> {
        let _guard = self.inner.state.lock().await;

        let config = self.inner.store.load()?.ok_or(VaultError::VaultUnavailable)?;
        if !config.device_key_enabled {
            tracing::debug!("device binding already disabled");
            return Ok(());
        }

        let device_key = self
            .inner
            .keychain
            .get_device_key()?
            .ok_or(VaultError::DeviceKeyUnavailable)?;

        let kek = self.derive_kek_blocking(password, config.kdf_params.clone()).await?;
        let wrapping = combine_keys(&kek, Some(&device_key));
        let dek = unwrap_key(&config.wrapped_dek, &wrapping).map_err(Self::collapse_unwrap)?;

        let new_wrapping = combine_keys(&kek, None);
        drop(kek);
        let new_wrapped = wrap_key(&dek, &new_wrapping)?;

        self.inner
            .store
            .update_wrapping(&config.kdf_params, &new_wrapped, false)?;
        self.inner.keychain.delete_device_key()?;

        self.inner.audit.record(AuditEventKind::DeviceBindingDisabled);
        tracing::info!("device binding disabled");
        Ok(())
    }

    /// Disclose the device key as a hex string — the out-of-band backup
    /// credential — after re-verifying the password.
    ///
    /// # Errors
    ///
    /// [`VaultError::DeviceKeyUnavailable`] when binding is disabled or
    /// the secret is absent on this host;
    /// [`VaultError::AuthenticationFailed`] for a wrong password.
    pub async fn reveal_recovery_key(&self, password: &str) -> Result<Zeroizing<String>> {
        let _guard = self.inner.state.lock().await;

        let config = self.inner.store.load()?.ok_or(VaultError::VaultUnavailable)?;
        if !config.device_key_enabled {
            return Err(VaultError::DeviceKeyUnavailable);
        }

        let device_key = self
            .inner
            .keychain
            .get_device_key()?
            .ok_or(VaultError::DeviceKeyUnavailable)?;

        let kek = self.derive_kek_blocking(password, config.kdf_params.clone()).await?;
        let wrapping = combine_keys(&kek, Some(&device_key));
        drop(kek);

        // Verification only; the unwrapped DEK is dropped immediately.
        let _dek = unwrap_key(&config.wrapped_dek, &wrapping).map_err(Self::collapse_unwrap)?;

        self.inner.audit.record(AuditEventKind::RecoveryKeyRevealed);
        tracing::info!("recovery key revealed");
        Ok(Zeroizing::new(hex::encode(device_key.as_bytes())))
    }

    // -- Internals ----------------------------------------------------------

    /// Derive the wrapping key for the persisted config and unwrap the DEK.
    ///
    /// Collapses the unwrap authentication failure into
    /// [`VaultError::AuthenticationFailed`]; see the module docs for why
    /// the collapse is intentional and which conditions stay distinct.
    async fn try_unwrap_dek(&self, password: &str, config: &VaultConfig) -> Result<SecretKey> {
        let device_key = if config.device_key_enabled {
            Some(
                self.inner
                    .keychain
                    .get_device_key()?
                    .ok_or(VaultError::DeviceKeyUnavailable)?,
            )
        } else {
            None
        };

        let kek = self
            .derive_kek_blocking(password, config.kdf_params.clone())
            .await?;
        let wrapping = combine_keys(&kek, device_key.as_ref());
        drop(kek);

        unwrap_key(&config.wrapped_dek, &wrapping).map_err(Self::collapse_unwrap)
    }

    /// Map an unwrap failure to the undifferentiated authentication error.
    fn collapse_unwrap(err: VaultError) -> VaultError {
        match err {
            VaultError::DecryptionFailed => VaultError::AuthenticationFailed,
            other => other,
        }
    }

    /// Run `derive_kek` on the blocking pool with the per-attempt timeout,
    /// so an expensive derivation can never stall unrelated tasks.
    async fn derive_kek_blocking(&self, password: &str, params: KdfParams) -> Result<SecretKey> {
        let password = Zeroizing::new(password.to_owned());
        let handle = tokio::task::spawn_blocking(move || kdf::derive_kek(&password, &params));

        match tokio::time::timeout(self.inner.kdf_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(VaultError::ConfigurationError {
                reason: format!("key derivation task failed: {join}"),
            }),
            Err(_) => Err(VaultError::Timeout),
        }
    }

    /// As [`derive_kek_blocking`](Self::derive_kek_blocking), but choosing
    /// parameters with the preferred-then-fallback policy.
    async fn derive_with_fallback_blocking(
        &self,
        password: &str,
    ) -> Result<(SecretKey, KdfParams)> {
        let password = Zeroizing::new(password.to_owned());
        let handle = tokio::task::spawn_blocking(move || kdf::derive_with_fallback(&password));

        match tokio::time::timeout(self.inner.kdf_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(VaultError::ConfigurationError {
                reason: format!("key derivation task failed: {join}"),
            }),
            Err(_) => Err(VaultError::Timeout),
        }
    }

    fn next_epoch(&self) -> u64 {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.lock_timeout_ms.load(Ordering::SeqCst))
    }

    /// Cancel the pending auto-lock task and arm exactly one new one.
    /// Must be called with the state mutex held, so cancel-and-reschedule
    /// is atomic with respect to other activity.
    fn reschedule_timer(&self, state: &mut SessionState) {
        if let SessionState::Unlocked { epoch, timer, .. } = state {
            timer.abort();
            let new_epoch = self.next_epoch();
            *epoch = new_epoch;
            *timer = Self::spawn_autolock(Arc::clone(&self.inner), new_epoch, self.lock_timeout());
        }
    }

    /// The single scheduled auto-lock task for one session epoch.
    fn spawn_autolock(inner: Arc<SessionInner>, epoch: u64, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut state = inner.state.lock().await;
            let current =
                matches!(&*state, SessionState::Unlocked { epoch: e, .. } if *e == epoch);
            if current {
                Self::transition_to_locked(&mut state, &inner.audit, AuditEventKind::AutoLocked);
            }
        })
    }

    /// Shared Unlocked→Locked transition: zeroize the DEK (via drop),
    /// cancel the timer, record the event.
    fn transition_to_locked(state: &mut SessionState, audit: &AuditLog, kind: AuditEventKind) {
        if let SessionState::Unlocked { dek, timer, .. } =
            std::mem::replace(state, SessionState::Locked)
        {
            timer.abort();
            drop(dek);
            audit.record(kind);
            tracing::info!(trigger = kind.as_str(), "session locked");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::keychain::MemoryKeychain;

    const PASSWORD: &str = "correct horse battery staple";

    struct Fixture {
        session: SessionManager,
        keychain: Arc<MemoryKeychain>,
        audit: Arc<AuditLog>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ConfigStore::open_in_memory().unwrap());
        let keychain = Arc::new(MemoryKeychain::new());
        let audit = Arc::new(AuditLog::new(&store));
        let session = SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&keychain) as Arc<dyn DeviceKeychain>,
            Arc::clone(&audit),
        );
        Fixture {
            session,
            keychain,
            audit,
        }
    }

    #[tokio::test]
    async fn unlock_before_initialize_fails() {
        let f = fixture();
        let result = f.session.unlock(PASSWORD).await;
        assert!(matches!(result, Err(VaultError::VaultUnavailable)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initialize_unlock_require_dek() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();

        assert!(!f.session.is_authenticated().await);
        f.session.unlock(PASSWORD).await.unwrap();
        assert!(f.session.is_authenticated().await);

        let dek = f.session.require_dek().await.unwrap();
        let blob = crypto::encrypt(b"record", dek.as_bytes()).unwrap();
        assert_eq!(crypto::decrypt(&blob, dek.as_bytes()).unwrap(), b"record");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wrong_password_is_undifferentiated_auth_failure() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();

        let result = f.session.unlock("not the password").await;
        assert!(matches!(result, Err(VaultError::AuthenticationFailed)));
        assert!(!f.session.is_authenticated().await);

        // And the failed attempt left no partial session behind.
        let result = f.session.require_dek().await;
        assert!(matches!(result, Err(VaultError::VaultLocked)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lock_zeroes_session() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.unlock(PASSWORD).await.unwrap();

        f.session.lock().await;

        assert!(!f.session.is_authenticated().await);
        let result = f.session.require_dek().await;
        assert!(matches!(result, Err(VaultError::VaultLocked)));

        // Locking again is a harmless no-op.
        f.session.lock().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lock_during_inflight_unlock_leaves_vault_locked() {
        let f = fixture();
        let session = Arc::new(f.session);
        session.initialize(PASSWORD).await.unwrap();

        let unlocking = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.unlock(PASSWORD).await })
        };
        // Let the unlock claim the state mutex and start deriving.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queues on the state mutex behind the in-flight unlock and runs
        // after it commits.
        session.lock().await;
        unlocking.await.unwrap().unwrap();

        // The superseded session's DEK is gone; the system is cleanly Locked.
        assert!(!session.is_authenticated().await);
        assert!(matches!(
            session.require_dek().await,
            Err(VaultError::VaultLocked)
        ));

        // Newest-first audit order shows the lock landed after the unlock.
        let kinds: Vec<_> = f.audit.recent(10).unwrap().iter().map(|e| e.kind).collect();
        let locked = kinds.iter().position(|k| *k == AuditEventKind::Locked);
        let unlocked = kinds.iter().position(|k| *k == AuditEventKind::UnlockSucceeded);
        assert!(locked.unwrap() < unlocked.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unlock_while_unlocked_is_activity() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.unlock(PASSWORD).await.unwrap();

        // No second derivation happens; still unlocked.
        f.session.unlock(PASSWORD).await.unwrap();
        assert!(f.session.is_authenticated().await);

        // The short circuit does not look at the password: it is an
        // activity signal, not a re-authentication gate.
        f.session.unlock("not the password").await.unwrap();
        assert!(f.session.is_authenticated().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn double_initialize_rejected() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();

        let result = f.session.initialize(PASSWORD).await;
        assert!(matches!(
            result,
            Err(VaultError::ConfigurationError { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn change_password_preserves_dek() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.unlock(PASSWORD).await.unwrap();

        // Encrypt a record under the current DEK.
        let dek = f.session.require_dek().await.unwrap();
        let blob = crypto::encrypt(b"pre-rotation record", dek.as_bytes()).unwrap();

        f.session.change_password(PASSWORD, "new password").await.unwrap();
        f.session.lock().await;

        // Old password no longer works.
        let result = f.session.unlock(PASSWORD).await;
        assert!(matches!(result, Err(VaultError::AuthenticationFailed)));

        // New password does, and the DEK is unchanged.
        f.session.unlock("new password").await.unwrap();
        let dek = f.session.require_dek().await.unwrap();
        assert_eq!(
            crypto::decrypt(&blob, dek.as_bytes()).unwrap(),
            b"pre-rotation record"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn change_password_with_wrong_old_password_fails() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();

        let result = f.session.change_password("wrong", "new password").await;
        assert!(matches!(result, Err(VaultError::AuthenticationFailed)));

        // The old password still opens the vault.
        f.session.unlock(PASSWORD).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_binding_round_trip() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.unlock(PASSWORD).await.unwrap();
        let dek = f.session.require_dek().await.unwrap();
        let blob = crypto::encrypt(b"bound record", dek.as_bytes()).unwrap();
        f.session.lock().await;

        f.session.enable_device_binding(PASSWORD).await.unwrap();
        assert!(f.keychain.has_device_key().unwrap());

        // Unlock now requires password + device key; DEK is unchanged.
        f.session.unlock(PASSWORD).await.unwrap();
        let dek = f.session.require_dek().await.unwrap();
        assert_eq!(
            crypto::decrypt(&blob, dek.as_bytes()).unwrap(),
            b"bound record"
        );
        f.session.lock().await;

        f.session.disable_device_binding(PASSWORD).await.unwrap();
        assert!(!f.keychain.has_device_key().unwrap());
        f.session.unlock(PASSWORD).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_device_key_is_distinct_from_auth_failure() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.enable_device_binding(PASSWORD).await.unwrap();

        // Simulate a new machine: the credential store is empty.
        f.keychain.delete_device_key().unwrap();

        let result = f.session.unlock(PASSWORD).await;
        assert!(matches!(result, Err(VaultError::DeviceKeyUnavailable)));
        assert!(!f.session.is_authenticated().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reveal_recovery_key_discloses_device_secret() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.enable_device_binding(PASSWORD).await.unwrap();

        let revealed = f.session.reveal_recovery_key(PASSWORD).await.unwrap();
        let device_key = f.keychain.get_device_key().unwrap().unwrap();
        assert_eq!(*revealed, hex::encode(device_key.as_bytes()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reveal_recovery_key_reverifies_password() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.enable_device_binding(PASSWORD).await.unwrap();

        let result = f.session.reveal_recovery_key("wrong").await;
        assert!(matches!(result, Err(VaultError::AuthenticationFailed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reveal_recovery_key_without_binding_fails() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();

        let result = f.session.reveal_recovery_key(PASSWORD).await;
        assert!(matches!(result, Err(VaultError::DeviceKeyUnavailable)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_lock_timeout_rejected() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();

        let result = f.session.update_lock_timeout(0).await;
        assert!(matches!(
            result,
            Err(VaultError::ConfigurationError { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn audit_trail_records_session_events() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.unlock(PASSWORD).await.unwrap();
        f.session.lock().await;
        let _ = f.session.unlock("wrong").await;

        let events = f.audit.recent(10).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();

        assert!(kinds.contains(&AuditEventKind::VaultCreated));
        assert!(kinds.contains(&AuditEventKind::UnlockSucceeded));
        assert!(kinds.contains(&AuditEventKind::Locked));
        assert!(kinds.contains(&AuditEventKind::UnlockFailed));
    }

    // Paused-clock tests need the current-thread runtime.
    #[tokio::test]
    async fn auto_lock_fires_after_inactivity() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.update_lock_timeout(1).await.unwrap();
        f.session.unlock(PASSWORD).await.unwrap();
        assert!(f.session.is_authenticated().await);

        // Let the freshly spawned auto-lock task register its sleep timer
        // before the clock is frozen; otherwise advance() has nothing to fire.
        tokio::task::yield_now().await;

        // Freeze the clock after the expensive work is done, then jump
        // past the one-minute window.
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::time::resume();

        // Give the auto-lock task a moment to run.
        for _ in 0..20 {
            if !f.session.is_authenticated().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.session.is_authenticated().await);

        let events = f.audit.recent(10).unwrap();
        assert!(events.iter().any(|e| e.kind == AuditEventKind::AutoLocked));
    }

    #[tokio::test]
    async fn activity_pushes_back_auto_lock() {
        let f = fixture();
        f.session.initialize(PASSWORD).await.unwrap();
        f.session.update_lock_timeout(1).await.unwrap();
        f.session.unlock(PASSWORD).await.unwrap();

        // Let the auto-lock task register its sleep timer before freezing
        // the clock; otherwise advance() has nothing to fire.
        tokio::task::yield_now().await;

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(45)).await;
        tokio::time::resume();

        // Activity at t=45s re-arms the window.
        let _ = f.session.require_dek().await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(45)).await;
        tokio::time::resume();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // t=90s but only 45s since the last activity: still unlocked.
        assert!(f.session.is_authenticated().await);

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::time::resume();
        for _ in 0..20 {
            if !f.session.is_authenticated().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // 75s since the last activity: locked.
        assert!(!f.session.is_authenticated().await);
    }
}
