//! Platform keystore integration for secure key sealing
//!
//! Provides a unified interface to platform-specific secure storage
//! (Android Keystore, iOS/macOS Keychain, DPAPI, libsecret). The host
//! application injects an implementation; this crate only defines the
//! contract plus a software [`MockKeystore`] for tests and tooling.

use crate::{EncryptionAlgorithm, Error, MasterKey, Result, SealedKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Platform capabilities for secure storage
#[derive(Debug, Clone)]
pub struct KeystoreCapabilities {
    /// Has biometric authentication available
    pub has_biometrics: bool,
    /// Kind of biometric sensor, [`BiometricType::None`] when unavailable
    pub biometric_type: BiometricType,
}

impl Default for KeystoreCapabilities {
    fn default() -> Self {
        Self {
            has_biometrics: false,
            biometric_type: BiometricType::None,
        }
    }
}

/// Biometric authentication type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiometricType {
    /// Fingerprint sensor
    Fingerprint,
    /// Face recognition (Face ID)
    Face,
    /// Iris scanner
    Iris,
    /// Multiple types available
    Multiple,
    /// Unknown or unavailable
    None,
}

impl BiometricType {
    /// Short label suitable for UI strings
    pub fn label(&self) -> &'static str {
        match self {
            BiometricType::Fingerprint => "fingerprint",
            BiometricType::Face => "face",
            BiometricType::Iris => "iris",
            BiometricType::Multiple => "biometrics",
            BiometricType::None => "none",
        }
    }
}

/// How a key should be protected when sealed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SealPolicy {
    /// Unsealing must pass a biometric prompt
    pub require_biometric: bool,
}

/// Keystore result for operations that may require user interaction
#[derive(Debug)]
pub enum KeystoreResult<T> {
    /// Success
    Success(T),
    /// User cancelled authentication
    Cancelled,
    /// Authentication failed (wrong biometric, timeout, etc.)
    AuthFailed,
    /// Keystore or key not available on this platform
    NotAvailable,
    /// Error occurred
    Error(Error),
}

impl<T> From<Result<T>> for KeystoreResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => KeystoreResult::Success(v),
            Err(e) => KeystoreResult::Error(e),
        }
    }
}

/// Platform keystore abstraction
///
/// Implementations bridge to native platform code. Prompting methods are
/// async because the platform suspends while the user answers the prompt.
#[async_trait]
pub trait PlatformKeystore: Send + Sync {
    /// Get platform capabilities
    fn capabilities(&self) -> KeystoreCapabilities;

    /// Seal (encrypt) a key using the platform keystore
    async fn seal_key(
        &self,
        key: &MasterKey,
        key_id: &str,
        policy: SealPolicy,
    ) -> KeystoreResult<SealedKey>;

    /// Unseal (decrypt) a key that was sealed without a biometric gate
    async fn unseal_key(&self, sealed: &SealedKey) -> KeystoreResult<MasterKey>;

    /// Unseal with biometric authentication, showing `reason` in the prompt
    async fn unseal_key_biometric(
        &self,
        sealed: &SealedKey,
        reason: &str,
    ) -> KeystoreResult<MasterKey>;

    /// Delete a sealed key from the keystore
    async fn delete_key(&self, key_id: &str) -> Result<()>;

    /// Check if biometric authentication is available
    fn has_biometrics(&self) -> bool {
        self.capabilities().has_biometrics
    }

    /// Get available biometric type
    fn biometric_type(&self) -> BiometricType {
        let caps = self.capabilities();
        if caps.has_biometrics {
            caps.biometric_type
        } else {
            BiometricType::None
        }
    }
}

/// Scripted answer the mock keystore gives to biometric prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiometricResponse {
    /// User confirms
    Approve,
    /// User dismisses the prompt
    Cancel,
    /// Sensor rejects the user
    Fail,
}

const GATE_NONE: u8 = 0;
const GATE_BIOMETRIC: u8 = 1;

/// Software keystore for tests and platforms without native integration.
///
/// Seals with ChaCha20-Poly1305 under a per-process device key, so sealed
/// keys do not survive a restart. Biometric prompts are answered from a
/// scripted [`BiometricResponse`].
pub struct MockKeystore {
    capabilities: KeystoreCapabilities,
    device_key: MasterKey,
    live_keys: Mutex<HashSet<String>>,
    available: AtomicBool,
    response: Mutex<BiometricResponse>,
    prompts: AtomicUsize,
}

impl MockKeystore {
    /// Create new mock keystore without biometrics
    pub fn new() -> Self {
        Self::with_capabilities(KeystoreCapabilities::default())
    }

    /// Create a mock keystore reporting a fingerprint sensor
    pub fn with_biometrics() -> Self {
        Self::with_capabilities(KeystoreCapabilities {
            has_biometrics: true,
            biometric_type: BiometricType::Fingerprint,
        })
    }

    /// Create with custom capabilities (for testing)
    pub fn with_capabilities(capabilities: KeystoreCapabilities) -> Self {
        Self {
            capabilities,
            device_key: MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305),
            live_keys: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            response: Mutex::new(BiometricResponse::Approve),
            prompts: AtomicUsize::new(0),
        }
    }

    /// Simulate the secure store becoming (un)available
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Script the answer to subsequent biometric prompts
    pub fn set_biometric_response(&self, response: BiometricResponse) {
        *self.response.lock() = response;
    }

    /// Number of biometric prompts shown so far
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::Acquire)
    }

    /// Whether a key id is currently held by the keystore
    pub fn contains_key(&self, key_id: &str) -> bool {
        self.live_keys.lock().contains(key_id)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn open(&self, sealed: &SealedKey) -> KeystoreResult<(u8, MasterKey)> {
        if !self.is_available() || !self.contains_key(&sealed.key_id) {
            return KeystoreResult::NotAvailable;
        }

        let plaintext = match self.device_key.decrypt(&sealed.encrypted_key) {
            Ok(p) => p,
            Err(e) => return KeystoreResult::Error(e),
        };
        let Some((&gate, key_bytes)) = plaintext.split_first() else {
            return KeystoreResult::Error(Error::Keystore("Empty sealed payload".to_string()));
        };

        match MasterKey::from_bytes(key_bytes, sealed.algorithm) {
            Ok(key) => KeystoreResult::Success((gate, key)),
            Err(e) => KeystoreResult::Error(e),
        }
    }
}

impl Default for MockKeystore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformKeystore for MockKeystore {
    fn capabilities(&self) -> KeystoreCapabilities {
        self.capabilities.clone()
    }

    async fn seal_key(
        &self,
        key: &MasterKey,
        key_id: &str,
        policy: SealPolicy,
    ) -> KeystoreResult<SealedKey> {
        if !self.is_available() {
            return KeystoreResult::NotAvailable;
        }

        let gate = if policy.require_biometric && self.has_biometrics() {
            GATE_BIOMETRIC
        } else {
            GATE_NONE
        };

        let mut payload = zeroize::Zeroizing::new(Vec::with_capacity(1 + key.as_bytes().len()));
        payload.push(gate);
        payload.extend_from_slice(key.as_bytes());

        let encrypted = match self.device_key.encrypt(&payload) {
            Ok(e) => e,
            Err(e) => return KeystoreResult::Error(e),
        };

        self.live_keys.lock().insert(key_id.to_string());
        KeystoreResult::Success(SealedKey::new(
            encrypted,
            key_id.to_string(),
            key.algorithm(),
        ))
    }

    async fn unseal_key(&self, sealed: &SealedKey) -> KeystoreResult<MasterKey> {
        match self.open(sealed) {
            KeystoreResult::Success((GATE_NONE, key)) => KeystoreResult::Success(key),
            // Gated keys refuse to open without a prompt
            KeystoreResult::Success(_) => KeystoreResult::AuthFailed,
            KeystoreResult::Cancelled => KeystoreResult::Cancelled,
            KeystoreResult::AuthFailed => KeystoreResult::AuthFailed,
            KeystoreResult::NotAvailable => KeystoreResult::NotAvailable,
            KeystoreResult::Error(e) => KeystoreResult::Error(e),
        }
    }

    async fn unseal_key_biometric(
        &self,
        sealed: &SealedKey,
        reason: &str,
    ) -> KeystoreResult<MasterKey> {
        if !self.has_biometrics() {
            return KeystoreResult::NotAvailable;
        }

        let (_, key) = match self.open(sealed) {
            KeystoreResult::Success(opened) => opened,
            KeystoreResult::Cancelled => return KeystoreResult::Cancelled,
            KeystoreResult::AuthFailed => return KeystoreResult::AuthFailed,
            KeystoreResult::NotAvailable => return KeystoreResult::NotAvailable,
            KeystoreResult::Error(e) => return KeystoreResult::Error(e),
        };

        self.prompts.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("Biometric prompt shown: {}", reason);

        match *self.response.lock() {
            BiometricResponse::Approve => KeystoreResult::Success(key),
            BiometricResponse::Cancel => KeystoreResult::Cancelled,
            BiometricResponse::Fail => KeystoreResult::AuthFailed,
        }
    }

    async fn delete_key(&self, key_id: &str) -> Result<()> {
        self.live_keys.lock().remove(key_id);
        Ok(())
    }
}

// =============================================================================
// Biometric lockout tracking
// =============================================================================

/// Biometric unlock state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiometricState {
    /// Ready to prompt
    Ready,
    /// Locked out (too many failed attempts)
    LockedOut,
}

/// Tracks consecutive biometric failures and enforces a temporary lockout
#[derive(Debug)]
pub struct BiometricManager {
    failed_attempts: u32,
    locked_until: Option<Instant>,
    lockout: Duration,
}

impl BiometricManager {
    /// Maximum failed attempts before lockout
    pub const MAX_FAILED_ATTEMPTS: u32 = 5;

    /// Lockout duration in seconds
    pub const LOCKOUT_DURATION_SECS: u64 = 30;

    /// Create new biometric manager
    pub fn new() -> Self {
        Self::with_lockout(Duration::from_secs(Self::LOCKOUT_DURATION_SECS))
    }

    /// Create with a custom lockout duration
    pub fn with_lockout(lockout: Duration) -> Self {
        Self {
            failed_attempts: 0,
            locked_until: None,
            lockout,
        }
    }

    /// Get current state, expiring an elapsed lockout
    pub fn state(&mut self) -> BiometricState {
        match self.locked_until {
            Some(until) if Instant::now() < until => BiometricState::LockedOut,
            Some(_) => {
                self.reset_lockout();
                BiometricState::Ready
            }
            None => BiometricState::Ready,
        }
    }

    /// Check if locked out
    pub fn is_locked_out(&mut self) -> bool {
        self.state() == BiometricState::LockedOut
    }

    /// Record successful authentication
    pub fn record_success(&mut self) {
        self.reset_lockout();
    }

    /// Record failed authentication
    pub fn record_failure(&mut self) {
        self.failed_attempts += 1;
        if self.failed_attempts >= Self::MAX_FAILED_ATTEMPTS {
            self.locked_until = Some(Instant::now() + self.lockout);
        }
    }

    /// Consecutive failures since the last success
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Reset lockout (after timeout or a successful password unlock)
    pub fn reset_lockout(&mut self) {
        self.failed_attempts = 0;
        self.locked_until = None;
    }
}

impl Default for BiometricManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MasterKey {
        MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305)
    }

    #[tokio::test]
    async fn test_mock_keystore_seal_unseal() {
        let keystore = MockKeystore::new();
        let master_key = key();

        let KeystoreResult::Success(sealed) = keystore
            .seal_key(&master_key, "test_key", SealPolicy::default())
            .await
        else {
            panic!("seal failed");
        };
        assert_eq!(sealed.key_id, "test_key");
        assert_ne!(sealed.encrypted_key.as_slice(), master_key.as_bytes().as_slice());

        match keystore.unseal_key(&sealed).await {
            KeystoreResult::Success(unsealed) => {
                assert_eq!(unsealed.as_bytes(), master_key.as_bytes())
            }
            other => panic!("Failed to unseal key: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gated_key_requires_prompt() {
        let keystore = MockKeystore::with_biometrics();
        let policy = SealPolicy {
            require_biometric: true,
        };
        let KeystoreResult::Success(sealed) = keystore.seal_key(&key(), "gated", policy).await
        else {
            panic!("seal failed");
        };

        assert!(matches!(
            keystore.unseal_key(&sealed).await,
            KeystoreResult::AuthFailed
        ));
        assert!(matches!(
            keystore.unseal_key_biometric(&sealed, "unlock").await,
            KeystoreResult::Success(_)
        ));
        assert_eq!(keystore.prompt_count(), 1);

        keystore.set_biometric_response(BiometricResponse::Cancel);
        assert!(matches!(
            keystore.unseal_key_biometric(&sealed, "unlock").await,
            KeystoreResult::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_gate_ignored_without_biometrics() {
        let keystore = MockKeystore::new();
        let policy = SealPolicy {
            require_biometric: true,
        };
        let KeystoreResult::Success(sealed) = keystore.seal_key(&key(), "plain", policy).await
        else {
            panic!("seal failed");
        };

        assert!(matches!(
            keystore.unseal_key(&sealed).await,
            KeystoreResult::Success(_)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_and_deleted_keys() {
        let keystore = MockKeystore::new();
        let KeystoreResult::Success(sealed) = keystore
            .seal_key(&key(), "k1", SealPolicy::default())
            .await
        else {
            panic!("seal failed");
        };

        keystore.delete_key("k1").await.unwrap();
        assert!(!keystore.contains_key("k1"));
        assert!(matches!(
            keystore.unseal_key(&sealed).await,
            KeystoreResult::NotAvailable
        ));

        keystore.set_available(false);
        assert!(matches!(
            keystore.seal_key(&key(), "k2", SealPolicy::default()).await,
            KeystoreResult::NotAvailable
        ));
    }

    #[test]
    fn test_biometric_manager_lockout() {
        let mut manager = BiometricManager::new();
        assert!(!manager.is_locked_out());

        for _ in 0..BiometricManager::MAX_FAILED_ATTEMPTS {
            manager.record_failure();
        }
        assert!(manager.is_locked_out());

        manager.reset_lockout();
        assert_eq!(manager.state(), BiometricState::Ready);
    }

    #[test]
    fn test_biometric_lockout_expires() {
        let mut manager = BiometricManager::with_lockout(Duration::from_millis(0));
        for _ in 0..BiometricManager::MAX_FAILED_ATTEMPTS {
            manager.record_failure();
        }

        std::thread::sleep(Duration::from_millis(5));
        assert!(!manager.is_locked_out());
        assert_eq!(manager.failed_attempts(), 0);
    }
}
