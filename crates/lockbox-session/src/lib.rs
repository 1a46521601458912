//! Session and credential lifecycle for Lockbox instances
//!
//! Turns a password into an unlocked data key for an instance's encrypted
//! datastore, optionally remembers the unlock behind the platform keystore,
//! and tells dependents when the active instance changes.
//!
//! ## Components
//!
//! - [`CredentialStore`]: password verifier material and rotation
//! - [`PersistedSessionVault`]: keystore-sealed "remember me" record
//! - [`InstanceChangeNotifier`]: explicit instance-change events
//! - [`SessionManager`]: per-instance lifecycle state machine
//! - [`SessionRegistry`]: owns the managers and the active instance

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credential;
pub mod error;
pub mod instance;
pub mod manager;
pub mod notifier;
pub mod registry;
mod serde_hex;
pub mod vault;

pub use config::SessionConfig;
pub use credential::{Credential, CredentialStore, SetupOutcome, UnlockedKey, VerifyOutcome};
pub use error::{Error, Result};
pub use instance::{InstanceId, InstanceLayout};
pub use manager::{BiometricCapability, SessionManager, SessionState};
pub use notifier::{InstanceChange, InstanceChangeNotifier, QueryCache, Subscription};
pub use registry::SessionRegistry;
pub use vault::{PersistedSessionRecord, PersistedSessionVault, UnwrapOutcome};

pub use lockbox_storage_sqlite::{
    BiometricResponse, BiometricType, EncryptionAlgorithm, KdfParams, MockKeystore,
    PasswordStrength, PlatformKeystore, QueryResult, SqlValue,
};
