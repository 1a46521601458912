//! Encrypted SQLite storage for Lockbox instances
//!
//! Provides the key material and datastore primitives the session layer
//! builds on.
//!
//! ## Security Features
//!
//! - **Datastore Encryption**: SQLCipher page encryption keyed by a random data key
//! - **Key Wrapping**: AES-256-GCM or ChaCha20-Poly1305 envelopes
//! - **Password KDF**: Argon2id, 64 MiB memory, 3 iterations, 4 lanes by default
//! - **Key Sealing**: Platform keystores (Android Keystore, iOS Keychain, DPAPI, libsecret)
//! - **Biometric Gate**: Optional fingerprint/face confirmation with lockout tracking

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod database;
pub mod encryption;
pub mod error;
pub mod files;
pub mod keystore;
pub mod migrations;
pub mod models;
pub mod security;

pub use database::Database;
pub use encryption::EncryptionKey;
pub use error::{Error, Result};
pub use keystore::{
    BiometricManager, BiometricResponse, BiometricState, BiometricType, KeystoreCapabilities,
    KeystoreResult, MockKeystore, PlatformKeystore, SealPolicy,
};
pub use models::*;
pub use security::{
    constant_time_eq, derive_key_bytes, derive_master_key, generate_salt, hash_sha256,
    EncryptionAlgorithm, KdfParams, MasterKey, PasswordStrength, SealedKey, KEY_LENGTH,
};
