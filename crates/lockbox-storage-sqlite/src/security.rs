//! Security and encryption primitives
//!
//! Implements AES-GCM and ChaCha20-Poly1305 sealing of key material,
//! Argon2id password derivation with per-credential parameters, and key
//! zeroization.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, ParamsBuilder, Version};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Length of every symmetric key handled by this crate
pub const KEY_LENGTH: usize = 32;

/// Minimum salt length accepted by the KDF
pub const MIN_SALT_LENGTH: usize = 16;

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LENGTH: usize = 12;
const HEADER_LENGTH: usize = 2 + NONCE_LENGTH;

/// Encryption algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM
    AesGcm,
    /// ChaCha20-Poly1305
    #[default]
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            Self::AesGcm => 0,
            Self::ChaCha20Poly1305 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::AesGcm),
            1 => Ok(Self::ChaCha20Poly1305),
            other => Err(Error::Encryption(format!("Unknown algorithm: {}", other))),
        }
    }
}

/// Symmetric key with an attached AEAD algorithm.
///
/// Key bytes live in a `Zeroizing` buffer and are wiped when the key is dropped.
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LENGTH]>,
    algorithm: EncryptionAlgorithm,
}

impl MasterKey {
    /// Generate new random master key
    pub fn generate(algorithm: EncryptionAlgorithm) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut key[..]);

        Self { key, algorithm }
    }

    /// Create from bytes
    pub fn from_bytes(bytes: &[u8], algorithm: EncryptionAlgorithm) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(Error::Encryption("Invalid key length".to_string()));
        }

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(bytes);

        Ok(Self { key, algorithm })
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Algorithm used by [`MasterKey::encrypt`]
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Encrypt data
    ///
    /// Format: `[version(1)][algorithm(1)][nonce(12)][ciphertext]`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = match self.algorithm {
            EncryptionAlgorithm::AesGcm => {
                Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key[..]))
                    .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.key[..]))
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce_bytes), plaintext)
            }
        }
        .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(HEADER_LENGTH + ciphertext.len());
        result.push(ENVELOPE_VERSION);
        result.push(self.algorithm.tag());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypt data produced by [`MasterKey::encrypt`]
    pub fn decrypt(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if data.len() < HEADER_LENGTH {
            return Err(Error::Encryption("Invalid ciphertext length".to_string()));
        }

        if data[0] != ENVELOPE_VERSION {
            return Err(Error::Encryption(format!(
                "Unsupported encryption version: {}",
                data[0]
            )));
        }

        let algorithm = EncryptionAlgorithm::from_tag(data[1])?;
        if algorithm != self.algorithm {
            return Err(Error::Encryption(format!(
                "Algorithm mismatch: expected {:?}, got {:?}",
                self.algorithm, algorithm
            )));
        }

        let nonce = &data[2..HEADER_LENGTH];
        let ciphertext = &data[HEADER_LENGTH..];

        let plaintext = match algorithm {
            EncryptionAlgorithm::AesGcm => {
                Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key[..]))
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.key[..]))
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            }
        }
        .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Password strength buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStrength {
    /// Weak: < 8 characters
    Weak,
    /// Fair: 8-11 characters
    Fair,
    /// Good: 12-15 characters, or longer with little variety
    Good,
    /// Strong: 16+ characters with variety
    Strong,
}

impl PasswordStrength {
    /// Evaluate password strength
    pub fn evaluate(password: &str) -> Self {
        let len = password.chars().count();
        let variety_score = [
            password.chars().any(|c| c.is_ascii_lowercase()),
            password.chars().any(|c| c.is_ascii_uppercase()),
            password.chars().any(|c| c.is_ascii_digit()),
            password.chars().any(|c| !c.is_alphanumeric()),
        ]
        .iter()
        .filter(|&&b| b)
        .count();

        if len < 8 {
            Self::Weak
        } else if len < 12 {
            Self::Fair
        } else if len < 16 || variety_score < 3 {
            Self::Good
        } else {
            Self::Strong
        }
    }
}

/// Argon2id cost parameters, persisted next to every credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub m_cost: u32,
    /// Iterations
    pub t_cost: u32,
    /// Lanes
    pub p_cost: u32,
}

impl KdfParams {
    /// Mandatory production parameters: 64 MiB, 3 iterations, 4 lanes
    pub const STRONG: Self = Self {
        m_cost: 65536,
        t_cost: 3,
        p_cost: 4,
    };

    /// Cheap parameters for tests and tooling. Never use for real data.
    pub const fn insecure_for_tests() -> Self {
        Self {
            m_cost: 64,
            t_cost: 1,
            p_cost: 1,
        }
    }

    /// Reject parameters Argon2 cannot run with
    pub fn validate(&self) -> Result<()> {
        self.build().map(|_| ())
    }

    fn build(&self) -> Result<argon2::Params> {
        ParamsBuilder::new()
            .m_cost(self.m_cost)
            .t_cost(self.t_cost)
            .p_cost(self.p_cost)
            .output_len(KEY_LENGTH)
            .build()
            .map_err(|e| Error::Validation(format!("Invalid KDF parameters: {}", e)))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::STRONG
    }
}

/// Derive raw key bytes from a password using Argon2id.
pub fn derive_key_bytes(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    if salt.len() < MIN_SALT_LENGTH {
        return Err(Error::Encryption("Salt too short".to_string()));
    }

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params.build()?);

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| Error::Encryption(e.to_string()))?;

    Ok(key)
}

/// Derive a [`MasterKey`] for `algorithm` from a password
pub fn derive_master_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
    algorithm: EncryptionAlgorithm,
) -> Result<MasterKey> {
    let bytes = derive_key_bytes(password, salt, params)?;
    MasterKey::from_bytes(&bytes[..], algorithm)
}

/// Key sealed by a platform keystore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKey {
    /// Encrypted master key
    pub encrypted_key: Vec<u8>,
    /// Key identifier
    pub key_id: String,
    /// Encryption algorithm
    pub algorithm: EncryptionAlgorithm,
}

impl SealedKey {
    /// Create new sealed key
    pub fn new(encrypted_key: Vec<u8>, key_id: String, algorithm: EncryptionAlgorithm) -> Self {
        Self {
            encrypted_key,
            key_id,
            algorithm,
        }
    }

    /// Serialize for storage
    pub fn serialize(&self) -> Vec<u8> {
        let key_id_bytes = self.key_id.as_bytes();
        let mut data = Vec::with_capacity(10 + key_id_bytes.len() + self.encrypted_key.len());

        data.push(1);
        data.push(self.algorithm.tag());

        data.extend_from_slice(&(key_id_bytes.len() as u32).to_le_bytes());
        data.extend_from_slice(key_id_bytes);

        data.extend_from_slice(&(self.encrypted_key.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.encrypted_key);

        data
    }

    /// Deserialize from storage
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 10 {
            return Err(Error::Encryption("Invalid sealed key data".to_string()));
        }

        if data[0] != 1 {
            return Err(Error::Encryption("Unknown sealed key version".to_string()));
        }
        let algorithm = EncryptionAlgorithm::from_tag(data[1])?;

        let mut pos = 2;
        let key_id_bytes = read_chunk(data, &mut pos)?;
        let key_id = String::from_utf8(key_id_bytes.to_vec())
            .map_err(|_| Error::Encryption("Invalid key ID".to_string()))?;
        let encrypted_key = read_chunk(data, &mut pos)?.to_vec();

        if pos != data.len() {
            return Err(Error::Encryption("Trailing sealed key data".to_string()));
        }

        Ok(Self {
            encrypted_key,
            key_id,
            algorithm,
        })
    }
}

fn read_chunk<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let truncated = || Error::Encryption("Truncated sealed key data".to_string());

    let len_bytes: [u8; 4] = data
        .get(*pos..*pos + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(truncated)?;
    *pos += 4;

    let len = u32::from_le_bytes(len_bytes) as usize;
    let chunk = data.get(*pos..*pos + len).ok_or_else(truncated)?;
    *pos += len;
    Ok(chunk)
}

/// Generate secure random salt
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Hash data with SHA-256
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compare two byte strings without leaking where they differ
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_generation() {
        let key = MasterKey::generate(EncryptionAlgorithm::AesGcm);
        assert_eq!(key.as_bytes().len(), 32);
        assert!(key.as_bytes().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_encryption_decryption_aes_gcm() {
        let key = MasterKey::generate(EncryptionAlgorithm::AesGcm);
        let plaintext = b"Hello, Lockbox!";

        let ciphertext = key.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext.as_slice(), plaintext);
        assert_eq!(ciphertext[1], 0);

        let decrypted = key.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_encryption_decryption_chacha20() {
        let key = MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305);
        let plaintext = b"Secret message";

        let ciphertext = key.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext[1], 1);

        let decrypted = key.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_wrong_key_decryption() {
        let key1 = MasterKey::generate(EncryptionAlgorithm::AesGcm);
        let key2 = MasterKey::generate(EncryptionAlgorithm::AesGcm);

        let ciphertext = key1.encrypt(b"Secret").unwrap();
        assert!(key2.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_algorithm_mismatch_rejected() {
        let bytes = [7u8; 32];
        let aes = MasterKey::from_bytes(&bytes, EncryptionAlgorithm::AesGcm).unwrap();
        let chacha = MasterKey::from_bytes(&bytes, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();

        let ciphertext = aes.encrypt(b"data").unwrap();
        assert!(chacha.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let key = MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305);
        assert!(key.decrypt(&[1, 1, 0]).is_err());
    }

    #[test]
    fn test_debug_does_not_print_key() {
        let key = MasterKey::from_bytes(&[0xAB; 32], EncryptionAlgorithm::AesGcm).unwrap();
        let printed = format!("{:?}", key);
        assert!(!printed.contains("171"));
        assert!(!printed.to_lowercase().contains("ab, ab"));
    }

    #[test]
    fn test_password_strength_evaluation() {
        assert_eq!(PasswordStrength::evaluate("short"), PasswordStrength::Weak);
        assert_eq!(PasswordStrength::evaluate("password12"), PasswordStrength::Fair);
        assert_eq!(PasswordStrength::evaluate("MyPassword123"), PasswordStrength::Good);
        assert_eq!(
            PasswordStrength::evaluate("MySecurePass123!@#"),
            PasswordStrength::Strong
        );
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let salt = generate_salt();
        let params = KdfParams::insecure_for_tests();
        let key1 = derive_key_bytes("passphrase", &salt, &params).unwrap();
        let key2 = derive_key_bytes("passphrase", &salt, &params).unwrap();

        assert_eq!(*key1, *key2);
    }

    #[test]
    fn test_key_derivation_depends_on_params() {
        let salt = generate_salt();
        let cheap = KdfParams::insecure_for_tests();
        let other = KdfParams { t_cost: 2, ..cheap };

        let key1 = derive_key_bytes("passphrase", &salt, &cheap).unwrap();
        let key2 = derive_key_bytes("passphrase", &salt, &other).unwrap();
        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_salt_minimum_length() {
        let params = KdfParams::insecure_for_tests();
        assert!(derive_key_bytes("test", &[0u8; 15], &params).is_err());
        assert!(derive_key_bytes("test", &[0u8; 16], &params).is_ok());
    }

    #[test]
    fn test_kdf_params_validation() {
        assert!(KdfParams::STRONG.validate().is_ok());
        assert!(KdfParams::insecure_for_tests().validate().is_ok());
        assert!(KdfParams { m_cost: 64, t_cost: 0, p_cost: 1 }.validate().is_err());
        assert!(KdfParams { m_cost: 1, t_cost: 1, p_cost: 4 }.validate().is_err());
    }

    #[test]
    fn test_argon2id_default_parameters() {
        let params = KdfParams::default();
        assert_eq!(params.m_cost, 65536);
        assert_eq!(params.t_cost, 3);
        assert_eq!(params.p_cost, 4);
    }

    #[test]
    fn test_sealed_key_serialization() {
        let sealed = SealedKey::new(
            vec![1, 2, 3, 4],
            "test_key".to_string(),
            EncryptionAlgorithm::ChaCha20Poly1305,
        );

        let deserialized = SealedKey::deserialize(&sealed.serialize()).unwrap();
        assert_eq!(deserialized, sealed);
    }

    #[test]
    fn test_sealed_key_truncated_data_is_error() {
        let sealed = SealedKey::new(vec![9; 48], "k".to_string(), EncryptionAlgorithm::AesGcm);
        let mut bytes = sealed.serialize();
        bytes.truncate(bytes.len() - 5);

        assert!(SealedKey::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
