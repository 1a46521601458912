//! Security tests for key derivation, key wrapping, and keystore sealing
//!
//! Tests cover:
//! - Argon2id KDF determinism and salt/password sensitivity
//! - Master key envelopes under both algorithms
//! - Key sealing/unsealing with the software keystore
//! - Biometric gate behaviour and lockout tracking

use lockbox_storage_sqlite::keystore::{
    BiometricManager, BiometricResponse, BiometricState, KeystoreResult, MockKeystore,
    PlatformKeystore, SealPolicy,
};
use lockbox_storage_sqlite::security::{
    constant_time_eq, derive_key_bytes, derive_master_key, generate_salt, hash_sha256,
    EncryptionAlgorithm, KdfParams, MasterKey, PasswordStrength, SealedKey,
};
use proptest::prelude::*;

const FAST: KdfParams = KdfParams::insecure_for_tests();

// =============================================================================
// KDF
// =============================================================================

#[test]
fn test_strong_parameters_are_mandatory_defaults() {
    let params = KdfParams::default();
    assert_eq!(params.m_cost, 65536);
    assert_eq!(params.t_cost, 3);
    assert_eq!(params.p_cost, 4);
    assert!(params.validate().is_ok());
}

#[test]
fn test_kdf_determinism_vector() {
    let salt: Vec<u8> = (1u8..=32).collect();

    let key1 = derive_key_bytes("MySecurePassphrase!@#$%^", &salt, &FAST).unwrap();
    let key2 = derive_key_bytes("MySecurePassphrase!@#$%^", &salt, &FAST).unwrap();

    assert_eq!(*key1, *key2);
    assert!(key1.iter().any(|&b| b != 0));
}

#[test]
fn test_kdf_different_salt_produces_different_key() {
    let key1 = derive_key_bytes("password", &generate_salt(), &FAST).unwrap();
    let key2 = derive_key_bytes("password", &generate_salt(), &FAST).unwrap();
    assert_ne!(*key1, *key2);
}

#[test]
fn test_kdf_parameters_change_output() {
    let salt = generate_salt();
    let cheap = derive_key_bytes("password", &salt, &FAST).unwrap();
    let other = KdfParams {
        m_cost: 128,
        ..FAST
    };
    let costlier = derive_key_bytes("password", &salt, &other).unwrap();
    assert_ne!(*cheap, *costlier);
}

#[test]
fn test_kdf_salt_minimum_length() {
    assert!(derive_key_bytes("password", &[0u8; 8], &FAST).is_err());
    assert!(derive_key_bytes("password", &[0u8; 16], &FAST).is_ok());
}

#[test]
fn test_invalid_kdf_parameters_rejected() {
    let params = KdfParams {
        m_cost: 1,
        t_cost: 0,
        p_cost: 0,
    };
    assert!(params.validate().is_err());
    assert!(derive_key_bytes("password", &generate_salt(), &params).is_err());
}

#[test]
fn test_wrong_password_cannot_decrypt() {
    let salt = generate_salt();
    let right =
        derive_master_key("correct horse", &salt, &FAST, EncryptionAlgorithm::AesGcm).unwrap();
    let wrong =
        derive_master_key("battery staple", &salt, &FAST, EncryptionAlgorithm::AesGcm).unwrap();

    let envelope = right.encrypt(b"data key").unwrap();
    assert!(wrong.decrypt(&envelope).is_err());
    assert_eq!(right.decrypt(&envelope).unwrap().as_slice(), b"data key");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_distinct_passwords_derive_distinct_keys(
        a in "[a-zA-Z0-9]{1,24}",
        b in "[a-zA-Z0-9]{1,24}",
    ) {
        prop_assume!(a != b);
        let salt = [9u8; 32];
        let ka = derive_key_bytes(&a, &salt, &FAST).unwrap();
        let kb = derive_key_bytes(&b, &salt, &FAST).unwrap();
        prop_assert!(!constant_time_eq(&ka[..], &kb[..]));
    }
}

// =============================================================================
// Master key envelopes
// =============================================================================

#[test]
fn test_envelopes_for_both_algorithms() {
    for algorithm in [EncryptionAlgorithm::AesGcm, EncryptionAlgorithm::ChaCha20Poly1305] {
        let key = MasterKey::generate(algorithm);
        let envelope = key.encrypt(b"payload").unwrap();
        assert_ne!(&envelope[..], b"payload");
        assert_eq!(key.decrypt(&envelope).unwrap().as_slice(), b"payload");
    }
}

#[test]
fn test_tampered_envelope_rejected() {
    let key = MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305);
    let mut envelope = key.encrypt(b"payload").unwrap();
    let last = envelope.len() - 1;
    envelope[last] ^= 0x01;
    assert!(key.decrypt(&envelope).is_err());
}

#[test]
fn test_master_key_debug_is_redacted() {
    let key = MasterKey::from_bytes(&[0xAB; 32], EncryptionAlgorithm::AesGcm).unwrap();
    let rendered = format!("{:?}", key);
    assert!(!rendered.to_lowercase().contains("abab"));
}

#[test]
fn test_sealed_key_invalid_data() {
    assert!(SealedKey::deserialize(&[]).is_err());
    assert!(SealedKey::deserialize(&[1, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());

    let sealed = SealedKey::new(vec![1, 2, 3], "k".into(), EncryptionAlgorithm::AesGcm);
    let mut data = sealed.serialize();
    data.truncate(data.len() - 1);
    assert!(SealedKey::deserialize(&data).is_err());

    let mut data = sealed.serialize();
    data.push(0);
    assert!(SealedKey::deserialize(&data).is_err());
}

#[test]
fn test_verifier_hash_is_stable() {
    assert_eq!(hash_sha256(b"abc"), hash_sha256(b"abc"));
    assert_ne!(hash_sha256(b"abc"), hash_sha256(b"abd"));
}

#[test]
fn test_password_strength_evaluation() {
    assert_eq!(PasswordStrength::evaluate("short"), PasswordStrength::Weak);
    assert_eq!(PasswordStrength::evaluate("eightchr"), PasswordStrength::Fair);
    assert_eq!(
        PasswordStrength::evaluate("Longer-Passw0rd-Here"),
        PasswordStrength::Strong
    );
}

// =============================================================================
// Keystore
// =============================================================================

#[tokio::test]
async fn test_mock_keystore_seal_unseal_roundtrip() {
    let keystore = MockKeystore::new();
    let master_key = MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305);

    let sealed = match keystore
        .seal_key(&master_key, "instance_key", SealPolicy::default())
        .await
    {
        KeystoreResult::Success(sealed) => sealed,
        other => panic!("Expected Success, got {:?}", other),
    };
    assert_eq!(sealed.key_id, "instance_key");
    assert_ne!(sealed.encrypted_key.as_slice(), master_key.as_bytes().as_slice());

    match keystore.unseal_key(&sealed).await {
        KeystoreResult::Success(unsealed) => {
            assert_eq!(unsealed.as_bytes(), master_key.as_bytes());
        }
        other => panic!("Expected Success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sealed_keys_do_not_cross_keystores() {
    let first = MockKeystore::new();
    let second = MockKeystore::new();
    let key = MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305);

    let KeystoreResult::Success(sealed) = first.seal_key(&key, "k", SealPolicy::default()).await
    else {
        panic!("seal failed");
    };

    // Unknown to the second keystore
    assert!(matches!(
        second.unseal_key(&sealed).await,
        KeystoreResult::NotAvailable
    ));
}

#[tokio::test]
async fn test_biometric_gate_responses() {
    let keystore = MockKeystore::with_biometrics();
    let key = MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305);
    let policy = SealPolicy {
        require_biometric: true,
    };

    let KeystoreResult::Success(sealed) = keystore.seal_key(&key, "gated", policy).await else {
        panic!("seal failed");
    };

    keystore.set_biometric_response(BiometricResponse::Cancel);
    assert!(matches!(
        keystore.unseal_key_biometric(&sealed, "Unlock").await,
        KeystoreResult::Cancelled
    ));

    keystore.set_biometric_response(BiometricResponse::Fail);
    assert!(matches!(
        keystore.unseal_key_biometric(&sealed, "Unlock").await,
        KeystoreResult::AuthFailed
    ));

    keystore.set_biometric_response(BiometricResponse::Approve);
    assert!(matches!(
        keystore.unseal_key_biometric(&sealed, "Unlock").await,
        KeystoreResult::Success(_)
    ));
    assert_eq!(keystore.prompt_count(), 3);
}

#[test]
fn test_biometric_lockout_after_max_failures() {
    let mut manager = BiometricManager::new();
    for _ in 0..BiometricManager::MAX_FAILED_ATTEMPTS {
        assert_eq!(manager.state(), BiometricState::Ready);
        manager.record_failure();
    }
    assert!(manager.is_locked_out());

    manager.reset_lockout();
    assert_eq!(manager.state(), BiometricState::Ready);
    assert_eq!(manager.failed_attempts(), 0);
}
