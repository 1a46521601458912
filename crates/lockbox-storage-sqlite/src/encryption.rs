//! Datastore encryption key

use crate::security::{MasterKey, KEY_LENGTH};
use zeroize::Zeroizing;

/// Raw SQLCipher key for an instance datastore
pub struct EncryptionKey(Zeroizing<[u8; KEY_LENGTH]>);

impl EncryptionKey {
    /// Create from raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the bytes of a master key as a datastore key
    pub fn from_master_key(key: &MasterKey) -> Self {
        Self(Zeroizing::new(*key.as_bytes()))
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// SQLCipher raw-key literal (`x'…'`), zeroized on drop
    pub(crate) fn pragma_literal(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("\"x'{}'\"", hex::encode(self.as_bytes())))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}
