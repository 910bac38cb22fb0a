//! Fragment sealing using AES-256-GCM
//!
//! Each stored fragment is sealed under a key derived (HKDF-SHA256) from a
//! key-ring entry and the fragment ID. The sealed envelope records which
//! key-ring entry was used, so fragments sealed under an old key stay
//! readable while a rotation is in progress.

use super::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

/// Identifier of a key-ring entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(pub u32);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// AES-256-GCM encryption key
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Create a new encryption key from bytes
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Generate a random encryption key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Encrypt data with AES-256-GCM
    /// Returns: nonce (12 bytes) || ciphertext || tag (16 bytes)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypt data produced by [`EncryptionKey::encrypt`]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("Ciphertext too short".into()));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);

        cipher
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Derive the key that seals one specific fragment
    pub fn derive_fragment_key(&self, fragment_id: &str) -> Result<EncryptionKey, CryptoError> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(fragment_id.as_bytes()), &self.key);
        let mut fragment_key = [0u8; KEY_SIZE];
        hk.expand(b"tessera-fragment-key", &mut fragment_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(EncryptionKey::new(fragment_key))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// On-server representation of a sealed fragment
#[derive(Debug, Serialize, Deserialize)]
struct SealedEnvelope {
    key_id: KeyId,
    payload: Vec<u8>,
}

struct KeyRingState {
    active: KeyId,
    keys: BTreeMap<KeyId, EncryptionKey>,
}

/// Set of keys able to open stored fragments; exactly one is active for sealing
pub struct KeyRing {
    state: RwLock<KeyRingState>,
}

impl KeyRing {
    /// Create a key ring whose first (active) entry is `initial`
    pub fn new(initial: EncryptionKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(KeyId(1), initial);
        Self {
            state: RwLock::new(KeyRingState {
                active: KeyId(1),
                keys,
            }),
        }
    }

    /// Key currently used for new seals
    pub fn active_id(&self) -> KeyId {
        self.state.read().active
    }

    /// All keys able to open fragments
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.state.read().keys.keys().copied().collect()
    }

    pub fn contains(&self, id: KeyId) -> bool {
        self.state.read().keys.contains_key(&id)
    }

    /// Add a key and make it active; older keys remain available for opening
    pub fn install(&self, key: EncryptionKey) -> KeyId {
        let mut state = self.state.write();
        let id = KeyId(state.keys.keys().next_back().map(|k| k.0 + 1).unwrap_or(1));
        state.keys.insert(id, key);
        state.active = id;
        id
    }

    /// Re-register a key under a known id (used when a node restarts mid-rotation)
    pub fn insert(&self, id: KeyId, key: EncryptionKey) {
        self.state.write().keys.insert(id, key);
    }

    /// Remove a non-active key from the ring
    pub fn retire(&self, id: KeyId) -> Result<(), CryptoError> {
        let mut state = self.state.write();
        if state.active == id {
            return Err(CryptoError::KeyInUse(id));
        }
        state
            .keys
            .remove(&id)
            .map(|_| ())
            .ok_or(CryptoError::UnknownKey(id))
    }

    /// Seal a fragment under the active key
    pub fn seal(&self, fragment_id: &str, plaintext: &[u8]) -> Result<(KeyId, Vec<u8>), CryptoError> {
        let active = self.active_id();
        let sealed = self.seal_with(active, fragment_id, plaintext)?;
        Ok((active, sealed))
    }

    /// Seal a fragment under a specific key
    pub fn seal_with(&self, id: KeyId, fragment_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let payload = {
            let state = self.state.read();
            let key = state.keys.get(&id).ok_or(CryptoError::UnknownKey(id))?;
            key.derive_fragment_key(fragment_id)?.encrypt(plaintext)?
        };

        bincode::serialize(&SealedEnvelope { key_id: id, payload })
            .map_err(|e| CryptoError::InvalidData(e.to_string()))
    }

    /// Open a sealed fragment with whichever key sealed it
    pub fn open(&self, fragment_id: &str, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope: SealedEnvelope =
            bincode::deserialize(sealed).map_err(|e| CryptoError::InvalidData(e.to_string()))?;

        let state = self.state.read();
        let key = state
            .keys
            .get(&envelope.key_id)
            .ok_or(CryptoError::UnknownKey(envelope.key_id))?;
        key.derive_fragment_key(fragment_id)?.decrypt(&envelope.payload)
    }

    /// Read the key id recorded in a sealed envelope
    pub fn envelope_key_id(sealed: &[u8]) -> Result<KeyId, CryptoError> {
        let envelope: SealedEnvelope =
            bincode::deserialize(sealed).map_err(|e| CryptoError::InvalidData(e.to_string()))?;
        Ok(envelope.key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = EncryptionKey::generate();
        let plaintext = b"fragment bytes";

        let ciphertext = key.encrypt(plaintext).unwrap();
        let decrypted = key.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_different_keys_fail() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();

        let ciphertext = key1.encrypt(b"Secret data").unwrap();

        assert!(key2.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_fragment_keys_are_distinct() {
        let master = EncryptionKey::generate();

        let a = master.derive_fragment_key("f-v1-frag-00").unwrap();
        let b = master.derive_fragment_key("f-v1-frag-01").unwrap();
        let a_again = master.derive_fragment_key("f-v1-frag-00").unwrap();

        assert_ne!(a.key, b.key);
        assert_eq!(a.key, a_again.key);
    }

    #[test]
    fn test_keyring_seal_open_across_rotation() {
        let ring = KeyRing::new(EncryptionKey::generate());
        let (old_id, sealed_old) = ring.seal("frag-a", b"old data").unwrap();

        let new_id = ring.install(EncryptionKey::generate());
        assert_ne!(old_id, new_id);
        assert_eq!(ring.active_id(), new_id);

        let (id, sealed_new) = ring.seal("frag-b", b"new data").unwrap();
        assert_eq!(id, new_id);

        // Both generations stay readable until the old key is retired
        assert_eq!(ring.open("frag-a", &sealed_old).unwrap(), b"old data");
        assert_eq!(ring.open("frag-b", &sealed_new).unwrap(), b"new data");
        assert_eq!(KeyRing::envelope_key_id(&sealed_old).unwrap(), old_id);

        ring.retire(old_id).unwrap();
        assert!(matches!(
            ring.open("frag-a", &sealed_old),
            Err(CryptoError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_cannot_retire_active_key() {
        let ring = KeyRing::new(EncryptionKey::generate());
        assert!(matches!(
            ring.retire(ring.active_id()),
            Err(CryptoError::KeyInUse(_))
        ));
    }

    #[test]
    fn test_open_with_wrong_fragment_id_fails() {
        let ring = KeyRing::new(EncryptionKey::generate());
        let (_, sealed) = ring.seal("frag-a", b"payload").unwrap();

        assert!(ring.open("frag-b", &sealed).is_err());
    }
}
