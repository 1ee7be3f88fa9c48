//! Per-blob key derivation and AEAD.
//!
//! Salt and nonce are derived from the storage key, never drawn at random:
//! the salt is `key[..16]` and the nonce is `key[20..]`. Re-encrypting the
//! same (path, content) reproduces the identical ciphertext.
//!
//! A storage key must only ever encrypt one plaintext. The key is a hash of
//! the content hash, so this holds as long as nonces stay key-derived.
//! Random nonces would make rebuilt blobs differ from the first upload and
//! break idempotent retries and recovery.

use crate::{Error, Result, StorageKey};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

pub struct BlobKey {
    key: [u8; KEY_LEN],
}

impl BlobKey {
    /// PBKDF2-HMAC-SHA256 over the passphrase, salted with the first 16 bytes of the storage key.
    pub fn derive(passphrase: &str, storage_key: &StorageKey, params: &KdfParams) -> Result<Self> {
        if params.iterations == 0 {
            return Err(Error::Codec("KDF iterations must be non-zero".to_string()));
        }
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            salt_for(storage_key),
            params.iterations,
            &mut key,
        );
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for BlobKey {
    fn drop(&mut self) {
        self.key.fill(0);
    }
}

pub fn salt_for(storage_key: &StorageKey) -> &[u8] {
    &storage_key.as_bytes()[..SALT_LEN]
}

pub fn nonce_for(storage_key: &StorageKey) -> &[u8] {
    let bytes = storage_key.as_bytes();
    &bytes[bytes.len() - NONCE_LEN..]
}

pub struct Encryptor {
    cipher: ChaCha20Poly1305,
}

impl Encryptor {
    pub fn new(key: &BlobKey) -> Self {
        let key = Key::from_slice(key.as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    pub fn for_blob(passphrase: &str, storage_key: &StorageKey, params: &KdfParams) -> Result<Self> {
        Ok(Self::new(&BlobKey::derive(passphrase, storage_key, params)?))
    }

    /// ChaCha20-Poly1305 with the key-derived nonce and no associated data.
    /// The output is ciphertext followed by the 16-byte tag; the nonce is not stored.
    pub fn encrypt(&self, storage_key: &StorageKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce_for(storage_key));
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Codec(format!("encryption failed: {e}")))
    }

    pub fn decrypt(&self, storage_key: &StorageKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce_for(storage_key));
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Codec("decryption failed: wrong passphrase or corrupted payload".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: KdfParams = KdfParams { iterations: 10 };

    #[test]
    fn test_encryption_roundtrip() {
        let storage_key = StorageKey::from_data(b"docs/report.txt:00");
        let encryptor = Encryptor::for_blob("hunter2", &storage_key, &FAST).unwrap();

        let plaintext = b"Hello, blobkeep!";
        let ciphertext = encryptor.encrypt(&storage_key, plaintext).unwrap();
        let decrypted = encryptor.decrypt(&storage_key, &ciphertext).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
        assert_eq!(ciphertext.len(), plaintext.len() + 16);
    }

    #[test]
    fn test_same_key_same_ciphertext() {
        let storage_key = StorageKey::from_data(b"a:1");
        let first = Encryptor::for_blob("pw", &storage_key, &FAST)
            .unwrap()
            .encrypt(&storage_key, b"payload")
            .unwrap();
        let second = Encryptor::for_blob("pw", &storage_key, &FAST)
            .unwrap()
            .encrypt(&storage_key, b"payload")
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let storage_key = StorageKey::from_data(b"a:1");
        let ciphertext = Encryptor::for_blob("right", &storage_key, &FAST)
            .unwrap()
            .encrypt(&storage_key, b"payload")
            .unwrap();
        let err = Encryptor::for_blob("wrong", &storage_key, &FAST)
            .unwrap()
            .decrypt(&storage_key, &ciphertext)
            .unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_salt_and_nonce_come_from_key_ends() {
        let storage_key = StorageKey::from([7u8; 32]);
        assert_eq!(salt_for(&storage_key).len(), SALT_LEN);
        assert_eq!(nonce_for(&storage_key).len(), NONCE_LEN);

        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let storage_key = StorageKey::from(bytes);
        assert_eq!(salt_for(&storage_key), &bytes[..16]);
        assert_eq!(nonce_for(&storage_key), &bytes[20..]);
    }

    #[test]
    fn test_default_iterations() {
        assert_eq!(KdfParams::default().iterations, 100_000);
        assert!(BlobKey::derive("pw", &StorageKey::from([1u8; 32]), &KdfParams { iterations: 0 }).is_err());
    }
}
