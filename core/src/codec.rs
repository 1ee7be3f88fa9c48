//! Content identity and the blob wire format.
//!
//! A blob is a JSON object:
//!
//! ```text
//! {
//!   "encrypted_content": "<base64 of ChaCha20-Poly1305(LZ4-frame(plaintext))>",
//!   "metadata": { "path", "size", "timestamp", "file_hash", "type" }
//! }
//! ```
//!
//! The metadata block is plaintext so an inventory can be taken without the
//! passphrase. The backend object key is the hex storage key.

use crate::crypto::{Encryptor, KdfParams};
use crate::types::timestamp_seconds;
use crate::{BlobMetadata, BlobType, ContentHash, Error, Result, StorageKey};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// `(content_hash, storage_key)` for the bytes (or symlink target) found at `path`.
pub fn identify(path: &str, content: &[u8]) -> (ContentHash, StorageKey) {
    let content_hash = ContentHash::from_data(content);
    let storage_key = storage_key_for(path, &content_hash);
    (content_hash, storage_key)
}

/// Path-aware: the same bytes under two canonical paths get two keys.
pub fn storage_key_for(canonical_path: &str, content_hash: &ContentHash) -> StorageKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical_path.as_bytes());
    hasher.update(b":");
    hasher.update(content_hash.to_hex().as_bytes());
    StorageKey::from(hasher.finalize())
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len() / 2 + 64));
    encoder
        .write_all(data)
        .map_err(|e| Error::Codec(format!("lz4 compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Codec(format!("lz4 compression failed: {e}")))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::Codec(format!("lz4 decompression failed: {e}")))?;
    Ok(result)
}

/// Encrypt already-compressed plaintext with the default KDF parameters.
pub fn encode(storage_key: &StorageKey, compressed: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    BlobCodec::new(passphrase).encode(storage_key, compressed)
}

/// Inverse of [`encode`].
pub fn decode(storage_key: &StorageKey, payload: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    BlobCodec::new(passphrase).decode(storage_key, payload)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub encrypted_content: String,
    pub metadata: BlobMetadata,
}

#[derive(Deserialize)]
struct MetadataOnly {
    metadata: BlobMetadata,
}

impl Blob {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Codec(format!("malformed blob envelope: {e}")))
    }

    /// Parse just the plaintext metadata block; the payload is skipped.
    pub fn read_metadata(data: &[u8]) -> Result<BlobMetadata> {
        serde_json::from_slice::<MetadataOnly>(data)
            .map(|m| m.metadata)
            .map_err(|e| Error::Codec(format!("malformed blob metadata: {e}")))
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.encrypted_content)
            .map_err(|e| Error::Codec(format!("invalid base64 payload: {e}")))
    }
}

/// A blob ready to push, with the identity it was built under.
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub storage_key: StorageKey,
    pub content_hash: ContentHash,
    pub bytes: Bytes,
}

pub struct BlobCodec {
    passphrase: String,
    kdf: KdfParams,
}

impl BlobCodec {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self::with_kdf_params(passphrase, KdfParams::default())
    }

    pub fn with_kdf_params(passphrase: impl Into<String>, kdf: KdfParams) -> Self {
        Self {
            passphrase: passphrase.into(),
            kdf,
        }
    }

    pub fn kdf_params(&self) -> &KdfParams {
        &self.kdf
    }

    pub fn encode(&self, storage_key: &StorageKey, compressed: &[u8]) -> Result<Vec<u8>> {
        Encryptor::for_blob(&self.passphrase, storage_key, &self.kdf)?.encrypt(storage_key, compressed)
    }

    pub fn decode(&self, storage_key: &StorageKey, payload: &[u8]) -> Result<Vec<u8>> {
        Encryptor::for_blob(&self.passphrase, storage_key, &self.kdf)?.decrypt(storage_key, payload)
    }

    /// Build the blob for the canonical member of a group.
    ///
    /// `content` is the file bytes, or the symlink target for symlinks.
    pub fn seal(
        &self,
        canonical_path: &str,
        content: &[u8],
        blob_type: BlobType,
        modified: DateTime<Utc>,
    ) -> Result<SealedBlob> {
        let (content_hash, storage_key) = identify(canonical_path, content);
        let compressed = compress(content)?;
        let encrypted = self.encode(&storage_key, &compressed)?;

        let blob = Blob {
            encrypted_content: BASE64.encode(encrypted),
            metadata: BlobMetadata {
                path: canonical_path.to_string(),
                size: content.len() as u64,
                timestamp: timestamp_seconds(modified),
                file_hash: content_hash,
                blob_type,
            },
        };

        Ok(SealedBlob {
            storage_key,
            content_hash,
            bytes: blob.to_bytes()?,
        })
    }

    /// Decrypt, decompress and verify against the declared metadata.
    ///
    /// The metadata path and content hash must reproduce `storage_key`, and
    /// the plaintext must match the declared size and hash.
    pub fn open(&self, storage_key: &StorageKey, blob: &Blob) -> Result<Vec<u8>> {
        let expected_key = storage_key_for(&blob.metadata.path, &blob.metadata.file_hash);
        if expected_key != *storage_key {
            return Err(Error::Corruption {
                key: storage_key.to_hex(),
                detail: format!(
                    "metadata for {} derives storage key {}",
                    blob.metadata.path, expected_key
                ),
            });
        }

        let payload = blob.payload()?;
        let compressed = self.decode(storage_key, &payload)?;
        let plaintext = decompress(&compressed)?;

        if plaintext.len() as u64 != blob.metadata.size {
            return Err(Error::Corruption {
                key: storage_key.to_hex(),
                detail: format!("expected {} bytes, got {}", blob.metadata.size, plaintext.len()),
            });
        }

        let actual = ContentHash::from_data(&plaintext);
        if actual != blob.metadata.file_hash {
            return Err(Error::Corruption {
                key: storage_key.to_hex(),
                detail: format!(
                    "expected content hash {}, got {}",
                    blob.metadata.file_hash,
                    actual
                ),
            });
        }
        Ok(plaintext)
    }

    pub fn open_bytes(&self, storage_key: &StorageKey, data: &[u8]) -> Result<(BlobMetadata, Vec<u8>)> {
        let blob = Blob::from_bytes(data)?;
        let plaintext = self.open(storage_key, &blob)?;
        Ok((blob.metadata, plaintext))
    }
}
