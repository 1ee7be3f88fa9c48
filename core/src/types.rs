use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn from_data(data: &[u8]) -> Self {
                Self(*blake3::hash(data).as_bytes())
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn short_string(&self) -> String {
                self.to_hex().chars().take(12).collect()
            }
        }

        impl From<blake3::Hash> for $name {
            fn from(hash: blake3::Hash) -> Self {
                Self(*hash.as_bytes())
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut array = [0u8; 32];
                hex::decode_to_slice(s, &mut array)?;
                Ok(Self(array))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                $name::from_str(&s).map_err(serde::de::Error::custom)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

digest_id!(
    /// BLAKE3 of the file bytes, or of the symlink target string.
    ContentHash
);

digest_id!(
    /// BLAKE3 of `canonical_path + ":" + content_hash_hex`. Doubles as the
    /// backend object key (hex) and as the source of the blob's salt and nonce.
    StorageKey
);

digest_id!(
    /// BLAKE3 over the changeset name and its sorted path list.
    ChangesetId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    File,
    Symlink,
}

impl BlobType {
    pub fn from_symlink_flag(is_symlink: bool) -> Self {
        if is_symlink { BlobType::Symlink } else { BlobType::File }
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, BlobType::Symlink)
    }
}

/// Upload progress of a record, derived from its two timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadState {
    NotStarted,
    InProgress,
    Completed,
}

impl UploadState {
    pub fn from_timestamps(started: Option<DateTime<Utc>>, finished: Option<DateTime<Utc>>) -> Self {
        match (started, finished) {
            (_, Some(_)) => UploadState::Completed,
            (Some(_), None) => UploadState::InProgress,
            (None, None) => UploadState::NotStarted,
        }
    }

    /// Whether `claim_batch` may take the record. A stale `InProgress` counts as `NotStarted`.
    pub fn is_claimable(
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        stuck_threshold: Duration,
    ) -> bool {
        match Self::from_timestamps(started, finished) {
            UploadState::NotStarted => true,
            UploadState::InProgress => started.is_some_and(|s| s < now - stuck_threshold),
            UploadState::Completed => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangesetStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Processing => "processing",
            ChangesetStatus::Completed => "completed",
            ChangesetStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "processing" => Ok(ChangesetStatus::Processing),
            "completed" => Ok(ChangesetStatus::Completed),
            "failed" => Ok(ChangesetStatus::Failed),
            other => Err(crate::Error::InvalidInput(format!("unknown changeset status: {other}"))),
        }
    }
}

impl fmt::Display for ChangesetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record is parked outside the claim pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hold {
    /// Retry budget exhausted, or a codec/corruption error.
    Failed,
    /// Permanent backend error; waiting for an operator.
    Blocked,
}

impl Hold {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hold::Failed => "failed",
            Hold::Blocked => "blocked",
        }
    }
}

impl FromStr for Hold {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "failed" => Ok(Hold::Failed),
            "blocked" => Ok(Hold::Blocked),
            other => Err(crate::Error::InvalidInput(format!("unknown hold: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub changeset_id: ChangesetId,
    pub device_id: Option<u64>,
    pub inode_id: Option<u64>,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub content_hash: ContentHash,
    pub storage_key: StorageKey,
    pub is_canonical: bool,
    pub is_symlink: bool,
    pub upload_started_at: Option<DateTime<Utc>>,
    pub upload_finished_at: Option<DateTime<Utc>>,
    pub hold: Option<Hold>,
    pub last_error: Option<String>,
}

impl FileRecord {
    pub fn upload_state(&self) -> UploadState {
        UploadState::from_timestamps(self.upload_started_at, self.upload_finished_at)
    }

    pub fn blob_type(&self) -> BlobType {
        BlobType::from_symlink_flag(self.is_symlink)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub changeset_id: ChangesetId,
    pub name: String,
    /// BLAKE3 over the sorted storage keys.
    pub content_signature: String,
    pub created_at: DateTime<Utc>,
    pub file_count: u64,
    pub total_size: u64,
    pub status: ChangesetStatus,
}

impl Changeset {
    pub fn short_id(&self) -> String {
        self.changeset_id.short_string()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} - {} files, {} bytes, {} ({})",
            self.short_id(),
            self.name,
            self.file_count,
            self.total_size,
            self.status,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Pending,
    Completed,
    Failed,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Pending => "pending",
            BackendState::Completed => "completed",
            BackendState::Failed => "failed",
        }
    }
}

impl FromStr for BackendState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(BackendState::Pending),
            "completed" => Ok(BackendState::Completed),
            "failed" => Ok(BackendState::Failed),
            other => Err(crate::Error::InvalidInput(format!("unknown backend state: {other}"))),
        }
    }
}

/// Per-(storage key, backend) delivery record, kept in multi-backend mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub storage_key: StorageKey,
    pub backend: String,
    pub status: BackendState,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Plaintext metadata carried by every blob. Readable without the passphrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub path: String,
    pub size: u64,
    /// Modification time as float seconds since the epoch.
    pub timestamp: f64,
    pub file_hash: ContentHash,
    #[serde(rename = "type")]
    pub blob_type: BlobType,
}

impl BlobMetadata {
    pub fn modified(&self) -> DateTime<Utc> {
        let millis = (self.timestamp * 1000.0).round() as i64;
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }
}

pub fn timestamp_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}
