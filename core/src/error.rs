use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Compression, encryption, decryption or envelope parsing failed.
    /// Fatal for the operation, never retried.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Stored bytes fail verification, e.g. the decoded plaintext does not
    /// hash to what the blob metadata declares.
    #[error("Blob {key} is corrupted: {detail}")]
    Corruption { key: String, detail: String },

    /// The file on disk no longer matches the manifest row it was planned from.
    #[error("Source changed since it was recorded: {path}")]
    SourceChanged { path: String },

    #[error("Transient error from backend {backend}: {message}")]
    TransientBackend { backend: String, message: String },

    #[error("Permanent error from backend {backend}: {message}")]
    PermanentBackend { backend: String, message: String },

    /// Another worker owns the record. Callers move on.
    #[error("Claim contention: {0}")]
    StoreContention(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn transient(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TransientBackend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn permanent(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PermanentBackend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::TransientBackend { .. } => true,
            Error::Database(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            _ => false,
        }
    }

    /// Codec and corruption failures must be counted per record, never skipped.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::Codec(_) | Error::Corruption { .. } | Error::SourceChanged { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::transient("s3", "timeout").is_transient());
        assert!(!Error::permanent("s3", "403 Forbidden").is_transient());
        assert!(!Error::Codec("bad frame".into()).is_transient());
        assert!(Error::Codec("bad frame".into()).is_integrity());
        assert!(
            Error::Corruption {
                key: "ab".into(),
                detail: "hash mismatch".into(),
            }
            .is_integrity()
        );
        assert!(!Error::transient("local", "disk busy").is_integrity());
    }
}
