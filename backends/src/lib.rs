pub mod backend;
pub mod health;
pub mod local;
pub mod memory;
pub mod retry;
pub mod s3;

pub use backend::{Backend, BackendType, BatchOutcome, HealthStatus};
pub use health::{HealthSnapshot, HealthTracker};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use retry::{RetryConfig, RetryOutcome, Retryable, retry_counting, retry_with_backoff};
pub use s3::{S3Backend, S3Config};
