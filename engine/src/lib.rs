pub mod audit;
pub mod coordinator;
pub mod discovery;
pub mod recovery;
pub mod stats;
pub mod worker;

pub use audit::{AuditReport, audit, repair};
pub use coordinator::{
    BackendSlot, CoordinatorConfig, LaggingBackendPolicy, LaggingReport, RecordFailure, RunReport, UploadCoordinator,
};
pub use discovery::{DiscoveryClient, TreeScanner};
pub use recovery::{Inventory, Reconstructor, RecoveredBlob, RecoveredFile, RebuildReport, RestoreOptions, RestoreReport};
pub use stats::{StatsSummary, WorkerStats};
pub use worker::{Worker, WorkerConfig};
