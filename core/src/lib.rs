pub mod canonical;
pub mod changeset;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod manifest;
pub mod types;

pub use canonical::{DiscoveredFile, HardlinkGroup};
pub use changeset::{ChangesetPlan, ChangesetRequest, FsSource, SourceReader};
pub use codec::{Blob, BlobCodec, SealedBlob};
pub use crypto::KdfParams;
pub use error::{Error, Result};
pub use manifest::{ChangesetProgress, ChangesetReport, ManifestStore};
pub use types::*;
