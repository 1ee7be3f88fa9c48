//! Claim, build, push, commit.
//!
//! Every claimed canonical record goes through
//! `Claimed -> BlobBuilt -> Pushed(backend...) -> Committed`, or ends up held
//! (`failed` / `blocked`) or deferred. Nothing here needs to be atomic across
//! steps: a crash anywhere before `commit_group` leaves a stale claim that the
//! next `claim_batch` picks up, and rebuilding the blob yields the same bytes.

use crate::stats::WorkerStats;
use blobkeep_backends::{Backend, HealthTracker, RetryConfig, retry_counting};
use blobkeep_core::changeset::plan;
use blobkeep_core::{
    BackendState, BlobCodec, ChangesetId, ChangesetRequest, ChangesetStatus, Error, FileRecord, Hold, KdfParams,
    ManifestStore, Result, SealedBlob, SourceReader, StorageKey,
};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_BATCH_SIZE: u32 = 64;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_BACKEND_CONCURRENCY: usize = 4;
const CONTENTION_BACKOFF: Duration = Duration::from_millis(50);

/// What to do with backends that fell behind once quorum was reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaggingBackendPolicy {
    /// Retry failed deliveries at the end of every run.
    Automatic,
    /// Only when asked through [`UploadCoordinator::retry_lagging_backends`].
    #[default]
    OnDemand,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub batch_size: u32,
    /// Records processed at once.
    pub concurrency: usize,
    /// Backends pushed to at once for a single record.
    pub backend_concurrency: usize,
    /// `None` requires every configured backend.
    pub require_minimum_backends: Option<usize>,
    pub lagging_backends: LaggingBackendPolicy,
    pub kdf: KdfParams,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            backend_concurrency: DEFAULT_BACKEND_CONCURRENCY,
            require_minimum_backends: None,
            lagging_backends: LaggingBackendPolicy::default(),
            kdf: KdfParams::default(),
        }
    }
}

/// A configured backend and the retry budget for pushes to it.
#[derive(Clone)]
pub struct BackendSlot {
    pub backend: Arc<dyn Backend>,
    pub retry: RetryConfig,
}

impl BackendSlot {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub path: String,
    pub storage_key: StorageKey,
    pub hold: Option<Hold>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub claimed: u64,
    pub committed: u64,
    pub deduplicated: u64,
    pub failed: u64,
    pub blocked: u64,
    /// Left claimed, either because no usable backend was available or
    /// because processing hit a manifest or runtime error. Claimable again
    /// once the claim goes stale.
    pub deferred: u64,
    pub bytes_uploaded: u64,
    pub failures: Vec<RecordFailure>,
    pub lagging: Option<LaggingReport>,
    pub status: Option<ChangesetStatus>,
}

impl RunReport {
    fn absorb(&mut self, outcome: RecordOutcome) {
        self.claimed += 1;
        match outcome {
            RecordOutcome::Committed { bytes } => {
                self.committed += 1;
                self.bytes_uploaded += bytes;
            }
            RecordOutcome::Deduplicated => self.deduplicated += 1,
            RecordOutcome::Held(failure) => {
                match failure.hold {
                    Some(Hold::Blocked) => self.blocked += 1,
                    _ => self.failed += 1,
                }
                self.failures.push(failure);
            }
            RecordOutcome::Deferred(failure) => {
                self.deferred += 1;
                self.failures.push(failure);
            }
        }
    }

    fn merge(&mut self, other: RunReport) {
        self.claimed += other.claimed;
        self.committed += other.committed;
        self.deduplicated += other.deduplicated;
        self.failed += other.failed;
        self.blocked += other.blocked;
        self.deferred += other.deferred;
        self.bytes_uploaded += other.bytes_uploaded;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaggingReport {
    pub attempted: u64,
    pub recovered: u64,
    pub still_failing: u64,
    /// Groups that reached quorum thanks to the retry.
    pub committed: u64,
}

#[derive(Debug)]
enum RecordOutcome {
    Committed { bytes: u64 },
    Deduplicated,
    Held(RecordFailure),
    Deferred(RecordFailure),
}

#[derive(Debug)]
enum PushResult {
    Stored,
    Skipped,
    Failed(Error),
}

pub struct UploadCoordinator {
    manifest: ManifestStore,
    backends: Vec<BackendSlot>,
    source: Arc<dyn SourceReader>,
    codec: Arc<BlobCodec>,
    health: Arc<HealthTracker>,
    stats: Arc<WorkerStats>,
    config: CoordinatorConfig,
}

impl UploadCoordinator {
    pub fn new(
        manifest: ManifestStore,
        backends: Vec<BackendSlot>,
        source: Arc<dyn SourceReader>,
        passphrase: impl Into<String>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::InvalidInput("at least one backend is required".to_string()));
        }
        let mut names = HashSet::new();
        for slot in &backends {
            if !names.insert(slot.name().to_string()) {
                return Err(Error::InvalidInput(format!("duplicate backend name: {}", slot.name())));
            }
        }
        if let Some(quorum) = config.require_minimum_backends {
            if quorum == 0 || quorum > backends.len() {
                return Err(Error::InvalidInput(format!(
                    "require_minimum_backends must be between 1 and {}, got {quorum}",
                    backends.len()
                )));
            }
        }

        Ok(Self {
            manifest,
            backends,
            source,
            codec: Arc::new(BlobCodec::with_kdf_params(passphrase, config.kdf)),
            health: Arc::new(HealthTracker::default()),
            stats: Arc::new(WorkerStats::new()),
            config,
        })
    }

    pub fn with_health_tracker(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = health;
        self
    }

    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn multi_backend(&self) -> bool {
        self.backends.len() > 1
    }

    pub fn quorum(&self) -> usize {
        self.config
            .require_minimum_backends
            .unwrap_or(self.backends.len())
            .clamp(1, self.backends.len())
    }

    /// Plan a changeset and record it. Submitting the same request twice
    /// returns the same id and inserts nothing the second time.
    #[instrument(skip(self, request), fields(name = %request.name, files = request.files.len()))]
    pub async fn submit(&self, request: &ChangesetRequest) -> Result<ChangesetId> {
        let planned = plan(request, self.source.as_ref()).await?;
        let id = planned.changeset.changeset_id;
        let created = self.manifest.insert_changeset(&planned.changeset, &planned.records).await?;
        if created {
            info!(
                changeset = %id.short_string(),
                records = planned.records.len(),
                canonical = planned.groups,
                "Submitted changeset"
            );
        } else {
            info!(changeset = %id.short_string(), "Changeset already submitted");
        }
        Ok(id)
    }

    /// Work a changeset until nothing is claimable, then settle its status.
    pub async fn run_changeset(&self, changeset_id: &ChangesetId) -> Result<RunReport> {
        self.run_changeset_with(changeset_id, |_| {}).await
    }

    /// [`run_changeset`](Self::run_changeset), calling `on_batch` after every batch.
    pub async fn run_changeset_with<F>(&self, changeset_id: &ChangesetId, mut on_batch: F) -> Result<RunReport>
    where
        F: FnMut(&RunReport) + Send,
    {
        if self.manifest.get_changeset(changeset_id).await?.is_none() {
            return Err(Error::NotFound(format!("changeset {}", changeset_id.short_string())));
        }

        let mut report = RunReport::default();
        loop {
            let batch = match self.run_batch(changeset_id).await {
                Ok(batch) => batch,
                Err(Error::StoreContention(reason)) => {
                    debug!(reason = %reason, "Claim lost to another worker, retrying");
                    tokio::time::sleep(CONTENTION_BACKOFF).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if batch.claimed == 0 {
                break;
            }
            on_batch(&batch);
            report.merge(batch);
        }

        if self.multi_backend() && self.config.lagging_backends == LaggingBackendPolicy::Automatic {
            report.lagging = Some(self.retry_lagging_backends(Some(changeset_id)).await?);
        }

        let status = self.manifest.refresh_status(changeset_id).await?;
        report.status = Some(status);
        info!(
            changeset = %changeset_id.short_string(),
            status = %status,
            committed = report.committed,
            deduplicated = report.deduplicated,
            failed = report.failed,
            blocked = report.blocked,
            deferred = report.deferred,
            "Changeset run finished"
        );
        Ok(report)
    }

    /// Claim one batch and process it. `claimed == 0` means no claimable work.
    pub async fn run_batch(&self, changeset_id: &ChangesetId) -> Result<RunReport> {
        let claimed = self.manifest.claim_batch(changeset_id, self.config.batch_size).await?;
        let mut report = RunReport::default();
        if claimed.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<(String, StorageKey, Result<RecordOutcome>)> = stream::iter(claimed)
            .map(|record| {
                async move {
                    let path = record.path.clone();
                    let key = record.storage_key;
                    (path, key, self.process(record).await)
                }
                .boxed()
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (path, storage_key, outcome) in outcomes {
            let outcome = outcome.unwrap_or_else(|e| {
                warn!(path = %path, storage_key = %storage_key.short_string(), error = %e, "Record left claimed");
                self.stats.record_deferred();
                RecordOutcome::Deferred(RecordFailure {
                    path,
                    storage_key,
                    hold: None,
                    error: e.to_string(),
                })
            });
            report.absorb(outcome);
        }
        Ok(report)
    }

    #[instrument(skip_all, fields(path = %record.path, storage_key = %record.storage_key.short_string()))]
    async fn process(&self, record: FileRecord) -> Result<RecordOutcome> {
        let key = record.storage_key;

        if self.manifest.is_committed(&key).await? {
            return self.deduplicate(&record).await;
        }

        let already_stored = self.completed_backends(&key).await?;
        if already_stored.len() >= self.quorum() {
            return self.deduplicate(&record).await;
        }

        let sealed = match self.build_blob(&record).await {
            Ok(sealed) => sealed,
            Err(e) if e.is_integrity() || matches!(e, Error::Io(_)) => {
                return self.hold(&record, Hold::Failed, &e).await;
            }
            Err(e) => return Err(e),
        };

        let targets: Vec<&BackendSlot> = self
            .backends
            .iter()
            .filter(|slot| !already_stored.contains(slot.name()))
            .collect();
        let results = self.push(&key, sealed.bytes.clone(), &targets).await?;

        let stored = already_stored.len() + results.iter().filter(|(_, r)| matches!(r, PushResult::Stored)).count();
        if stored >= self.quorum() {
            self.manifest.commit_group(&key).await?;
            let bytes = sealed.bytes.len() as u64;
            self.stats.record_committed(bytes);
            debug!(backends = stored, bytes, "Committed");
            return Ok(RecordOutcome::Committed { bytes });
        }

        self.settle_failure(&record, stored, results).await
    }

    async fn deduplicate(&self, record: &FileRecord) -> Result<RecordOutcome> {
        self.manifest.commit_group(&record.storage_key).await?;
        self.stats.record_deduplicated();
        debug!("Already durable, committed without upload");
        Ok(RecordOutcome::Deduplicated)
    }

    async fn completed_backends(&self, key: &StorageKey) -> Result<HashSet<String>> {
        if !self.multi_backend() {
            return Ok(HashSet::new());
        }
        Ok(self
            .manifest
            .backend_statuses(key)
            .await?
            .into_iter()
            .filter(|s| s.status == BackendState::Completed)
            .map(|s| s.backend)
            .collect())
    }

    /// Re-read the source and seal it. The record's stored mtime goes into
    /// the metadata so a rebuilt blob matches the first one byte for byte.
    async fn build_blob(&self, record: &FileRecord) -> Result<SealedBlob> {
        let content = self.source.read(&record.path, record.is_symlink).await?;

        let codec = self.codec.clone();
        let path = record.path.clone();
        let blob_type = record.blob_type();
        let modified = record.mod_time;
        let sealed = tokio::task::spawn_blocking(move || codec.seal(&path, &content.bytes, blob_type, modified))
            .await
            .map_err(|e| Error::Other(format!("codec task failed: {e}")))??;

        if sealed.storage_key != record.storage_key {
            return Err(Error::SourceChanged {
                path: record.path.clone(),
            });
        }
        Ok(sealed)
    }

    async fn push(&self, key: &StorageKey, bytes: Bytes, targets: &[&BackendSlot]) -> Result<Vec<(String, PushResult)>> {
        let pushes: Vec<BoxFuture<'_, Result<(String, PushResult)>>> = targets
            .iter()
            .copied()
            .map(|slot| {
                let bytes = bytes.clone();
                async move {
                    let result = self.push_one(slot, key, bytes).await?;
                    Ok((slot.name().to_string(), result))
                }
                .boxed()
            })
            .collect();
        let results: Vec<Result<(String, PushResult)>> = stream::iter(pushes)
            .buffer_unordered(self.config.backend_concurrency.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn push_one(&self, slot: &BackendSlot, key: &StorageKey, bytes: Bytes) -> Result<PushResult> {
        let backend = slot.backend.as_ref();
        let name = backend.name();
        if !self.health.available(backend).await {
            debug!(backend = name, "Skipping degraded backend");
            return Ok(PushResult::Skipped);
        }

        let multi = self.multi_backend();
        if multi {
            self.manifest.record_backend_attempt(key, name).await?;
        }

        let outcome = retry_counting(&slot.retry, "store", || backend.store_one(*key, bytes.clone())).await;
        match outcome.result {
            Ok(()) => {
                self.health.record_success(name);
                if multi {
                    self.manifest.record_backend_success(key, name).await?;
                }
                Ok(PushResult::Stored)
            }
            Err(e) => {
                self.health.record_failure(name, &e.to_string());
                if multi {
                    self.manifest
                        .record_backend_failure(key, name, &e.to_string(), outcome.attempts)
                        .await?;
                }
                warn!(backend = name, attempts = outcome.attempts, error = %e, "Push failed");
                Ok(PushResult::Failed(e))
            }
        }
    }

    /// Quorum was missed. Defer if skipped backends could still make it,
    /// otherwise hold: `failed` when a retry budget ran out, `blocked` when
    /// every failure was permanent.
    async fn settle_failure(
        &self,
        record: &FileRecord,
        stored: usize,
        results: Vec<(String, PushResult)>,
    ) -> Result<RecordOutcome> {
        let skipped = results.iter().filter(|(_, r)| matches!(r, PushResult::Skipped)).count();
        let errors: Vec<(String, Error)> = results
            .into_iter()
            .filter_map(|(name, r)| match r {
                PushResult::Failed(e) => Some((name, e)),
                _ => None,
            })
            .collect();

        let mut summary: Vec<String> = errors.iter().map(|(name, e)| format!("{name}: {e}")).collect();
        if skipped > 0 {
            summary.push(format!("{skipped} backend(s) degraded"));
        }
        let message = format!("stored on {stored}/{} required backends; {}", self.quorum(), summary.join("; "));

        if stored + skipped >= self.quorum() {
            self.manifest.record_error(record, &message).await?;
            self.stats.record_deferred();
            return Ok(RecordOutcome::Deferred(RecordFailure {
                path: record.path.clone(),
                storage_key: record.storage_key,
                hold: None,
                error: message,
            }));
        }

        let hold = if errors.iter().any(|(_, e)| e.is_transient()) {
            Hold::Failed
        } else {
            Hold::Blocked
        };
        self.hold_with_message(record, hold, message).await
    }

    async fn hold(&self, record: &FileRecord, hold: Hold, error: &Error) -> Result<RecordOutcome> {
        self.hold_with_message(record, hold, error.to_string()).await
    }

    async fn hold_with_message(&self, record: &FileRecord, hold: Hold, message: String) -> Result<RecordOutcome> {
        self.manifest.hold_record(record, hold, &message).await?;
        match hold {
            Hold::Failed => self.stats.record_failed(),
            Hold::Blocked => self.stats.record_blocked(),
        }
        warn!(path = %record.path, hold = hold.as_str(), error = %message, "Record held");
        Ok(RecordOutcome::Held(RecordFailure {
            path: record.path.clone(),
            storage_key: record.storage_key,
            hold: Some(hold),
            error: message,
        }))
    }

    /// Push blobs again to backends whose delivery is marked `failed`.
    /// Commits any group that reaches quorum as a result.
    pub async fn retry_lagging_backends(&self, changeset_id: Option<&ChangesetId>) -> Result<LaggingReport> {
        let mut report = LaggingReport::default();
        let rows = self.manifest.failed_backend_work(changeset_id, None).await?;
        if rows.is_empty() {
            return Ok(report);
        }

        let mut by_key: BTreeMap<StorageKey, Vec<String>> = BTreeMap::new();
        for row in rows {
            by_key.entry(row.storage_key).or_default().push(row.backend);
        }

        let mut touched = HashSet::new();
        for (key, failed_on) in by_key {
            let targets: Vec<&BackendSlot> = self
                .backends
                .iter()
                .filter(|slot| failed_on.iter().any(|name| name == slot.name()))
                .collect();
            if targets.is_empty() {
                continue;
            }
            report.attempted += targets.len() as u64;

            let Some(record) = self.manifest.canonical_record(&key).await? else {
                report.still_failing += targets.len() as u64;
                continue;
            };
            let sealed = match self.build_blob(&record).await {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(path = %record.path, error = %e, "Cannot rebuild blob for lagging backend");
                    report.still_failing += targets.len() as u64;
                    continue;
                }
            };

            for (_, result) in self.push(&key, sealed.bytes.clone(), &targets).await? {
                match result {
                    PushResult::Stored => report.recovered += 1,
                    _ => report.still_failing += 1,
                }
            }

            if !self.manifest.is_committed(&key).await?
                && self.completed_backends(&key).await?.len() >= self.quorum()
            {
                self.manifest.commit_group(&key).await?;
                report.committed += 1;
                touched.insert(record.changeset_id);
            }
        }

        for id in touched {
            self.manifest.refresh_status(&id).await?;
        }
        info!(
            attempted = report.attempted,
            recovered = report.recovered,
            still_failing = report.still_failing,
            "Retried lagging backends"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blobkeep_backends::{BackendType, BatchOutcome, HealthStatus, MemoryBackend};
    use blobkeep_core::{Blob, DiscoveredFile, FsSource, UploadState};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tempfile::TempDir;

    const FAST_KDF: KdfParams = KdfParams { iterations: 8 };

    /// Wraps a memory backend and fails stores on demand.
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
        permanent: bool,
        stores: AtomicU32,
    }

    impl FlakyBackend {
        fn new(name: &str, failing: bool, permanent: bool) -> Self {
            Self {
                inner: MemoryBackend::new(name),
                failing: AtomicBool::new(failing),
                permanent,
                stores: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn backend_type(&self) -> BackendType {
            BackendType::Memory
        }

        async fn store(&self, items: Vec<(StorageKey, Bytes)>) -> Result<BatchOutcome<()>> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                let name = self.name().to_string();
                return Ok(items
                    .into_iter()
                    .map(|(key, _)| {
                        let err = if self.permanent {
                            Error::permanent(&name, "403 Forbidden")
                        } else {
                            Error::transient(&name, "connection reset")
                        };
                        (key, Err(err))
                    })
                    .collect());
            }
            self.inner.store(items).await
        }

        async fn retrieve(&self, keys: &[StorageKey]) -> Result<BatchOutcome<Bytes>> {
            self.inner.retrieve(keys).await
        }

        async fn delete(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, bool>> {
            self.inner.delete(keys).await
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::Healthy
        }

        async fn list(&self, prefix: Option<&str>) -> Result<Vec<StorageKey>> {
            self.inner.list(prefix).await
        }
    }

    fn slot(backend: Arc<dyn Backend>) -> BackendSlot {
        BackendSlot::new(backend).with_retry(RetryConfig::immediate(2))
    }

    fn config(quorum: Option<usize>) -> CoordinatorConfig {
        CoordinatorConfig {
            batch_size: 2,
            require_minimum_backends: quorum,
            kdf: FAST_KDF,
            ..Default::default()
        }
    }

    struct Fixture {
        dir: TempDir,
        manifest: ManifestStore,
    }

    impl Fixture {
        async fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                manifest: ManifestStore::connect_in_memory().await.unwrap(),
            }
        }

        fn write(&self, path: &str, content: &[u8]) {
            let full = self.dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }

        fn coordinator(&self, backends: Vec<BackendSlot>, config: CoordinatorConfig) -> UploadCoordinator {
            UploadCoordinator::new(
                self.manifest.clone(),
                backends,
                Arc::new(FsSource::new(self.dir.path())),
                "test passphrase",
                config,
            )
            .unwrap()
        }

        fn request(&self, name: &str, files: Vec<DiscoveredFile>) -> ChangesetRequest {
            ChangesetRequest::new(name, files)
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hardlinks_and_symlink_scenario() {
        use crate::discovery::{DiscoveryClient, TreeScanner};

        let fx = Fixture::new().await;
        fx.write("one.txt", b"one");
        fx.write("two.txt", b"two");
        fx.write("three.txt", b"three");
        let root = fx.dir.path();
        std::fs::create_dir_all(root.join("links")).unwrap();
        std::fs::hard_link(root.join("one.txt"), root.join("links/one-a.txt")).unwrap();
        std::fs::hard_link(root.join("one.txt"), root.join("links/one-b.txt")).unwrap();
        std::os::unix::fs::symlink("one.txt", root.join("alias")).unwrap();
        let files = TreeScanner::new(root).discover().unwrap();
        assert_eq!(files.len(), 6);

        let memory = Arc::new(MemoryBackend::new("mem"));
        let coordinator = fx.coordinator(vec![slot(memory.clone())], config(None));
        let id = coordinator.submit(&fx.request("scenario", files)).await.unwrap();

        let records = fx.manifest.list_files(&id, None).await.unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records.iter().filter(|r| r.is_canonical).count(), 4);
        let keys: HashSet<_> = records.iter().map(|r| r.storage_key).collect();
        assert_eq!(keys.len(), 4);

        let group_key = records.iter().find(|r| r.path == "one.txt").unwrap().storage_key;
        let group: Vec<&FileRecord> = records.iter().filter(|r| r.storage_key == group_key).collect();
        assert_eq!(group.len(), 3);
        let canonical: Vec<&str> = group.iter().filter(|r| r.is_canonical).map(|r| r.path.as_str()).collect();
        assert_eq!(canonical, ["links/one-a.txt"]);

        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.committed, 4);
        assert_eq!(report.status, Some(ChangesetStatus::Completed));
        assert_eq!(memory.len().await, 4);

        let finished = fx.manifest.list_files(&id, Some(UploadState::Completed)).await.unwrap();
        assert_eq!(finished.len(), 6);

        let alias = records.iter().find(|r| r.path == "alias").unwrap();
        assert_ne!(alias.storage_key, group_key);
        let stored = memory.get(&alias.storage_key).await.unwrap();
        let metadata = Blob::read_metadata(&stored).unwrap();
        assert!(metadata.blob_type.is_symlink());
        assert_eq!(metadata.file_hash, blobkeep_core::ContentHash::from_data(b"one.txt"));

        let stored = memory.get(&group_key).await.unwrap();
        assert_eq!(Blob::read_metadata(&stored).unwrap().path, "links/one-a.txt");
    }

    #[tokio::test]
    async fn test_resubmit_and_rerun_are_noops() {
        let fx = Fixture::new().await;
        fx.write("a.txt", b"alpha");
        let memory = Arc::new(MemoryBackend::new("mem"));
        let coordinator = fx.coordinator(vec![slot(memory.clone())], config(None));
        let request = fx.request("idempotent", vec![DiscoveredFile::new("a.txt", 1, 1)]);

        let id = coordinator.submit(&request).await.unwrap();
        coordinator.run_changeset(&id).await.unwrap();
        let before = fx.manifest.list_files(&id, None).await.unwrap();
        let blob = memory.get(&before[0].storage_key).await.unwrap();

        assert_eq!(coordinator.submit(&request).await.unwrap(), id);
        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.claimed, 0);

        let after = fx.manifest.list_files(&id, None).await.unwrap();
        assert_eq!(before[0].upload_finished_at, after[0].upload_finished_at);
        assert_eq!(memory.get(&before[0].storage_key).await.unwrap(), blob);
    }

    #[tokio::test]
    async fn test_crash_before_commit_converges_to_same_blob() {
        let fx = Fixture::new().await;
        fx.write("data.bin", &[7u8; 4096]);
        let memory = Arc::new(MemoryBackend::new("mem"));
        let coordinator = fx.coordinator(vec![slot(memory.clone())], config(None));
        let id = coordinator
            .submit(&fx.request("crash", vec![DiscoveredFile::new("data.bin", 1, 1)]))
            .await
            .unwrap();

        // Simulate a worker that claimed, built and pushed, then died.
        let claimed = fx.manifest.claim_batch(&id, 10).await.unwrap();
        let sealed = coordinator.build_blob(&claimed[0]).await.unwrap();
        memory.store_one(sealed.storage_key, sealed.bytes.clone()).await.unwrap();
        assert_eq!(coordinator.run_batch(&id).await.unwrap().claimed, 0);

        age_claims(&fx.manifest, 2 * 3600 * 1000).await;
        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.status, Some(ChangesetStatus::Completed));
        assert_eq!(memory.get(&sealed.storage_key).await.unwrap(), sealed.bytes);
    }

    /// Reads from disk but fails one path with an error unrelated to its content.
    struct BrokenSource {
        inner: FsSource,
        broken: &'static str,
        failing: AtomicBool,
    }

    #[async_trait]
    impl SourceReader for BrokenSource {
        async fn read(&self, path: &str, is_symlink: bool) -> Result<blobkeep_core::changeset::SourceContent> {
            if path == self.broken && self.failing.load(Ordering::SeqCst) {
                return Err(Error::Other("source mount went away".to_string()));
            }
            self.inner.read(path, is_symlink).await
        }
    }

    #[tokio::test]
    async fn test_record_error_does_not_discard_batch() {
        let fx = Fixture::new().await;
        fx.write("a.txt", b"alpha");
        fx.write("b.txt", b"beta");
        fx.write("c.txt", b"gamma");
        let memory = Arc::new(MemoryBackend::new("mem"));
        let source = Arc::new(BrokenSource {
            inner: FsSource::new(fx.dir.path()),
            broken: "b.txt",
            failing: AtomicBool::new(false),
        });
        let coordinator = UploadCoordinator::new(
            fx.manifest.clone(),
            vec![slot(memory.clone())],
            source.clone(),
            "test passphrase",
            CoordinatorConfig {
                batch_size: 10,
                ..config(None)
            },
        )
        .unwrap();
        let files = vec![
            DiscoveredFile::new("a.txt", 1, 1),
            DiscoveredFile::new("b.txt", 1, 2),
            DiscoveredFile::new("c.txt", 1, 3),
        ];
        let id = coordinator.submit(&fx.request("partial", files)).await.unwrap();
        source.failing.store(true, Ordering::SeqCst);

        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.committed, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "b.txt");
        assert_eq!(report.failures[0].hold, None);
        assert_eq!(memory.len().await, 2);
        assert_eq!(report.status, Some(ChangesetStatus::Processing));

        // The claim is picked up again once it is stale.
        source.failing.store(false, Ordering::SeqCst);
        age_claims(&fx.manifest, 2 * 3600 * 1000).await;
        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.status, Some(ChangesetStatus::Completed));
    }

    async fn age_claims(manifest: &ManifestStore, millis: i64) {
        sqlx::query("UPDATE files SET upload_started_at = upload_started_at - ?1 WHERE upload_started_at IS NOT NULL")
            .bind(millis)
            .execute(manifest.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_quorum_two_of_three_with_one_failing_backend() {
        let fx = Fixture::new().await;
        fx.write("a.txt", b"a");
        fx.write("b.txt", b"b");
        fx.write("c.txt", b"c");

        let good_a = Arc::new(MemoryBackend::new("alpha"));
        let good_b = Arc::new(MemoryBackend::new("beta"));
        let broken = Arc::new(FlakyBackend::new("gamma", true, false));
        let coordinator = fx.coordinator(
            vec![slot(good_a.clone()), slot(good_b.clone()), slot(broken.clone())],
            config(Some(2)),
        );
        let id = coordinator
            .submit(&fx.request(
                "quorum",
                vec![
                    DiscoveredFile::new("a.txt", 1, 1),
                    DiscoveredFile::new("b.txt", 1, 2),
                    DiscoveredFile::new("c.txt", 1, 3),
                ],
            ))
            .await
            .unwrap();

        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.committed, 3);
        assert_eq!(report.status, Some(ChangesetStatus::Completed));

        let lagging = fx.manifest.failed_backend_work(Some(&id), Some("gamma")).await.unwrap();
        assert_eq!(lagging.len(), 3);
        assert!(lagging.iter().all(|s| s.retry_count == 2));

        // The broken backend recovers and catches up on request.
        broken.failing.store(false, Ordering::SeqCst);
        let lagging = coordinator.retry_lagging_backends(Some(&id)).await.unwrap();
        assert_eq!(lagging.recovered, 3);
        assert_eq!(broken.inner.len().await, 3);
        assert!(fx.manifest.failed_backend_work(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_blocks_and_transient_exhaustion_fails() {
        let fx = Fixture::new().await;
        fx.write("a.txt", b"a");

        let forbidden = Arc::new(FlakyBackend::new("forbidden", true, true));
        let coordinator = fx.coordinator(vec![slot(forbidden.clone())], config(None));
        let id = coordinator
            .submit(&fx.request("blocked", vec![DiscoveredFile::new("a.txt", 1, 1)]))
            .await
            .unwrap();
        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.blocked, 1);
        // Permanent errors are not retried.
        assert_eq!(forbidden.stores.load(Ordering::SeqCst), 1);
        assert_eq!(report.status, Some(ChangesetStatus::Processing));
        let held = &fx.manifest.list_files(&id, None).await.unwrap()[0];
        assert_eq!(held.hold, Some(Hold::Blocked));
        assert_eq!(held.upload_state(), UploadState::InProgress);

        let fx = Fixture::new().await;
        fx.write("a.txt", b"a");
        let flaky = Arc::new(FlakyBackend::new("flaky", true, false));
        let coordinator = fx.coordinator(vec![slot(flaky.clone())], config(None));
        let id = coordinator
            .submit(&fx.request("failed", vec![DiscoveredFile::new("a.txt", 1, 1)]))
            .await
            .unwrap();
        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(flaky.stores.load(Ordering::SeqCst), 2);
        assert_eq!(report.status, Some(ChangesetStatus::Failed));

        let status = fx.manifest.report(&id).await.unwrap();
        assert_eq!(status.failing.len(), 1);
        assert!(status.failing[0].last_error.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_source_drift_is_held_as_failed() {
        let fx = Fixture::new().await;
        fx.write("a.txt", b"original");
        let memory = Arc::new(MemoryBackend::new("mem"));
        let coordinator = fx.coordinator(vec![slot(memory.clone())], config(None));
        let id = coordinator
            .submit(&fx.request("drift", vec![DiscoveredFile::new("a.txt", 1, 1)]))
            .await
            .unwrap();

        fx.write("a.txt", b"edited after submit");
        let report = coordinator.run_changeset(&id).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.failures[0].error.contains("Source changed"));
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_unchanged_file_in_later_changeset_is_deduplicated() {
        let fx = Fixture::new().await;
        fx.write("a.txt", b"stable");
        fx.write("b.txt", b"new");
        let memory = Arc::new(FlakyBackend::new("mem", false, false));
        let coordinator = fx.coordinator(vec![slot(memory.clone())], config(None));

        let first = coordinator
            .submit(&fx.request("monday", vec![DiscoveredFile::new("a.txt", 1, 1)]))
            .await
            .unwrap();
        coordinator.run_changeset(&first).await.unwrap();

        let second = coordinator
            .submit(&fx.request(
                "tuesday",
                vec![DiscoveredFile::new("a.txt", 1, 1), DiscoveredFile::new("b.txt", 1, 2)],
            ))
            .await
            .unwrap();
        let report = coordinator.run_changeset(&second).await.unwrap();
        assert_eq!(report.deduplicated, 1);
        assert_eq!(report.committed, 1);
        assert_eq!(memory.stores.load(Ordering::SeqCst), 2);
        assert_eq!(report.status, Some(ChangesetStatus::Completed));
    }

    #[tokio::test]
    async fn test_rejects_impossible_quorum_and_duplicate_names() {
        let fx = Fixture::new().await;
        let build = |backends: Vec<BackendSlot>, quorum| {
            UploadCoordinator::new(
                fx.manifest.clone(),
                backends,
                Arc::new(FsSource::new(fx.dir.path())),
                "pw",
                config(quorum),
            )
        };
        let only = || slot(Arc::new(MemoryBackend::new("only")));

        assert!(matches!(build(vec![only()], Some(2)), Err(Error::InvalidInput(_))));
        assert!(matches!(build(vec![only(), only()], None), Err(Error::InvalidInput(_))));
        assert!(matches!(build(Vec::new(), None), Err(Error::InvalidInput(_))));
    }
}
