//! The manifest: changesets, file records and per-backend delivery state in
//! one embedded SQLite database.
//!
//! Workers coordinate only through [`ManifestStore::claim_batch`] and
//! [`ManifestStore::commit_group`]. A claim is a single `UPDATE ... RETURNING`
//! inside a write transaction, so two workers can never take the same record.

use crate::{
    BackendState, BackendStatus, Changeset, ChangesetId, ChangesetStatus, ContentHash, Error, FileRecord, Hold,
    Result, StorageKey, UploadState,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, instrument};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const MAX_CONNECTIONS: u32 = 5;

/// Claims older than this are considered abandoned.
pub const DEFAULT_STUCK_THRESHOLD_SECS: i64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct ManifestStore {
    pool: SqlitePool,
    stuck_threshold: Duration,
}

impl ManifestStore {
    async fn new(options: SqliteConnectOptions, max: Option<u32>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self {
            pool,
            stuck_threshold: Duration::seconds(DEFAULT_STUCK_THRESHOLD_SECS),
        })
    }

    /// Open (creating if needed) the manifest at `path` and apply migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = Self::base_options().filename(path).create_if_missing(true);
        let store = Self::new(options, None).await?;
        info!(path = %path.display(), "Opened manifest");
        Ok(store)
    }

    /// In-memory manifest. Limited to one connection so every caller sees the same database.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        Self::new(options, Some(1)).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // Many workers queue on the single writer; claims are short.
            .busy_timeout(std::time::Duration::from_secs(5))
    }

    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA wal_autocheckpoint = 1000;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn stuck_threshold(&self) -> Duration {
        self.stuck_threshold
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }

    // =========================================================================
    // Changesets
    // =========================================================================

    /// Insert a changeset with all of its records.
    ///
    /// Returns `false` without touching anything when the changeset already
    /// exists, which makes resubmitting the same request a no-op.
    pub async fn insert_changeset(&self, changeset: &Changeset, records: &[FileRecord]) -> Result<bool> {
        if let Some(stray) = records.iter().find(|r| r.changeset_id != changeset.changeset_id) {
            return Err(Error::InvalidInput(format!(
                "record {} belongs to changeset {}, not {}",
                stray.path,
                stray.changeset_id.short_string(),
                changeset.short_id()
            )));
        }

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
                INSERT INTO changesets
                    (changeset_id, name, content_signature, created_at, file_count, total_size, status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (changeset_id) DO NOTHING
            "#,
        )
        .bind(changeset.changeset_id.to_hex())
        .bind(&changeset.name)
        .bind(&changeset.content_signature)
        .bind(to_millis(changeset.created_at))
        .bind(changeset.file_count as i64)
        .bind(changeset.total_size as i64)
        .bind(changeset.status.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(changeset = %changeset.short_id(), "Changeset already recorded");
            tx.rollback().await?;
            return Ok(false);
        }

        for record in records {
            sqlx::query(
                r#"
                    INSERT INTO files
                        (path, changeset_id, device_id, inode_id, size, mod_time, content_hash, storage_key,
                         is_canonical, is_symlink, upload_started_at, upload_finished_at, hold, last_error)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                    ON CONFLICT (path, changeset_id) DO NOTHING
                "#,
            )
            .bind(&record.path)
            .bind(record.changeset_id.to_hex())
            .bind(record.device_id.map(|d| d as i64))
            .bind(record.inode_id.map(|i| i as i64))
            .bind(record.size as i64)
            .bind(to_millis(record.mod_time))
            .bind(record.content_hash.to_hex())
            .bind(record.storage_key.to_hex())
            .bind(record.is_canonical)
            .bind(record.is_symlink)
            .bind(record.upload_started_at.map(to_millis))
            .bind(record.upload_finished_at.map(to_millis))
            .bind(record.hold.map(|h| h.as_str()))
            .bind(record.last_error.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            changeset = %changeset.short_id(),
            name = %changeset.name,
            files = records.len(),
            "Recorded changeset"
        );
        Ok(true)
    }

    pub async fn get_changeset(&self, changeset_id: &ChangesetId) -> Result<Option<Changeset>> {
        let row: Option<ChangesetRow> = sqlx::query_as("SELECT * FROM changesets WHERE changeset_id = ?1")
            .bind(changeset_id.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Changeset::try_from).transpose()
    }

    /// Newest first.
    pub async fn list_changesets(&self, status: Option<ChangesetStatus>) -> Result<Vec<Changeset>> {
        let rows: Vec<ChangesetRow> = sqlx::query_as(
            "SELECT * FROM changesets WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC, changeset_id",
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Changeset::try_from).collect()
    }

    /// Changesets a worker should look at, oldest first.
    pub async fn changesets_with_work(&self) -> Result<Vec<ChangesetId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT changeset_id FROM changesets WHERE status IN ('pending', 'processing') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        ids.iter().map(|id| parse_digest("changeset_id", id)).collect()
    }

    pub async fn progress(&self, changeset_id: &ChangesetId) -> Result<ChangesetProgress> {
        let row: ProgressRow = sqlx::query_as(
            r#"
                SELECT
                    COUNT(*) AS files,
                    COALESCE(SUM(is_canonical), 0) AS canonical,
                    COALESCE(SUM(is_canonical AND upload_started_at IS NOT NULL AND upload_finished_at IS NULL), 0)
                        AS in_progress,
                    COALESCE(SUM(is_canonical AND upload_finished_at IS NOT NULL), 0) AS finished,
                    COALESCE(SUM(is_canonical AND hold = 'failed'), 0) AS failed,
                    COALESCE(SUM(is_canonical AND hold = 'blocked'), 0) AS blocked
                FROM files
                WHERE changeset_id = ?1
            "#,
        )
        .bind(changeset_id.to_hex())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Recompute a changeset's status from its records and store it.
    pub async fn refresh_status(&self, changeset_id: &ChangesetId) -> Result<ChangesetStatus> {
        let status = self.progress(changeset_id).await?.status();
        let updated = sqlx::query("UPDATE changesets SET status = ?1 WHERE changeset_id = ?2")
            .bind(status.as_str())
            .bind(changeset_id.to_hex())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("changeset {}", changeset_id.short_string())));
        }
        Ok(status)
    }

    pub async fn report(&self, changeset_id: &ChangesetId) -> Result<ChangesetReport> {
        let changeset = self
            .get_changeset(changeset_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("changeset {}", changeset_id.short_string())))?;
        let progress = self.progress(changeset_id).await?;

        let failing: Vec<FileRow> = sqlx::query_as(
            r#"
                SELECT * FROM files
                WHERE changeset_id = ?1 AND is_canonical = 1 AND (hold IS NOT NULL OR last_error IS NOT NULL)
                ORDER BY path
            "#,
        )
        .bind(changeset_id.to_hex())
        .fetch_all(&self.pool)
        .await?;

        Ok(ChangesetReport {
            changeset,
            progress,
            failing: rows_to_records(failing)?,
            failed_backends: self.failed_backend_work(Some(changeset_id), None).await?,
        })
    }

    // =========================================================================
    // Claim / commit
    // =========================================================================

    /// Take up to `limit` canonical records that are unfinished and either
    /// unclaimed or claimed longer ago than the stuck threshold.
    #[instrument(skip(self, changeset_id), fields(changeset = %changeset_id.short_string()))]
    pub async fn claim_batch(&self, changeset_id: &ChangesetId, limit: u32) -> Result<Vec<FileRecord>> {
        let now = Utc::now();
        let cutoff = now - self.stuck_threshold;

        let mut tx = self.pool.begin().await.map_err(contention)?;
        let rows: Vec<FileRow> = sqlx::query_as(
            r#"
                UPDATE files SET upload_started_at = ?1
                WHERE rowid IN (
                    SELECT rowid FROM files
                    WHERE changeset_id = ?2
                      AND is_canonical = 1
                      AND upload_finished_at IS NULL
                      AND hold IS NULL
                      AND (upload_started_at IS NULL OR upload_started_at < ?3)
                    ORDER BY path
                    LIMIT ?4
                )
                RETURNING *
            "#,
        )
        .bind(to_millis(now))
        .bind(changeset_id.to_hex())
        .bind(to_millis(cutoff))
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(contention)?;

        if !rows.is_empty() {
            sqlx::query("UPDATE changesets SET status = 'processing' WHERE changeset_id = ?1 AND status = 'pending'")
                .bind(changeset_id.to_hex())
                .execute(&mut *tx)
                .await
                .map_err(contention)?;
        }
        tx.commit().await.map_err(contention)?;

        let mut records = rows_to_records(rows)?;
        records.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(claimed = records.len(), "Claimed batch");
        Ok(records)
    }

    /// Mark every record sharing `storage_key` finished, in every changeset.
    ///
    /// Already-finished rows are left alone, so `upload_finished_at` never moves.
    pub async fn commit_group(&self, storage_key: &StorageKey) -> Result<u64> {
        let now = to_millis(Utc::now());
        let affected = sqlx::query(
            r#"
                UPDATE files
                SET upload_finished_at = ?1,
                    upload_started_at = COALESCE(upload_started_at, ?1),
                    hold = NULL,
                    last_error = NULL
                WHERE storage_key = ?2 AND upload_finished_at IS NULL
            "#,
        )
        .bind(now)
        .bind(storage_key.to_hex())
        .execute(&self.pool)
        .await?
        .rows_affected();
        debug!(storage_key = %storage_key.short_string(), affected, "Committed group");
        Ok(affected)
    }

    /// Give a claim back without finishing it.
    pub async fn release_claim(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
                UPDATE files SET upload_started_at = NULL
                WHERE path = ?1 AND changeset_id = ?2 AND upload_finished_at IS NULL
            "#,
        )
        .bind(&record.path)
        .bind(record.changeset_id.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Park a record outside the claim pool. Its claim timestamp is kept.
    pub async fn hold_record(&self, record: &FileRecord, hold: Hold, message: &str) -> Result<()> {
        sqlx::query(
            r#"
                UPDATE files SET hold = ?1, last_error = ?2
                WHERE path = ?3 AND changeset_id = ?4 AND upload_finished_at IS NULL
            "#,
        )
        .bind(hold.as_str())
        .bind(message)
        .bind(&record.path)
        .bind(record.changeset_id.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remember the latest error on a record that stays claimable.
    pub async fn record_error(&self, record: &FileRecord, message: &str) -> Result<()> {
        sqlx::query("UPDATE files SET last_error = ?1 WHERE path = ?2 AND changeset_id = ?3")
            .bind(message)
            .bind(&record.path)
            .bind(record.changeset_id.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return held records to the claim pool and refresh affected changesets.
    pub async fn release_holds(&self, changeset_id: Option<&ChangesetId>, kind: Option<Hold>) -> Result<u64> {
        let released: Vec<String> = sqlx::query_scalar(
            r#"
                UPDATE files SET hold = NULL, upload_started_at = NULL
                WHERE hold IS NOT NULL
                  AND upload_finished_at IS NULL
                  AND (?1 IS NULL OR changeset_id = ?1)
                  AND (?2 IS NULL OR hold = ?2)
                RETURNING changeset_id
            "#,
        )
        .bind(changeset_id.map(|id| id.to_hex()))
        .bind(kind.map(|h| h.as_str()))
        .fetch_all(&self.pool)
        .await?;

        self.refresh_many(&released).await?;
        info!(released = released.len(), "Released held records");
        Ok(released.len() as u64)
    }

    /// Clear stale claims so they read as not started.
    pub async fn reset_stale(&self, threshold: Duration) -> Result<u64> {
        let cutoff = to_millis(Utc::now() - threshold);
        let reset: Vec<String> = sqlx::query_scalar(
            r#"
                UPDATE files SET upload_started_at = NULL
                WHERE upload_finished_at IS NULL AND hold IS NULL AND upload_started_at < ?1
                RETURNING changeset_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        self.refresh_many(&reset).await?;
        if !reset.is_empty() {
            info!(reset = reset.len(), "Reset stale claims");
        }
        Ok(reset.len() as u64)
    }

    /// Forget that a group was ever uploaded, e.g. after its blob failed
    /// verification. The next run re-creates it from source.
    pub async fn invalidate(&self, storage_key: &StorageKey) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let touched: Vec<String> = sqlx::query_scalar(
            r#"
                UPDATE files
                SET upload_started_at = NULL, upload_finished_at = NULL, hold = NULL, last_error = NULL
                WHERE storage_key = ?1
                RETURNING changeset_id
            "#,
        )
        .bind(storage_key.to_hex())
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM backend_status WHERE storage_key = ?1")
            .bind(storage_key.to_hex())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.refresh_many(&touched).await?;
        info!(storage_key = %storage_key.short_string(), records = touched.len(), "Invalidated group");
        Ok(touched.len() as u64)
    }

    async fn refresh_many(&self, changeset_ids: &[String]) -> Result<()> {
        let distinct: BTreeSet<&String> = changeset_ids.iter().collect();
        for id in distinct {
            self.refresh_status(&parse_digest("changeset_id", id)?).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn list_files(&self, changeset_id: &ChangesetId, state: Option<UploadState>) -> Result<Vec<FileRecord>> {
        let filter = match state {
            None => "",
            Some(UploadState::NotStarted) => " AND upload_started_at IS NULL AND upload_finished_at IS NULL",
            Some(UploadState::InProgress) => " AND upload_started_at IS NOT NULL AND upload_finished_at IS NULL",
            Some(UploadState::Completed) => " AND upload_finished_at IS NOT NULL",
        };
        let sql = format!("SELECT * FROM files WHERE changeset_id = ?1{filter} ORDER BY path");
        let rows: Vec<FileRow> = sqlx::query_as(&sql)
            .bind(changeset_id.to_hex())
            .fetch_all(&self.pool)
            .await?;
        rows_to_records(rows)
    }

    pub async fn files_needing_upload(&self, changeset_id: &ChangesetId) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> =
            sqlx::query_as("SELECT * FROM files WHERE changeset_id = ?1 AND upload_finished_at IS NULL ORDER BY path")
                .bind(changeset_id.to_hex())
                .fetch_all(&self.pool)
                .await?;
        rows_to_records(rows)
    }

    /// Unfinished claims older than `threshold`, across all changesets.
    pub async fn stuck_uploads(&self, threshold: Duration) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(
            r#"
                SELECT * FROM files
                WHERE upload_finished_at IS NULL AND upload_started_at < ?1
                ORDER BY upload_started_at, path
            "#,
        )
        .bind(to_millis(Utc::now() - threshold))
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(rows)
    }

    /// Groups of two or more records sharing a storage key within a changeset.
    pub async fn hardlink_groups(&self, changeset_id: &ChangesetId) -> Result<Vec<StoredGroup>> {
        let rows: Vec<FileRow> = sqlx::query_as(
            r#"
                SELECT * FROM files
                WHERE changeset_id = ?1
                  AND storage_key IN (
                      SELECT storage_key FROM files
                      WHERE changeset_id = ?1
                      GROUP BY storage_key
                      HAVING COUNT(*) > 1
                  )
                ORDER BY storage_key, is_canonical DESC, path
            "#,
        )
        .bind(changeset_id.to_hex())
        .fetch_all(&self.pool)
        .await?;

        let mut groups: Vec<StoredGroup> = Vec::new();
        for record in rows_to_records(rows)? {
            match groups.last_mut() {
                Some(group) if group.storage_key == record.storage_key => group.members.push(record),
                _ => groups.push(StoredGroup {
                    storage_key: record.storage_key,
                    members: vec![record],
                }),
            }
        }
        Ok(groups)
    }

    /// Any record, in any changeset, already finished under this key.
    pub async fn is_committed(&self, storage_key: &StorageKey) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM files WHERE storage_key = ?1 AND upload_finished_at IS NOT NULL LIMIT 1")
                .bind(storage_key.to_hex())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn committed_keys(&self) -> Result<BTreeSet<StorageKey>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT storage_key FROM files WHERE upload_finished_at IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;
        keys.iter().map(|k| parse_digest("storage_key", k)).collect()
    }

    /// The uploaded member of a group, from whichever changeset recorded it first.
    pub async fn canonical_record(&self, storage_key: &StorageKey) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(
            r#"
                SELECT f.* FROM files f
                JOIN changesets c ON c.changeset_id = f.changeset_id
                WHERE f.storage_key = ?1 AND f.is_canonical = 1
                ORDER BY c.created_at
                LIMIT 1
            "#,
        )
        .bind(storage_key.to_hex())
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileRecord::try_from).transpose()
    }

    // =========================================================================
    // Backend status
    // =========================================================================

    pub async fn record_backend_attempt(&self, storage_key: &StorageKey, backend: &str) -> Result<()> {
        sqlx::query(
            r#"
                INSERT INTO backend_status (storage_key, backend, status, attempted_at)
                VALUES (?1, ?2, 'pending', ?3)
                ON CONFLICT (storage_key, backend) DO UPDATE SET
                    attempted_at = excluded.attempted_at,
                    status = CASE WHEN status = 'completed' THEN status ELSE 'pending' END
            "#,
        )
        .bind(storage_key.to_hex())
        .bind(backend)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_backend_success(&self, storage_key: &StorageKey, backend: &str) -> Result<()> {
        let now = to_millis(Utc::now());
        sqlx::query(
            r#"
                INSERT INTO backend_status (storage_key, backend, status, attempted_at, completed_at)
                VALUES (?1, ?2, 'completed', ?3, ?3)
                ON CONFLICT (storage_key, backend) DO UPDATE SET
                    status = 'completed',
                    completed_at = excluded.completed_at,
                    last_error = NULL
            "#,
        )
        .bind(storage_key.to_hex())
        .bind(backend)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `attempts` is added to the row's running retry count.
    pub async fn record_backend_failure(
        &self,
        storage_key: &StorageKey,
        backend: &str,
        message: &str,
        attempts: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
                INSERT INTO backend_status (storage_key, backend, status, attempted_at, last_error, retry_count)
                VALUES (?1, ?2, 'failed', ?3, ?4, ?5)
                ON CONFLICT (storage_key, backend) DO UPDATE SET
                    status = 'failed',
                    attempted_at = excluded.attempted_at,
                    last_error = excluded.last_error,
                    retry_count = retry_count + excluded.retry_count
            "#,
        )
        .bind(storage_key.to_hex())
        .bind(backend)
        .bind(to_millis(Utc::now()))
        .bind(message)
        .bind(i64::from(attempts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn backend_statuses(&self, storage_key: &StorageKey) -> Result<Vec<BackendStatus>> {
        let rows: Vec<BackendStatusRow> =
            sqlx::query_as("SELECT * FROM backend_status WHERE storage_key = ?1 ORDER BY backend")
                .bind(storage_key.to_hex())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(BackendStatus::try_from).collect()
    }

    /// Failed delivery rows, optionally narrowed to one changeset and/or backend.
    pub async fn failed_backend_work(
        &self,
        changeset_id: Option<&ChangesetId>,
        backend: Option<&str>,
    ) -> Result<Vec<BackendStatus>> {
        let rows: Vec<BackendStatusRow> = sqlx::query_as(
            r#"
                SELECT bs.* FROM backend_status bs
                WHERE bs.status = 'failed'
                  AND (?1 IS NULL OR bs.backend = ?1)
                  AND (?2 IS NULL OR EXISTS (
                      SELECT 1 FROM files f WHERE f.storage_key = bs.storage_key AND f.changeset_id = ?2
                  ))
                ORDER BY bs.backend, bs.storage_key
            "#,
        )
        .bind(backend)
        .bind(changeset_id.map(|id| id.to_hex()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BackendStatus::try_from).collect()
    }
}

/// Canonical-record counters for one changeset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangesetProgress {
    /// All records, siblings included.
    pub files: u64,
    pub canonical: u64,
    pub in_progress: u64,
    pub finished: u64,
    pub failed: u64,
    pub blocked: u64,
}

impl ChangesetProgress {
    pub fn remaining(&self) -> u64 {
        self.canonical.saturating_sub(self.finished)
    }

    pub fn status(&self) -> ChangesetStatus {
        if self.failed > 0 {
            ChangesetStatus::Failed
        } else if self.canonical > 0 && self.finished == self.canonical {
            ChangesetStatus::Completed
        } else if self.in_progress > 0 || self.finished > 0 {
            ChangesetStatus::Processing
        } else {
            ChangesetStatus::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangesetReport {
    pub changeset: Changeset,
    pub progress: ChangesetProgress,
    /// Canonical records that are held or carry an error.
    pub failing: Vec<FileRecord>,
    pub failed_backends: Vec<BackendStatus>,
}

/// Records sharing one storage key; the canonical member comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredGroup {
    pub storage_key: StorageKey,
    pub members: Vec<FileRecord>,
}

impl StoredGroup {
    pub fn canonical(&self) -> Option<&FileRecord> {
        self.members.iter().find(|r| r.is_canonical)
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(sqlx::FromRow)]
struct ChangesetRow {
    changeset_id: String,
    name: String,
    content_signature: String,
    created_at: i64,
    file_count: i64,
    total_size: i64,
    status: String,
}

impl TryFrom<ChangesetRow> for Changeset {
    type Error = Error;

    fn try_from(row: ChangesetRow) -> Result<Self> {
        Ok(Self {
            changeset_id: parse_digest("changeset_id", &row.changeset_id)?,
            name: row.name,
            content_signature: row.content_signature,
            created_at: from_millis(row.created_at)?,
            file_count: row.file_count as u64,
            total_size: row.total_size as u64,
            status: ChangesetStatus::from_str(&row.status)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    path: String,
    changeset_id: String,
    device_id: Option<i64>,
    inode_id: Option<i64>,
    size: i64,
    mod_time: i64,
    content_hash: String,
    storage_key: String,
    is_canonical: bool,
    is_symlink: bool,
    upload_started_at: Option<i64>,
    upload_finished_at: Option<i64>,
    hold: Option<String>,
    last_error: Option<String>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = Error;

    fn try_from(row: FileRow) -> Result<Self> {
        Ok(Self {
            path: row.path,
            changeset_id: parse_digest("changeset_id", &row.changeset_id)?,
            // Stored as the same 64 bits.
            device_id: row.device_id.map(|d| d as u64),
            inode_id: row.inode_id.map(|i| i as u64),
            size: row.size as u64,
            mod_time: from_millis(row.mod_time)?,
            content_hash: parse_digest::<ContentHash>("content_hash", &row.content_hash)?,
            storage_key: parse_digest("storage_key", &row.storage_key)?,
            is_canonical: row.is_canonical,
            is_symlink: row.is_symlink,
            upload_started_at: row.upload_started_at.map(from_millis).transpose()?,
            upload_finished_at: row.upload_finished_at.map(from_millis).transpose()?,
            hold: row.hold.as_deref().map(Hold::from_str).transpose()?,
            last_error: row.last_error,
        })
    }
}

fn rows_to_records(rows: Vec<FileRow>) -> Result<Vec<FileRecord>> {
    rows.into_iter().map(FileRecord::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct BackendStatusRow {
    storage_key: String,
    backend: String,
    status: String,
    attempted_at: Option<i64>,
    completed_at: Option<i64>,
    last_error: Option<String>,
    retry_count: i64,
}

impl TryFrom<BackendStatusRow> for BackendStatus {
    type Error = Error;

    fn try_from(row: BackendStatusRow) -> Result<Self> {
        Ok(Self {
            storage_key: parse_digest("storage_key", &row.storage_key)?,
            backend: row.backend,
            status: BackendState::from_str(&row.status)?,
            attempted_at: row.attempted_at.map(from_millis).transpose()?,
            completed_at: row.completed_at.map(from_millis).transpose()?,
            last_error: row.last_error,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    files: i64,
    canonical: i64,
    in_progress: i64,
    finished: i64,
    failed: i64,
    blocked: i64,
}

impl From<ProgressRow> for ChangesetProgress {
    fn from(row: ProgressRow) -> Self {
        Self {
            files: row.files as u64,
            canonical: row.canonical as u64,
            in_progress: row.in_progress as u64,
            finished: row.finished as u64,
            failed: row.failed as u64,
            blocked: row.blocked as u64,
        }
    }
}

/// SQLite reports a lost write race as `SQLITE_BUSY` (5) or `SQLITE_BUSY_SNAPSHOT` (517).
fn contention(err: sqlx::Error) -> Error {
    let busy = match &err {
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("5" | "517")) => Some(db.message().to_string()),
        _ => None,
    };
    match busy {
        Some(message) => Error::StoreContention(message),
        None => Error::Database(err),
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {millis}")))
}

fn parse_digest<T>(field: &str, value: &str) -> Result<T>
where
    T: FromStr<Err = hex::FromHexError>,
{
    value
        .parse()
        .map_err(|e| Error::InvalidInput(format!("invalid {field} in manifest ({value}): {e}")))
}
