use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by every task of a coordinator or worker.
#[derive(Debug)]
pub struct WorkerStats {
    started: Instant,
    processed: AtomicU64,
    committed: AtomicU64,
    deduplicated: AtomicU64,
    failed: AtomicU64,
    blocked: AtomicU64,
    deferred: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            processed: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
        }
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_committed(&self, bytes: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            elapsed: self.started.elapsed(),
            processed: self.processed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSummary {
    #[serde(skip)]
    pub elapsed: Duration,
    pub processed: u64,
    pub committed: u64,
    pub deduplicated: u64,
    pub failed: u64,
    pub blocked: u64,
    pub deferred: u64,
    pub bytes_uploaded: u64,
}

impl StatsSummary {
    pub fn files_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.processed as f64 / secs } else { 0.0 }
    }

    pub fn megabytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_uploaded as f64 / 1024.0 / 1024.0 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed ({} uploaded, {} deduplicated, {} failed, {} blocked, {} deferred), {:.2} MB at {:.1} files/s, {:.2} MB/s",
            self.processed,
            self.committed,
            self.deduplicated,
            self.failed,
            self.blocked,
            self.deferred,
            self.bytes_uploaded as f64 / 1024.0 / 1024.0,
            self.files_per_second(),
            self.megabytes_per_second()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = WorkerStats::new();
        stats.record_committed(2048);
        stats.record_committed(1024);
        stats.record_deduplicated();
        stats.record_failed();

        let summary = stats.summary();
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.committed, 2);
        assert_eq!(summary.bytes_uploaded, 3072);
        assert!(summary.to_string().starts_with("4 processed"));
    }
}
