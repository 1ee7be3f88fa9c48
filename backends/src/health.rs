use crate::backend::Backend;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_DEGRADED_AFTER: u32 = 5;
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct Health {
    consecutive_failures: u32,
    degraded: bool,
    last_check: Option<Instant>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub backend: String,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_error: Option<String>,
}

/// Consecutive-failure bookkeeping per backend.
///
/// A backend that fails `degraded_after` times in a row is skipped for new
/// work until its `health_check` passes again. Checks are rate limited to
/// one per `recheck_interval`.
#[derive(Debug)]
pub struct HealthTracker {
    degraded_after: u32,
    recheck_interval: Duration,
    state: Mutex<HashMap<String, Health>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DEGRADED_AFTER)
    }
}

impl HealthTracker {
    pub fn new(degraded_after: u32) -> Self {
        Self {
            degraded_after: degraded_after.max(1),
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HashMap<String, Health>) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn record_success(&self, backend: &str) {
        self.with_state(|state| {
            if let Some(health) = state.get_mut(backend) {
                if health.degraded {
                    info!(backend, "Backend recovered");
                }
                *health = Health::default();
            }
        });
    }

    /// Returns `true` when this failure tipped the backend into degraded.
    pub fn record_failure(&self, backend: &str, error: &str) -> bool {
        self.with_state(|state| {
            let health = state.entry(backend.to_string()).or_default();
            health.consecutive_failures += 1;
            health.last_error = Some(error.to_string());
            if !health.degraded && health.consecutive_failures >= self.degraded_after {
                health.degraded = true;
                health.last_check = Some(Instant::now());
                warn!(
                    backend,
                    consecutive_failures = health.consecutive_failures,
                    error,
                    "Backend degraded, skipping it for new work"
                );
                return true;
            }
            false
        })
    }

    pub fn is_degraded(&self, backend: &str) -> bool {
        self.with_state(|state| state.get(backend).is_some_and(|h| h.degraded))
    }

    /// Whether new work may be sent to `backend`, probing it if it is degraded
    /// and due for a recheck.
    pub async fn available(&self, backend: &dyn Backend) -> bool {
        let name = backend.name();
        let due = self.with_state(|state| match state.get_mut(name) {
            Some(health) if health.degraded => {
                let due = health
                    .last_check
                    .is_none_or(|last| last.elapsed() >= self.recheck_interval);
                if due {
                    health.last_check = Some(Instant::now());
                }
                Some(due)
            }
            _ => None,
        });

        match due {
            None => true,
            Some(false) => false,
            Some(true) => {
                let status = backend.health_check().await;
                if status.is_healthy() {
                    self.record_success(name);
                    true
                } else {
                    warn!(backend = name, status = ?status, "Degraded backend still failing health check");
                    false
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let mut snapshot: Vec<HealthSnapshot> = self.with_state(|state| {
            state
                .iter()
                .map(|(name, health)| HealthSnapshot {
                    backend: name.clone(),
                    consecutive_failures: health.consecutive_failures,
                    degraded: health.degraded,
                    last_error: health.last_error.clone(),
                })
                .collect()
        });
        snapshot.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshot
    }
}
