//! Shared adapter machinery
//!
//! Every backend adapter embeds a [`BaseAdapter`] supplying bounded
//! exponential-backoff retry, deadline-bounded execution, lock-free metrics,
//! an optional periodic health loop and a short-TTL status cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{AdapterConfig, RETRY_BACKOFF_CAP, RETRY_JITTER, STATUS_CACHE_CAPACITY, STATUS_CACHE_TTL};
use crate::error::{BackendError, Error, ErrorKind, Result};
use crate::translation::Backend;

use super::status::CompositeStatus;
use super::{ReplicationAdapter, ReplicationClassView, ReplicationIntent};

/// Lock-free operation counters for one adapter instance.
#[derive(Debug, Default)]
pub struct AdapterMetrics {
    total: AtomicU64,
    success: AtomicU64,
    fail: AtomicU64,
    latency_ms_total: AtomicU64,
    health_checks: AtomicU64,
    health_failures: AtomicU64,
    connection_errors: AtomicU64,
    timeout_errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub avg_latency_ms: u64,
    pub health_checks: u64,
    pub health_failures: u64,
    pub connection_errors: u64,
    pub timeout_errors: u64,
}

impl AdapterMetrics {
    pub fn record_attempt(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.latency_ms_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, err: &Error) {
        self.fail.fetch_add(1, Ordering::Relaxed);
        match err.kind() {
            ErrorKind::Connection => {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::Timeout => {
                self.timeout_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_health_check(&self, healthy: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if !healthy {
            self.health_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let success = self.success.load(Ordering::Relaxed);
        let latency = self.latency_ms_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success,
            fail: self.fail.load(Ordering::Relaxed),
            avg_latency_ms: if success == 0 { 0 } else { latency / success },
            health_checks: self.health_checks.load(Ordering::Relaxed),
            health_failures: self.health_failures.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
        }
    }
}

struct CacheEntry {
    status: CompositeStatus,
    inserted: Instant,
}

/// Short-TTL cache of observed statuses keyed by `namespace/name`. Bounded;
/// the entry with the oldest timestamp is evicted when full.
pub struct StatusCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl StatusCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<CompositeStatus> {
        let entries = self.entries.read().expect("status cache lock poisoned");
        let entry = entries.get(key)?;
        if entry.inserted.elapsed() > self.ttl {
            return None;
        }
        Some(entry.status.clone())
    }

    pub fn put(&self, key: &str, status: CompositeStatus) {
        let mut entries = self.entries.write().expect("status cache lock poisoned");
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                status,
                inserted: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries
            .write()
            .expect("status cache lock poisoned")
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("status cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(STATUS_CACHE_TTL, STATUS_CACHE_CAPACITY)
    }
}

struct HealthLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The reusable embedded value each backend adapter composes.
pub struct BaseAdapter {
    backend: Backend,
    pub config: AdapterConfig,
    pub metrics: Arc<AdapterMetrics>,
    pub cache: StatusCache,
    healthy: Arc<AtomicBool>,
    health_loop: Mutex<Option<HealthLoop>>,
}

impl BaseAdapter {
    pub fn new(backend: Backend, config: AdapterConfig) -> Self {
        Self {
            backend,
            config,
            metrics: Arc::new(AdapterMetrics::default()),
            cache: StatusCache::default(),
            healthy: Arc::new(AtomicBool::new(true)),
            health_loop: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Run `op` under the per-operation deadline with bounded
    /// exponential-backoff retry. Non-retryable errors short-circuit; each
    /// delay doubles, carries proportional jitter, and never exceeds the cap.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, object: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        self.metrics.record_attempt();

        let steps = self.config.retry_attempts.max(1);
        let mut delay = self.config.retry_delay;
        let mut last_err = None;

        for attempt in 1..=steps {
            match tokio::time::timeout(self.config.timeout, op()).await {
                Ok(Ok(value)) => {
                    self.metrics.record_success(start.elapsed());
                    return Ok(value);
                }
                Ok(Err(err)) if !err.is_retriable() => {
                    self.metrics.record_failure(&err);
                    return Err(err);
                }
                Ok(Err(err)) => {
                    debug!(
                        backend = %self.backend,
                        operation,
                        object,
                        attempt,
                        error = %err,
                        "retryable failure"
                    );
                    last_err = Some(err);
                }
                Err(_) => {
                    let err = Error::TimeoutError(self.config.timeout);
                    debug!(backend = %self.backend, operation, object, attempt, "deadline exceeded");
                    last_err = Some(err);
                }
            }

            if attempt < steps {
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(RETRY_BACKOFF_CAP);
            }
        }

        let err = last_err.unwrap_or_else(|| {
            Error::BackendError(BackendError::new(
                ErrorKind::Unknown,
                self.backend,
                operation,
                object,
                "retry loop exited without an error",
            ))
        });
        self.metrics.record_failure(&err);
        Err(err)
    }

    /// Start the periodic health loop, if enabled. `check` probes the
    /// backend; the loop samples under a short critical section and is torn
    /// down through a close channel + join handle in [`shutdown_health_loop`].
    pub fn spawn_health_loop<F, Fut>(&self, check: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        if !self.config.health_check_enabled {
            return;
        }
        let mut slot = self.health_loop.lock().expect("health loop lock poisoned");
        if slot.is_some() {
            return;
        }

        let (shutdown, mut closed) = watch::channel(false);
        let interval = self.config.health_check_interval;
        let metrics = Arc::clone(&self.metrics);
        let healthy = Arc::clone(&self.healthy);
        let backend = self.backend;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ok = check().await.is_ok();
                        metrics.record_health_check(ok);
                        if !ok {
                            warn!(backend = %backend, "health check failed");
                        }
                        healthy.store(ok, Ordering::Relaxed);
                    }
                    _ = closed.changed() => break,
                }
            }
        });

        *slot = Some(HealthLoop { shutdown, task });
    }

    /// Stop the health loop and wait for it to exit.
    pub async fn shutdown_health_loop(&self) {
        let handle = self
            .health_loop
            .lock()
            .expect("health loop lock poisoned")
            .take();
        if let Some(HealthLoop { shutdown, task }) = handle {
            let _ = shutdown.send(true);
            let _ = task.await;
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + rand::rng().random_range(0.0..RETRY_JITTER);
    delay.mul_f64(factor).min(RETRY_BACKOFF_CAP)
}

/// How the recovery ladder resolved an unhealthy relationship.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Resynced,
    Recreated,
    ResetToSecondary,
}

/// Recovery ladder for an Unhealthy observed status. Rungs are tried in
/// order, stopping at the first that restores health: trigger a resync;
/// delete and recreate the backend object; reset to the secondary role with
/// auto-resync. Each attempt waits one retry interval before re-checking.
pub async fn run_recovery_ladder<A>(
    adapter: &A,
    base: &BaseAdapter,
    intent: &ReplicationIntent,
    class: Option<&ReplicationClassView>,
) -> Result<RecoveryOutcome>
where
    A: ReplicationAdapter + ?Sized,
{
    let wait = base.config.retry_delay;

    adapter.resync(intent, class).await?;
    if recheck_health(adapter, base, intent, wait).await? {
        return Ok(RecoveryOutcome::Resynced);
    }

    adapter.delete(intent).await?;
    adapter.reconcile(intent, class).await?;
    if recheck_health(adapter, base, intent, wait).await? {
        return Ok(RecoveryOutcome::Recreated);
    }

    let mut reset = intent.clone();
    reset.state = crate::crd::VolumeReplicationState::Secondary;
    reset.auto_resync = true;
    adapter.reconcile(&reset, class).await?;
    if recheck_health(adapter, base, intent, wait).await? {
        return Ok(RecoveryOutcome::ResetToSecondary);
    }

    Err(Error::BackendError(
        BackendError::new(
            ErrorKind::Operation,
            base.backend(),
            "recover",
            intent.object_ref(),
            "recovery ladder exhausted without restoring health",
        )
        .with_remediation("inspect the backend replication object and storage system directly"),
    ))
}

async fn recheck_health<A>(
    adapter: &A,
    base: &BaseAdapter,
    intent: &ReplicationIntent,
    wait: Duration,
) -> Result<bool>
where
    A: ReplicationAdapter + ?Sized,
{
    tokio::time::sleep(wait).await;
    base.cache.invalidate(&intent.object_ref());
    let status = adapter.status(intent).await?;
    Ok(status.health != crate::crd::Health::Unhealthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> AdapterConfig {
        AdapterConfig {
            timeout: Duration::from_millis(200),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let base = BaseAdapter::new(Backend::Ceph, fast_config());
        let calls = AtomicU32::new(0);

        let result = base
            .with_retry("reconcile", "default/db", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::BackendError(BackendError::new(
                            ErrorKind::Connection,
                            Backend::Ceph,
                            "reconcile",
                            "default/db",
                            "transient",
                        )))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snap = base.metrics.snapshot();
        assert_eq!(snap.success, 1);
        assert_eq!(snap.fail, 0);
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit() {
        let base = BaseAdapter::new(Backend::Dell, fast_config());
        let calls = AtomicU32::new(0);

        let result: Result<()> = base
            .with_retry("reconcile", "default/db", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::ValidationError("bad spec".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(base.metrics.snapshot().fail, 1);
    }

    #[tokio::test]
    async fn retries_exhaust_and_count_connection_errors() {
        let base = BaseAdapter::new(Backend::Trident, fast_config());
        let calls = AtomicU32::new(0);

        let result: Result<()> = base
            .with_retry("status", "default/db", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::BackendError(BackendError::new(
                        ErrorKind::Connection,
                        Backend::Trident,
                        "status",
                        "default/db",
                        "unreachable",
                    )))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snap = base.metrics.snapshot();
        assert_eq!(snap.fail, 1);
        assert_eq!(snap.connection_errors, 1);
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let base = BaseAdapter::new(Backend::Ceph, AdapterConfig {
            timeout: Duration::from_millis(10),
            retry_attempts: 1,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        });

        let result: Result<()> = base
            .with_retry("reconcile", "default/db", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::TimeoutError(_))));
        assert_eq!(base.metrics.snapshot().timeout_errors, 1);
    }

    #[test]
    fn cache_expires_and_evicts_oldest() {
        let cache = StatusCache::new(Duration::from_millis(40), 2);
        cache.put("a", CompositeStatus::default());
        assert!(cache.get("a").is_some());

        cache.put("b", CompositeStatus::default());
        // Capacity 2: inserting a third evicts the oldest entry.
        cache.put("c", CompositeStatus::default());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn cache_invalidation_removes_entries() {
        let cache = StatusCache::default();
        cache.put("default/db", CompositeStatus::default());
        cache.invalidate("default/db");
        assert!(cache.is_empty());
    }

    #[test]
    fn avg_latency_is_computed_over_successes() {
        let metrics = AdapterMetrics::default();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_success(Duration::from_millis(30));
        assert_eq!(metrics.snapshot().avg_latency_ms, 20);
    }
}
