use crate::credentials::CredentialId;
use crate::error::RotatorError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Worker exits after this long with nothing to do; the tracking sets
/// are cleared on the way out and the next enqueue respawns it.
pub const QUEUE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A credential stuck in the unavailable set longer than this is reaped
/// by the next `is_available` check.
pub const UNAVAILABLE_TTL: Duration = Duration::from_secs(300);

/// The slice of the OAuth engine the queue worker calls back into.
///
/// The queue owns only its tracking state; the engine owns tokens,
/// per-credential locks, and backoff timers. The driver travels with
/// each job, so neither side owns the other.
#[async_trait]
pub trait RefreshDriver: Send + Sync {
    /// True when the cached token is outside the refresh buffer.
    fn token_is_fresh(&self, id: &CredentialId) -> bool;

    /// Remaining backoff window after recent refresh failures.
    fn backoff_remaining(&self, id: &CredentialId) -> Option<Duration>;

    /// Perform the refresh under the engine's per-credential lock.
    async fn run_refresh(
        &self,
        id: &CredentialId,
        force: bool,
        needs_reauth: bool,
    ) -> Result<(), RotatorError>;
}

struct Job {
    id: CredentialId,
    force: bool,
    needs_reauth: bool,
    driver: Arc<dyn RefreshDriver>,
}

#[derive(Default)]
struct Tracking {
    queued: HashSet<CredentialId>,
    unavailable: HashMap<CredentialId, Instant>,
}

struct QueueInner {
    jobs: Mutex<VecDeque<Job>>,
    tracking: Mutex<Tracking>,
    notify: tokio::sync::Notify,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    idle_timeout: Duration,
    unavailable_ttl: Duration,
}

/// Single-consumer refresh queue: serializes token refreshes per
/// provider adapter so concurrent expiry never turns into a refresh
/// storm, and gives the failure backoff a single enforcement point.
#[derive(Clone)]
pub struct RefreshQueue {
    inner: Arc<QueueInner>,
}

impl RefreshQueue {
    pub fn new() -> Self {
        Self::with_timing(QUEUE_IDLE_TIMEOUT, UNAVAILABLE_TTL)
    }

    pub fn with_timing(idle_timeout: Duration, unavailable_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(VecDeque::new()),
                tracking: Mutex::new(Tracking::default()),
                notify: tokio::sync::Notify::new(),
                worker: Mutex::new(None),
                idle_timeout,
                unavailable_ttl,
            }),
        }
    }

    /// Add a refresh request. Silent no-op when the credential is inside
    /// its backoff window (unless `needs_reauth` — interactive recovery
    /// bypasses backoff), already queued, or already unavailable. Marks
    /// the credential unavailable and lazily starts the worker.
    pub fn enqueue(
        &self,
        id: &CredentialId,
        force: bool,
        needs_reauth: bool,
        driver: Arc<dyn RefreshDriver>,
    ) {
        if !needs_reauth {
            if let Some(remaining) = driver.backoff_remaining(id) {
                tracing::debug!(
                    credential = %id,
                    remaining_secs = remaining.as_secs(),
                    "skipping automated refresh, credential in backoff"
                );
                return;
            }
        }

        {
            let mut t = self.inner.tracking.lock();
            if t.queued.contains(id) || t.unavailable.contains_key(id) {
                return;
            }
            t.queued.insert(id.clone());
            t.unavailable.insert(id.clone(), Instant::now());
            tracing::debug!(
                credential = %id,
                unavailable = t.unavailable.len(),
                "marked credential unavailable for refresh"
            );
        }

        self.inner.jobs.lock().push_back(Job {
            id: id.clone(),
            force,
            needs_reauth,
            driver,
        });
        self.inner.notify.notify_one();
        self.ensure_worker();
    }

    /// Whether the credential may be handed out by the rotator.
    ///
    /// Reaps entries stuck longer than the TTL: defense in depth against
    /// a lost worker leaving a credential permanently excluded.
    pub fn is_available(&self, id: &CredentialId) -> bool {
        let mut t = self.inner.tracking.lock();
        match t.unavailable.get(id) {
            None => true,
            Some(marked) => {
                let elapsed = marked.elapsed();
                if elapsed > self.inner.unavailable_ttl {
                    tracing::warn!(
                        credential = %id,
                        stuck_secs = elapsed.as_secs(),
                        ttl_secs = self.inner.unavailable_ttl.as_secs(),
                        "credential stuck in unavailable state, auto-cleaning stale entry"
                    );
                    t.unavailable.remove(id);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Stop the worker task, if running. Pending jobs are dropped.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.worker.lock().take() {
            handle.abort();
        }
        let mut t = self.inner.tracking.lock();
        t.queued.clear();
        t.unavailable.clear();
    }

    fn ensure_worker(&self) {
        let mut slot = self.inner.worker.lock();
        let running = slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !running {
            let inner = Arc::clone(&self.inner);
            *slot = Some(tokio::spawn(worker_loop(inner)));
        }
    }

    #[cfg(test)]
    fn worker_finished(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    #[cfg(test)]
    fn mark_unavailable_for_test(&self, id: &CredentialId) {
        self.inner
            .tracking
            .lock()
            .unavailable
            .insert(id.clone(), Instant::now());
    }

    #[cfg(test)]
    fn unavailable_len(&self) -> usize {
        self.inner.tracking.lock().unavailable.len()
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let job = inner.jobs.lock().pop_front();
        let Some(job) = job else {
            match tokio::time::timeout(inner.idle_timeout, inner.notify.notified()).await {
                Ok(_) => continue,
                Err(_) => {
                    let mut t = inner.tracking.lock();
                    if !t.unavailable.is_empty() {
                        tracing::warn!(
                            stale = t.unavailable.len(),
                            "queue worker idle timeout, clearing stale unavailable credentials"
                        );
                        t.unavailable.clear();
                    }
                    t.queued.clear();
                    return;
                }
            }
        };
        process(&inner, job).await;
    }
}

async fn process(inner: &QueueInner, job: Job) {
    let Job {
        id,
        force,
        needs_reauth,
        driver,
    } = job;

    // State may have changed since the job was queued.
    if !force && driver.token_is_fresh(&id) {
        tracing::debug!(credential = %id, "token no longer near expiry, skipping queued refresh");
    } else if let Err(e) = driver.run_refresh(&id, force, needs_reauth).await {
        // Backoff bookkeeping happened inside the refresh; the
        // credential goes back to available so rotation can decide.
        tracing::warn!(credential = %id, error = %e, "queued refresh failed");
    } else {
        tracing::debug!(credential = %id, "queued refresh done");
    }

    let mut t = inner.tracking.lock();
    t.queued.remove(&id);
    t.unavailable.remove(&id);
}

impl Default for RefreshQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeDriver {
        refreshes: AtomicUsize,
        fresh: AtomicBool,
        backoff: Mutex<Option<Duration>>,
    }

    impl FakeDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicUsize::new(0),
                fresh: AtomicBool::new(false),
                backoff: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl RefreshDriver for FakeDriver {
        fn token_is_fresh(&self, _id: &CredentialId) -> bool {
            self.fresh.load(Ordering::SeqCst)
        }
        fn backoff_remaining(&self, _id: &CredentialId) -> Option<Duration> {
            *self.backoff.lock()
        }
        async fn run_refresh(
            &self,
            _id: &CredentialId,
            _force: bool,
            _needs_reauth: bool,
        ) -> Result<(), RotatorError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn id(n: &str) -> CredentialId {
        CredentialId::from_path(format!("/tmp/{n}_oauth_1.json"))
    }

    #[tokio::test]
    async fn enqueue_processes_and_restores_availability() {
        let queue = RefreshQueue::new();
        let driver = FakeDriver::new();
        let cred = id("qwen_code");

        queue.enqueue(&cred, false, false, driver.clone());
        assert!(!queue.is_available(&cred));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_available(&cred));
        assert_eq!(driver.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_suppresses_automated_enqueue_but_not_reauth() {
        let queue = RefreshQueue::new();
        let driver = FakeDriver::new();
        *driver.backoff.lock() = Some(Duration::from_secs(60));
        let cred = id("qwen_code");

        queue.enqueue(&cred, false, false, driver.clone());
        assert!(queue.is_available(&cred), "backoff enqueue must be a no-op");

        queue.enqueue(&cred, true, true, driver.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_dropped() {
        let queue = RefreshQueue::new();
        let driver = FakeDriver::new();
        let cred = id("qwen_code");

        for _ in 0..5 {
            queue.enqueue(&cred, false, false, driver.clone());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh_but_marks_available() {
        let queue = RefreshQueue::new();
        let driver = FakeDriver::new();
        driver.fresh.store(true, Ordering::SeqCst);
        let cred = id("qwen_code");

        queue.enqueue(&cred, false, false, driver.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_available(&cred));
        assert_eq!(driver.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_reaps_stuck_unavailable_entry() {
        let queue = RefreshQueue::new();
        let cred = id("qwen_code");
        queue.mark_unavailable_for_test(&cred);

        assert!(!queue.is_available(&cred));
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(queue.is_available(&cred), "TTL must reap the stale entry");
        assert_eq!(queue.unavailable_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_clears_tracking_state_and_exits() {
        let queue = RefreshQueue::new();
        let driver = FakeDriver::new();
        let cred = id("qwen_code");

        queue.enqueue(&cred, false, false, driver.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Stuck entry left behind by a hypothetical lost worker.
        queue.mark_unavailable_for_test(&id("stuck"));

        tokio::time::sleep(QUEUE_IDLE_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(queue.unavailable_len(), 0);
        assert!(queue.worker_finished(), "worker should exit after idle timeout");

        // Next enqueue respawns the worker.
        queue.enqueue(&cred, false, false, driver.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.refreshes.load(Ordering::SeqCst), 2);
    }
}
