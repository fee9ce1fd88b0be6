//! Shared, rate-limited scheduler for invite lookups.
//!
//! Every guild's checks and the background sweeps funnel their lookups
//! through one [`ValidationQueue`]. A fixed pool of workers pulls the
//! lowest-priority-value job first (FIFO among equals), waits for the rate
//! limiter, and resolves the code with a timeout. A lookup that fails for any
//! reason resolves to `None`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use serenity::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// What the chat platform reports for a code that resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InviteLookup {
    pub expires_at: Option<DateTime<Utc>>,
    pub max_age: Option<u64>,
    pub max_uses: Option<u64>,
}

impl InviteLookup {
    /// No expiry, no max age and no max uses.
    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
            && self.max_age.unwrap_or(0) == 0
            && self.max_uses.unwrap_or(0) == 0
    }
}

#[async_trait]
pub trait InviteResolver: Send + Sync {
    /// Looks up one invite code. An unknown or revoked code is an error.
    async fn resolve(&self, code: &str) -> anyhow::Result<InviteLookup>;
}

/// Lower values are serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// A user is waiting on a check.
    Interactive = 0,
    /// Maintenance sweeps.
    Background = 1,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub rate_per_second: NonZeroU32,
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            rate_per_second: NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN),
            timeout: Duration::from_secs(15),
        }
    }
}

struct Job {
    priority: Priority,
    seq: u64,
    code: String,
    reply: oneshot::Sender<Option<InviteLookup>>,
}

// BinaryHeap is a max-heap: the "greatest" job is the one with the lowest
// priority value and, among those, the earliest sequence number.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Job {}

struct Shared {
    pending: Mutex<BinaryHeap<Job>>,
    notify: Notify,
    seq: AtomicU64,
    resolver: Arc<dyn InviteResolver>,
    limiter: DefaultDirectRateLimiter,
    timeout: Duration,
}

pub struct ValidationQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ValidationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationQueue")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl ValidationQueue {
    /// Spawns the worker pool on the current tokio runtime.
    pub fn new(resolver: Arc<dyn InviteResolver>, config: QueueConfig) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            resolver,
            limiter: RateLimiter::direct(Quota::per_second(config.rate_per_second)),
            timeout: config.timeout,
        });

        let workers = (0..config.concurrency.max(1))
            .map(|worker| tokio::spawn(work(Arc::clone(&shared), worker)))
            .collect();

        Self { shared, workers }
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Queues a lookup and returns the receiver for its result. The job is
    /// queued before this returns, so submission order is call order.
    pub fn enqueue(
        &self,
        code: impl Into<String>,
        priority: Priority,
    ) -> oneshot::Receiver<Option<InviteLookup>> {
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            priority,
            seq: self.shared.seq.fetch_add(1, AtomicOrdering::Relaxed),
            code: code.into(),
            reply,
        };
        self.shared.pending.lock().push(job);
        self.shared.notify.notify_one();
        receiver
    }

    pub async fn submit(&self, code: impl Into<String>, priority: Priority) -> Option<InviteLookup> {
        self.enqueue(code, priority).await.ok().flatten()
    }
}

impl Drop for ValidationQueue {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn work(shared: Arc<Shared>, worker: usize) {
    loop {
        let job = loop {
            if let Some(job) = shared.pending.lock().pop() {
                break job;
            }
            shared.notify.notified().await;
        };

        // The caller gave up waiting.
        if job.reply.is_closed() {
            continue;
        }

        shared.limiter.until_ready().await;
        let result = match tokio::time::timeout(shared.timeout, shared.resolver.resolve(&job.code)).await {
            Ok(Ok(lookup)) => Some(lookup),
            Ok(Err(e)) => {
                debug!(worker, priority = ?job.priority, error = %e, "invite lookup failed");
                None
            }
            Err(_) => {
                warn!(worker, priority = ?job.priority, timeout = ?shared.timeout, "invite lookup timed out");
                None
            }
        };
        let _ = job.reply.send(result);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use anyhow::anyhow;
    use tokio::sync::Semaphore;

    use super::*;

    /// Resolves codes from a fixed table and records the order it saw them.
    #[derive(Default)]
    pub(crate) struct TableResolver {
        pub(crate) valid: HashMap<String, InviteLookup>,
        pub(crate) seen: Mutex<Vec<String>>,
        pub(crate) gate: Option<Arc<Semaphore>>,
        pub(crate) started: Notify,
    }

    impl TableResolver {
        pub(crate) fn with_valid(codes: &[(&str, InviteLookup)]) -> Self {
            Self {
                valid: codes
                    .iter()
                    .map(|(code, lookup)| (code.to_string(), lookup.clone()))
                    .collect(),
                ..Default::default()
            }
        }

        pub(crate) fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl InviteResolver for TableResolver {
        async fn resolve(&self, code: &str) -> anyhow::Result<InviteLookup> {
            self.seen.lock().push(code.to_string());
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            self.valid.get(code).cloned().ok_or_else(|| anyhow!("Unknown Invite"))
        }
    }

    struct Stalled;

    #[async_trait]
    impl InviteResolver for Stalled {
        async fn resolve(&self, _code: &str) -> anyhow::Result<InviteLookup> {
            std::future::pending().await
        }
    }

    fn config(concurrency: usize) -> QueueConfig {
        QueueConfig {
            concurrency,
            rate_per_second: NonZeroU32::new(1000).unwrap(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn permanence_requires_no_limits() {
        assert!(InviteLookup::default().is_permanent());
        assert!(InviteLookup { max_age: Some(0), max_uses: Some(0), ..Default::default() }.is_permanent());
        assert!(!InviteLookup { max_uses: Some(5), ..Default::default() }.is_permanent());
        assert!(!InviteLookup { expires_at: Some(Utc::now()), ..Default::default() }.is_permanent());
    }

    #[tokio::test]
    async fn failed_lookup_resolves_to_none() {
        let resolver = Arc::new(TableResolver::with_valid(&[("good", InviteLookup::default())]));
        let queue = ValidationQueue::new(resolver, config(2));

        assert_eq!(queue.submit("good", Priority::Interactive).await, Some(InviteLookup::default()));
        assert_eq!(queue.submit("gone", Priority::Interactive).await, None);
    }

    #[tokio::test]
    async fn timed_out_lookup_resolves_to_none() {
        let queue = ValidationQueue::new(
            Arc::new(Stalled),
            QueueConfig { timeout: Duration::from_millis(20), ..config(1) },
        );
        assert_eq!(queue.submit("slow", Priority::Interactive).await, None);
    }

    #[tokio::test]
    async fn serves_lower_priority_value_first_then_fifo() {
        let gate = Arc::new(Semaphore::new(0));
        let resolver = Arc::new(TableResolver {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let queue = ValidationQueue::new(Arc::clone(&resolver) as Arc<dyn InviteResolver>, config(1));

        // Occupy the only worker so everything after this queues up.
        let blocker = queue.enqueue("blocker", Priority::Background);
        resolver.started.notified().await;

        let receivers = vec![
            queue.enqueue("bg-1", Priority::Background),
            queue.enqueue("int-1", Priority::Interactive),
            queue.enqueue("bg-2", Priority::Background),
            queue.enqueue("int-2", Priority::Interactive),
        ];
        assert_eq!(queue.pending(), 4);

        gate.add_permits(5);
        blocker.await.unwrap();
        for receiver in receivers {
            receiver.await.unwrap();
        }

        assert_eq!(resolver.seen(), vec!["blocker", "int-1", "int-2", "bg-1", "bg-2"]);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let gate = Arc::new(Semaphore::new(0));
        let resolver = Arc::new(TableResolver {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let queue = ValidationQueue::new(Arc::clone(&resolver) as Arc<dyn InviteResolver>, config(2));

        let receivers: Vec<_> = (0..5)
            .map(|i| queue.enqueue(format!("code-{i}"), Priority::Interactive))
            .collect();
        while resolver.seen().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(resolver.seen().len(), 2);
        assert_eq!(queue.pending(), 3);

        gate.add_permits(5);
        for receiver in receivers {
            assert_eq!(receiver.await.unwrap(), None);
        }
        assert_eq!(resolver.seen().len(), 5);
    }
}
