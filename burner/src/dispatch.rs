//! Paced dispatch of API operations.
//!
//! Submissions flow through a bounded FIFO queue into a fixed pool of
//! workers. Every execution first takes a token from a bucket of capacity
//! `burst` refilled at `qps` tokens per second, so over any window the
//! dispatcher issues at most qps·t + burst operations. Retries of transient
//! failures back off exponentially and do not take a second token.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use tdigest::TDigest;
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, Mutex},
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

use crate::config::RetryPolicy;

/// Errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The run was cancelled before the submission could be queued.
    #[error("dispatch cancelled")]
    Cancelled,
    /// The queue was closed.
    #[error("dispatch queue closed")]
    Closed,
}

/// An API operation. Invoked once per attempt so retries re-run it.
pub type Operation = Box<dyn Fn() -> BoxFuture<'static, Result<(), kube::Error>> + Send + Sync>;

/// One unit of work flowing through the queue.
pub struct Submission {
    /// Identifies the submission in logs, e.g. `create deployment api-1/web-2`.
    pub name: String,
    /// The operation to execute.
    pub op: Operation,
}

/// Counters and latency digest collected over a dispatcher's lifetime.
#[derive(Debug)]
pub struct DispatchStats {
    /// Submissions executed to completion, successfully.
    pub succeeded: u64,
    /// Submissions that failed after exhausting retries.
    pub failed: u64,
    /// Wall-clock latency digest across all submissions, in seconds.
    pub digest: TDigest,
}

impl DispatchStats {
    /// Quantile estimate in seconds.
    pub fn quantile(&self, q: f64) -> f64 {
        self.digest.estimate_quantile(q)
    }
}

struct Shared {
    succeeded: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
    idle: tokio::sync::Notify,
    durations: Mutex<Vec<f64>>,
}

/// Token bucket with capacity `burst` refilled at `qps` tokens per second.
///
/// A qps of zero disables pacing; config validation guarantees burst is also
/// zero in that case.
struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst.max(1)),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst.max(1)),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the refill covers the deficit.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), DispatchError> {
        if self.qps <= 0.0 {
            return Ok(());
        }
        loop {
            let deficit = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                state.last_refill = Instant::now();
                state.tokens = (state.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.qps)
            };
            select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = sleep(deficit) => {}
            }
        }
    }
}

/// Bounded-concurrency worker pool serializing calls through a token bucket.
pub struct Dispatcher {
    queue: mpsc::Sender<Submission>,
    tracker: TaskTracker,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Start `workers` workers paced at (`qps`, `burst`).
    pub fn new(
        qps: f64,
        burst: u32,
        workers: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        // Queue depth bounds caller lookahead; enqueue blocks beyond it
        let (tx, rx) = mpsc::channel::<Submission>((burst.max(1) as usize * 2).max(workers));
        let rx = Arc::new(Mutex::new(rx));
        let bucket = Arc::new(TokenBucket::new(qps, burst));
        let shared = Arc::new(Shared {
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            idle: tokio::sync::Notify::new(),
            durations: Mutex::new(Vec::new()),
        });
        let tracker = TaskTracker::new();
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let bucket = bucket.clone();
            let shared = shared.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                loop {
                    let submission = {
                        let mut rx = rx.lock().await;
                        select! {
                            _ = cancel.cancelled() => None,
                            recv = rx.recv() => recv,
                        }
                    };
                    let Some(submission) = submission else {
                        break;
                    };
                    if cancel.is_cancelled() || bucket.acquire(&cancel).await.is_err() {
                        debug!(submission.name, "dropping submission on cancellation");
                        shared.pending.fetch_sub(1, Ordering::AcqRel);
                        shared.idle.notify_waiters();
                        break;
                    }
                    execute(submission, retry, &shared, &cancel).await;
                }
            });
        }
        tracker.close();
        Self {
            queue: tx,
            tracker,
            shared,
            cancel,
        }
    }

    /// Queue a submission, blocking while the queue is full.
    pub async fn submit(&self, submission: Submission) -> Result<(), DispatchError> {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let outcome = select! {
            _ = self.cancel.cancelled() => Err(DispatchError::Cancelled),
            sent = self.queue.send(submission) => sent.map_err(|_| DispatchError::Closed),
        };
        if outcome.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            self.shared.idle.notify_waiters();
        }
        outcome
    }

    /// Wait until every queued submission has been executed.
    ///
    /// Returns early on cancellation. Unlike [`Dispatcher::drain`] the
    /// dispatcher stays usable, so callers can fence one iteration's
    /// submissions before starting the next.
    pub async fn barrier(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, or a completion between the
            // check and the await would be missed
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            select! {
                _ = self.cancel.cancelled() => return,
                _ = notified.as_mut() => {}
            }
        }
    }

    /// Close the queue, wait for the workers to drain, and report stats.
    pub async fn drain(self) -> DispatchStats {
        drop(self.queue);
        self.tracker.wait().await;
        let durations = std::mem::take(&mut *self.shared.durations.lock().await);
        DispatchStats {
            succeeded: self.shared.succeeded.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            digest: TDigest::new_with_size(100).merge_unsorted(durations),
        }
    }
}

async fn execute(
    submission: Submission,
    retry: RetryPolicy,
    shared: &Shared,
    cancel: &CancellationToken,
) {
    let started = Instant::now();
    let mut attempt = 1;
    let outcome = loop {
        match (submission.op)().await {
            Ok(()) => break Ok(()),
            Err(err) if is_transient(&err) && attempt < retry.max_attempts => {
                let backoff = retry
                    .base_delay
                    .saturating_mul(1 << (attempt - 1).min(16))
                    .min(retry.max_delay);
                warn!(
                    submission.name,
                    attempt,
                    ?backoff,
                    %err,
                    "transient API error, backing off"
                );
                attempt += 1;
                select! {
                    _ = cancel.cancelled() => break Err(err),
                    _ = sleep(backoff) => {}
                }
            }
            Err(err) => break Err(err),
        }
    };
    shared
        .durations
        .lock()
        .await
        .push(started.elapsed().as_secs_f64());
    match outcome {
        Ok(()) => {
            shared.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            shared.failed.fetch_add(1, Ordering::Relaxed);
            error!(submission.name, attempts = attempt, %err, "submission failed");
        }
    }
    shared.pending.fetch_sub(1, Ordering::AcqRel);
    shared.idle.notify_waiters();
}

/// Whether an API error is worth retrying.
///
/// Conflicts, throttling and server-side failures are transient; client
/// errors are permanent.
fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => {
            response.code == 409 || response.code == 429 || response.code >= 500
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}
