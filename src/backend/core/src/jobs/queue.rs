//! Concurrency-limited, priority-ordered, retrying task queue.
//!
//! ```text
//!   add() ──► pending (BinaryHeap: priority desc, seq asc)
//!                 │  pump() while !paused && active < concurrency
//!                 ▼
//!             spawn(run) ──► ok ─────────────────► handle resolves Ok
//!                 │
//!                 └──► err/timeout ──► retries left? ──► sleep(backoff) ──► pending
//!                                          └── no ───► handle resolves Err
//! ```
//!
//! The queue is used both for fan-out inside a single job (staking positions
//! with a concurrency of 5, per-user PnL with no limit) and as the execution
//! layer under the job registry.
//!
//! A timed-out task's future is dropped, which cancels it at its next
//! `.await`. Work already committed before that point stays committed, so
//! ledger-mutating tasks must re-check state after taking their row lock
//! instead of relying on the timeout as an abort.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

use super::backoff::RetryPolicy;
use crate::error::SettlementError;
use crate::telemetry::SettlementMetrics;

type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

/// Terminal failure of a queued task.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({max} pending tasks)")]
    CapacityExceeded { max: usize },

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task failed: {0}")]
    Failed(#[source] SettlementError),

    #[error("task panicked")]
    Panicked,

    #[error("queue dropped the task")]
    Closed,
}

/// Per-task options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Higher runs first.
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Queue construction parameters.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub name: String,
    /// Maximum tasks executing at once; `None` means unbounded.
    pub concurrency: Option<usize>,
    /// Pending tasks beyond this are rejected by `add`.
    pub max_queue_length: Option<usize>,
}

impl TaskQueueConfig {
    pub fn bounded(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency: Some(concurrency.max(1)),
            max_queue_length: None,
        }
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            max_queue_length: None,
        }
    }

    pub fn with_max_queue_length(mut self, max: usize) -> Self {
        self.max_queue_length = Some(max);
        self
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskQueueStats {
    pub pending: usize,
    pub active: usize,
    /// Tasks sleeping before a retry.
    pub retrying: usize,
    pub peak_active: usize,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
}

struct QueuedTask {
    priority: i32,
    seq: u64,
    retries_done: u32,
    options: TaskOptions,
    action: TaskAction,
    reply: oneshot::Sender<Result<(), QueueError>>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<QueuedTask>,
    paused: bool,
    next_seq: u64,
    stats: TaskQueueStats,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.stats.active == 0 && self.stats.retrying == 0
    }
}

struct Inner {
    name: String,
    concurrency: usize,
    max_queue_length: Option<usize>,
    state: Mutex<QueueState>,
    drained: Notify,
}

/// Resolves when the task reaches a terminal outcome.
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<(), QueueError>>,
}

impl Future for TaskHandle {
    type Output = Result<(), QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded-concurrency task runner. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        tracing::debug!(
            queue = %config.name,
            concurrency = ?config.concurrency,
            max_queue_length = ?config.max_queue_length,
            "Task queue created"
        );
        Self {
            inner: Arc::new(Inner {
                name: config.name,
                concurrency: config.concurrency.unwrap_or(usize::MAX),
                max_queue_length: config.max_queue_length,
                state: Mutex::new(QueueState::default()),
                drained: Notify::new(),
            }),
        }
    }

    /// Admit a task. Fails immediately when the pending queue is at
    /// capacity; otherwise the returned handle resolves once the task
    /// succeeds or exhausts its retries.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add<F, Fut>(&self, action: F, options: TaskOptions) -> Result<TaskHandle, QueueError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if let Some(max) = self.inner.max_queue_length {
                if state.pending.len() >= max {
                    return Err(QueueError::CapacityExceeded { max });
                }
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(QueuedTask {
                priority: options.priority,
                seq,
                retries_done: 0,
                options,
                action: Arc::new(move || action().boxed()),
                reply,
            });
        }
        self.pump();
        Ok(TaskHandle { rx })
    }

    /// Stop dispatching new tasks. In-flight tasks keep running.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Resolves once nothing is pending, running or waiting to retry.
    /// Returns immediately when the queue is already drained.
    pub async fn on_idle(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().stats.active
    }

    pub fn stats(&self) -> TaskQueueStats {
        let state = self.inner.state.lock();
        TaskQueueStats {
            pending: state.pending.len(),
            ..state.stats.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    fn pump(&self) {
        let mut ready = Vec::new();
        let (active, pending) = {
            let mut state = self.inner.state.lock();
            while !state.paused && state.stats.active < self.inner.concurrency {
                let Some(task) = state.pending.pop() else { break };
                state.stats.active += 1;
                state.stats.peak_active = state.stats.peak_active.max(state.stats.active);
                ready.push(task);
            }
            (state.stats.active, state.pending.len())
        };
        SettlementMetrics::set_queue_depth(&self.inner.name, active, pending);

        for task in ready {
            let queue = self.clone();
            tokio::spawn(async move { queue.run(task).await });
        }
    }

    async fn run(self, mut task: QueuedTask) {
        let fut = AssertUnwindSafe((task.action)()).catch_unwind();
        let outcome = match task.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => flatten(result),
                Err(_) => Err(QueueError::Timeout(limit)),
            },
            None => flatten(fut.await),
        };

        let retry_delay = match (&outcome, &task.options.retry) {
            (Err(QueueError::Panicked), _) => None,
            (Err(QueueError::Failed(err)), Some(policy)) if !policy.retries_error(err) => None,
            (Err(_), Some(policy)) if policy.should_retry(task.retries_done) => {
                task.retries_done += 1;
                Some(policy.delay_for_retry(task.retries_done))
            }
            _ => None,
        };

        match (outcome, retry_delay) {
            (Err(err), Some(delay)) => {
                tracing::debug!(
                    queue = %self.inner.name,
                    retry = task.retries_done,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Task failed, scheduling retry"
                );
                {
                    let mut state = self.inner.state.lock();
                    state.stats.active -= 1;
                    state.stats.retrying += 1;
                    state.stats.retries += 1;
                }
                self.pump();

                let queue = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut state = queue.inner.state.lock();
                        state.stats.retrying -= 1;
                        state.pending.push(task);
                    }
                    queue.pump();
                });
            }
            (outcome, _) => {
                let idle = {
                    let mut state = self.inner.state.lock();
                    state.stats.active -= 1;
                    if outcome.is_ok() {
                        state.stats.completed += 1;
                    } else {
                        state.stats.failed += 1;
                    }
                    state.is_idle()
                };
                let _ = task.reply.send(outcome);
                if idle {
                    self.inner.drained.notify_waiters();
                }
                self.pump();
            }
        }
    }
}

fn flatten(result: std::thread::Result<crate::Result<()>>) -> Result<(), QueueError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(QueueError::Failed(err)),
        Err(_) => Err(QueueError::Panicked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering as AtomicOrdering};

    fn noop() -> impl Future<Output = crate::Result<()>> + Send {
        async { Ok(()) }
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = TaskQueue::new(TaskQueueConfig::bounded("order", 1));
        queue.pause();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (label, priority) in [("a", 0), ("b", 5), ("c", 0), ("d", 5), ("e", 10)] {
            let order = order.clone();
            let handle = queue
                .add(
                    move || {
                        let order = order.clone();
                        async move {
                            order.lock().push(label);
                            Ok(())
                        }
                    },
                    TaskOptions::default().with_priority(priority),
                )
                .unwrap();
            handles.push(handle);
        }

        queue.resume();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["e", "b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn test_capacity_rejects_immediately() {
        let queue = TaskQueue::new(TaskQueueConfig::bounded("cap", 1).with_max_queue_length(2));
        queue.pause();
        queue.add(noop, TaskOptions::default()).unwrap();
        queue.add(noop, TaskOptions::default()).unwrap();

        let err = queue.add(noop, TaskOptions::default()).err().unwrap();
        assert!(matches!(err, QueueError::CapacityExceeded { max: 2 }));

        queue.resume();
        queue.on_idle().await;
        assert_eq!(queue.stats().completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_rejected() {
        let queue = TaskQueue::new(TaskQueueConfig::bounded("timeout", 2));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let handle = queue
            .add(
                move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                },
                TaskOptions::default()
                    .with_timeout(Duration::from_secs(1))
                    .with_retry(RetryPolicy::new(1, Duration::from_millis(10), 2.0)),
            )
            .unwrap();

        let err = handle.await.unwrap_err();
        assert!(matches!(err, QueueError::Timeout(d) if d == Duration::from_secs(1)));
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_idle_when_already_drained() {
        let queue = TaskQueue::new(TaskQueueConfig::unbounded("idle"));
        queue.on_idle().await;

        queue.add(noop, TaskOptions::default()).unwrap();
        queue.on_idle().await;
        assert_eq!(queue.stats().completed, 1);
        queue.on_idle().await;
    }

    #[tokio::test]
    async fn test_pause_holds_pending_work() {
        let queue = TaskQueue::new(TaskQueueConfig::bounded("pause", 2));
        let ran = Arc::new(AtomicUsize::new(0));
        queue.pause();
        for _ in 0..3 {
            let ran = ran.clone();
            queue
                .add(
                    move || {
                        ran.fetch_add(1, AtomicOrdering::SeqCst);
                        noop()
                    },
                    TaskOptions::default(),
                )
                .unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(queue.len(), 3);

        queue.resume();
        queue.on_idle().await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_without_retry() {
        let queue = TaskQueue::new(TaskQueueConfig::bounded("fail", 1));
        let handle = queue
            .add(
                || async { Err(SettlementError::validation("bad row")) },
                TaskOptions::default(),
            )
            .unwrap();
        match handle.await {
            Err(QueueError::Failed(err)) => assert_eq!(err.user_message(), "bad row"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_skips_retry() {
        let queue = TaskQueue::new(TaskQueueConfig::bounded("staking", 1));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handle = queue
            .add(
                move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    async { Err(SettlementError::not_found("StakingPool", "p-1")) }
                },
                TaskOptions::default()
                    .with_retry(RetryPolicy::fixed(3, Duration::from_secs(5)).transient_only()),
            )
            .unwrap();

        assert!(matches!(handle.await, Err(QueueError::Failed(_))));
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(queue.stats().retries, 0);
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_slot() {
        let queue = TaskQueue::new(TaskQueueConfig::bounded("panic", 1));
        let handle = queue
            .add(
                || async {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                },
                TaskOptions::default(),
            )
            .unwrap();
        assert!(matches!(handle.await, Err(QueueError::Panicked)));

        queue.add(noop, TaskOptions::default()).unwrap().await.unwrap();
        queue.on_idle().await;
        assert_eq!(queue.active_count(), 0);
    }
}
