//! Scheduling, task queue and retry behaviour.
//!
//! Tests cover:
//! - The task queue never exceeds its concurrency limit
//! - Exponential backoff timing between attempts
//! - Catalog jobs fired by the interval backend through the registry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use settlement_core::capabilities::Capabilities;
use settlement_core::config::Config;
use settlement_core::jobs::{
    register_jobs, retry_with_backoff, DurableBackend, IntervalBackend, JobInvoker, JobRegistry, JobStatus,
    RetryPolicy, TaskOptions, TaskQueue, TaskQueueConfig,
};
use settlement_core::ledger::{InMemoryStore, User, UserBlock, UserStatus};
use settlement_core::notify::{ChannelBroadcaster, InMemoryOutbox, Notifier};
use settlement_core::settings::{InMemorySettings, Settings};
use settlement_core::settlement::SettlementContext;
use settlement_core::SettlementError;

// ============================================================================
// Task Queue
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_queue_never_exceeds_concurrency() {
    let queue = TaskQueue::new(TaskQueueConfig::bounded("staking", 5));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..23u64)
        .map(|n| {
            let active = active.clone();
            let peak = peak.clone();
            queue
                .add(
                    move || {
                        let active = active.clone();
                        let peak = peak.clone();
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50 + n * 7)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                    TaskOptions::default(),
                )
                .unwrap()
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 5);
    assert_eq!(queue.stats().peak_active, 5);
    assert_eq!(queue.stats().completed, 23);
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Backoff
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_waits_one_two_four_seconds() {
    let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0);
    let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let result: Result<(), SettlementError> = retry_with_backoff(&policy, "flaky_gateway", |_| {
        let attempts = attempts.clone();
        async move {
            attempts.lock().push(Instant::now());
            Err(SettlementError::external("gateway", "timeout"))
        }
    })
    .await;
    assert!(result.is_err());

    let attempts = attempts.lock().clone();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_secs(1));
    assert!(gaps[1] >= Duration::from_secs(2));
    assert!(gaps[2] >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_queue_retries_failing_task_then_succeeds() {
    let queue = TaskQueue::new(TaskQueueConfig::bounded("forex", 1));
    let calls = Arc::new(AtomicUsize::new(0));
    let task_calls = calls.clone();

    let handle = queue
        .add(
            move || {
                let calls = task_calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(SettlementError::external("broker", "connection reset"));
                    }
                    Ok(())
                }
            },
            TaskOptions::default().with_retry(RetryPolicy::new(3, Duration::from_secs(1), 2.0)),
        )
        .unwrap();

    handle.await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(queue.stats().retries, 2);
}

// ============================================================================
// Registry + Backend
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_interval_backend_runs_catalog_job() {
    let store = InMemoryStore::new();
    let mut user = User::new("blocked@example.com", "Temp", "Block");
    user.status = UserStatus::Suspended;
    let user_id = user.id;
    store
        .seed(|s| {
            let block = UserBlock {
                id: uuid::Uuid::new_v4(),
                user_id,
                reason: "too many login attempts".into(),
                is_temporary: true,
                blocked_until: Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
                is_active: true,
            };
            s.blocks.insert(block.id, block);
            s.users.insert(user.id, user);
        })
        .await;

    let broadcast = Arc::new(ChannelBroadcaster::default());
    let ctx = SettlementContext::new(
        Arc::new(store.clone()),
        Settings::new(Arc::new(InMemorySettings::new())),
        Notifier::in_memory(Arc::new(InMemoryOutbox::new()), broadcast.clone()),
        Arc::new(Capabilities::default()),
        Arc::new(Config::default()),
    );
    let registry = JobRegistry::new(broadcast, Duration::from_secs(5));
    register_jobs(&registry, ctx).unwrap();

    let backend = Arc::new(IntervalBackend::new());
    assert_eq!(registry.schedule_all(backend.as_ref()).await.unwrap(), 5);

    let shutdown = CancellationToken::new();
    let run = {
        let backend = backend.clone();
        let invoker: Arc<dyn JobInvoker> = Arc::new(registry.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move { backend.run(invoker, shutdown).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let job = registry.get_job("processExpiredUserBlocks").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.next_scheduled_run.is_some());
    assert_eq!(store.snapshot().await.users[&user_id].status, UserStatus::Active);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}
