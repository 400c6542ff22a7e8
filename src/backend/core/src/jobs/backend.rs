//! Durable scheduling backends.
//!
//! A backend owns the repeating schedules and calls back into a
//! [`JobInvoker`] when one fires. Two implementations:
//!
//! - [`IntervalBackend`]: in-process timers, one worker per schedule
//! - [`RedisBackend`]: schedules kept in Redis so they survive restarts and
//!   fire on exactly one of several processes sharing the same prefix

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::backoff::{retry_until_cancelled, RetryPolicy};
use crate::error::{ErrorCode, Result, SettlementError};

const REPEAT_PREFIX: &str = "repeat:";

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Spec
// ═══════════════════════════════════════════════════════════════════════════════

/// A repeating schedule registered with a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    /// `repeat:<job name>`; re-registering the same id replaces the schedule.
    pub job_id: String,
    #[serde(with = "humantime_serde")]
    pub every: Duration,
    /// First fire is `start_date + every`.
    pub start_date: DateTime<Utc>,
    pub backoff: RetryPolicySpec,
}

/// Serializable mirror of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicySpec {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub factor: f64,
    #[serde(default, with = "humantime_serde")]
    pub max_delay: Option<Duration>,
}

impl From<&RetryPolicy> for RetryPolicySpec {
    fn from(p: &RetryPolicy) -> Self {
        Self {
            max_retries: p.max_retries,
            initial_delay: p.initial_delay,
            factor: p.factor,
            max_delay: p.max_delay,
        }
    }
}

impl From<&RetryPolicySpec> for RetryPolicy {
    fn from(s: &RetryPolicySpec) -> Self {
        Self {
            max_retries: s.max_retries,
            initial_delay: s.initial_delay,
            factor: s.factor,
            max_delay: s.max_delay,
            retry_if: None,
        }
    }
}

impl RepeatSpec {
    /// Schedule for a job with the given period. The start date is one
    /// period in the past so the first run fires immediately; failed runs
    /// retry three times starting at half a period, never waiting longer
    /// than the period itself.
    pub fn for_job(name: &str, every: Duration, now: DateTime<Utc>) -> Self {
        let start_date = chrono::Duration::from_std(every)
            .map(|d| now - d)
            .unwrap_or(now);
        let backoff = RetryPolicy::new(3, every / 2, 2.0).with_max_delay(every);
        Self {
            job_id: format!("{}{}", REPEAT_PREFIX, name),
            every,
            start_date,
            backoff: RetryPolicySpec::from(&backoff),
        }
    }

    /// Strip the `repeat:` prefix from a schedule id.
    pub fn job_name(job_id: &str) -> &str {
        job_id.strip_prefix(REPEAT_PREFIX).unwrap_or(job_id)
    }

    pub fn first_fire(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.every)
            .map(|d| self.start_date + d)
            .unwrap_or(self.start_date)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.backoff)
    }

    fn validate(&self) -> Result<()> {
        if self.every.is_zero() {
            return Err(SettlementError::validation(format!(
                "Schedule {} has a zero period",
                self.job_id
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Called by a backend when a schedule fires.
#[async_trait]
pub trait JobInvoker: Send + Sync {
    async fn invoke(&self, job_id: &str) -> Result<()>;
}

#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Register or replace a repeating schedule keyed by `spec.job_id`.
    async fn register_repeating(&self, spec: RepeatSpec) -> Result<()>;

    /// Remove a schedule. Returns whether it existed.
    async fn remove(&self, job_id: &str) -> Result<bool>;

    async fn registered(&self) -> Result<Vec<RepeatSpec>>;

    /// Fire schedules until `shutdown` is cancelled.
    async fn run(&self, invoker: Arc<dyn JobInvoker>, shutdown: CancellationToken) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Interval Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Running {
    invoker: Arc<dyn JobInvoker>,
    shutdown: CancellationToken,
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-process backend. Schedules live as long as the process.
#[derive(Default)]
pub struct IntervalBackend {
    schedules: DashMap<String, RepeatSpec>,
    workers: DashMap<String, Worker>,
    running: Mutex<Option<Running>>,
}

impl IntervalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_worker(&self, spec: RepeatSpec, running: Running) {
        let token = running.shutdown.child_token();
        let job_id = spec.job_id.clone();
        let handle = tokio::spawn(interval_worker(spec, running.invoker, token.clone()));
        if let Some(old) = self.workers.insert(job_id, Worker { token, handle }) {
            old.token.cancel();
        }
    }
}

async fn interval_worker(spec: RepeatSpec, invoker: Arc<dyn JobInvoker>, token: CancellationToken) {
    let wait = (spec.first_fire() - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + wait, spec.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let policy = spec.retry_policy();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // An in-flight run is allowed to finish after cancellation; pending
        // backoff waits are not.
        let result = retry_until_cancelled(&policy, &spec.job_id, &token, |_| invoker.invoke(&spec.job_id)).await;
        if let Err(err) = result {
            tracing::error!(job_id = %spec.job_id, error = %err, "Scheduled run failed after retries");
        }
    }
    tracing::debug!(job_id = %spec.job_id, "Schedule worker stopped");
}

#[async_trait]
impl DurableBackend for IntervalBackend {
    async fn register_repeating(&self, spec: RepeatSpec) -> Result<()> {
        spec.validate()?;
        if let Some(existing) = self.schedules.get(&spec.job_id) {
            if existing.every == spec.every && existing.backoff == spec.backoff {
                return Ok(());
            }
        }
        self.schedules.insert(spec.job_id.clone(), spec.clone());

        let running = self.running.lock().clone();
        if let Some(running) = running {
            self.spawn_worker(spec, running);
        }
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        if let Some((_, worker)) = self.workers.remove(job_id) {
            worker.token.cancel();
        }
        Ok(self.schedules.remove(job_id).is_some())
    }

    async fn registered(&self) -> Result<Vec<RepeatSpec>> {
        Ok(self.schedules.iter().map(|e| e.value().clone()).collect())
    }

    async fn run(&self, invoker: Arc<dyn JobInvoker>, shutdown: CancellationToken) -> Result<()> {
        let running = Running { invoker, shutdown: shutdown.clone() };
        *self.running.lock() = Some(running.clone());

        let specs: Vec<RepeatSpec> = self.schedules.iter().map(|e| e.value().clone()).collect();
        tracing::info!(schedules = specs.len(), "Interval backend started");
        for spec in specs {
            self.spawn_worker(spec, running.clone());
        }

        shutdown.cancelled().await;
        self.running.lock().take();

        let ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<JoinHandle<()>> = ids
            .iter()
            .filter_map(|id| self.workers.remove(id))
            .map(|(_, worker)| worker.handle)
            .collect();
        futures::future::join_all(handles).await;
        tracing::info!("Interval backend stopped");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Atomically claim every schedule due at `ARGV[1]` (epoch ms). Each
/// claimed member is pushed forward by its period, which acts as a lease:
/// if the process dies mid-run the schedule fires again one period later.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local claimed = {}
for _, id in ipairs(due) do
  local raw = redis.call('HGET', KEYS[2], id)
  if raw then
    local spec = cjson.decode(raw)
    redis.call('ZADD', KEYS[1], tonumber(ARGV[1]) + tonumber(spec['every_ms']), id)
    table.insert(claimed, id)
  else
    redis.call('ZREM', KEYS[1], id)
  end
end
return claimed
"#;

const CLAIM_BATCH: usize = 32;

/// What is stored per schedule in the `schedules` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSpec {
    every_ms: u64,
    spec: RepeatSpec,
}

/// Redis-backed durable schedules.
///
/// Keys, under the configured prefix:
/// - `{prefix}:schedules` HASH job_id → spec JSON
/// - `{prefix}:due` ZSET job_id → next fire time (epoch ms)
/// - `{prefix}:attempts` HASH job_id → consecutive failed attempts
///
/// Delivery is at-least-once; handlers are idempotent.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
    poll_interval: Duration,
    claim: Arc<redis::Script>,
}

impl RedisBackend {
    pub async fn connect(url: &str, prefix: &str, poll_interval: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            SettlementError::with_internal(
                ErrorCode::QueueConnectionFailed,
                "Failed to connect to the schedule store",
                e.to_string(),
            )
        })?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(prefix, "Redis schedule backend connected");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            poll_interval,
            claim: Arc::new(redis::Script::new(CLAIM_SCRIPT)),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    async fn load_spec(&self, job_id: &str) -> Result<Option<RepeatSpec>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key("schedules"))
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str::<StoredSpec>(&raw)?.spec)),
            None => Ok(None),
        }
    }

    async fn claim_due(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = self
            .claim
            .key(self.key("due"))
            .key(self.key("schedules"))
            .arg(Utc::now().timestamp_millis())
            .arg(CLAIM_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed)
    }

    async fn fire(&self, job_id: String, invoker: Arc<dyn JobInvoker>) -> Result<()> {
        let Some(spec) = self.load_spec(&job_id).await? else {
            return Ok(());
        };
        let result = invoker.invoke(&job_id).await;
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let every_ms = spec.every.as_millis() as i64;

        match result {
            Ok(()) => {
                redis::pipe()
                    .cmd("HDEL")
                    .arg(self.key("attempts"))
                    .arg(&job_id)
                    .ignore()
                    .cmd("ZADD")
                    .arg(self.key("due"))
                    .arg("XX")
                    .arg(now_ms + every_ms)
                    .arg(&job_id)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            Err(err) => {
                let attempts: u32 = redis::cmd("HINCRBY")
                    .arg(self.key("attempts"))
                    .arg(&job_id)
                    .arg(1)
                    .query_async(&mut conn)
                    .await?;
                let policy = spec.retry_policy();
                let next_ms = if policy.should_retry(attempts - 1) {
                    let delay = policy.delay_for_retry(attempts);
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Scheduled run failed, retrying"
                    );
                    now_ms + delay.as_millis() as i64
                } else {
                    tracing::error!(job_id = %job_id, error = %err, "Scheduled run failed after retries");
                    redis::cmd("HDEL")
                        .arg(self.key("attempts"))
                        .arg(&job_id)
                        .query_async::<_, ()>(&mut conn)
                        .await?;
                    now_ms + every_ms
                };
                redis::cmd("ZADD")
                    .arg(self.key("due"))
                    .arg("XX")
                    .arg(next_ms)
                    .arg(&job_id)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DurableBackend for RedisBackend {
    async fn register_repeating(&self, spec: RepeatSpec) -> Result<()> {
        spec.validate()?;
        let stored = StoredSpec {
            every_ms: spec.every.as_millis() as u64,
            spec: spec.clone(),
        };
        let payload = serde_json::to_string(&stored)?;
        let mut conn = self.conn.clone();
        // NX keeps the existing fire time when the process restarts.
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.key("schedules"))
            .arg(&spec.job_id)
            .arg(payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.key("due"))
            .arg("NX")
            .arg(spec.first_fire().timestamp_millis())
            .arg(&spec.job_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::debug!(job_id = %spec.job_id, every_ms = stored.every_ms, "Schedule registered");
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (removed, _, _): (u32, u32, u32) = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.key("schedules"))
            .arg(job_id)
            .cmd("ZREM")
            .arg(self.key("due"))
            .arg(job_id)
            .cmd("HDEL")
            .arg(self.key("attempts"))
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn registered(&self) -> Result<Vec<RepeatSpec>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.key("schedules"))
            .query_async(&mut conn)
            .await?;
        raw.iter()
            .map(|r| Ok(serde_json::from_str::<StoredSpec>(r)?.spec))
            .collect()
    }

    async fn run(&self, invoker: Arc<dyn JobInvoker>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        tracing::info!(prefix = %self.prefix, "Redis schedule backend started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            in_flight.retain(|h| !h.is_finished());

            let claimed = match self.claim_due().await {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to poll due schedules");
                    continue;
                }
            };
            for job_id in claimed {
                let backend = self.clone();
                let invoker = invoker.clone();
                in_flight.push(tokio::spawn(async move {
                    if let Err(err) = backend.fire(job_id.clone(), invoker).await {
                        tracing::error!(job_id = %job_id, error = %err, "Failed to record schedule outcome");
                    }
                }));
            }
        }

        futures::future::join_all(in_flight).await;
        tracing::info!("Redis schedule backend stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingInvoker {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl JobInvoker for CountingInvoker {
        async fn invoke(&self, _job_id: &str) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(SettlementError::validation("not yet"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_spec_for_job() {
        let now = Utc::now();
        let spec = RepeatSpec::for_job("processPnl", Duration::from_secs(3600), now);
        assert_eq!(spec.job_id, "repeat:processPnl");
        assert_eq!(RepeatSpec::job_name(&spec.job_id), "processPnl");
        assert_eq!(spec.first_fire(), now);

        let policy = spec.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1800));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let backend = IntervalBackend::new();
        let spec = RepeatSpec::for_job("x", Duration::ZERO, Utc::now());
        assert!(backend.register_repeating(spec).await.is_err());
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let backend = IntervalBackend::new();
        for _ in 0..3 {
            backend
                .register_repeating(RepeatSpec::for_job("a", Duration::from_secs(60), Utc::now()))
                .await
                .unwrap();
        }
        assert_eq!(backend.registered().await.unwrap().len(), 1);
        assert!(backend.remove("repeat:a").await.unwrap());
        assert!(!backend.remove("repeat:a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fires_immediately_then_every_period() {
        let backend = Arc::new(IntervalBackend::new());
        backend
            .register_repeating(RepeatSpec::for_job("a", Duration::from_secs(60), Utc::now()))
            .await
            .unwrap();

        let invoker = Arc::new(CountingInvoker::default());
        let shutdown = CancellationToken::new();
        let run = {
            let backend = backend.clone();
            let invoker: Arc<dyn JobInvoker> = invoker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { backend.run(invoker, shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_retries_failed_runs() {
        let backend = Arc::new(IntervalBackend::new());
        backend
            .register_repeating(RepeatSpec::for_job("a", Duration::from_secs(60), Utc::now()))
            .await
            .unwrap();

        let invoker = Arc::new(CountingInvoker { calls: AtomicU32::new(0), fail_first: 2 });
        let shutdown = CancellationToken::new();
        let run = {
            let backend = backend.clone();
            let invoker: Arc<dyn JobInvoker> = invoker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { backend.run(invoker, shutdown).await })
        };

        // Retries after 30s then 60s (capped at one period).
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_is_prompt() {
        let backend = Arc::new(IntervalBackend::new());
        backend
            .register_repeating(RepeatSpec::for_job("fetchFiatCurrencyPrices", Duration::from_secs(12 * 3600), Utc::now()))
            .await
            .unwrap();

        let invoker = Arc::new(CountingInvoker { calls: AtomicU32::new(0), fail_first: u32::MAX });
        let shutdown = CancellationToken::new();
        let run = {
            let backend = backend.clone();
            let invoker: Arc<dyn JobInvoker> = invoker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { backend.run(invoker, shutdown).await })
        };

        // First run fails and the worker starts a six hour backoff.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

        let cancelled_at = tokio::time::Instant::now();
        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }
}
