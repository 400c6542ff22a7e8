//! Job registry: the catalog of recurring jobs and their live run state.
//!
//! The registry is an explicitly constructed handle (cheap to clone) owned
//! by the process bootstrap. It records every run in a bounded history,
//! exposes manual triggering, and registers one repeating schedule per job
//! with a [`DurableBackend`]. After a run finishes, the job shows
//! `completed`/`failed` for `reset_delay` and then drops back to `idle`.
//! That reset is a tokio timer, so tests drive it with a paused clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backend::{DurableBackend, JobInvoker, RepeatSpec};
use super::job::{
    ExecutionRecord, Job, JobContext, JobDescriptor, JobStatus, JobTrigger, MAX_EXECUTION_HISTORY,
};
use crate::error::{ErrorCode, Result, SettlementError};
use crate::notify::BroadcastSink;
use crate::telemetry::SettlementMetrics;

struct RunState {
    status: JobStatus,
    last_run: Option<DateTime<Utc>>,
    last_run_error: Option<String>,
    progress: u8,
    execution_time_ms: Option<u64>,
    success_rate: f64,
    last_executions: VecDeque<ExecutionRecord>,
    next_scheduled_run: Option<DateTime<Utc>>,
    /// Bumped on every state change; a pending idle reset only applies to
    /// the generation it was scheduled for.
    generation: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: JobStatus::Idle,
            last_run: None,
            last_run_error: None,
            progress: 0,
            execution_time_ms: None,
            success_rate: 100.0,
            last_executions: VecDeque::with_capacity(MAX_EXECUTION_HISTORY),
            next_scheduled_run: None,
            generation: 0,
        }
    }
}

struct JobEntry {
    job: Arc<dyn Job>,
    state: RunState,
}

impl JobEntry {
    fn descriptor(&self) -> JobDescriptor {
        let s = &self.state;
        JobDescriptor {
            name: self.job.name().to_string(),
            title: self.job.title().to_string(),
            description: self.job.description().to_string(),
            category: self.job.category().to_string(),
            period_ms: self.job.period().as_millis() as u64,
            status: s.status,
            last_run: s.last_run,
            last_run_error: s.last_run_error.clone(),
            progress: s.progress,
            execution_time_ms: s.execution_time_ms,
            success_rate: s.success_rate,
            last_executions: s.last_executions.iter().cloned().collect(),
            next_scheduled_run: s.next_scheduled_run,
        }
    }
}

struct RegistryInner {
    jobs: RwLock<Vec<JobEntry>>,
    broadcast: Arc<dyn BroadcastSink>,
    reset_delay: Duration,
}

/// Handle to the job catalog. Clones share state.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    pub fn new(broadcast: Arc<dyn BroadcastSink>, reset_delay: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: RwLock::new(Vec::new()),
                broadcast,
                reset_delay,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalog
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a job. Names must be unique.
    pub fn register(&self, job: Arc<dyn Job>) -> Result<()> {
        let mut jobs = self.inner.jobs.write();
        if jobs.iter().any(|e| e.job.name() == job.name()) {
            return Err(SettlementError::new(
                ErrorCode::DuplicateRecord,
                format!("Job already registered: {}", job.name()),
            ));
        }
        tracing::debug!(job = job.name(), period_ms = job.period().as_millis() as u64, "Job registered");
        jobs.push(JobEntry {
            job,
            state: RunState::default(),
        });
        Ok(())
    }

    /// Snapshot of every registered job, in registration order.
    pub fn get_cron_jobs(&self) -> Vec<JobDescriptor> {
        self.inner.jobs.read().iter().map(JobEntry::descriptor).collect()
    }

    pub fn get_job(&self, name: &str) -> Option<JobDescriptor> {
        self.inner
            .jobs
            .read()
            .iter()
            .find(|e| e.job.name() == name)
            .map(JobEntry::descriptor)
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status Updates
    // ─────────────────────────────────────────────────────────────────────────

    /// Record the outcome of a run and schedule the reset to `idle`.
    ///
    /// The reset needs a tokio runtime; outside one the job keeps its
    /// terminal status until the next update.
    pub fn update_job_status(
        &self,
        name: &str,
        last_run: DateTime<Utc>,
        error: Option<&str>,
        execution_time: Option<Duration>,
        next_scheduled_run: Option<DateTime<Utc>>,
    ) {
        let (status, generation) = {
            let mut jobs = self.inner.jobs.write();
            let Some(entry) = jobs.iter_mut().find(|e| e.job.name() == name) else {
                tracing::warn!(job = name, "Status update for unknown job");
                return;
            };
            let state = &mut entry.state;

            let status = if error.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            state.status = status;
            state.progress = if status == JobStatus::Completed { 100 } else { 0 };
            state.last_run = Some(last_run);
            state.last_run_error = error.map(str::to_string);
            if let Some(elapsed) = execution_time {
                state.execution_time_ms = Some(elapsed.as_millis() as u64);
            }
            if next_scheduled_run.is_some() {
                state.next_scheduled_run = next_scheduled_run;
            }

            state.last_executions.push_back(ExecutionRecord {
                timestamp: last_run,
                duration_ms: execution_time.map(|d| d.as_millis() as u64).unwrap_or(0),
                status,
            });
            while state.last_executions.len() > MAX_EXECUTION_HISTORY {
                state.last_executions.pop_front();
            }
            let ok = state
                .last_executions
                .iter()
                .filter(|r| r.status != JobStatus::Failed)
                .count();
            state.success_rate = ok as f64 * 100.0 / state.last_executions.len() as f64;

            state.generation += 1;
            (status, state.generation)
        };

        self.inner.broadcast.status(
            name,
            status.as_str(),
            Some(serde_json::json!({
                "executionTime": execution_time.map(|d| d.as_millis() as u64),
                "error": error,
            })),
        );
        self.schedule_idle_reset(name, generation);
    }

    /// Set status/progress directly. Progress is zeroed on terminal states.
    pub fn update_job_running_status(&self, name: &str, status: JobStatus, progress: Option<u8>) {
        let progress = {
            let mut jobs = self.inner.jobs.write();
            let Some(entry) = jobs.iter_mut().find(|e| e.job.name() == name) else {
                tracing::warn!(job = name, "Running status update for unknown job");
                return;
            };
            let state = &mut entry.state;
            state.status = status;
            if let Some(p) = progress {
                state.progress = p.min(100);
            }
            if status.is_terminal() || status == JobStatus::Idle {
                state.progress = 0;
            }
            state.generation += 1;
            state.progress
        };

        self.inner.broadcast.status(name, status.as_str(), None);
        self.inner.broadcast.progress(name, progress);
    }

    pub fn set_next_run(&self, name: &str, at: DateTime<Utc>) {
        let mut jobs = self.inner.jobs.write();
        if let Some(entry) = jobs.iter_mut().find(|e| e.job.name() == name) {
            entry.state.next_scheduled_run = Some(at);
        }
    }

    fn schedule_idle_reset(&self, name: &str, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.clone();
        let name = name.to_string();
        let delay = self.inner.reset_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            registry.reset_to_idle(&name, generation);
        });
    }

    fn reset_to_idle(&self, name: &str, generation: u64) {
        let reset = {
            let mut jobs = self.inner.jobs.write();
            match jobs.iter_mut().find(|e| e.job.name() == name) {
                Some(entry)
                    if entry.state.generation == generation
                        && entry.state.status != JobStatus::Running =>
                {
                    entry.state.status = JobStatus::Idle;
                    entry.state.progress = 0;
                    true
                }
                _ => false,
            }
        };
        if reset {
            self.inner.broadcast.status(name, JobStatus::Idle.as_str(), None);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a job now. Returns `false` when the job is unknown, already
    /// running, or its handler failed. Handler errors are recorded, never
    /// propagated.
    pub async fn trigger_job(&self, name: &str) -> bool {
        match self.run_job(name, JobTrigger::Manual).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(job = name, error = %err, "Manual trigger did not complete");
                false
            }
        }
    }

    /// Run a job inline and record the outcome.
    pub async fn run_job(&self, name: &str, trigger: JobTrigger) -> Result<()> {
        let job = {
            let mut jobs = self.inner.jobs.write();
            let entry = jobs
                .iter_mut()
                .find(|e| e.job.name() == name)
                .ok_or_else(|| SettlementError::job_not_found(name))?;
            if entry.state.status == JobStatus::Running {
                return Err(SettlementError::new(
                    ErrorCode::JobAlreadyRunning,
                    format!("Job {} is already running", name),
                ));
            }
            entry.state.status = JobStatus::Running;
            entry.state.progress = 0;
            entry.state.generation += 1;
            entry.job.clone()
        };
        self.inner.broadcast.status(name, JobStatus::Running.as_str(), None);

        let job_name = job.name();
        let registry = self.clone();
        let ctx = JobContext::new(job_name, trigger, self.inner.broadcast.clone()).with_progress_hook(
            Arc::new(move |p| registry.update_job_running_status(job_name, JobStatus::Running, Some(p))),
        );

        tracing::info!(job = job_name, trigger = ?trigger, "Job started");
        let started = Utc::now();
        let clock = Instant::now();

        let outcome = match AssertUnwindSafe(job.run(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::internal(format!("job {} panicked", job_name))),
        };

        let elapsed = clock.elapsed();
        let next_run = chrono::Duration::from_std(job.period())
            .ok()
            .map(|period| started + period);

        match &outcome {
            Ok(()) => {
                tracing::info!(job = job_name, duration_ms = elapsed.as_millis() as u64, "Job completed");
                self.update_job_status(job_name, started, None, Some(elapsed), next_run);
            }
            Err(err) => {
                err.log();
                tracing::error!(job = job_name, error = %err, "Job failed");
                let message = err.to_string();
                self.update_job_status(job_name, started, Some(&message), Some(elapsed), next_run);
            }
        }
        SettlementMetrics::record_job_run(job_name, outcome.is_ok(), elapsed.as_secs_f64());
        outcome
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Durable Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Register one repeating schedule per job. Safe to call on every
    /// start: schedules are keyed by job name.
    pub async fn schedule_all(&self, backend: &dyn DurableBackend) -> Result<usize> {
        let now = Utc::now();
        let specs: Vec<(String, RepeatSpec)> = self
            .inner
            .jobs
            .read()
            .iter()
            .map(|e| (e.job.name().to_string(), RepeatSpec::for_job(e.job.name(), e.job.period(), now)))
            .collect();

        for (name, spec) in &specs {
            backend.register_repeating(spec.clone()).await?;
            self.set_next_run(name, spec.first_fire());
        }
        tracing::info!(count = specs.len(), "Repeating schedules registered");
        Ok(specs.len())
    }
}

#[async_trait]
impl JobInvoker for JobRegistry {
    async fn invoke(&self, job_id: &str) -> Result<()> {
        let name = RepeatSpec::job_name(job_id);
        match self.run_job(name, JobTrigger::Scheduled).await {
            Err(err) if err.code() == ErrorCode::JobAlreadyRunning => {
                tracing::info!(job = name, "Skipping scheduled run, previous run still active");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelBroadcaster;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    struct CountingJob {
        runs: AtomicU32,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn title(&self) -> &'static str {
            "Counting job"
        }

        fn period(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&self, ctx: &JobContext) -> Result<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.report_progress(1, 2);
            if self.fail_on == Some(n) || self.fail_on == Some(0) {
                return Err(SettlementError::validation("scripted failure"));
            }
            Ok(())
        }
    }

    struct BlockingJob {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Job for BlockingJob {
        fn name(&self) -> &'static str {
            "blocking"
        }

        fn title(&self) -> &'static str {
            "Blocking job"
        }

        fn period(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&self, _ctx: &JobContext) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(ChannelBroadcaster::default()), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_records_and_resets_to_idle() {
        let registry = registry();
        registry
            .register(Arc::new(CountingJob { runs: AtomicU32::new(0), fail_on: None }))
            .unwrap();

        assert!(registry.trigger_job("counting").await);
        let job = registry.get_job("counting").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_executions.len(), 1);
        assert_eq!(job.success_rate, 100.0);
        assert!(job.next_scheduled_run.is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let job = registry.get_job("counting").unwrap();
        assert_eq!(job.status, JobStatus::Idle);
        assert_eq!(job.progress, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected() {
        assert!(!registry().trigger_job("missing").await);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_propagated() {
        let registry = registry();
        registry
            .register(Arc::new(CountingJob { runs: AtomicU32::new(0), fail_on: Some(0) }))
            .unwrap();

        assert!(!registry.trigger_job("counting").await);
        let job = registry.get_job("counting").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_run_error.unwrap().contains("scripted failure"));
        assert_eq!(job.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_rate_recomputed() {
        let registry = registry();
        registry
            .register(Arc::new(CountingJob { runs: AtomicU32::new(0), fail_on: Some(3) }))
            .unwrap();

        for _ in 0..12 {
            registry.trigger_job("counting").await;
        }
        let job = registry.get_job("counting").unwrap();
        assert_eq!(job.last_executions.len(), MAX_EXECUTION_HISTORY);
        // Run 3 failed and has since been pushed out of the window.
        assert_eq!(job.success_rate, 100.0);

        registry.update_job_status("counting", Utc::now(), Some("late"), None, None);
        let job = registry.get_job("counting").unwrap();
        assert_eq!(job.success_rate, 90.0);
    }

    #[tokio::test]
    async fn test_running_job_cannot_be_triggered_twice() {
        let registry = registry();
        let release = Arc::new(Notify::new());
        registry
            .register(Arc::new(BlockingJob { release: release.clone() }))
            .unwrap();

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.trigger_job("blocking").await })
        };
        while registry.get_job("blocking").unwrap().status != JobStatus::Running {
            tokio::task::yield_now().await;
        }

        assert!(!registry.trigger_job("blocking").await);
        // Scheduled invocations skip quietly instead of failing.
        assert!(registry.invoke("repeat:blocking").await.is_ok());

        release.notify_one();
        assert!(first.await.unwrap());
    }

    #[tokio::test]
    async fn test_running_status_zeroes_progress_on_terminal() {
        let registry = registry();
        registry
            .register(Arc::new(CountingJob { runs: AtomicU32::new(0), fail_on: None }))
            .unwrap();

        registry.update_job_running_status("counting", JobStatus::Running, Some(40));
        assert_eq!(registry.get_job("counting").unwrap().progress, 40);
        registry.update_job_running_status("counting", JobStatus::Failed, Some(40));
        assert_eq!(registry.get_job("counting").unwrap().progress, 0);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let registry = registry();
        let job = Arc::new(CountingJob { runs: AtomicU32::new(0), fail_on: None });
        registry.register(job.clone()).unwrap();
        let err = registry.register(job).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
    }
}
