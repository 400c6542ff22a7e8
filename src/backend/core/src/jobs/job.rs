//! Job definitions and traits.
//!
//! - **Job trait**: the interface every recurring business process implements
//! - **JobStatus**: run state shown on the admin dashboard
//! - **JobDescriptor**: a snapshot of a job's identity and run history
//! - **JobContext**: handed to a job for the duration of one run

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::notify::{BroadcastSink, LogLevel};

/// Maximum entries kept in a job's execution ring buffer.
pub const MAX_EXECUTION_HISTORY: usize = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Run History
// ═══════════════════════════════════════════════════════════════════════════════

/// One entry of the execution ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: JobStatus,
}

/// Dashboard view of a registered job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub name: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub period_ms: u64,
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_error: Option<String>,
    pub progress: u8,
    pub execution_time_ms: Option<u64>,
    /// Percentage of non-failed runs in `last_executions`.
    pub success_rate: f64,
    pub last_executions: Vec<ExecutionRecord>,
    pub next_scheduled_run: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTrigger {
    /// Fired by the durable backend on the job's period.
    Scheduled,
    /// Started from the dashboard or CLI.
    Manual,
}

type ProgressHook = Arc<dyn Fn(u8) + Send + Sync>;

/// Context passed to a job for one run.
#[derive(Clone)]
pub struct JobContext {
    job: &'static str,
    trigger: JobTrigger,
    broadcast: Arc<dyn BroadcastSink>,
    on_progress: Option<ProgressHook>,
}

impl JobContext {
    pub fn new(job: &'static str, trigger: JobTrigger, broadcast: Arc<dyn BroadcastSink>) -> Self {
        Self {
            job,
            trigger,
            broadcast,
            on_progress: None,
        }
    }

    pub(crate) fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.on_progress = Some(hook);
        self
    }

    pub fn job_name(&self) -> &'static str {
        self.job
    }

    pub fn trigger(&self) -> JobTrigger {
        self.trigger
    }

    pub fn is_manual(&self) -> bool {
        self.trigger == JobTrigger::Manual
    }

    /// Report progress as `done` out of `total`.
    pub fn report_progress(&self, done: usize, total: usize) {
        let percent = if total == 0 {
            100
        } else {
            ((done.min(total) * 100) / total) as u8
        };
        if let Some(hook) = &self.on_progress {
            hook(percent);
        }
        self.broadcast.progress(self.job, percent);
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(job = self.job, "{}", message);
        self.broadcast.log(self.job, message, LogLevel::Info);
    }

    pub fn log_success(&self, message: &str) {
        tracing::info!(job = self.job, "{}", message);
        self.broadcast.log(self.job, message, LogLevel::Success);
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(job = self.job, "{}", message);
        self.broadcast.log(self.job, message, LogLevel::Warning);
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(job = self.job, "{}", message);
        self.broadcast.log(self.job, message, LogLevel::Error);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A recurring business process.
///
/// Implementations catch and log per-row failures themselves; an `Err`
/// returned from [`Job::run`] means the run as a whole failed and is
/// recorded against the job.
#[async_trait]
pub trait Job: Send + Sync {
    /// Unique, stable name (also the durable schedule key).
    fn name(&self) -> &'static str;

    fn title(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Dashboard grouping tag.
    fn category(&self) -> &'static str {
        "normal"
    }

    /// Interval between scheduled runs.
    fn period(&self) -> Duration;

    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{BroadcastEvent, ChannelBroadcaster};
    use std::sync::atomic::{AtomicU8, Ordering};

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[tokio::test]
    async fn test_progress_reaches_hook_and_broadcast() {
        let broadcaster = Arc::new(ChannelBroadcaster::new(8));
        let mut rx = broadcaster.subscribe();
        let seen = Arc::new(AtomicU8::new(0));
        let hook_seen = seen.clone();

        let ctx = JobContext::new("processPnl", JobTrigger::Manual, broadcaster)
            .with_progress_hook(Arc::new(move |p| hook_seen.store(p, Ordering::SeqCst)));

        ctx.report_progress(1, 4);
        assert_eq!(seen.load(Ordering::SeqCst), 25);
        assert!(matches!(rx.recv().await.unwrap(), BroadcastEvent::Progress { percent: 25, .. }));

        ctx.report_progress(0, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 100);
        assert!(ctx.is_manual());
    }
}
