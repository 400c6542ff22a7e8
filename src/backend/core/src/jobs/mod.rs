//! Recurring job system.
//!
//! - **Job**: trait implemented by every recurring business process
//! - **Registry**: catalog of jobs with live status, history and manual triggering
//! - **Backend**: durable repeating schedules (in-process or Redis)
//! - **Queue**: bounded-concurrency task queue used inside jobs
//! - **Backoff**: the retry policy shared by all of the above
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Recurring Job System                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐  schedule_all  ┌────────────┐   invoke   ┌─────────┐ │
//! │  │ JobRegistry│───────────────▶│  Durable   │───────────▶│   Job   │ │
//! │  │ (status,   │◀───────────────│  Backend   │            │  run()  │ │
//! │  │  history)  │  JobInvoker    └────────────┘            └────┬────┘ │
//! │  └────────────┘                                               │      │
//! │                                                    ┌──────────▼────┐ │
//! │                                                    │   TaskQueue   │ │
//! │                                                    │ (per-row work)│ │
//! │                                                    └───────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod backoff;
pub mod builtin;
pub mod job;
pub mod queue;
pub mod registry;

pub use backend::{DurableBackend, IntervalBackend, JobInvoker, RedisBackend, RepeatSpec};
pub use backoff::{retry_until_cancelled, retry_with_backoff, RetryPolicy, RetryPredicate};
pub use builtin::register_jobs;
pub use job::{ExecutionRecord, Job, JobContext, JobDescriptor, JobStatus, JobTrigger};
pub use queue::{QueueError, TaskHandle, TaskOptions, TaskQueue, TaskQueueConfig, TaskQueueStats};
pub use registry::JobRegistry;
