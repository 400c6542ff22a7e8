#![allow(clippy::result_large_err)]
//! # Settlement Core
//!
//! Cron orchestration and recurring financial settlement engine.
//!
//! ## Architecture
//!
//! - **Jobs**: registry of recurring jobs, durable repeating schedules and a bounded task queue
//! - **Settlement**: investment maturity, staking payouts, exchange reconciliation, PnL, ICO phases
//! - **Rewards**: referral reward engine for DIRECT, BINARY and UNILEVEL programs
//! - **Ledger**: wallet, transaction and referral persistence behind a transactional store
//! - **Notify**: user notifications, queued email and the job-status broadcast channel
//! - **Telemetry**: structured logging, tracing and metrics

pub mod capabilities;
pub mod config;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod notify;
pub mod rewards;
pub mod settings;
pub mod settlement;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, Result, SettlementError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::capabilities::{Capabilities, Capability, ExchangeGateway, TickerSource};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, Result, SettlementError};
    pub use crate::jobs::{
        register_jobs, DurableBackend, IntervalBackend, Job, JobContext, JobDescriptor, JobRegistry,
        JobStatus, JobTrigger, RedisBackend, RetryPolicy, TaskOptions, TaskQueue, TaskQueueConfig,
    };
    pub use crate::ledger::{InMemoryStore, IsolationLevel, LedgerStore, LedgerTx, PgStore};
    pub use crate::notify::{ChannelBroadcaster, InMemoryOutbox, Notifier};
    pub use crate::rewards::{RewardEngine, RewardEvent};
    pub use crate::settings::{InMemorySettings, Settings};
    pub use crate::settlement::{SettlementContext, SweepReport};
}
