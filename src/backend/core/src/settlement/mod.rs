//! Settlement jobs: the recurring business processes the scheduler runs.
//!
//! Every job follows the same shape. It reads a batch of candidate rows,
//! settles each row in its own store transaction, and only after commit
//! touches the side channels (email, notifications, rewards). A failing
//! row is logged and counted; it never aborts the rest of the batch. An
//! `Err` out of a job function means the batch could not be read at all.

pub mod blocks;
pub mod campaigns;
pub mod ico;
pub mod investment;
pub mod pnl;
pub mod rates;
pub mod reconciliation;
pub mod staking;

pub use blocks::process_expired_user_blocks;
pub use campaigns::process_mail_campaigns;
pub use ico::process_ico_phases;
pub use investment::{process_investments, settle_investment};
pub use pnl::{cleanup_pnl, process_pnl};
pub use rates::{fetch_fiat_currency_prices, RateFetcher};
pub use reconciliation::{process_pending_deposits, process_pending_withdrawals};
pub use staking::{calculate_reward, process_staking_positions};

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::ledger::LedgerStore;
use crate::notify::Notifier;
use crate::rewards::RewardEngine;
use crate::settings::Settings;

/// Everything a settlement job needs. Cheap to clone.
#[derive(Clone)]
pub struct SettlementContext {
    pub store: Arc<dyn LedgerStore>,
    pub settings: Settings,
    pub notifier: Notifier,
    pub rewards: RewardEngine,
    pub capabilities: Arc<Capabilities>,
    pub config: Arc<Config>,
}

impl SettlementContext {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settings: Settings,
        notifier: Notifier,
        capabilities: Arc<Capabilities>,
        config: Arc<Config>,
    ) -> Self {
        let rewards = RewardEngine::new(store.clone(), settings.clone(), notifier.clone(), capabilities.clone());
        Self {
            store,
            settings,
            notifier,
            rewards,
            capabilities,
            config,
        }
    }
}

/// Outcome counts of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Rows moved to a new state.
    pub settled: usize,
    /// Rows left alone: already handled, locked elsewhere, or unchanged.
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.settled + self.skipped + self.failed
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} settled, {} skipped, {} failed",
            self.settled, self.skipped, self.failed
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for the job tests.

    use super::*;
    use crate::capabilities::Capability;
    use crate::jobs::{JobContext, JobTrigger};
    use crate::ledger::InMemoryStore;
    use crate::notify::{ChannelBroadcaster, InMemoryOutbox};
    use crate::settings::InMemorySettings;

    pub(crate) struct Fixture {
        pub store: InMemoryStore,
        pub settings: Arc<InMemorySettings>,
        pub outbox: Arc<InMemoryOutbox>,
        pub ctx: SettlementContext,
    }

    pub(crate) fn fixture(capabilities: Capabilities, config: Config) -> Fixture {
        let store = InMemoryStore::new();
        let settings = Arc::new(InMemorySettings::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let notifier = Notifier::in_memory(outbox.clone(), Arc::new(ChannelBroadcaster::default()));
        let ctx = SettlementContext::new(
            Arc::new(store.clone()),
            Settings::new(settings.clone()),
            notifier,
            Arc::new(capabilities),
            Arc::new(config),
        );
        Fixture {
            store,
            settings,
            outbox,
            ctx,
        }
    }

    pub(crate) fn default_fixture() -> Fixture {
        fixture(Capabilities::new([Capability::Mlm]), Config::default())
    }

    pub(crate) fn job_context(name: &'static str, trigger: JobTrigger) -> JobContext {
        JobContext::new(name, trigger, Arc::new(ChannelBroadcaster::default()))
    }
}
