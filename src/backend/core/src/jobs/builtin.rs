//! Built-in settlement jobs.
//!
//! Every recurring business process is a [`CatalogEntry`] in [`CATALOG`]. Addon
//! jobs carry the capability they need and are only registered when it is
//! installed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{Job, JobContext, JobRegistry};
use crate::capabilities::Capability;
use crate::error::Result;
use crate::ledger::InvestmentKind;
use crate::settlement::{self, SettlementContext, SweepReport};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Which settlement routine a catalog entry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    Investments(InvestmentKind),
    StakingPositions,
    Withdrawals,
    Deposits,
    Pnl,
    CleanupPnl,
    IcoPhases,
    UserBlocks,
    FiatRates,
    MailCampaigns,
}

/// Static description of one job.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub period: Duration,
    /// Capability that must be installed for the job to exist.
    pub requires: Option<Capability>,
    sweep: Sweep,
}

pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "processPendingInvestments",
        title: "Process Pending Investments",
        description: "Settles matured general investments into user wallets.",
        category: "normal",
        period: HOUR,
        requires: None,
        sweep: Sweep::Investments(InvestmentKind::General),
    },
    CatalogEntry {
        name: "processForexInvestments",
        title: "Process Forex Investments",
        description: "Settles matured forex investments, cancelling rows that keep failing.",
        category: "forex",
        period: HOUR,
        requires: Some(Capability::Forex),
        sweep: Sweep::Investments(InvestmentKind::Forex),
    },
    CatalogEntry {
        name: "processAiInvestments",
        title: "Process AI Investments",
        description: "Settles matured AI investments.",
        category: "ai",
        period: HOUR,
        requires: Some(Capability::AiInvestment),
        sweep: Sweep::Investments(InvestmentKind::Ai),
    },
    CatalogEntry {
        name: "processStakingPositions",
        title: "Process Staking Positions",
        description: "Distributes earnings for staking positions past their end date.",
        category: "staking",
        period: HOUR,
        requires: Some(Capability::Staking),
        sweep: Sweep::StakingPositions,
    },
    CatalogEntry {
        name: "processPendingWithdrawals",
        title: "Process Pending Withdrawals",
        description: "Reconciles pending withdrawals with the exchange, refunding failures.",
        category: "exchange",
        period: HOUR,
        requires: Some(Capability::Exchange),
        sweep: Sweep::Withdrawals,
    },
    CatalogEntry {
        name: "processPendingDeposits",
        title: "Process Pending Deposits",
        description: "Reconciles pending deposits with the exchange, crediting completed ones.",
        category: "exchange",
        period: HOUR,
        requires: Some(Capability::Exchange),
        sweep: Sweep::Deposits,
    },
    CatalogEntry {
        name: "processPnl",
        title: "Process PnL",
        description: "Records today's balance snapshot for every active user.",
        category: "normal",
        period: DAY,
        requires: None,
        sweep: Sweep::Pnl,
    },
    CatalogEntry {
        name: "cleanupPnl",
        title: "Cleanup PnL",
        description: "Deletes PnL snapshots past retention.",
        category: "normal",
        period: DAY,
        requires: None,
        sweep: Sweep::CleanupPnl,
    },
    CatalogEntry {
        name: "processIcoPhases",
        title: "Process ICO Phases",
        description: "Starts and closes token offerings on their dates.",
        category: "ico",
        period: HOUR,
        requires: Some(Capability::Ico),
        sweep: Sweep::IcoPhases,
    },
    CatalogEntry {
        name: "processExpiredUserBlocks",
        title: "Process Expired User Blocks",
        description: "Lifts expired temporary blocks and reactivates users.",
        category: "normal",
        period: Duration::from_secs(15 * 60),
        requires: None,
        sweep: Sweep::UserBlocks,
    },
    CatalogEntry {
        name: "fetchFiatCurrencyPrices",
        title: "Fetch Fiat Currency Prices",
        description: "Refreshes fiat exchange rates from the configured providers.",
        category: "normal",
        period: Duration::from_secs(12 * 60 * 60),
        requires: None,
        sweep: Sweep::FiatRates,
    },
    CatalogEntry {
        name: "processMailwizardCampaigns",
        title: "Process Mail Campaigns",
        description: "Sends the next batch of every active mail campaign.",
        category: "mailwizard",
        period: MINUTE,
        requires: Some(Capability::MailWizard),
        sweep: Sweep::MailCampaigns,
    },
];

/// A catalog entry bound to the settlement context it runs against.
struct SettlementJob {
    entry: &'static CatalogEntry,
    ctx: SettlementContext,
}

#[async_trait]
impl Job for SettlementJob {
    fn name(&self) -> &'static str {
        self.entry.name
    }

    fn title(&self) -> &'static str {
        self.entry.title
    }

    fn description(&self) -> &'static str {
        self.entry.description
    }

    fn category(&self) -> &'static str {
        self.entry.category
    }

    fn period(&self) -> Duration {
        self.entry.period
    }

    async fn run(&self, job: &JobContext) -> Result<()> {
        let ctx = &self.ctx;
        let report: SweepReport = match self.entry.sweep {
            Sweep::Investments(kind) => settlement::process_investments(ctx, job, kind).await?,
            Sweep::StakingPositions => settlement::process_staking_positions(ctx, job).await?,
            Sweep::Withdrawals => settlement::process_pending_withdrawals(ctx, job).await?,
            Sweep::Deposits => settlement::process_pending_deposits(ctx, job).await?,
            Sweep::Pnl => settlement::process_pnl(ctx, job).await?,
            Sweep::CleanupPnl => {
                let (expired, zero) = settlement::cleanup_pnl(ctx, job).await?;
                SweepReport {
                    settled: (expired + zero) as usize,
                    ..Default::default()
                }
            }
            Sweep::IcoPhases => settlement::process_ico_phases(ctx, job).await?,
            Sweep::UserBlocks => settlement::process_expired_user_blocks(ctx, job).await?,
            Sweep::FiatRates => settlement::fetch_fiat_currency_prices(ctx, job).await?,
            Sweep::MailCampaigns => settlement::process_mail_campaigns(ctx, job).await?,
        };

        tracing::debug!(
            job = self.entry.name,
            settled = report.settled,
            skipped = report.skipped,
            failed = report.failed,
            "Sweep finished"
        );
        Ok(())
    }
}

fn available(entry: &CatalogEntry, ctx: &SettlementContext) -> bool {
    match entry.requires {
        None => true,
        Some(Capability::Exchange) => {
            ctx.capabilities.is_installed(Capability::Exchange) && ctx.capabilities.exchange().is_some()
        }
        Some(capability) => ctx.capabilities.is_installed(capability),
    }
}

/// Register every catalog job whose capability is installed. Returns the
/// number registered.
pub fn register_jobs(registry: &JobRegistry, ctx: SettlementContext) -> Result<usize> {
    let mut registered = 0;
    for entry in CATALOG {
        if !available(entry, &ctx) {
            tracing::debug!(job = entry.name, capability = ?entry.requires, "Capability missing, job skipped");
            continue;
        }
        registry.register(Arc::new(SettlementJob {
            entry,
            ctx: ctx.clone(),
        }))?;
        registered += 1;
    }
    tracing::info!(registered, total = CATALOG.len(), "Settlement jobs registered");
    Ok(registered)
}
