//! Daily PnL snapshots and their retention.

use chrono::{Duration, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{SettlementContext, SweepReport};
use crate::error::{ErrorCode, Result, SettlementError};
use crate::jobs::{JobContext, TaskOptions, TaskQueue, TaskQueueConfig};
use crate::ledger::{PnlBalances, WalletType};

/// Prices used to value one run's balances, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    /// Units of the fiat currency per base-currency unit.
    pub fiat_rates: HashMap<String, Decimal>,
    /// Base-currency price of one unit of the spot currency.
    pub spot_prices: HashMap<String, Decimal>,
}

/// Snapshot every active user's balances for today.
///
/// Users are fanned out through an unbounded [`TaskQueue`]: the queue
/// isolates one user's failure from the rest rather than throttling.
pub async fn process_pnl(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    let users = ctx.store.active_users().await?;
    let prices = Arc::new(PriceBook {
        fiat_rates: ctx.store.fiat_currency_rates().await?,
        spot_prices: ctx.store.exchange_currency_prices().await?,
    });
    job.log_info(&format!("Recording PnL for {} users", users.len()));

    let queue = TaskQueue::new(TaskQueueConfig::unbounded("pnl"));
    let mut pending = FuturesUnordered::new();
    let mut report = SweepReport::default();

    for user in users {
        let user_id = user.id;
        let task_ctx = ctx.clone();
        let prices = prices.clone();
        match queue.add(
            move || {
                let ctx = task_ctx.clone();
                let prices = prices.clone();
                async move { record_snapshot(&ctx, user_id, &prices).await }
            },
            TaskOptions::default(),
        ) {
            Ok(handle) => pending.push(async move { (user_id, handle.await) }),
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "PnL task rejected");
                report.failed += 1;
            }
        }
    }

    let total = pending.len();
    let mut done = 0;
    while let Some((user_id, outcome)) = pending.next().await {
        done += 1;
        match outcome {
            Ok(()) => report.settled += 1,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "PnL snapshot failed");
                report.failed += 1;
            }
        }
        job.report_progress(done, total);
    }

    job.log_success(&format!("PnL snapshots recorded: {}", report));
    Ok(report)
}

async fn record_snapshot(ctx: &SettlementContext, user_id: Uuid, prices: &PriceBook) -> Result<()> {
    let balances = user_balances(ctx, user_id, prices).await?;
    let today = Utc::now().date_naive();
    ctx.store.upsert_pnl_snapshot(user_id, today, balances).await
}

/// Value a user's FIAT, SPOT and ECO wallets in the base currency.
///
/// Currencies without a price contribute nothing. ECO prices come from the
/// ecosystem ticker, which reports zero when the extension is absent. A
/// valuation that overflows fails the user's snapshot.
pub async fn user_balances(ctx: &SettlementContext, user_id: Uuid, prices: &PriceBook) -> Result<PnlBalances> {
    let mut balances = PnlBalances::default();

    for wallet in ctx.store.user_wallets(user_id).await? {
        if wallet.balance.is_zero() {
            continue;
        }
        let overflow = || {
            SettlementError::with_internal(
                ErrorCode::ValidationError,
                "Balance valuation out of range",
                format!("user {} wallet {}", user_id, wallet.id),
            )
        };
        match wallet.wallet_type {
            WalletType::Fiat => {
                if let Some(rate) = prices.fiat_rates.get(&wallet.currency).filter(|r| **r > Decimal::ZERO) {
                    let value = wallet.balance.checked_div(*rate).ok_or_else(overflow)?;
                    balances.fiat = balances.fiat.checked_add(value).ok_or_else(overflow)?;
                }
            }
            WalletType::Spot => {
                if let Some(price) = prices.spot_prices.get(&wallet.currency) {
                    let value = wallet.balance.checked_mul(*price).ok_or_else(overflow)?;
                    balances.spot = balances.spot.checked_add(value).ok_or_else(overflow)?;
                }
            }
            WalletType::Eco => match ctx.capabilities.ticker().last_price(&wallet.currency).await {
                Ok(Some(price)) => {
                    let value = wallet.balance.checked_mul(price).ok_or_else(overflow)?;
                    balances.eco = balances.eco.checked_add(value).ok_or_else(overflow)?;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(currency = %wallet.currency, error = %err, "Ticker lookup failed, valuing at zero");
                }
            },
            WalletType::Futures => {}
        }
    }

    balances.fiat = balances.fiat.round_dp(8);
    balances.spot = balances.spot.round_dp(8);
    balances.eco = balances.eco.round_dp(8);
    Ok(balances)
}

/// Delete snapshots past retention, and zero-balance ones sooner.
/// Returns `(expired, zero_balance)` row counts.
pub async fn cleanup_pnl(ctx: &SettlementContext, job: &JobContext) -> Result<(u64, u64)> {
    let today = Utc::now().date_naive();
    let retention = &ctx.config.pnl;
    let cutoff = |days: i64| {
        Duration::try_days(days)
            .and_then(|span| today.checked_sub_signed(span))
            .ok_or_else(|| SettlementError::configuration(format!("PnL retention of {} days is out of range", days)))
    };

    let expired = ctx
        .store
        .delete_pnl_snapshots_before(cutoff(retention.retention_days)?)
        .await?;
    let zero = ctx
        .store
        .delete_zero_pnl_snapshots_before(cutoff(retention.zero_balance_retention_days)?)
        .await?;

    job.log_success(&format!(
        "Removed {} expired and {} zero-balance PnL snapshots",
        expired, zero
    ));
    Ok((expired, zero))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Capabilities, TickerSource};
    use crate::config::Config;
    use crate::jobs::JobTrigger;
    use crate::ledger::{PnlSnapshot, User, Wallet};
    use crate::settlement::testing::{default_fixture, fixture, job_context};
    use async_trait::async_trait;

    struct FixedTicker(Decimal);

    #[async_trait]
    impl TickerSource for FixedTicker {
        async fn last_price(&self, _currency: &str) -> Result<Option<Decimal>> {
            Ok(Some(self.0))
        }
    }

    #[tokio::test]
    async fn test_snapshot_prices_every_wallet_type() {
        let caps = Capabilities::default().with_ticker(Arc::new(FixedTicker(Decimal::new(3, 0))));
        let fx = fixture(caps, Config::default());
        let user = User::new("trader@example.com", "Ada", "Lovelace");
        let user_id = user.id;
        fx.store
            .seed(|s| {
                s.users.insert(user.id, user);
                s.fiat_rates.insert("EUR".into(), Decimal::new(5, 1));
                s.exchange_prices.insert("BTC".into(), Decimal::new(40000, 0));
                for wallet in [
                    Wallet::new(user_id, WalletType::Fiat, "EUR", Decimal::new(50, 0)),
                    Wallet::new(user_id, WalletType::Spot, "BTC", Decimal::new(1, 1)),
                    Wallet::new(user_id, WalletType::Eco, "MO", Decimal::new(7, 0)),
                    Wallet::new(user_id, WalletType::Spot, "DOGE", Decimal::new(1000, 0)),
                ] {
                    s.wallets.insert(wallet.id, wallet);
                }
            })
            .await;

        let job = job_context("processPnl", JobTrigger::Scheduled);
        let report = process_pnl(&fx.ctx, &job).await.unwrap();
        assert_eq!(report.settled, 1);
        // Running twice on the same day replaces the row.
        process_pnl(&fx.ctx, &job).await.unwrap();

        let pnl = fx.store.snapshot().await.pnl;
        assert_eq!(pnl.len(), 1);
        assert_eq!(pnl[0].balances.fiat, Decimal::new(100, 0));
        assert_eq!(pnl[0].balances.spot, Decimal::new(4000, 0));
        assert_eq!(pnl[0].balances.eco, Decimal::new(21, 0));
    }

    #[tokio::test]
    async fn test_overflowing_valuation_fails_only_that_user() {
        let fx = default_fixture();
        let whale = User::new("whale@example.com", "Moby", "Dick");
        let minnow = User::new("minnow@example.com", "Nemo", "Clown");
        let (whale_id, minnow_id) = (whale.id, minnow.id);
        fx.store
            .seed(|s| {
                s.users.insert(whale.id, whale);
                s.users.insert(minnow.id, minnow);
                s.exchange_prices.insert("BTC".into(), Decimal::new(40000, 0));
                for wallet in [
                    Wallet::new(whale_id, WalletType::Spot, "BTC", Decimal::MAX),
                    Wallet::new(minnow_id, WalletType::Spot, "BTC", Decimal::new(1, 0)),
                ] {
                    s.wallets.insert(wallet.id, wallet);
                }
            })
            .await;

        let job = job_context("processPnl", JobTrigger::Scheduled);
        let report = process_pnl(&fx.ctx, &job).await.unwrap();
        assert_eq!((report.settled, report.failed), (1, 1));

        let pnl = fx.store.snapshot().await.pnl;
        assert_eq!(pnl.len(), 1);
        assert_eq!(pnl[0].user_id, minnow_id);
        assert_eq!(pnl[0].balances.spot, Decimal::new(40000, 0));
    }

    #[tokio::test]
    async fn test_cleanup_retention_rules() {
        let fx = default_fixture();
        let today = Utc::now().date_naive();
        let snapshot = |days_ago: i64, balance: i64| PnlSnapshot {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            day: today - Duration::days(days_ago),
            balances: PnlBalances {
                spot: Decimal::new(balance, 0),
                ..Default::default()
            },
            created_at: Utc::now(),
        };
        fx.store
            .seed(|s| {
                s.pnl.extend([
                    snapshot(40, 10),
                    snapshot(5, 0),
                    snapshot(5, 10),
                    snapshot(0, 0),
                ])
            })
            .await;

        let job = job_context("cleanupPnl", JobTrigger::Scheduled);
        let (expired, zero) = cleanup_pnl(&fx.ctx, &job).await.unwrap();
        assert_eq!((expired, zero), (1, 1));
        assert_eq!(fx.store.snapshot().await.pnl.len(), 2);
    }
}
