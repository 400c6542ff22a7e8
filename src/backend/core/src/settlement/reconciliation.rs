//! Withdrawal and deposit reconciliation against the external exchange.

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use super::{SettlementContext, SweepReport};
use crate::capabilities::map_external_status;
use crate::error::{ErrorCode, Result, SettlementError};
use crate::jobs::JobContext;
use crate::ledger::{ConditionName, IsolationLevel, LedgerTransaction, TransactionStatus, TransactionType};
use crate::notify::{NotificationType, UserNotification};
use crate::rewards::RewardEvent;
use crate::telemetry::SettlementMetrics;

/// Only rows created within this many minutes are polled.
const LOOKBACK_MINUTES: i64 = 60;

pub async fn process_pending_withdrawals(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    reconcile(ctx, job, TransactionType::Withdraw).await
}

pub async fn process_pending_deposits(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    reconcile(ctx, job, TransactionType::Deposit).await
}

async fn reconcile(ctx: &SettlementContext, job: &JobContext, kind: TransactionType) -> Result<SweepReport> {
    let Some(exchange) = ctx.capabilities.exchange() else {
        job.log_info("No exchange integration installed, nothing to reconcile");
        return Ok(SweepReport::default());
    };

    let since = Utc::now() - Duration::minutes(LOOKBACK_MINUTES);
    let rows = ctx.store.pending_transactions(kind, since).await?;
    job.log_info(&format!("Reconciling {} pending {} transactions", rows.len(), kind));

    let mut report = SweepReport::default();
    let total = rows.len();

    for (index, row) in rows.iter().enumerate() {
        job.report_progress(index, total);

        let (Some(reference), Some(currency)) = (row.reference_id.as_deref(), row.currency()) else {
            tracing::warn!(transaction_id = %row.id, "Pending transaction lacks a reference or currency");
            report.skipped += 1;
            continue;
        };

        let lookup = match kind {
            TransactionType::Withdraw => exchange.withdrawal_status(reference, currency).await,
            _ => exchange.deposit_status(reference, currency).await,
        };
        let external = match lookup {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(transaction_id = %row.id, error = %err, "Exchange status lookup failed");
                report.failed += 1;
                continue;
            }
        };

        let status = map_external_status(&external);
        if status == TransactionStatus::Pending {
            report.skipped += 1;
            continue;
        }

        match apply_status(ctx, row, status, &external).await {
            Ok(Some(updated)) => {
                report.settled += 1;
                SettlementMetrics::record_settlement(kind.as_str(), status.as_str());
                after_reconcile(ctx, &updated, status).await;
            }
            Ok(None) => report.skipped += 1,
            Err(err) if err.is_not_found() => {
                job.log_warn(&format!("Transaction {} skipped: {}", row.id, err));
                report.skipped += 1;
            }
            Err(err) => {
                err.log();
                job.log_error(&format!("Failed to reconcile transaction {}: {}", row.id, err));
                report.failed += 1;
            }
        }
    }

    job.report_progress(total, total);
    job.log_success(&format!("Reconciliation finished: {}", report));
    Ok(report)
}

/// Move a PENDING row to `status`, adjusting the wallet:
///
/// | kind     | COMPLETED            | FAILED / CANCELLED     |
/// |----------|----------------------|------------------------|
/// | WITHDRAW | no balance change    | refund amount + fee    |
/// | DEPOSIT  | credit amount - fee  | no balance change      |
///
/// `None` when the row is no longer PENDING.
async fn apply_status(
    ctx: &SettlementContext,
    row: &LedgerTransaction,
    status: TransactionStatus,
    external: &str,
) -> Result<Option<LedgerTransaction>> {
    let mut tx = ctx.store.begin(IsolationLevel::ReadCommitted).await?;
    let Some(mut current) = tx.lock_transaction(row.id).await? else {
        tx.rollback().await?;
        return Ok(None);
    };
    if current.status != TransactionStatus::Pending {
        tx.rollback().await?;
        return Ok(None);
    }

    let overflow = || {
        SettlementError::with_internal(
            ErrorCode::ValidationError,
            "Balance change out of range",
            format!("transaction {} wallet {}", current.id, current.wallet_id),
        )
    };
    let delta = match (current.kind, status) {
        (TransactionType::Withdraw, TransactionStatus::Failed | TransactionStatus::Cancelled) => {
            Some(current.amount.checked_add(current.fee).ok_or_else(overflow)?)
        }
        (TransactionType::Deposit, TransactionStatus::Completed) => {
            Some(current.amount.checked_sub(current.fee).ok_or_else(overflow)?)
        }
        _ => None,
    };

    if let Some(delta) = delta {
        let wallet = tx.lock_wallet_by_id(current.wallet_id).await?.ok_or_else(|| {
            SettlementError::new(
                ErrorCode::WalletNotFound,
                format!("Wallet {} not found", current.wallet_id),
            )
        })?;
        let balance = wallet.balance.checked_add(delta).ok_or_else(overflow)?;
        tx.update_wallet_balance(wallet.id, balance).await?;
    }

    let mut metadata = match current.metadata.take() {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    metadata.insert("externalStatus".into(), json!(external));
    current.metadata = Value::Object(metadata);
    current.status = status;

    tx.set_transaction_status(current.id, status, Some(current.metadata.clone()))
        .await?;
    tx.commit().await?;

    tracing::info!(
        transaction_id = %current.id,
        kind = %current.kind,
        status = %status,
        balance_change = ?delta,
        "Transaction reconciled"
    );
    Ok(Some(current))
}

async fn after_reconcile(ctx: &SettlementContext, row: &LedgerTransaction, status: TransactionStatus) {
    let currency = row.currency().unwrap_or_default();
    let (title, message) = match (row.kind, status) {
        (TransactionType::Withdraw, TransactionStatus::Completed) => (
            "Withdrawal Completed",
            format!("Your withdrawal of {} {} has been completed.", row.amount.normalize(), currency),
        ),
        (TransactionType::Withdraw, _) => (
            "Withdrawal Failed",
            format!(
                "Your withdrawal of {} {} was {} and the funds were returned to your wallet.",
                row.amount.normalize(),
                currency,
                status.as_str().to_lowercase()
            ),
        ),
        (_, TransactionStatus::Completed) => (
            "Deposit Confirmed",
            format!(
                "Your deposit of {} {} has been credited.",
                (row.amount - row.fee).normalize(),
                currency
            ),
        ),
        _ => (
            "Deposit Failed",
            format!(
                "Your deposit of {} {} was {}.",
                row.amount.normalize(),
                currency,
                status.as_str().to_lowercase()
            ),
        ),
    };

    let kind = if status == TransactionStatus::Completed {
        NotificationType::System
    } else {
        NotificationType::Alert
    };
    ctx.notifier
        .user(UserNotification::new(row.user_id, kind, title, message).with_link("/finance/history"))
        .await;

    if row.kind == TransactionType::Deposit && status == TransactionStatus::Completed {
        let event = RewardEvent::new(row.user_id, row.amount, ConditionName::Deposit, currency).with_source(row.id);
        ctx.rewards.process_rewards(&event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Capabilities, ExchangeGateway};
    use crate::config::Config;
    use crate::jobs::JobTrigger;
    use crate::ledger::{Wallet, WalletType};
    use crate::settlement::testing::{fixture, job_context};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::sync::Arc;
    use uuid::Uuid;

    /// Exchange answering from a fixed reference → status table.
    struct ScriptedExchange(HashMap<String, String>);

    #[async_trait]
    impl ExchangeGateway for ScriptedExchange {
        async fn withdrawal_status(&self, reference: &str, _currency: &str) -> Result<String> {
            Ok(self.0.get(reference).cloned().unwrap_or_else(|| "pending".into()))
        }

        async fn deposit_status(&self, reference: &str, currency: &str) -> Result<String> {
            self.withdrawal_status(reference, currency).await
        }
    }

    fn pending(wallet: &Wallet, kind: TransactionType, amount: i64, fee: i64, reference: &str) -> LedgerTransaction {
        LedgerTransaction::new(wallet, kind, Decimal::new(amount, 0), "external transfer")
            .with_status(TransactionStatus::Pending)
            .with_fee(Decimal::new(fee, 0))
            .with_reference(reference)
            .with_metadata(json!({"currency": "USDT"}))
    }

    fn exchange(pairs: &[(&str, &str)]) -> Arc<ScriptedExchange> {
        Arc::new(ScriptedExchange(
            pairs.iter().map(|(r, s)| (r.to_string(), s.to_string())).collect(),
        ))
    }

    #[tokio::test]
    async fn test_failed_withdrawal_refunds_once() {
        let caps = Capabilities::default().with_exchange(exchange(&[("w-1", "failed"), ("w-2", "processing")]));
        let fx = fixture(caps, Config::default());
        let wallet = Wallet::new(Uuid::new_v4(), WalletType::Spot, "USDT", Decimal::new(10, 0));
        let failed = pending(&wallet, TransactionType::Withdraw, 100, 2, "w-1");
        let waiting = pending(&wallet, TransactionType::Withdraw, 50, 1, "w-2");
        let (wallet_id, failed_id) = (wallet.id, failed.id);
        fx.store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
                s.transactions.extend([failed, waiting]);
            })
            .await;

        let job = job_context("processPendingWithdrawals", JobTrigger::Scheduled);
        let report = process_pending_withdrawals(&fx.ctx, &job).await.unwrap();
        assert_eq!((report.settled, report.skipped), (1, 1));

        process_pending_withdrawals(&fx.ctx, &job).await.unwrap();
        let state = fx.store.snapshot().await;
        assert_eq!(state.wallets[&wallet_id].balance, Decimal::new(112, 0));
        let row = state.transactions.iter().find(|t| t.id == failed_id).unwrap();
        assert_eq!(row.status, TransactionStatus::Failed);
        assert_eq!(row.metadata["externalStatus"], "failed");
        assert_eq!(fx.outbox.user_notifications()[0].title, "Withdrawal Failed");
    }

    #[tokio::test]
    async fn test_deposit_outcomes() {
        let caps = Capabilities::default().with_exchange(exchange(&[("d-1", "ok"), ("d-2", "canceled")]));
        let fx = fixture(caps, Config::default());
        let wallet = Wallet::new(Uuid::new_v4(), WalletType::Spot, "USDT", Decimal::ZERO);
        let confirmed = pending(&wallet, TransactionType::Deposit, 200, 5, "d-1");
        let cancelled = pending(&wallet, TransactionType::Deposit, 70, 0, "d-2");
        let (wallet_id, cancelled_id) = (wallet.id, cancelled.id);
        fx.store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
                s.transactions.extend([confirmed, cancelled]);
            })
            .await;

        let job = job_context("processPendingDeposits", JobTrigger::Scheduled);
        let report = process_pending_deposits(&fx.ctx, &job).await.unwrap();
        assert_eq!(report.settled, 2);

        let state = fx.store.snapshot().await;
        assert_eq!(state.wallets[&wallet_id].balance, Decimal::new(195, 0));
        let row = state.transactions.iter().find(|t| t.id == cancelled_id).unwrap();
        assert_eq!(row.status, TransactionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_refund_overflow_fails_only_that_row() {
        let caps = Capabilities::default().with_exchange(exchange(&[("w-1", "failed"), ("w-2", "failed")]));
        let fx = fixture(caps, Config::default());
        let full = Wallet::new(Uuid::new_v4(), WalletType::Spot, "USDT", Decimal::MAX);
        let normal = Wallet::new(Uuid::new_v4(), WalletType::Spot, "USDT", Decimal::ZERO);
        let stuck = pending(&full, TransactionType::Withdraw, 100, 0, "w-1");
        let refunded = pending(&normal, TransactionType::Withdraw, 100, 0, "w-2");
        let (full_id, normal_id, stuck_id) = (full.id, normal.id, stuck.id);
        fx.store
            .seed(|s| {
                s.wallets.insert(full.id, full);
                s.wallets.insert(normal.id, normal);
                s.transactions.extend([stuck, refunded]);
            })
            .await;

        let job = job_context("processPendingWithdrawals", JobTrigger::Scheduled);
        let report = process_pending_withdrawals(&fx.ctx, &job).await.unwrap();
        assert_eq!((report.settled, report.failed), (1, 1));

        let state = fx.store.snapshot().await;
        assert_eq!(state.wallets[&full_id].balance, Decimal::MAX);
        assert_eq!(state.wallets[&normal_id].balance, Decimal::new(100, 0));
        let row = state.transactions.iter().find(|t| t.id == stuck_id).unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_without_exchange_is_noop() {
        let fx = fixture(Capabilities::default(), Config::default());
        let job = job_context("processPendingDeposits", JobTrigger::Scheduled);
        assert_eq!(process_pending_deposits(&fx.ctx, &job).await.unwrap(), SweepReport::default());
    }
}
