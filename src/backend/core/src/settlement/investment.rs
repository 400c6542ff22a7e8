//! Investment maturity sweep (general, forex and AI plans).

use chrono::Utc;
use serde_json::json;

use super::{SettlementContext, SweepReport};
use crate::error::{ErrorCode, Result, SettlementError};
use crate::jobs::{retry_with_backoff, JobContext};
use crate::ledger::{
    ConditionName, Investment, InvestmentKind, InvestmentStatus, IsolationLevel, LedgerTransaction,
};
use crate::notify::{NotificationType, UserNotification};
use crate::rewards::RewardEvent;
use crate::telemetry::SettlementMetrics;

pub const FOREX_ADMIN_PERMISSION: &str = "Access Forex Management";

/// Settle every matured ACTIVE investment of `kind`.
///
/// Forex rows failing transiently are retried with the forex backoff policy
/// and cancelled, with an alert to forex admins, once retries run out. Rows
/// whose term cannot be dated or whose wallet is missing are skipped.
pub async fn process_investments(
    ctx: &SettlementContext,
    job: &JobContext,
    kind: InvestmentKind,
) -> Result<SweepReport> {
    let now = Utc::now();
    let mut report = SweepReport::default();
    let mut matured = Vec::new();
    for investment in ctx.store.active_investments(kind).await? {
        match investment.is_matured(now) {
            Some(true) => matured.push(investment),
            Some(false) => {}
            None => {
                report.skipped += 1;
                tracing::warn!(
                    investment_id = %investment.id,
                    duration = investment.duration.duration,
                    timeframe = %investment.duration.timeframe,
                    "Investment term out of range, skipping"
                );
                job.log_warn(&format!("Investment {} has an invalid term", investment.id));
            }
        }
    }

    job.log_info(&format!("Found {} matured {} investments", matured.len(), kind));

    let total = matured.len();
    let forex_policy = ctx.config.forex.retry_policy();

    for (index, investment) in matured.iter().enumerate() {
        let outcome = if kind == InvestmentKind::Forex {
            retry_with_backoff(&forex_policy, "forex_settlement", |_| settle_investment(ctx, investment)).await
        } else {
            settle_investment(ctx, investment).await
        };

        match outcome {
            Ok(Some(record)) => {
                report.settled += 1;
                SettlementMetrics::record_settlement(kind.as_str(), "completed");
                after_settlement(ctx, investment, &record).await;
            }
            Ok(None) => report.skipped += 1,
            Err(err) if err.is_not_found() => {
                report.skipped += 1;
                job.log_warn(&format!("Investment {} skipped: {}", investment.id, err));
            }
            Err(err) => {
                report.failed += 1;
                SettlementMetrics::record_settlement(kind.as_str(), "failed");
                err.log();
                job.log_error(&format!("Failed to settle investment {}: {}", investment.id, err));
                // Only exhausted transient failures are terminal.
                if kind == InvestmentKind::Forex && err.is_retryable() {
                    cancel_forex_investment(ctx, job, investment, &err).await;
                }
            }
        }
        job.report_progress(index + 1, total);
    }

    job.log_success(&format!("Investment sweep finished: {}", report));
    Ok(report)
}

/// Credit the wallet and close the investment. `None` when the row is no
/// longer ACTIVE (settled by an earlier or concurrent run).
pub async fn settle_investment(ctx: &SettlementContext, investment: &Investment) -> Result<Option<LedgerTransaction>> {
    let kind = investment.kind;
    let mut tx = ctx.store.begin(IsolationLevel::ReadCommitted).await?;

    let Some(current) = tx.lock_investment(kind, investment.id).await? else {
        tx.rollback().await?;
        return Ok(None);
    };
    if current.status != InvestmentStatus::Active {
        tx.rollback().await?;
        tracing::debug!(investment_id = %current.id, status = %current.status, "Investment already settled");
        return Ok(None);
    }

    let wallet = tx
        .lock_wallet(current.user_id, current.wallet_type, &current.currency)
        .await?
        .ok_or_else(|| {
            SettlementError::new(
                ErrorCode::WalletNotFound,
                format!(
                    "{} wallet for {} not found for user {}",
                    current.wallet_type, current.currency, current.user_id
                ),
            )
        })?;

    let overflow = || {
        SettlementError::with_internal(
            ErrorCode::ValidationError,
            "Settlement amount out of range",
            format!("investment {} wallet {}", current.id, wallet.id),
        )
    };
    let credit = current.settlement_amount().ok_or_else(overflow)?;
    let balance = wallet.balance.checked_add(credit).ok_or_else(overflow)?;
    tx.update_wallet_balance(wallet.id, balance).await?;

    let result = current.result.map(|r| r.as_str()).unwrap_or("DRAW");
    let record = LedgerTransaction::new(
        &wallet,
        kind.roi_transaction(),
        credit,
        format!("ROI of {} {} from plan \"{}\"", credit.normalize(), current.currency, current.plan_title),
    )
    .with_reference(current.id.to_string())
    .with_metadata(json!({
        "currency": current.currency,
        "investmentId": current.id,
        "result": result,
        "profit": current.profit,
    }));
    tx.insert_transaction(&record).await?;
    tx.set_investment_status(kind, current.id, InvestmentStatus::Completed, None)
        .await?;
    tx.commit().await?;

    tracing::info!(
        investment_id = %current.id,
        kind = %kind,
        user_id = %current.user_id,
        credit = %credit,
        result,
        "Investment settled"
    );
    Ok(Some(record))
}

async fn after_settlement(ctx: &SettlementContext, investment: &Investment, record: &LedgerTransaction) {
    let result = investment.result.map(|r| r.as_str()).unwrap_or("DRAW");

    match ctx.store.user(investment.user_id).await {
        Ok(Some(user)) => {
            ctx.notifier
                .email(
                    email_type(investment.kind),
                    json!({
                        "TO": user.email,
                        "FIRSTNAME": user.first_name,
                        "PLAN": investment.plan_title,
                        "AMOUNT": investment.amount,
                        "PROFIT": investment.profit,
                        "RESULT": result,
                        "CURRENCY": investment.currency,
                    }),
                )
                .await
        }
        Ok(None) => tracing::warn!(user_id = %investment.user_id, "Investment owner missing, no email sent"),
        Err(err) => tracing::warn!(user_id = %investment.user_id, error = %err, "Failed to load investment owner"),
    }

    ctx.notifier
        .user(
            UserNotification::new(
                investment.user_id,
                NotificationType::Investment,
                "Investment Completed",
                format!(
                    "Your investment in \"{}\" completed with result {}. {} {} credited.",
                    investment.plan_title,
                    result,
                    record.amount.normalize(),
                    investment.currency
                ),
            )
            .with_link("/investment/history"),
        )
        .await;

    let event = RewardEvent::new(
        investment.user_id,
        investment.amount,
        reward_condition(investment.kind),
        investment.currency.clone(),
    )
    .with_source(investment.id);
    ctx.rewards.process_rewards(&event).await;
}

async fn cancel_forex_investment(
    ctx: &SettlementContext,
    job: &JobContext,
    investment: &Investment,
    cause: &SettlementError,
) {
    let reason = cause.user_message().to_string();
    let cancelled = async {
        let mut tx = ctx.store.begin(IsolationLevel::ReadCommitted).await?;
        match tx.lock_investment(InvestmentKind::Forex, investment.id).await? {
            Some(current) if current.status == InvestmentStatus::Active => {
                tx.set_investment_status(
                    InvestmentKind::Forex,
                    investment.id,
                    InvestmentStatus::Cancelled,
                    Some(reason.clone()),
                )
                .await?;
                tx.commit().await?;
                Ok::<bool, SettlementError>(true)
            }
            _ => {
                tx.rollback().await?;
                Ok(false)
            }
        }
    }
    .await;

    match cancelled {
        Ok(true) => {
            job.log_warn(&format!("Forex investment {} cancelled after retries", investment.id));
            ctx.notifier
                .admins(
                    FOREX_ADMIN_PERMISSION,
                    NotificationType::Alert,
                    "Forex Investment Cancelled",
                    format!(
                        "Forex investment {} of user {} could not be settled and was cancelled: {}",
                        investment.id, investment.user_id, reason
                    ),
                    Some("/admin/forex/investment"),
                )
                .await;
        }
        Ok(false) => {}
        Err(err) => {
            err.log();
            tracing::error!(investment_id = %investment.id, error = %err, "Failed to cancel forex investment");
        }
    }
}

fn email_type(kind: InvestmentKind) -> &'static str {
    match kind {
        InvestmentKind::General => "InvestmentCompleted",
        InvestmentKind::Forex => "ForexInvestmentCompleted",
        InvestmentKind::Ai => "AiInvestmentCompleted",
    }
}

fn reward_condition(kind: InvestmentKind) -> ConditionName {
    match kind {
        InvestmentKind::General => ConditionName::Investment,
        InvestmentKind::Forex => ConditionName::ForexInvestment,
        InvestmentKind::Ai => ConditionName::AiInvestment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobTrigger;
    use crate::ledger::{InvestmentDuration, InvestmentResult, Timeframe, TransactionType, Wallet, WalletType};
    use crate::settlement::testing::{default_fixture, job_context};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn matured(kind: InvestmentKind, user_id: Uuid, result: InvestmentResult) -> Investment {
        Investment {
            id: Uuid::new_v4(),
            kind,
            user_id,
            plan_id: Uuid::new_v4(),
            plan_title: "Gold".into(),
            wallet_type: WalletType::Spot,
            currency: "USDT".into(),
            amount: Decimal::new(1000, 0),
            profit: Decimal::new(150, 0),
            result: Some(result),
            status: InvestmentStatus::Active,
            duration: InvestmentDuration {
                duration: 1,
                timeframe: Timeframe::Day,
            },
            created_at: Utc::now() - chrono::Duration::days(2),
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_credits_once() {
        let fx = default_fixture();
        let user = Uuid::new_v4();
        let wallet = Wallet::new(user, WalletType::Spot, "USDT", Decimal::new(10, 0));
        let win = matured(InvestmentKind::General, user, InvestmentResult::Win);
        let mut pending = matured(InvestmentKind::General, user, InvestmentResult::Win);
        pending.created_at = Utc::now();
        let (win_id, wallet_id) = (win.id, wallet.id);
        fx.store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
                s.investments.insert(win.id, win);
                s.investments.insert(pending.id, pending);
            })
            .await;

        let job = job_context("processPendingInvestments", JobTrigger::Manual);
        let report = process_investments(&fx.ctx, &job, InvestmentKind::General).await.unwrap();
        assert_eq!(report.settled, 1);

        let again = process_investments(&fx.ctx, &job, InvestmentKind::General).await.unwrap();
        assert_eq!(again.settled, 0);

        let state = fx.store.snapshot().await;
        assert_eq!(state.wallets[&wallet_id].balance, Decimal::new(1160, 0));
        assert_eq!(state.investments[&win_id].status, InvestmentStatus::Completed);
        let roi: Vec<_> = state
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionType::InvestmentRoi)
            .collect();
        assert_eq!(roi.len(), 1);
        assert_eq!(fx.outbox.emails()[0].email_type, "InvestmentCompleted");
        assert_eq!(fx.outbox.user_notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_wallet_does_not_stop_sweep() {
        let fx = default_fixture();
        let (lonely, funded) = (Uuid::new_v4(), Uuid::new_v4());
        let wallet = Wallet::new(funded, WalletType::Spot, "USDT", Decimal::ZERO);
        let broken = matured(InvestmentKind::Ai, lonely, InvestmentResult::Loss);
        let mut good = matured(InvestmentKind::Ai, funded, InvestmentResult::Loss);
        good.created_at = broken.created_at + chrono::Duration::seconds(1);
        let wallet_id = wallet.id;
        fx.store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
                s.investments.insert(broken.id, broken);
                s.investments.insert(good.id, good);
            })
            .await;

        let job = job_context("processAiInvestments", JobTrigger::Scheduled);
        let report = process_investments(&fx.ctx, &job, InvestmentKind::Ai).await.unwrap();
        assert_eq!((report.settled, report.skipped, report.failed), (1, 1, 0));
        // LOSS returns principal minus loss.
        assert_eq!(fx.store.snapshot().await.wallets[&wallet_id].balance, Decimal::new(850, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forex_conflicts_cancel_after_retries() {
        let fx = default_fixture();
        let user = Uuid::new_v4();
        let wallet = Wallet::new(user, WalletType::Spot, "USDT", Decimal::ZERO);
        let investment = matured(InvestmentKind::Forex, user, InvestmentResult::Win);
        let (id, wallet_id) = (investment.id, wallet.id);
        fx.store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
                s.investments.insert(id, investment);
            })
            .await;
        fx.store.inject_conflicts(4);

        let started = tokio::time::Instant::now();
        let job = job_context("processForexInvestments", JobTrigger::Scheduled);
        let report = process_investments(&fx.ctx, &job, InvestmentKind::Forex).await.unwrap();

        assert_eq!(report.failed, 1);
        // 1s + 2s + 4s of backoff before giving up.
        assert!(started.elapsed() >= std::time::Duration::from_secs(7));
        let state = fx.store.snapshot().await;
        assert_eq!(state.investments[&id].status, InvestmentStatus::Cancelled);
        assert!(state.investments[&id].failure_reason.is_some());
        assert_eq!(state.wallets[&wallet_id].balance, Decimal::ZERO);
        let alerts = fx.outbox.admin_notifications();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].permission, FOREX_ADMIN_PERMISSION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forex_recovers_from_a_single_conflict() {
        let fx = default_fixture();
        let user = Uuid::new_v4();
        let wallet = Wallet::new(user, WalletType::Spot, "USDT", Decimal::ZERO);
        let investment = matured(InvestmentKind::Forex, user, InvestmentResult::Draw);
        let wallet_id = wallet.id;
        fx.store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
                s.investments.insert(investment.id, investment);
            })
            .await;
        fx.store.inject_conflicts(1);

        let job = job_context("processForexInvestments", JobTrigger::Scheduled);
        let report = process_investments(&fx.ctx, &job, InvestmentKind::Forex).await.unwrap();
        assert_eq!((report.settled, report.failed), (1, 0));
        assert_eq!(fx.store.snapshot().await.wallets[&wallet_id].balance, Decimal::new(1000, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forex_missing_wallet_is_not_retried_or_cancelled() {
        let fx = default_fixture();
        let investment = matured(InvestmentKind::Forex, Uuid::new_v4(), InvestmentResult::Win);
        let id = investment.id;
        fx.store.seed(|s| { s.investments.insert(id, investment); }).await;

        let started = tokio::time::Instant::now();
        let job = job_context("processForexInvestments", JobTrigger::Scheduled);
        let report = process_investments(&fx.ctx, &job, InvestmentKind::Forex).await.unwrap();

        assert_eq!((report.skipped, report.failed), (1, 0));
        assert_eq!(started.elapsed(), std::time::Duration::ZERO);
        let state = fx.store.snapshot().await;
        assert_eq!(state.investments[&id].status, InvestmentStatus::Active);
        assert!(fx.outbox.admin_notifications().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_term_is_skipped_without_stopping_sweep() {
        let fx = default_fixture();
        let user = Uuid::new_v4();
        let wallet = Wallet::new(user, WalletType::Spot, "USDT", Decimal::ZERO);
        let good = matured(InvestmentKind::General, user, InvestmentResult::Draw);
        let mut corrupt = matured(InvestmentKind::General, user, InvestmentResult::Win);
        corrupt.duration = InvestmentDuration { duration: 100_000_000, timeframe: Timeframe::Month };
        let (good_id, corrupt_id, wallet_id) = (good.id, corrupt.id, wallet.id);
        fx.store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
                s.investments.insert(good.id, good);
                s.investments.insert(corrupt.id, corrupt);
            })
            .await;

        let job = job_context("processPendingInvestments", JobTrigger::Scheduled);
        let report = process_investments(&fx.ctx, &job, InvestmentKind::General).await.unwrap();
        assert_eq!((report.settled, report.skipped, report.failed), (1, 1, 0));

        let state = fx.store.snapshot().await;
        assert_eq!(state.investments[&good_id].status, InvestmentStatus::Completed);
        assert_eq!(state.investments[&corrupt_id].status, InvestmentStatus::Active);
        assert_eq!(state.wallets[&wallet_id].balance, Decimal::new(1000, 0));
    }

    #[tokio::test]
    async fn test_balance_overflow_fails_only_that_row() {
        let fx = default_fixture();
        let (rich, plain) = (Uuid::new_v4(), Uuid::new_v4());
        let full = Wallet::new(rich, WalletType::Spot, "USDT", Decimal::MAX);
        let empty = Wallet::new(plain, WalletType::Spot, "USDT", Decimal::ZERO);
        let overflowing = matured(InvestmentKind::General, rich, InvestmentResult::Win);
        let ok = matured(InvestmentKind::General, plain, InvestmentResult::Win);
        let (full_id, empty_id, overflow_id) = (full.id, empty.id, overflowing.id);
        fx.store
            .seed(|s| {
                s.wallets.insert(full.id, full);
                s.wallets.insert(empty.id, empty);
                s.investments.insert(overflowing.id, overflowing);
                s.investments.insert(ok.id, ok);
            })
            .await;

        let job = job_context("processPendingInvestments", JobTrigger::Scheduled);
        let report = process_investments(&fx.ctx, &job, InvestmentKind::General).await.unwrap();
        assert_eq!((report.settled, report.failed), (1, 1));

        let state = fx.store.snapshot().await;
        assert_eq!(state.wallets[&full_id].balance, Decimal::MAX);
        assert_eq!(state.wallets[&empty_id].balance, Decimal::new(1150, 0));
        assert_eq!(state.investments[&overflow_id].status, InvestmentStatus::Active);
    }
}
