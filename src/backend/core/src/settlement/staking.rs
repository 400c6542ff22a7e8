//! Staking maturity distribution.
//!
//! Matured positions are fanned out through a bounded [`TaskQueue`]; each
//! one settles in its own SERIALIZABLE transaction under a skip-locked row
//! lock. Transient failures are retried with the fixed staking policy, a
//! missing pool skips the position, and positions that still fail are
//! reported to staking admins in one digest.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use super::{SettlementContext, SweepReport};
use crate::error::{ErrorCode, Result, SettlementError};
use crate::jobs::{JobContext, QueueError, TaskOptions, TaskQueue, TaskQueueConfig};
use crate::ledger::{
    AdminEarning, AprMethod, AuditEntry, IsolationLevel, LockMode, StakingEarning, StakingPosition, StakingStatus,
};
use crate::notify::{NotificationType, UserNotification};
use crate::telemetry::SettlementMetrics;

pub const STAKING_ADMIN_PERMISSION: &str = "Access Staking Management";

const DAYS_PER_YEAR: f64 = 365.0;

/// Reward earned by `amount` staked for `days_staked` days at `apr` percent,
/// or `None` if the result does not fit a decimal.
///
/// Simple interest is computed exactly in decimal. Compound interest uses
/// `amount * ((1 + r/n)^(n*t) - 1)` in floating point and is rounded to
/// 8 decimal places.
pub fn calculate_reward(
    amount: Decimal,
    apr: Decimal,
    method: AprMethod,
    days_staked: i64,
    compound_frequency: u32,
) -> Option<Decimal> {
    if amount <= Decimal::ZERO || apr <= Decimal::ZERO || days_staked <= 0 {
        return Some(Decimal::ZERO);
    }
    match method {
        AprMethod::Simple => amount
            .checked_mul(apr)?
            .checked_div(Decimal::ONE_HUNDRED)?
            .checked_mul(Decimal::from(days_staked))?
            .checked_div(Decimal::from(365))
            .map(|r| r.round_dp(8)),
        AprMethod::Compound => {
            let principal = amount.to_f64()?;
            let rate = apr.to_f64()?;
            let n = f64::from(compound_frequency.max(1));
            let years = days_staked as f64 / DAYS_PER_YEAR;
            let reward = principal * ((1.0 + rate / 100.0 / n).powf(n * years) - 1.0);
            Decimal::from_f64(reward).map(|r| r.round_dp(8))
        }
    }
}

/// Whether `now` lies within `window` of the daily `target` time, across midnight.
pub fn within_distribution_window(now: DateTime<Utc>, target: NaiveTime, window: Duration) -> bool {
    const DAY: i64 = 24 * 60 * 60;
    let now_secs = i64::from(now.time().num_seconds_from_midnight());
    let target_secs = i64::from(target.num_seconds_from_midnight());
    let diff = (now_secs - target_secs).rem_euclid(DAY);
    diff.min(DAY - diff) <= window.as_secs() as i64
}

pub async fn process_staking_positions(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    if !ctx.settings.staking_automatic_distribution().await {
        job.log_info("Automatic staking distribution is disabled");
        return Ok(SweepReport::default());
    }

    let now = Utc::now();
    let staking = &ctx.config.staking;
    if !ctx.config.scheduler.manual_run && !job.is_manual() {
        let target = ctx.settings.staking_distribution_time().await;
        if !within_distribution_window(now, target, staking.window) {
            let grace = chrono::Duration::from_std(staking.overdue_grace)
                .map_err(|e| SettlementError::configuration(format!("invalid staking overdue grace: {}", e)))?;
            let overdue = ctx.store.count_overdue_staking_positions(now - grace).await?;
            if overdue == 0 {
                job.log_info(&format!("Outside the distribution window around {}, skipping", target));
                return Ok(SweepReport::default());
            }
            job.log_warn(&format!(
                "{} positions are overdue, distributing outside the window",
                overdue
            ));
        }
    }

    let positions = ctx.store.matured_staking_positions(now).await?;
    job.log_info(&format!("Found {} matured staking positions", positions.len()));
    if positions.is_empty() {
        return Ok(SweepReport::default());
    }

    let default_method = ctx.settings.staking_default_apr_method().await;
    let default_frequency = ctx.settings.staking_compound_frequency().await;
    let queue = TaskQueue::new(TaskQueueConfig::bounded("staking", staking.concurrency));
    let options = TaskOptions::default().with_retry(staking.retry_policy());

    let mut pending = FuturesUnordered::new();
    let mut report = SweepReport::default();
    let mut failed_ids: Vec<Uuid> = Vec::new();

    for position in positions {
        let id = position.id;
        let task_ctx = ctx.clone();
        let settled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = settled.clone();
        let admitted = queue.add(
            move || {
                let ctx = task_ctx.clone();
                let position = position.clone();
                let flag = flag.clone();
                async move {
                    let done = settle_position(&ctx, &position, default_method, default_frequency).await?;
                    flag.store(done, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            },
            options.clone(),
        );
        match admitted {
            Ok(handle) => pending.push(async move { (id, handle.await, settled) }),
            Err(err) => {
                tracing::error!(position_id = %id, error = %err, "Staking task rejected");
                report.failed += 1;
                failed_ids.push(id);
            }
        }
    }

    let total = pending.len();
    let mut done = 0;
    while let Some((id, outcome, settled)) = pending.next().await {
        done += 1;
        match outcome {
            Ok(()) if settled.load(std::sync::atomic::Ordering::SeqCst) => report.settled += 1,
            Ok(()) => report.skipped += 1,
            Err(QueueError::Failed(err)) if err.is_not_found() => {
                job.log_warn(&format!("Staking position {} skipped: {}", id, err));
                report.skipped += 1;
            }
            Err(err) => {
                job.log_error(&format!("Staking position {} failed: {}", id, err));
                SettlementMetrics::record_settlement("staking", "failed");
                report.failed += 1;
                failed_ids.push(id);
            }
        }
        let stats = queue.stats();
        SettlementMetrics::set_queue_depth("staking", stats.active, stats.pending);
        job.report_progress(done, total);
    }

    if !failed_ids.is_empty() {
        let ids: Vec<String> = failed_ids.iter().map(Uuid::to_string).collect();
        ctx.notifier
            .admins(
                STAKING_ADMIN_PERMISSION,
                NotificationType::Alert,
                "Staking Distribution Failures",
                format!(
                    "{} staking positions could not be settled: {}",
                    ids.len(),
                    ids.join(", ")
                ),
                Some("/admin/staking/position"),
            )
            .await;
    }

    job.log_success(&format!("Staking distribution finished: {}", report));
    Ok(report)
}

/// Settle one position. Returns `false` when the row is locked elsewhere
/// or no longer ACTIVE.
pub async fn settle_position(
    ctx: &SettlementContext,
    position: &StakingPosition,
    default_method: AprMethod,
    default_frequency: u32,
) -> Result<bool> {
    let pool = ctx
        .store
        .staking_pool(position.pool_id)
        .await?
        .ok_or_else(|| SettlementError::not_found("StakingPool", position.pool_id))?;

    let mut tx = ctx.store.begin(IsolationLevel::Serializable).await?;
    let Some(mut current) = tx.lock_staking_position(position.id, LockMode::SkipLocked).await? else {
        tx.rollback().await?;
        tracing::debug!(position_id = %position.id, "Position locked elsewhere, skipping");
        return Ok(false);
    };
    if current.status != StakingStatus::Active {
        tx.rollback().await?;
        return Ok(false);
    }

    let method = pool.apr_method.unwrap_or(default_method);
    let frequency = pool.compound_frequency.unwrap_or(default_frequency);
    let overflow = || {
        SettlementError::with_internal(
            ErrorCode::ValidationError,
            "Staking reward out of range",
            format!("position {} pool {}", current.id, pool.id),
        )
    };
    let gross = calculate_reward(current.amount, pool.apr, method, current.days_staked(), frequency)
        .ok_or_else(overflow)?;
    let fee = gross
        .checked_mul(pool.admin_fee_percentage)
        .and_then(|f| f.checked_div(Decimal::ONE_HUNDRED))
        .map(|f| f.round_dp(8))
        .ok_or_else(overflow)?;
    let net = gross.checked_sub(fee).ok_or_else(overflow)?;
    let now = Utc::now();

    if fee > Decimal::ZERO {
        tx.insert_admin_earning(&AdminEarning {
            id: Uuid::new_v4(),
            pool_id: pool.id,
            position_id: current.id,
            amount: fee,
            currency: pool.symbol.clone(),
            created_at: now,
        })
        .await?;
    }

    if pool.auto_compound {
        current.amount = current.amount.checked_add(net).ok_or_else(overflow)?;
    } else {
        tx.insert_staking_earning(&StakingEarning {
            id: Uuid::new_v4(),
            position_id: current.id,
            amount: net,
            is_claimed: false,
            created_at: now,
        })
        .await?;
    }

    current.status = StakingStatus::Completed;
    current.completed_at = Some(now);
    tx.update_staking_position(&current).await?;
    tx.insert_audit(&AuditEntry::new(
        "staking_position",
        current.id,
        "DISTRIBUTE_EARNINGS",
        json!({
            "gross": gross,
            "adminFee": fee,
            "net": net,
            "method": method.as_str(),
            "autoCompound": pool.auto_compound,
        }),
    ))
    .await?;
    tx.commit().await?;

    SettlementMetrics::record_settlement("staking", "completed");
    tracing::info!(
        position_id = %current.id,
        user_id = %current.user_id,
        gross = %gross,
        fee = %fee,
        auto_compound = pool.auto_compound,
        "Staking position settled"
    );

    ctx.notifier
        .user(
            UserNotification::new(
                current.user_id,
                NotificationType::Investment,
                "Staking Rewards Distributed",
                format!(
                    "Your {} stake earned {} {}{}.",
                    pool.name,
                    net.normalize(),
                    pool.symbol,
                    if pool.auto_compound { " and was compounded" } else { "" }
                ),
            )
            .with_link("/staking/position"),
        )
        .await;

    Ok(true)
}
