//! Expiry of temporary user blocks.

use chrono::Utc;

use super::{SettlementContext, SweepReport};
use crate::error::Result;
use crate::jobs::JobContext;
use crate::ledger::{IsolationLevel, UserBlock, UserStatus};

/// Deactivate expired temporary blocks. A user is reactivated only when
/// none of their other blocks is still active.
pub async fn process_expired_user_blocks(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    let blocks = ctx.store.expired_user_blocks(Utc::now()).await?;
    let mut report = SweepReport::default();

    for block in &blocks {
        match expire_block(ctx, block).await {
            Ok(reactivated) => {
                report.settled += 1;
                tracing::info!(block_id = %block.id, user_id = %block.user_id, reactivated, "User block expired");
            }
            Err(err) => {
                report.failed += 1;
                err.log();
                job.log_error(&format!("Failed to expire block {}: {}", block.id, err));
            }
        }
    }

    job.log_success(&format!("Expired user blocks processed: {}", report));
    Ok(report)
}

async fn expire_block(ctx: &SettlementContext, block: &UserBlock) -> Result<bool> {
    let mut tx = ctx.store.begin(IsolationLevel::ReadCommitted).await?;
    tx.deactivate_block(block.id).await?;
    let remaining = tx.count_active_blocks(block.user_id).await?;
    if remaining == 0 {
        tx.set_user_status(block.user_id, UserStatus::Active).await?;
    }
    tx.commit().await?;
    Ok(remaining == 0)
}
