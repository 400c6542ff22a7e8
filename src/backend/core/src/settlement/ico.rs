//! ICO phase transitions.

use chrono::Utc;

use super::{SettlementContext, SweepReport};
use crate::error::Result;
use crate::jobs::JobContext;
use crate::ledger::IcoStatus;

/// UPCOMING → ACTIVE once started, ACTIVE → SUCCESS once ended.
pub async fn process_ico_phases(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    let now = Utc::now();
    let offerings = ctx
        .store
        .ico_offerings(&[IcoStatus::Upcoming, IcoStatus::Active])
        .await?;

    let mut report = SweepReport::default();
    for offering in &offerings {
        let Some(next) = offering.next_status(now) else {
            report.skipped += 1;
            continue;
        };
        match ctx.store.set_ico_status(offering.id, next).await {
            Ok(()) => {
                report.settled += 1;
                tracing::info!(offering_id = %offering.id, name = %offering.name, from = %offering.status, to = %next, "ICO phase changed");
            }
            Err(err) => {
                report.failed += 1;
                job.log_error(&format!("Failed to move offering {} to {}: {}", offering.id, next, err));
            }
        }
    }

    job.log_success(&format!("ICO phases processed: {}", report));
    Ok(report)
}
