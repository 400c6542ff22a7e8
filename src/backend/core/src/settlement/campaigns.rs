//! Mail campaign dispatch.

use serde_json::json;

use super::{SettlementContext, SweepReport};
use crate::error::Result;
use crate::jobs::JobContext;
use crate::ledger::{CampaignStatus, MailCampaign, TargetStatus};

pub const CAMPAIGN_EMAIL_TYPE: &str = "EmailCampaign";

/// Send up to `speed` pending targets of every ACTIVE campaign. A campaign
/// with nothing left to send is marked COMPLETED.
pub async fn process_mail_campaigns(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    let campaigns = ctx.store.active_campaigns().await?;
    let mut report = SweepReport::default();

    for campaign in &campaigns {
        if let Err(err) = dispatch(ctx, campaign, &mut report).await {
            err.log();
            job.log_error(&format!("Campaign {} failed: {}", campaign.id, err));
        }
    }

    job.log_success(&format!("Mail campaigns processed: {}", report));
    Ok(report)
}

async fn dispatch(ctx: &SettlementContext, campaign: &MailCampaign, report: &mut SweepReport) -> Result<()> {
    let targets = ctx
        .store
        .pending_campaign_targets(campaign.id, campaign.speed)
        .await?;

    if targets.is_empty() {
        ctx.store
            .set_campaign_status(campaign.id, CampaignStatus::Completed)
            .await?;
        tracing::info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign completed");
        return Ok(());
    }

    for target in targets {
        let variables = json!({
            "TO": target.email,
            "SUBJECT": campaign.subject,
            "CAMPAIGN": campaign.name,
        });
        let status = match ctx.notifier.email.enqueue(CAMPAIGN_EMAIL_TYPE, variables).await {
            Ok(()) => {
                report.settled += 1;
                TargetStatus::Sent
            }
            Err(err) => {
                tracing::warn!(campaign_id = %campaign.id, target_id = %target.id, error = %err, "Campaign email failed");
                report.failed += 1;
                TargetStatus::Failed
            }
        };
        ctx.store.set_campaign_target_status(target.id, status).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobTrigger;
    use crate::ledger::MailTarget;
    use crate::settlement::testing::{default_fixture, job_context};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_speed_limits_each_run_then_completes() {
        let fx = default_fixture();
        let campaign = MailCampaign {
            id: Uuid::new_v4(),
            name: "Spring promo".into(),
            subject: "New staking pools".into(),
            speed: 2,
            status: CampaignStatus::Active,
        };
        let campaign_id = campaign.id;
        fx.store
            .seed(|s| {
                for n in 0..3 {
                    s.targets.push(MailTarget {
                        id: Uuid::new_v4(),
                        campaign_id,
                        email: format!("user{}@example.com", n),
                        user_id: None,
                        status: TargetStatus::Pending,
                    });
                }
                s.campaigns.insert(campaign.id, campaign);
            })
            .await;

        let job = job_context("processMailwizardCampaigns", JobTrigger::Scheduled);
        assert_eq!(process_mail_campaigns(&fx.ctx, &job).await.unwrap().settled, 2);
        assert_eq!(process_mail_campaigns(&fx.ctx, &job).await.unwrap().settled, 1);
        assert_eq!(process_mail_campaigns(&fx.ctx, &job).await.unwrap().settled, 0);

        let state = fx.store.snapshot().await;
        assert_eq!(state.campaigns[&campaign_id].status, CampaignStatus::Completed);
        assert!(state.targets.iter().all(|t| t.status == TargetStatus::Sent));
        assert_eq!(fx.outbox.emails().len(), 3);
        assert_eq!(fx.outbox.emails()[0].email_type, CAMPAIGN_EMAIL_TYPE);
    }
}
