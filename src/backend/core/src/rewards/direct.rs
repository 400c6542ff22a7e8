//! DIRECT mode: the user's own referrer is the only beneficiary.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use super::RewardEvent;
use crate::error::Result;
use crate::ledger::{IsolationLevel, LedgerStore, ReferralCondition, ReferralStatus, RewardRecord};

/// Without a source id, a repeat within this many seconds is a duplicate.
pub const DEDUPE_WINDOW_SECS: i64 = 60;

pub(super) async fn distribute(
    store: &dyn LedgerStore,
    event: &RewardEvent,
    condition: &ReferralCondition,
) -> Result<Vec<RewardRecord>> {
    let Some(edge) = store.referral_by_referred(event.user_id).await? else {
        tracing::debug!(user_id = %event.user_id, "User has no referrer");
        return Ok(Vec::new());
    };
    if edge.status != ReferralStatus::Active {
        tracing::debug!(referral_id = %edge.id, status = %edge.status, "Referral not active");
        return Ok(Vec::new());
    }

    let reward = condition.base_reward(event.amount);
    if reward <= Decimal::ZERO {
        return Ok(Vec::new());
    }

    // A source id identifies the event exactly; otherwise fall back to the window.
    let since = match event.source_id {
        Some(_) => None,
        None => Some(Utc::now() - Duration::seconds(DEDUPE_WINDOW_SECS)),
    };

    let mut tx = store.begin(IsolationLevel::Serializable).await?;
    if tx
        .reward_exists(edge.referrer_id, condition.id, since, event.source_id.as_deref())
        .await?
    {
        tx.rollback().await?;
        tracing::info!(
            referrer_id = %edge.referrer_id,
            condition = %condition.name,
            source_id = ?event.source_id,
            "Duplicate direct reward suppressed"
        );
        return Ok(Vec::new());
    }

    let record = RewardRecord::new(edge.referrer_id, condition.id, reward, event.source_id.clone());
    tx.insert_reward(&record).await?;
    tx.commit().await?;

    tracing::debug!(referrer_id = %record.referrer_id, reward = %record.reward, "Direct reward written");
    Ok(vec![record])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ConditionName, InMemoryStore, ReferralEdge, RewardType, WalletType};
    use uuid::Uuid;

    fn fixed_condition() -> ReferralCondition {
        ReferralCondition {
            id: Uuid::new_v4(),
            name: ConditionName::Investment,
            title: "Investment".into(),
            status: true,
            reward: Decimal::new(15, 0),
            reward_type: RewardType::Fixed,
            reward_wallet_type: WalletType::Spot,
            reward_currency: "USDT".into(),
        }
    }

    #[tokio::test]
    async fn test_source_id_dedupes_replays_only() {
        let store = InMemoryStore::new();
        let referrer = Uuid::new_v4();
        let referred = Uuid::new_v4();
        store
            .seed(|s| s.referrals.push(ReferralEdge::new(referrer, referred, ReferralStatus::Active)))
            .await;
        let cond = fixed_condition();

        let first = RewardEvent::new(referred, Decimal::new(50, 0), cond.name, "USDT").with_source("inv-1");
        assert_eq!(distribute(&store, &first, &cond).await.unwrap().len(), 1);
        assert!(distribute(&store, &first, &cond).await.unwrap().is_empty());

        let second = RewardEvent::new(referred, Decimal::new(50, 0), cond.name, "USDT").with_source("inv-2");
        assert_eq!(distribute(&store, &second, &cond).await.unwrap().len(), 1);
        assert_eq!(store.snapshot().await.rewards.len(), 2);
    }

    #[tokio::test]
    async fn test_window_dedupe_without_source() {
        let store = InMemoryStore::new();
        let referred = Uuid::new_v4();
        store
            .seed(|s| s.referrals.push(ReferralEdge::new(Uuid::new_v4(), referred, ReferralStatus::Active)))
            .await;
        let cond = fixed_condition();
        let event = RewardEvent::new(referred, Decimal::new(50, 0), cond.name, "USDT");

        assert_eq!(distribute(&store, &event, &cond).await.unwrap().len(), 1);
        assert!(distribute(&store, &event, &cond).await.unwrap().is_empty());

        // Push the existing record outside the window.
        store
            .seed(|s| s.rewards[0].created_at = Utc::now() - Duration::seconds(DEDUPE_WINDOW_SECS + 5))
            .await;
        assert_eq!(distribute(&store, &event, &cond).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_referral_earns_nothing() {
        let store = InMemoryStore::new();
        let referred = Uuid::new_v4();
        store
            .seed(|s| s.referrals.push(ReferralEdge::new(Uuid::new_v4(), referred, ReferralStatus::Pending)))
            .await;
        let cond = fixed_condition();
        let event = RewardEvent::new(referred, Decimal::new(50, 0), cond.name, "USDT");
        assert!(distribute(&store, &event, &cond).await.unwrap().is_empty());
    }
}
