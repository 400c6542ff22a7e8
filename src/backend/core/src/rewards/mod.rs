//! Referral reward propagation.
//!
//! [`RewardEngine::process_rewards`] is called after a monetary event has
//! been committed (an investment settled, a deposit confirmed, ...). It
//! resolves the configured compensation structure and writes zero or more
//! [`RewardRecord`]s:
//!
//! ```text
//!   event ──► enabled? ──► mode ──► settings blob ──► event eligible? ──► condition
//!                                                                            │
//!                      ┌──────────────────────┬──────────────────────────────┤
//!                      ▼                      ▼                              ▼
//!                   DIRECT                 BINARY                        UNILEVEL
//!                 one referrer       walk binary uplines           walk unilevel uplines
//! ```
//!
//! Every step fails closed: a disabled feature, bad settings or an
//! ineligible event distribute nothing and never surface an error to the
//! calling job. Referral registration ([`RewardEngine::handle_referral_register`])
//! is the exception and propagates its errors.

pub mod direct;
pub mod tree;
pub mod validation;

pub use tree::find_uplines;
pub use validation::{is_valid_transaction, LevelSettings, SettingsViolation};

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::capabilities::{Capabilities, Capability};
use crate::error::Result;
use crate::ledger::{ConditionName, LedgerStore, ReferralCondition, ReferralEdge, RewardRecord, TreeKind};
use crate::notify::{NotificationType, Notifier, UserNotification};
use crate::settings::{MlmSystem, Settings};
use crate::telemetry::SettlementMetrics;
use validation::{is_valid_event, mode_settings, parse_settings_blob, MAX_SETTINGS_BYTES};

/// Permission whose holders hear about distributed rewards.
pub const MLM_ADMIN_PERMISSION: &str = "Access MLM Management";

/// A committed event that may earn the actor's uplines a reward.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardEvent {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub condition: ConditionName,
    pub currency: String,
    /// Id of the ledger row behind the event. Used to recognise a replay.
    pub source_id: Option<String>,
}

impl RewardEvent {
    pub fn new(user_id: Uuid, amount: Decimal, condition: ConditionName, currency: impl Into<String>) -> Self {
        Self {
            user_id,
            amount,
            condition,
            currency: currency.into(),
            source_id: None,
        }
    }

    pub fn with_source(mut self, source_id: impl ToString) -> Self {
        self.source_id = Some(source_id.to_string());
        self
    }
}

#[derive(Clone)]
pub struct RewardEngine {
    store: Arc<dyn LedgerStore>,
    settings: Settings,
    notifier: Notifier,
    capabilities: Arc<Capabilities>,
}

impl RewardEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settings: Settings,
        notifier: Notifier,
        capabilities: Arc<Capabilities>,
    ) -> Self {
        Self {
            store,
            settings,
            notifier,
            capabilities,
        }
    }

    /// Distribute rewards for `event`. Returns whether any reward was written.
    pub async fn process_rewards(&self, event: &RewardEvent) -> bool {
        match self.try_process(event).await {
            Ok(distributed) => distributed,
            Err(err) => {
                err.log();
                tracing::error!(
                    user_id = %event.user_id,
                    condition = %event.condition,
                    error = %err,
                    "Reward distribution failed"
                );
                false
            }
        }
    }

    async fn try_process(&self, event: &RewardEvent) -> Result<bool> {
        if !self.capabilities.is_installed(Capability::Mlm) || !self.settings.referral_enabled().await {
            return Ok(false);
        }

        let raw_mode = self.settings.mlm_system_raw().await;
        let Some(mode) = raw_mode.as_deref().and_then(MlmSystem::parse) else {
            tracing::error!(mode = ?raw_mode, "Unknown or missing MLM system, skipping rewards");
            return Ok(false);
        };

        let blob = match self.settings.mlm_settings().await {
            Some(raw) => match parse_settings_blob(&raw, MAX_SETTINGS_BYTES) {
                Ok(blob) => blob,
                Err(violation) => {
                    tracing::error!(mode = mode.as_str(), %violation, "Rejected MLM settings");
                    return Ok(false);
                }
            },
            None => Map::new(),
        };

        if !is_valid_event(event.condition, event.amount, &event.currency) {
            tracing::debug!(
                user_id = %event.user_id,
                condition = %event.condition,
                amount = %event.amount,
                currency = %event.currency,
                "Event not eligible for referral rewards"
            );
            return Ok(false);
        }

        let Some(condition) = self.store.referral_condition(event.condition).await? else {
            tracing::error!(condition = %event.condition, "No active referral condition");
            return Ok(false);
        };

        match mode {
            MlmSystem::Direct => {
                let records = direct::distribute(self.store.as_ref(), event, &condition).await?;
                self.announce(mode, &condition, &records).await;
                Ok(!records.is_empty())
            }
            MlmSystem::Binary | MlmSystem::Unilevel => {
                let key = if mode == MlmSystem::Binary { "binary" } else { "unilevel" };
                let sub = match mode_settings(&blob, key) {
                    Ok(sub) => sub,
                    Err(violation) => {
                        tracing::error!(mode = mode.as_str(), %violation, "Rejected tree settings");
                        return Ok(false);
                    }
                };
                Ok(if mode == MlmSystem::Binary {
                    self.process_binary_rewards(event, &condition, &sub).await
                } else {
                    self.process_unilevel_rewards(event, &condition, &sub).await
                })
            }
        }
    }

    /// Pay up to `levels` binary uplines according to `settings`.
    pub async fn process_binary_rewards(
        &self,
        event: &RewardEvent,
        condition: &ReferralCondition,
        settings: &Value,
    ) -> bool {
        self.process_tree(MlmSystem::Binary, TreeKind::Binary, event, condition, settings)
            .await
    }

    /// Pay up to `levels` unilevel uplines according to `settings`.
    pub async fn process_unilevel_rewards(
        &self,
        event: &RewardEvent,
        condition: &ReferralCondition,
        settings: &Value,
    ) -> bool {
        self.process_tree(MlmSystem::Unilevel, TreeKind::Unilevel, event, condition, settings)
            .await
    }

    async fn process_tree(
        &self,
        mode: MlmSystem,
        kind: TreeKind,
        event: &RewardEvent,
        condition: &ReferralCondition,
        settings: &Value,
    ) -> bool {
        let levels = match LevelSettings::from_value(settings) {
            Ok(levels) => levels,
            Err(violation) => {
                tracing::error!(mode = mode.as_str(), %violation, "Invalid level settings, nothing distributed");
                return false;
            }
        };

        match tree::distribute(self.store.as_ref(), kind, event, condition, &levels).await {
            Ok(records) => {
                self.announce(mode, condition, &records).await;
                !records.is_empty()
            }
            Err(err) => {
                err.log();
                tracing::error!(mode = mode.as_str(), user_id = %event.user_id, error = %err, "Tree reward distribution failed");
                false
            }
        }
    }

    /// Record `referred_id` as introduced by `referrer_id` and, for tree
    /// modes, place the new user in the tree.
    pub async fn handle_referral_register(&self, referrer_id: Uuid, referred_id: Uuid) -> Result<ReferralEdge> {
        let kind = match self.settings.mlm_system_raw().await.as_deref().and_then(MlmSystem::parse) {
            Some(MlmSystem::Binary) => Some(TreeKind::Binary),
            Some(MlmSystem::Unilevel) => Some(TreeKind::Unilevel),
            _ => None,
        };
        let approval_required = self.settings.referral_approval_required().await;
        tree::register_referral(self.store.as_ref(), referrer_id, referred_id, kind, approval_required).await
    }

    async fn announce(&self, mode: MlmSystem, condition: &ReferralCondition, records: &[RewardRecord]) {
        if records.is_empty() {
            return;
        }
        SettlementMetrics::record_reward(mode.as_str(), records.len() as u64);

        for record in records {
            self.notifier
                .user(
                    UserNotification::new(
                        record.referrer_id,
                        NotificationType::System,
                        "Referral Reward Earned",
                        format!(
                            "You earned {} {} from \"{}\".",
                            record.reward.normalize(),
                            condition.reward_currency,
                            condition.title
                        ),
                    )
                    .with_link("/affiliate/reward"),
                )
                .await;
        }

        self.notifier
            .admins(
                MLM_ADMIN_PERMISSION,
                NotificationType::System,
                "Referral Rewards Distributed",
                format!(
                    "{} {} reward(s) written for \"{}\".",
                    records.len(),
                    mode.as_str(),
                    condition.title
                ),
                Some("/admin/affiliate/reward"),
            )
            .await;

        tracing::info!(
            mode = mode.as_str(),
            condition = %condition.name,
            count = records.len(),
            "Referral rewards distributed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryStore, ReferralStatus, RewardType, WalletType};
    use crate::notify::{ChannelBroadcaster, InMemoryOutbox};
    use crate::settings::{InMemorySettings, MLM_SETTINGS, MLM_SYSTEM, REFERRAL_STATUS};
    use serde_json::json;

    fn condition(name: ConditionName, reward_type: RewardType, reward: i64) -> ReferralCondition {
        ReferralCondition {
            id: Uuid::new_v4(),
            name,
            title: name.as_str().to_string(),
            status: true,
            reward: Decimal::new(reward, 0),
            reward_type,
            reward_wallet_type: WalletType::Spot,
            reward_currency: "USDT".into(),
        }
    }

    fn engine(store: &InMemoryStore, settings: InMemorySettings, caps: &[Capability]) -> (RewardEngine, Arc<InMemoryOutbox>) {
        let outbox = Arc::new(InMemoryOutbox::new());
        let notifier = Notifier::in_memory(outbox.clone(), Arc::new(ChannelBroadcaster::default()));
        let engine = RewardEngine::new(
            Arc::new(store.clone()),
            Settings::new(Arc::new(settings)),
            notifier,
            Arc::new(Capabilities::new(caps.iter().copied())),
        );
        (engine, outbox)
    }

    async fn seed_direct_pair(store: &InMemoryStore, reward_type: RewardType, reward: i64) -> (Uuid, Uuid) {
        let referrer = Uuid::new_v4();
        let referred = Uuid::new_v4();
        store
            .seed(|s| {
                s.referrals.push(ReferralEdge::new(referrer, referred, ReferralStatus::Active));
                s.conditions.push(condition(ConditionName::Deposit, reward_type, reward));
            })
            .await;
        (referrer, referred)
    }

    #[tokio::test]
    async fn test_direct_percentage_reward() {
        let store = InMemoryStore::new();
        let (referrer, referred) = seed_direct_pair(&store, RewardType::Percentage, 10).await;
        let settings = InMemorySettings::new()
            .with(REFERRAL_STATUS, "true")
            .with(MLM_SYSTEM, "DIRECT");
        let (engine, outbox) = engine(&store, settings, &[Capability::Mlm]);

        let event = RewardEvent::new(referred, Decimal::new(200, 0), ConditionName::Deposit, "USDT");
        assert!(engine.process_rewards(&event).await);

        let rewards = store.snapshot().await.rewards;
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].referrer_id, referrer);
        assert_eq!(rewards[0].reward, Decimal::new(20, 0));
        assert_eq!(outbox.user_notifications().len(), 1);
        assert_eq!(outbox.admin_notifications()[0].permission, MLM_ADMIN_PERMISSION);
    }

    #[tokio::test]
    async fn test_disabled_feature_is_silent_noop() {
        let store = InMemoryStore::new();
        let (_, referred) = seed_direct_pair(&store, RewardType::Fixed, 5).await;
        let event = RewardEvent::new(referred, Decimal::new(200, 0), ConditionName::Deposit, "USDT");

        let settings = InMemorySettings::new().with(MLM_SYSTEM, "DIRECT");
        let (no_flag, _) = engine(&store, settings, &[Capability::Mlm]);
        assert!(!no_flag.process_rewards(&event).await);

        let settings = InMemorySettings::new()
            .with(REFERRAL_STATUS, "true")
            .with(MLM_SYSTEM, "DIRECT");
        let (no_extension, _) = engine(&store, settings, &[]);
        assert!(!no_extension.process_rewards(&event).await);

        assert!(store.snapshot().await.rewards.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_mode_and_bad_blob_fail_closed() {
        let store = InMemoryStore::new();
        let (_, referred) = seed_direct_pair(&store, RewardType::Fixed, 5).await;
        let event = RewardEvent::new(referred, Decimal::new(200, 0), ConditionName::Deposit, "USDT");

        let settings = InMemorySettings::new()
            .with(REFERRAL_STATUS, "true")
            .with(MLM_SYSTEM, "PYRAMID");
        let (engine_a, _) = engine(&store, settings, &[Capability::Mlm]);
        assert!(!engine_a.process_rewards(&event).await);

        let settings = InMemorySettings::new()
            .with(REFERRAL_STATUS, "true")
            .with(MLM_SYSTEM, "DIRECT")
            .with(MLM_SETTINGS, r#"{"constructor":{"prototype":{}}}"#);
        let (engine_b, _) = engine(&store, settings, &[Capability::Mlm]);
        assert!(!engine_b.process_rewards(&event).await);

        assert!(store.snapshot().await.rewards.is_empty());
    }

    #[tokio::test]
    async fn test_ineligible_event_writes_nothing() {
        let store = InMemoryStore::new();
        let (_, referred) = seed_direct_pair(&store, RewardType::Fixed, 5).await;
        let settings = InMemorySettings::new()
            .with(REFERRAL_STATUS, "true")
            .with(MLM_SYSTEM, "DIRECT");
        let (engine, _) = engine(&store, settings, &[Capability::Mlm]);

        let event = RewardEvent::new(referred, Decimal::ZERO, ConditionName::Deposit, "USDT");
        assert!(!engine.process_rewards(&event).await);

        // No WELCOME_BONUS condition row exists.
        let event = RewardEvent::new(referred, Decimal::new(100, 0), ConditionName::WelcomeBonus, "USDT");
        assert!(!engine.process_rewards(&event).await);
        assert!(store.snapshot().await.rewards.is_empty());
    }

    #[tokio::test]
    async fn test_tree_settings_over_cap_rejected() {
        let store = InMemoryStore::new();
        let (engine, _) = engine(&store, InMemorySettings::new(), &[Capability::Mlm]);
        let cond = condition(ConditionName::Trade, RewardType::Fixed, 100);
        let event = RewardEvent::new(Uuid::new_v4(), Decimal::new(10, 0), ConditionName::Trade, "USDT");
        let settings = json!({
            "levels": 2,
            "levelsPercentage": [{"level": 1, "value": 60}, {"level": 2, "value": 50}]
        });

        assert!(!engine.process_binary_rewards(&event, &cond, &settings).await);
        assert!(!engine.process_unilevel_rewards(&event, &cond, &settings).await);
        assert!(store.snapshot().await.rewards.is_empty());
    }
}
