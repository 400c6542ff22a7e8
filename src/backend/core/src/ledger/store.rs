//! Repository interfaces the settlement engine depends on.
//!
//! [`LedgerStore`] covers batch reads and single-statement writes;
//! everything that mutates money goes through a [`LedgerTx`] obtained from
//! [`LedgerStore::begin`]. A transaction that is dropped without `commit`
//! rolls back.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Row-lock behavior when the row is already locked elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the other transaction finishes.
    Wait,
    /// Treat the row as absent.
    SkipLocked,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn LedgerTx>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Users & Wallets
    // ─────────────────────────────────────────────────────────────────────────

    async fn user(&self, id: Uuid) -> Result<Option<User>>;

    async fn active_users(&self) -> Result<Vec<User>>;

    async fn user_wallets(&self, user_id: Uuid) -> Result<Vec<Wallet>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Investments & Staking
    // ─────────────────────────────────────────────────────────────────────────

    /// ACTIVE rows of one investment table, oldest first.
    async fn active_investments(&self, kind: InvestmentKind) -> Result<Vec<Investment>>;

    async fn staking_pool(&self, id: Uuid) -> Result<Option<StakingPool>>;

    /// ACTIVE positions whose end date is at or before `now`, soonest first.
    async fn matured_staking_positions(&self, now: DateTime<Utc>) -> Result<Vec<StakingPosition>>;

    /// ACTIVE positions that ended before `cutoff`.
    async fn count_overdue_staking_positions(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────────

    /// PENDING rows of `kind` created at or after `since`, oldest first.
    async fn pending_transactions(
        &self,
        kind: TransactionType,
        since: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Prices
    // ─────────────────────────────────────────────────────────────────────────

    /// Fiat currency → units per one base-currency unit, as published by
    /// the rate providers.
    async fn fiat_currency_rates(&self) -> Result<HashMap<String, Decimal>>;

    /// Exchange (spot) currency → price in the base currency.
    async fn exchange_currency_prices(&self) -> Result<HashMap<String, Decimal>>;

    async fn known_fiat_currencies(&self) -> Result<Vec<String>>;

    /// Persist rates for currencies that already exist. Returns rows updated.
    async fn update_fiat_rates(&self, rates: &HashMap<String, Decimal>) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // PnL
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace the user's snapshot for `day`.
    async fn upsert_pnl_snapshot(&self, user_id: Uuid, day: NaiveDate, balances: PnlBalances) -> Result<()>;

    async fn delete_pnl_snapshots_before(&self, day: NaiveDate) -> Result<u64>;

    async fn delete_zero_pnl_snapshots_before(&self, day: NaiveDate) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // ICO & User Blocks
    // ─────────────────────────────────────────────────────────────────────────

    async fn ico_offerings(&self, statuses: &[IcoStatus]) -> Result<Vec<IcoOffering>>;

    async fn set_ico_status(&self, id: Uuid, status: IcoStatus) -> Result<()>;

    /// Active temporary blocks whose `blocked_until` has passed.
    async fn expired_user_blocks(&self, now: DateTime<Utc>) -> Result<Vec<UserBlock>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Referrals
    // ─────────────────────────────────────────────────────────────────────────

    /// The edge that introduced `user_id` (anchors excluded).
    async fn referral_by_referred(&self, user_id: Uuid) -> Result<Option<ReferralEdge>>;

    async fn referral(&self, id: Uuid) -> Result<Option<ReferralEdge>>;

    /// Active condition by name.
    async fn referral_condition(&self, name: ConditionName) -> Result<Option<ReferralCondition>>;

    /// The tree node whose referral edge has `referred_id == user_id`.
    async fn tree_node_for_user(&self, kind: TreeKind, user_id: Uuid) -> Result<Option<TreeNode>>;

    async fn tree_node(&self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Mail Campaigns
    // ─────────────────────────────────────────────────────────────────────────

    async fn active_campaigns(&self) -> Result<Vec<MailCampaign>>;

    async fn pending_campaign_targets(&self, campaign_id: Uuid, limit: u32) -> Result<Vec<MailTarget>>;

    async fn set_campaign_target_status(&self, id: Uuid, status: TargetStatus) -> Result<()>;

    async fn set_campaign_status(&self, id: Uuid, status: CampaignStatus) -> Result<()>;
}

/// An open store transaction.
#[async_trait]
pub trait LedgerTx: Send {
    // ─────────────────────────────────────────────────────────────────────────
    // Wallets & Transactions
    // ─────────────────────────────────────────────────────────────────────────

    async fn lock_wallet(
        &mut self,
        user_id: Uuid,
        wallet_type: WalletType,
        currency: &str,
    ) -> Result<Option<Wallet>>;

    async fn lock_wallet_by_id(&mut self, id: Uuid) -> Result<Option<Wallet>>;

    async fn update_wallet_balance(&mut self, id: Uuid, balance: Decimal) -> Result<()>;

    async fn insert_transaction(&mut self, transaction: &LedgerTransaction) -> Result<()>;

    async fn lock_transaction(&mut self, id: Uuid) -> Result<Option<LedgerTransaction>>;

    async fn set_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Investments & Staking
    // ─────────────────────────────────────────────────────────────────────────

    async fn lock_investment(&mut self, kind: InvestmentKind, id: Uuid) -> Result<Option<Investment>>;

    async fn set_investment_status(
        &mut self,
        kind: InvestmentKind,
        id: Uuid,
        status: InvestmentStatus,
        failure_reason: Option<String>,
    ) -> Result<()>;

    async fn lock_staking_position(&mut self, id: Uuid, mode: LockMode) -> Result<Option<StakingPosition>>;

    async fn update_staking_position(&mut self, position: &StakingPosition) -> Result<()>;

    async fn insert_staking_earning(&mut self, earning: &StakingEarning) -> Result<()>;

    async fn insert_admin_earning(&mut self, earning: &AdminEarning) -> Result<()>;

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Referrals & Rewards
    // ─────────────────────────────────────────────────────────────────────────

    /// The edge that introduced `user_id` (anchors excluded).
    async fn referral_for_referred(&mut self, user_id: Uuid) -> Result<Option<ReferralEdge>>;

    async fn referral(&mut self, id: Uuid) -> Result<Option<ReferralEdge>>;

    async fn insert_referral(&mut self, edge: &ReferralEdge) -> Result<()>;

    async fn lock_tree_node_for_user(&mut self, kind: TreeKind, user_id: Uuid) -> Result<Option<TreeNode>>;

    async fn lock_tree_node(&mut self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>>;

    /// Read a node without locking it.
    async fn tree_node(&mut self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>>;

    async fn insert_tree_node(&mut self, node: &TreeNode) -> Result<()>;

    async fn set_binary_child(&mut self, parent_id: Uuid, side: BinarySide, child_id: Uuid) -> Result<()>;

    /// Whether a reward exists for `(referrer, condition)`, optionally
    /// restricted to rows created at or after `since` and to one source id.
    async fn reward_exists(
        &mut self,
        referrer_id: Uuid,
        condition_id: Uuid,
        since: Option<DateTime<Utc>>,
        source_id: Option<&str>,
    ) -> Result<bool>;

    async fn insert_reward(&mut self, reward: &RewardRecord) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // User Blocks
    // ─────────────────────────────────────────────────────────────────────────

    async fn deactivate_block(&mut self, id: Uuid) -> Result<()>;

    async fn count_active_blocks(&mut self, user_id: Uuid) -> Result<u64>;

    async fn set_user_status(&mut self, user_id: Uuid, status: UserStatus) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Completion
    // ─────────────────────────────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
