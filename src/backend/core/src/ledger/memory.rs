//! In-memory ledger for tests and local runs.
//!
//! All state sits behind one async mutex. A transaction takes the mutex for
//! its whole lifetime and works on a copy, so transactions are serializable
//! and a dropped transaction leaves no trace. Do not call [`LedgerStore`]
//! methods on the same store while holding one of its transactions: the
//! call waits for the transaction to finish and never returns.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::*;
use super::store::{IsolationLevel, LedgerStore, LedgerTx, LockMode};
use crate::error::{ErrorCode, Result, SettlementError};

/// Everything the in-memory store holds. Fields are public so tests can
/// seed and inspect state directly.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub users: HashMap<Uuid, User>,
    pub wallets: HashMap<Uuid, Wallet>,
    pub transactions: Vec<LedgerTransaction>,
    pub investments: HashMap<Uuid, Investment>,
    pub pools: HashMap<Uuid, StakingPool>,
    pub positions: HashMap<Uuid, StakingPosition>,
    pub staking_earnings: Vec<StakingEarning>,
    pub admin_earnings: Vec<AdminEarning>,
    pub audit: Vec<AuditEntry>,
    pub referrals: Vec<ReferralEdge>,
    pub tree_nodes: Vec<TreeNode>,
    pub conditions: Vec<ReferralCondition>,
    pub rewards: Vec<RewardRecord>,
    pub pnl: Vec<PnlSnapshot>,
    pub fiat_rates: HashMap<String, Decimal>,
    pub exchange_prices: HashMap<String, Decimal>,
    pub icos: HashMap<Uuid, IcoOffering>,
    pub blocks: HashMap<Uuid, UserBlock>,
    pub campaigns: HashMap<Uuid, MailCampaign>,
    pub targets: Vec<MailTarget>,
}

impl MemoryState {
    fn tree_node_for_user(&self, kind: TreeKind, user_id: Uuid) -> Option<TreeNode> {
        self.tree_nodes
            .iter()
            .filter(|n| n.kind == kind)
            .find(|n| {
                self.referrals
                    .iter()
                    .any(|r| r.id == n.referral_id && r.referred_id == user_id)
            })
            .cloned()
    }

    fn referral_by_referred(&self, user_id: Uuid) -> Option<ReferralEdge> {
        self.referrals
            .iter()
            .find(|r| r.referred_id == user_id && !r.is_anchor())
            .cloned()
    }

    fn wallet_mut(&mut self, id: Uuid) -> Result<&mut Wallet> {
        self.wallets
            .get_mut(&id)
            .ok_or_else(|| SettlementError::not_found("Wallet", id))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    conflicts: Arc<AtomicU32>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MemoryState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            conflicts: Arc::default(),
        }
    }

    /// Fail the next `count` calls to `begin` with a serialization conflict,
    /// the way a contended SERIALIZABLE transaction fails in Postgres.
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// Mutate state outside any transaction.
    pub async fn seed<F>(&self, f: F)
    where
        F: FnOnce(&mut MemoryState),
    {
        f(&mut *self.state.lock().await);
    }

    /// Copy of the current committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn LedgerTx>> {
        let conflicted = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(SettlementError::new(
                ErrorCode::TransactionConflict,
                "Concurrent update conflict",
            ));
        }
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        tracing::trace!(isolation = isolation.as_sql(), "In-memory transaction started");
        Ok(Box::new(MemoryTx { guard, work }))
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn active_users(&self) -> Result<Vec<User>> {
        let state = self.state.lock().await;
        let mut users: Vec<User> = state
            .users
            .values()
            .filter(|u| u.status == UserStatus::Active)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn user_wallets(&self, user_id: Uuid) -> Result<Vec<Wallet>> {
        let state = self.state.lock().await;
        Ok(state.wallets.values().filter(|w| w.user_id == user_id).cloned().collect())
    }

    async fn active_investments(&self, kind: InvestmentKind) -> Result<Vec<Investment>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Investment> = state
            .investments
            .values()
            .filter(|i| i.kind == kind && i.status == InvestmentStatus::Active)
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.created_at);
        Ok(rows)
    }

    async fn staking_pool(&self, id: Uuid) -> Result<Option<StakingPool>> {
        Ok(self.state.lock().await.pools.get(&id).cloned())
    }

    async fn matured_staking_positions(&self, now: DateTime<Utc>) -> Result<Vec<StakingPosition>> {
        let state = self.state.lock().await;
        let mut rows: Vec<StakingPosition> = state
            .positions
            .values()
            .filter(|p| p.status == StakingStatus::Active && p.end_date <= now)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.end_date);
        Ok(rows)
    }

    async fn count_overdue_staking_positions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .positions
            .values()
            .filter(|p| p.status == StakingStatus::Active && p.end_date < cutoff)
            .count() as u64)
    }

    async fn pending_transactions(
        &self,
        kind: TransactionType,
        since: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<LedgerTransaction> = state
            .transactions
            .iter()
            .filter(|t| t.kind == kind && t.status == TransactionStatus::Pending && t.created_at >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn fiat_currency_rates(&self) -> Result<HashMap<String, Decimal>> {
        Ok(self.state.lock().await.fiat_rates.clone())
    }

    async fn exchange_currency_prices(&self) -> Result<HashMap<String, Decimal>> {
        Ok(self.state.lock().await.exchange_prices.clone())
    }

    async fn known_fiat_currencies(&self) -> Result<Vec<String>> {
        let mut currencies: Vec<String> = self.state.lock().await.fiat_rates.keys().cloned().collect();
        currencies.sort();
        Ok(currencies)
    }

    async fn update_fiat_rates(&self, rates: &HashMap<String, Decimal>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for (currency, rate) in rates {
            if let Some(existing) = state.fiat_rates.get_mut(currency) {
                *existing = *rate;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn upsert_pnl_snapshot(&self, user_id: Uuid, day: NaiveDate, balances: PnlBalances) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.pnl.iter_mut().find(|s| s.user_id == user_id && s.day == day) {
            Some(existing) => existing.balances = balances,
            None => state.pnl.push(PnlSnapshot {
                id: Uuid::new_v4(),
                user_id,
                day,
                balances,
                created_at: Utc::now(),
            }),
        }
        Ok(())
    }

    async fn delete_pnl_snapshots_before(&self, day: NaiveDate) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.pnl.len();
        state.pnl.retain(|s| s.day >= day);
        Ok((before - state.pnl.len()) as u64)
    }

    async fn delete_zero_pnl_snapshots_before(&self, day: NaiveDate) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.pnl.len();
        state.pnl.retain(|s| !(s.day < day && s.balances.is_zero()));
        Ok((before - state.pnl.len()) as u64)
    }

    async fn ico_offerings(&self, statuses: &[IcoStatus]) -> Result<Vec<IcoOffering>> {
        let state = self.state.lock().await;
        let mut rows: Vec<IcoOffering> = state
            .icos
            .values()
            .filter(|o| statuses.contains(&o.status))
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.start_date);
        Ok(rows)
    }

    async fn set_ico_status(&self, id: Uuid, status: IcoStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let offering = state
            .icos
            .get_mut(&id)
            .ok_or_else(|| SettlementError::not_found("IcoOffering", id))?;
        offering.status = status;
        Ok(())
    }

    async fn expired_user_blocks(&self, now: DateTime<Utc>) -> Result<Vec<UserBlock>> {
        let state = self.state.lock().await;
        Ok(state
            .blocks
            .values()
            .filter(|b| b.is_active && b.is_temporary && b.blocked_until.is_some_and(|until| until <= now))
            .cloned()
            .collect())
    }

    async fn referral_by_referred(&self, user_id: Uuid) -> Result<Option<ReferralEdge>> {
        Ok(self.state.lock().await.referral_by_referred(user_id))
    }

    async fn referral(&self, id: Uuid) -> Result<Option<ReferralEdge>> {
        Ok(self.state.lock().await.referrals.iter().find(|r| r.id == id).cloned())
    }

    async fn referral_condition(&self, name: ConditionName) -> Result<Option<ReferralCondition>> {
        let state = self.state.lock().await;
        Ok(state.conditions.iter().find(|c| c.name == name && c.status).cloned())
    }

    async fn tree_node_for_user(&self, kind: TreeKind, user_id: Uuid) -> Result<Option<TreeNode>> {
        Ok(self.state.lock().await.tree_node_for_user(kind, user_id))
    }

    async fn tree_node(&self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>> {
        let state = self.state.lock().await;
        Ok(state.tree_nodes.iter().find(|n| n.kind == kind && n.id == id).cloned())
    }

    async fn active_campaigns(&self) -> Result<Vec<MailCampaign>> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Active)
            .cloned()
            .collect())
    }

    async fn pending_campaign_targets(&self, campaign_id: Uuid, limit: u32) -> Result<Vec<MailTarget>> {
        let state = self.state.lock().await;
        Ok(state
            .targets
            .iter()
            .filter(|t| t.campaign_id == campaign_id && t.status == TargetStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn set_campaign_target_status(&self, id: Uuid, status: TargetStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let target = state
            .targets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| SettlementError::not_found("MailTarget", id))?;
        target.status = status;
        Ok(())
    }

    async fn set_campaign_status(&self, id: Uuid, status: CampaignStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| SettlementError::not_found("MailCampaign", id))?;
        campaign.status = status;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transaction
// ═══════════════════════════════════════════════════════════════════════════════

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_wallet(
        &mut self,
        user_id: Uuid,
        wallet_type: WalletType,
        currency: &str,
    ) -> Result<Option<Wallet>> {
        Ok(self
            .work
            .wallets
            .values()
            .find(|w| w.user_id == user_id && w.wallet_type == wallet_type && w.currency == currency)
            .cloned())
    }

    async fn lock_wallet_by_id(&mut self, id: Uuid) -> Result<Option<Wallet>> {
        Ok(self.work.wallets.get(&id).cloned())
    }

    async fn update_wallet_balance(&mut self, id: Uuid, balance: Decimal) -> Result<()> {
        self.work.wallet_mut(id)?.balance = balance;
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &LedgerTransaction) -> Result<()> {
        self.work.transactions.push(transaction.clone());
        Ok(())
    }

    async fn lock_transaction(&mut self, id: Uuid) -> Result<Option<LedgerTransaction>> {
        Ok(self.work.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn set_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let row = self
            .work
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| SettlementError::not_found("Transaction", id))?;
        row.status = status;
        if let Some(metadata) = metadata {
            row.metadata = metadata;
        }
        Ok(())
    }

    async fn lock_investment(&mut self, kind: InvestmentKind, id: Uuid) -> Result<Option<Investment>> {
        Ok(self.work.investments.get(&id).filter(|i| i.kind == kind).cloned())
    }

    async fn set_investment_status(
        &mut self,
        kind: InvestmentKind,
        id: Uuid,
        status: InvestmentStatus,
        failure_reason: Option<String>,
    ) -> Result<()> {
        let row = self
            .work
            .investments
            .get_mut(&id)
            .filter(|i| i.kind == kind)
            .ok_or_else(|| SettlementError::not_found("Investment", id))?;
        row.status = status;
        if failure_reason.is_some() {
            row.failure_reason = failure_reason;
        }
        Ok(())
    }

    async fn lock_staking_position(&mut self, id: Uuid, _mode: LockMode) -> Result<Option<StakingPosition>> {
        Ok(self.work.positions.get(&id).cloned())
    }

    async fn update_staking_position(&mut self, position: &StakingPosition) -> Result<()> {
        let row = self
            .work
            .positions
            .get_mut(&position.id)
            .ok_or_else(|| SettlementError::not_found("StakingPosition", position.id))?;
        *row = position.clone();
        Ok(())
    }

    async fn insert_staking_earning(&mut self, earning: &StakingEarning) -> Result<()> {
        self.work.staking_earnings.push(earning.clone());
        Ok(())
    }

    async fn insert_admin_earning(&mut self, earning: &AdminEarning) -> Result<()> {
        self.work.admin_earnings.push(earning.clone());
        Ok(())
    }

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        self.work.audit.push(entry.clone());
        Ok(())
    }

    async fn referral_for_referred(&mut self, user_id: Uuid) -> Result<Option<ReferralEdge>> {
        Ok(self.work.referral_by_referred(user_id))
    }

    async fn referral(&mut self, id: Uuid) -> Result<Option<ReferralEdge>> {
        Ok(self.work.referrals.iter().find(|r| r.id == id).cloned())
    }

    async fn insert_referral(&mut self, edge: &ReferralEdge) -> Result<()> {
        self.work.referrals.push(edge.clone());
        Ok(())
    }

    async fn lock_tree_node_for_user(&mut self, kind: TreeKind, user_id: Uuid) -> Result<Option<TreeNode>> {
        Ok(self.work.tree_node_for_user(kind, user_id))
    }

    async fn lock_tree_node(&mut self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>> {
        Ok(self.work.tree_nodes.iter().find(|n| n.kind == kind && n.id == id).cloned())
    }

    async fn tree_node(&mut self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>> {
        self.lock_tree_node(kind, id).await
    }

    async fn insert_tree_node(&mut self, node: &TreeNode) -> Result<()> {
        self.work.tree_nodes.push(node.clone());
        Ok(())
    }

    async fn set_binary_child(&mut self, parent_id: Uuid, side: BinarySide, child_id: Uuid) -> Result<()> {
        let parent = self
            .work
            .tree_nodes
            .iter_mut()
            .find(|n| n.kind == TreeKind::Binary && n.id == parent_id)
            .ok_or_else(|| SettlementError::not_found("BinaryNode", parent_id))?;
        match side {
            BinarySide::Left => parent.left_child_id = Some(child_id),
            BinarySide::Right => parent.right_child_id = Some(child_id),
        }
        Ok(())
    }

    async fn reward_exists(
        &mut self,
        referrer_id: Uuid,
        condition_id: Uuid,
        since: Option<DateTime<Utc>>,
        source_id: Option<&str>,
    ) -> Result<bool> {
        Ok(self.work.rewards.iter().any(|r| {
            r.referrer_id == referrer_id
                && r.condition_id == condition_id
                && since.map_or(true, |since| r.created_at >= since)
                && source_id.map_or(true, |source| r.source_id.as_deref() == Some(source))
        }))
    }

    async fn insert_reward(&mut self, reward: &RewardRecord) -> Result<()> {
        self.work.rewards.push(reward.clone());
        Ok(())
    }

    async fn deactivate_block(&mut self, id: Uuid) -> Result<()> {
        let block = self
            .work
            .blocks
            .get_mut(&id)
            .ok_or_else(|| SettlementError::not_found("UserBlock", id))?;
        block.is_active = false;
        Ok(())
    }

    async fn count_active_blocks(&mut self, user_id: Uuid) -> Result<u64> {
        Ok(self
            .work
            .blocks
            .values()
            .filter(|b| b.user_id == user_id && b.is_active)
            .count() as u64)
    }

    async fn set_user_status(&mut self, user_id: Uuid, status: UserStatus) -> Result<()> {
        let user = self
            .work
            .users
            .get_mut(&user_id)
            .ok_or_else(|| SettlementError::not_found("User", user_id))?;
        user.status = status;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let user = User::new("a@example.com", "A", "B");
        let wallet = Wallet::new(user.id, WalletType::Spot, "USDT", Decimal::new(10, 0));
        let wallet_id = wallet.id;
        store
            .seed(|s| {
                s.wallets.insert(wallet.id, wallet);
            })
            .await;

        {
            let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
            tx.update_wallet_balance(wallet_id, Decimal::new(99, 0)).await.unwrap();
        }
        assert_eq!(store.snapshot().await.wallets[&wallet_id].balance, Decimal::new(10, 0));

        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        tx.update_wallet_balance(wallet_id, Decimal::new(99, 0)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().await.wallets[&wallet_id].balance, Decimal::new(99, 0));
    }

    #[tokio::test]
    async fn test_zero_snapshot_cleanup_keeps_recent_and_nonzero() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let today = Utc::now().date_naive();
        let old = today - chrono::Duration::days(3);

        store.upsert_pnl_snapshot(user, old, PnlBalances::default()).await.unwrap();
        store
            .upsert_pnl_snapshot(
                user,
                old - chrono::Duration::days(1),
                PnlBalances { spot: Decimal::ONE, ..Default::default() },
            )
            .await
            .unwrap();
        store.upsert_pnl_snapshot(user, today, PnlBalances::default()).await.unwrap();
        // Same day replaces rather than duplicates.
        store.upsert_pnl_snapshot(user, today, PnlBalances::default()).await.unwrap();

        let removed = store
            .delete_zero_pnl_snapshots_before(today - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.snapshot().await.pnl.len(), 2);
    }
}
