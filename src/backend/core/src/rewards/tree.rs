//! Binary and unilevel trees: upline walks, level payouts and placement of
//! newly referred users.
//!
//! Each tree node points at the referral edge of the user it represents.
//! A user at the top of a tree is represented through an anchor edge
//! (`referrer_id == referred_id`) created the first time someone joins
//! under them.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use super::validation::LevelSettings;
use super::RewardEvent;
use crate::error::{ErrorCode, Result, SettlementError};
use crate::ledger::{
    BinarySide, IsolationLevel, LedgerStore, LedgerTx, ReferralCondition, ReferralEdge, ReferralStatus, RewardRecord,
    TreeKind, TreeNode,
};

/// A reward for the same upline and condition within this many seconds is a duplicate.
pub const DEDUPE_WINDOW_SECS: i64 = 60;

/// Upper bound on how far a cycle check climbs.
const MAX_ANCESTOR_WALK: usize = 10_000;

// ═══════════════════════════════════════════════════════════════════════════════
// Reward Distribution
// ═══════════════════════════════════════════════════════════════════════════════

/// Users above `user_id` in the tree, nearest first, at most `max_levels`.
///
/// The walk stops early at the root, or when a parent node or its referral
/// edge is missing.
pub async fn find_uplines(
    store: &dyn LedgerStore,
    kind: TreeKind,
    user_id: Uuid,
    max_levels: u8,
) -> Result<Vec<Uuid>> {
    let Some(mut current) = store.tree_node_for_user(kind, user_id).await? else {
        tracing::debug!(user_id = %user_id, kind = %kind, "User has no tree node");
        return Ok(Vec::new());
    };

    let mut uplines = Vec::with_capacity(max_levels as usize);
    let mut visited = HashSet::from([current.id]);

    while uplines.len() < max_levels as usize {
        let Some(parent_id) = current.parent_id else {
            break;
        };
        if !visited.insert(parent_id) {
            tracing::warn!(node_id = %parent_id, kind = %kind, "Cycle in upline chain");
            break;
        }
        let Some(parent) = store.tree_node(kind, parent_id).await? else {
            tracing::warn!(node_id = %current.id, parent_id = %parent_id, kind = %kind, "Upline chain broken: parent missing");
            break;
        };
        let Some(edge) = store.referral(parent.referral_id).await? else {
            tracing::warn!(node_id = %parent.id, referral_id = %parent.referral_id, "Upline chain broken: referral missing");
            break;
        };
        uplines.push(edge.referred_id);
        current = parent;
    }

    Ok(uplines)
}

/// Pay the uplines of `event.user_id`, farthest first. Level 1 is the
/// farthest upline reached by the walk.
pub(super) async fn distribute(
    store: &dyn LedgerStore,
    kind: TreeKind,
    event: &RewardEvent,
    condition: &ReferralCondition,
    levels: &LevelSettings,
) -> Result<Vec<RewardRecord>> {
    let uplines = find_uplines(store, kind, event.user_id, levels.levels).await?;
    if uplines.is_empty() {
        return Ok(Vec::new());
    }

    let base = condition.base_reward(event.amount);
    let since = Utc::now() - Duration::seconds(DEDUPE_WINDOW_SECS);
    let mut written = Vec::new();

    let mut tx = store.begin(IsolationLevel::Serializable).await?;
    for (index, upline) in uplines.iter().rev().enumerate() {
        let level = (index + 1) as u8;
        let Some(percentage) = levels.percentage_for(level) else {
            continue;
        };
        let reward = base * percentage / Decimal::ONE_HUNDRED;
        if reward <= Decimal::ZERO {
            continue;
        }
        if tx.reward_exists(*upline, condition.id, Some(since), None).await? {
            tracing::info!(referrer_id = %upline, level, condition = %condition.name, "Duplicate tree reward suppressed");
            continue;
        }

        let record = RewardRecord::new(*upline, condition.id, reward, event.source_id.clone());
        tx.insert_reward(&record).await?;
        written.push(record);
    }

    if written.is_empty() {
        tx.rollback().await?;
    } else {
        tx.commit().await?;
    }
    Ok(written)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registration
// ═══════════════════════════════════════════════════════════════════════════════

/// Create the referral edge for a new sign-up and, when `kind` is set,
/// place the new user in that tree. Everything happens in one transaction.
pub(super) async fn register_referral(
    store: &dyn LedgerStore,
    referrer_id: Uuid,
    referred_id: Uuid,
    kind: Option<TreeKind>,
    approval_required: bool,
) -> Result<ReferralEdge> {
    if referrer_id == referred_id {
        return Err(SettlementError::new(ErrorCode::SelfReferral, "Users cannot refer themselves"));
    }
    let status = if approval_required {
        ReferralStatus::Pending
    } else {
        ReferralStatus::Active
    };

    let mut tx = store.begin(IsolationLevel::Serializable).await?;
    if tx.referral_for_referred(referred_id).await?.is_some() {
        tx.rollback().await?;
        return Err(SettlementError::new(
            ErrorCode::DuplicateRecord,
            format!("User {} already has a referrer", referred_id),
        ));
    }

    let edge = ReferralEdge::new(referrer_id, referred_id, status);

    if let Some(kind) = kind {
        let anchor = referrer_node(tx.as_mut(), kind, referrer_id).await?;

        if let Err(err) = ensure_no_cycle(tx.as_mut(), kind, &anchor, referrer_id, referred_id).await {
            tx.rollback().await?;
            return Err(err);
        }

        tx.insert_referral(&edge).await?;
        match kind {
            TreeKind::Binary => {
                let (parent, side) = binary_slot(tx.as_mut(), &anchor).await?;
                let node = TreeNode::new(kind, edge.id, Some(parent.id));
                tx.insert_tree_node(&node).await?;
                tx.set_binary_child(parent.id, side, node.id).await?;
                tracing::debug!(node_id = %node.id, parent_id = %parent.id, side = ?side, "Placed binary node");
            }
            TreeKind::Unilevel => {
                let node = TreeNode::new(kind, edge.id, Some(anchor.id));
                tx.insert_tree_node(&node).await?;
            }
        }
    } else {
        tx.insert_referral(&edge).await?;
    }

    tx.commit().await?;
    tracing::info!(
        referral_id = %edge.id,
        referrer_id = %referrer_id,
        referred_id = %referred_id,
        status = %edge.status,
        tree = ?kind,
        "Referral registered"
    );
    Ok(edge)
}

/// The referrer's node, locked. Created as a root with an anchor edge when
/// the referrer is not yet in the tree.
async fn referrer_node(tx: &mut dyn LedgerTx, kind: TreeKind, referrer_id: Uuid) -> Result<TreeNode> {
    if let Some(node) = tx.lock_tree_node_for_user(kind, referrer_id).await? {
        return Ok(node);
    }
    let anchor = ReferralEdge::new(referrer_id, referrer_id, ReferralStatus::Active);
    tx.insert_referral(&anchor).await?;
    let root = TreeNode::new(kind, anchor.id, None);
    tx.insert_tree_node(&root).await?;
    tracing::debug!(referrer_id = %referrer_id, node_id = %root.id, kind = %kind, "Created root node");
    Ok(root)
}

/// Fails when `referred_id` already sits at or above the referrer's node.
async fn ensure_no_cycle(
    tx: &mut dyn LedgerTx,
    kind: TreeKind,
    start: &TreeNode,
    referrer_id: Uuid,
    referred_id: Uuid,
) -> Result<()> {
    let mut visited = HashSet::new();
    let mut current = Some(start.clone());

    while let Some(node) = current {
        if !visited.insert(node.id) || visited.len() > MAX_ANCESTOR_WALK {
            return Err(SettlementError::referral_loop(referrer_id, referred_id));
        }
        if let Some(edge) = tx.referral(node.referral_id).await? {
            if edge.referred_id == referred_id {
                tracing::warn!(referrer_id = %referrer_id, referred_id = %referred_id, "Referral loop detected");
                return Err(SettlementError::referral_loop(referrer_id, referred_id));
            }
        }
        current = match node.parent_id {
            Some(parent_id) => tx.tree_node(kind, parent_id).await?,
            None => None,
        };
    }
    Ok(())
}

/// First node with a free slot, breadth-first from `start`, left before right.
async fn binary_slot(tx: &mut dyn LedgerTx, start: &TreeNode) -> Result<(TreeNode, BinarySide)> {
    if let Some(side) = start.free_side() {
        return Ok((start.clone(), side));
    }

    let mut queue: VecDeque<Uuid> = [start.left_child_id, start.right_child_id].into_iter().flatten().collect();
    let mut visited = HashSet::from([start.id]);

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let Some(node) = tx.lock_tree_node(TreeKind::Binary, id).await? else {
            tracing::warn!(node_id = %id, "Binary child pointer to missing node");
            continue;
        };
        if let Some(side) = node.free_side() {
            return Ok((node, side));
        }
        queue.extend([node.left_child_id, node.right_child_id].into_iter().flatten());
    }

    Err(SettlementError::internal(format!(
        "no free binary slot below node {}",
        start.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryStore;

    #[tokio::test]
    async fn test_unilevel_registration_and_uplines() {
        let store = InMemoryStore::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        register_referral(&store, a, b, Some(TreeKind::Unilevel), false).await.unwrap();
        register_referral(&store, b, c, Some(TreeKind::Unilevel), false).await.unwrap();

        let state = store.snapshot().await;
        // Two real edges plus a's anchor.
        assert_eq!(state.referrals.len(), 3);
        assert_eq!(state.tree_nodes.len(), 3);

        let uplines = find_uplines(&store, TreeKind::Unilevel, c, 7).await.unwrap();
        assert_eq!(uplines, vec![b, a]);
        let capped = find_uplines(&store, TreeKind::Unilevel, c, 1).await.unwrap();
        assert_eq!(capped, vec![b]);
    }

    #[tokio::test]
    async fn test_binary_spillover_is_breadth_first() {
        let store = InMemoryStore::new();
        let root = Uuid::new_v4();
        let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for user in &users {
            register_referral(&store, root, *user, Some(TreeKind::Binary), false)
                .await
                .unwrap();
        }

        let state = store.snapshot().await;
        let node_of = |user: Uuid| {
            let edge = state.referrals.iter().find(|r| r.referred_id == user).unwrap();
            state.tree_nodes.iter().find(|n| n.referral_id == edge.id).unwrap().clone()
        };
        let root_node = node_of(root);
        let left = node_of(users[0]);
        assert_eq!(root_node.left_child_id, Some(left.id));
        assert_eq!(root_node.right_child_id, Some(node_of(users[1]).id));
        // Third user spills under the root's left child.
        let spilled = node_of(users[2]);
        assert_eq!(spilled.parent_id, Some(left.id));
        assert_eq!(node_of(users[0]).left_child_id, Some(spilled.id));
    }

    #[tokio::test]
    async fn test_self_and_duplicate_referral_rejected() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let err = register_referral(&store, a, a, None, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SelfReferral);

        let edge = register_referral(&store, a, b, None, true).await.unwrap();
        assert_eq!(edge.status, ReferralStatus::Pending);
        let err = register_referral(&store, Uuid::new_v4(), b, None, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
        assert_eq!(store.snapshot().await.referrals.len(), 1);
        assert!(store.snapshot().await.tree_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_broken_chain_stops_walk() {
        let store = InMemoryStore::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        register_referral(&store, a, b, Some(TreeKind::Unilevel), false).await.unwrap();
        register_referral(&store, b, c, Some(TreeKind::Unilevel), false).await.unwrap();

        // Drop a's root node: b's parent pointer now dangles.
        store
            .seed(|s| s.tree_nodes.retain(|n| n.parent_id.is_some()))
            .await;
        let uplines = find_uplines(&store, TreeKind::Unilevel, c, 7).await.unwrap();
        assert_eq!(uplines, vec![b]);
    }
}
