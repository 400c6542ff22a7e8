//! Ledger entities touched by the settlement engine.
//!
//! Every status/kind column is a closed enum stored as its upper-case
//! string (`ACTIVE`, `COMPLETED`, ...). Monetary amounts are `Decimal`.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, SettlementError};

/// Declares a column enum with `as_str`, `Display` and `FromStr` over the
/// stored string form.
macro_rules! column_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = SettlementError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SettlementError::new(
                        ErrorCode::DeserializationError,
                        format!("Unknown {} value: {}", stringify!($name), other),
                    )),
                }
            }
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Wallets & Transactions
// ═══════════════════════════════════════════════════════════════════════════════

column_enum!(WalletType {
    Fiat => "FIAT",
    Spot => "SPOT",
    Eco => "ECO",
    Futures => "FUTURES",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub wallet_type: WalletType,
    pub currency: String,
    pub balance: Decimal,
    pub in_order: Decimal,
}

impl Wallet {
    pub fn new(user_id: Uuid, wallet_type: WalletType, currency: &str, balance: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            wallet_type,
            currency: currency.to_string(),
            balance,
            in_order: Decimal::ZERO,
        }
    }
}

column_enum!(TransactionType {
    Deposit => "DEPOSIT",
    Withdraw => "WITHDRAW",
    InvestmentRoi => "INVESTMENT_ROI",
    ForexInvestmentRoi => "FOREX_INVESTMENT_ROI",
    AiInvestmentRoi => "AI_INVESTMENT_ROI",
    StakingReward => "STAKING_REWARD",
    ReferralReward => "REFERRAL_REWARD",
});

column_enum!(TransactionStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
    Rejected => "REJECTED",
});

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A row of the transaction ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub kind: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub fee: Decimal,
    pub description: String,
    /// External reference id (exchange withdrawal/deposit id) or the id of
    /// the entity this row settles.
    pub reference_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn new(wallet: &Wallet, kind: TransactionType, amount: Decimal, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: wallet.user_id,
            wallet_id: wallet.id,
            kind,
            status: TransactionStatus::Completed,
            amount,
            fee: Decimal::ZERO,
            description: description.into(),
            reference_id: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_id = Some(reference.into());
        self
    }

    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Currency recorded in metadata, used by reconciliation.
    pub fn currency(&self) -> Option<&str> {
        self.metadata.get("currency").and_then(|v| v.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Investments
// ═══════════════════════════════════════════════════════════════════════════════

column_enum!(
    /// Which investment table a row lives in.
    InvestmentKind {
        General => "GENERAL",
        Forex => "FOREX",
        Ai => "AI",
    }
);

impl InvestmentKind {
    /// Ledger transaction type written when a row settles.
    pub fn roi_transaction(&self) -> TransactionType {
        match self {
            Self::General => TransactionType::InvestmentRoi,
            Self::Forex => TransactionType::ForexInvestmentRoi,
            Self::Ai => TransactionType::AiInvestmentRoi,
        }
    }
}

column_enum!(InvestmentResult {
    Win => "WIN",
    Loss => "LOSS",
    Draw => "DRAW",
});

column_enum!(InvestmentStatus {
    Active => "ACTIVE",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
    Rejected => "REJECTED",
});

column_enum!(Timeframe {
    Hour => "HOUR",
    Day => "DAY",
    Week => "WEEK",
    Month => "MONTH",
});

impl Timeframe {
    pub fn unit(&self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
            Self::Month => Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentDuration {
    pub duration: i64,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub id: Uuid,
    pub kind: InvestmentKind,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub plan_title: String,
    pub wallet_type: WalletType,
    pub currency: String,
    pub amount: Decimal,
    pub profit: Decimal,
    pub result: Option<InvestmentResult>,
    pub status: InvestmentStatus,
    pub duration: InvestmentDuration,
    pub created_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl Investment {
    /// Maturity date, or `None` when the stored term is negative or does not
    /// fit the calendar.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        let count = i32::try_from(self.duration.duration).ok().filter(|n| *n >= 0)?;
        let term = self.duration.timeframe.unit().checked_mul(count)?;
        self.created_at.checked_add_signed(term)
    }

    /// `None` for rows whose maturity date cannot be computed.
    pub fn is_matured(&self, now: DateTime<Utc>) -> Option<bool> {
        self.end_date().map(|end| end <= now)
    }

    /// Amount credited back to the wallet on settlement, `None` on overflow.
    ///
    /// WIN pays principal plus profit, LOSS returns what is left of the
    /// principal after the loss (never negative), DRAW or a missing result
    /// returns the principal.
    pub fn settlement_amount(&self) -> Option<Decimal> {
        match self.result {
            Some(InvestmentResult::Win) => self.amount.checked_add(self.profit),
            Some(InvestmentResult::Loss) => self
                .amount
                .checked_sub(self.profit)
                .map(|left| left.max(Decimal::ZERO)),
            Some(InvestmentResult::Draw) | None => Some(self.amount),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Staking
// ═══════════════════════════════════════════════════════════════════════════════

column_enum!(StakingStatus {
    Active => "ACTIVE",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

column_enum!(AprMethod {
    Simple => "SIMPLE",
    Compound => "COMPOUND",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingPool {
    pub id: Uuid,
    pub name: String,
    pub symbol: String,
    pub wallet_type: WalletType,
    /// Annual percentage rate, `12` meaning 12%.
    pub apr: Decimal,
    /// Falls back to the `stakingDefaultAprCalculationMethod` setting.
    pub apr_method: Option<AprMethod>,
    pub compound_frequency: Option<u32>,
    pub admin_fee_percentage: Decimal,
    pub auto_compound: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingPosition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pool_id: Uuid,
    pub amount: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: StakingStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StakingPosition {
    pub fn days_staked(&self) -> i64 {
        (self.end_date - self.start_date).num_days().max(0)
    }
}

/// Net reward recorded for manual claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingEarning {
    pub id: Uuid,
    pub position_id: Uuid,
    pub amount: Decimal,
    pub is_claimed: bool,
    pub created_at: DateTime<Utc>,
}

/// Platform fee carved out of a staking reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminEarning {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub position_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity: String,
    pub entity_id: Uuid,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(entity: &str, entity_id: Uuid, action: &str, details: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: entity.to_string(),
            entity_id,
            action: action.to_string(),
            details,
            created_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Referrals
// ═══════════════════════════════════════════════════════════════════════════════

column_enum!(ReferralStatus {
    Pending => "PENDING",
    Active => "ACTIVE",
    Rejected => "REJECTED",
});

/// Who introduced whom. `referrer_id == referred_id` marks the anchor of
/// a referrer's own tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralEdge {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
}

impl ReferralEdge {
    pub fn new(referrer_id: Uuid, referred_id: Uuid, status: ReferralStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            referrer_id,
            referred_id,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn is_anchor(&self) -> bool {
        self.referrer_id == self.referred_id
    }
}

column_enum!(TreeKind {
    Binary => "BINARY",
    Unilevel => "UNILEVEL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: Uuid,
    pub kind: TreeKind,
    pub referral_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub left_child_id: Option<Uuid>,
    pub right_child_id: Option<Uuid>,
}

impl TreeNode {
    pub fn new(kind: TreeKind, referral_id: Uuid, parent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            referral_id,
            parent_id,
            left_child_id: None,
            right_child_id: None,
        }
    }

    /// First free binary slot, left before right.
    pub fn free_side(&self) -> Option<BinarySide> {
        if self.left_child_id.is_none() {
            Some(BinarySide::Left)
        } else if self.right_child_id.is_none() {
            Some(BinarySide::Right)
        } else {
            None
        }
    }
}

column_enum!(RewardType {
    Percentage => "PERCENTAGE",
    Fixed => "FIXED",
});

column_enum!(
    /// Events that can earn a referral reward.
    ConditionName {
        Deposit => "DEPOSIT",
        Trade => "TRADE",
        Investment => "INVESTMENT",
        BinaryWin => "BINARY_WIN",
        AiInvestment => "AI_INVESTMENT",
        ForexInvestment => "FOREX_INVESTMENT",
        IcoContribution => "ICO_CONTRIBUTION",
        Staking => "STAKING",
        EcommercePurchase => "ECOMMERCE_PURCHASE",
        P2pTrade => "P2P_TRADE",
        WelcomeBonus => "WELCOME_BONUS",
        MonthlyTradeVolume => "MONTHLY_TRADE_VOLUME",
        StakingLoyalty => "STAKING_LOYALTY",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralCondition {
    pub id: Uuid,
    pub name: ConditionName,
    pub title: String,
    pub status: bool,
    pub reward: Decimal,
    pub reward_type: RewardType,
    pub reward_wallet_type: WalletType,
    pub reward_currency: String,
}

impl ReferralCondition {
    /// Base reward for an event of `amount`: a percentage of it, or flat.
    pub fn base_reward(&self, amount: Decimal) -> Decimal {
        match self.reward_type {
            RewardType::Percentage => amount * self.reward / Decimal::ONE_HUNDRED,
            RewardType::Fixed => self.reward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub condition_id: Uuid,
    pub reward: Decimal,
    /// Id of the event that earned the reward, when the caller has one.
    pub source_id: Option<String>,
    pub is_claimed: bool,
    pub created_at: DateTime<Utc>,
}

impl RewardRecord {
    pub fn new(referrer_id: Uuid, condition_id: Uuid, reward: Decimal, source_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            referrer_id,
            condition_id,
            reward,
            source_id,
            is_claimed: false,
            created_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PnL
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-wallet-type totals in the base currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlBalances {
    pub fiat: Decimal,
    pub spot: Decimal,
    pub eco: Decimal,
}

impl PnlBalances {
    pub fn is_zero(&self) -> bool {
        self.fiat.is_zero() && self.spot.is_zero() && self.eco.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub day: NaiveDate,
    pub balances: PnlBalances,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ICO
// ═══════════════════════════════════════════════════════════════════════════════

column_enum!(IcoStatus {
    Upcoming => "UPCOMING",
    Active => "ACTIVE",
    Success => "SUCCESS",
    Failed => "FAILED",
    Rejected => "REJECTED",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcoOffering {
    pub id: Uuid,
    pub name: String,
    pub status: IcoStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl IcoOffering {
    /// Status the offering should move to at `now`, if any.
    pub fn next_status(&self, now: DateTime<Utc>) -> Option<IcoStatus> {
        match self.status {
            IcoStatus::Upcoming if self.start_date <= now => Some(IcoStatus::Active),
            IcoStatus::Active if self.end_date <= now => Some(IcoStatus::Success),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Users
// ═══════════════════════════════════════════════════════════════════════════════

column_enum!(UserStatus {
    Active => "ACTIVE",
    Inactive => "INACTIVE",
    Suspended => "SUSPENDED",
    Banned => "BANNED",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: &str, first_name: &str, last_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            status: UserStatus::Active,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBlock {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub is_temporary: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Mail Campaigns
// ═══════════════════════════════════════════════════════════════════════════════

column_enum!(CampaignStatus {
    Pending => "PENDING",
    Paused => "PAUSED",
    Active => "ACTIVE",
    Stopped => "STOPPED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

column_enum!(TargetStatus {
    Pending => "PENDING",
    Sent => "SENT",
    Failed => "FAILED",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailCampaign {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    /// Targets sent per run.
    pub speed: u32,
    pub status: CampaignStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailTarget {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub email: String,
    pub user_id: Option<Uuid>,
    pub status: TargetStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn investment(result: Option<InvestmentResult>) -> Investment {
        Investment {
            id: Uuid::new_v4(),
            kind: InvestmentKind::General,
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            plan_title: "Gold".into(),
            wallet_type: WalletType::Spot,
            currency: "USDT".into(),
            amount: Decimal::new(1000, 0),
            profit: Decimal::new(150, 0),
            result,
            status: InvestmentStatus::Active,
            duration: InvestmentDuration { duration: 2, timeframe: Timeframe::Month },
            created_at: Utc::now(),
            failure_reason: None,
        }
    }

    #[test]
    fn test_settlement_amount_by_result() {
        assert_eq!(investment(Some(InvestmentResult::Win)).settlement_amount(), Some(Decimal::new(1150, 0)));
        assert_eq!(investment(Some(InvestmentResult::Loss)).settlement_amount(), Some(Decimal::new(850, 0)));
        assert_eq!(investment(Some(InvestmentResult::Draw)).settlement_amount(), Some(Decimal::new(1000, 0)));
        assert_eq!(investment(None).settlement_amount(), Some(Decimal::new(1000, 0)));

        let mut wiped = investment(Some(InvestmentResult::Loss));
        wiped.profit = Decimal::new(5000, 0);
        assert_eq!(wiped.settlement_amount(), Some(Decimal::ZERO));

        let mut huge = investment(Some(InvestmentResult::Win));
        huge.amount = Decimal::MAX;
        assert_eq!(huge.settlement_amount(), None);
    }

    #[test]
    fn test_month_timeframe_is_thirty_days() {
        let inv = investment(None);
        assert_eq!(inv.end_date().unwrap() - inv.created_at, Duration::days(60));
        assert_eq!(inv.is_matured(Utc::now()), Some(false));
    }

    #[test]
    fn test_out_of_range_terms_have_no_end_date() {
        let mut inv = investment(None);
        inv.duration = InvestmentDuration { duration: 100_000_000, timeframe: Timeframe::Month };
        assert_eq!(inv.end_date(), None);
        assert_eq!(inv.is_matured(Utc::now()), None);

        // Would wrap to 1 hour if narrowed with a cast.
        inv.duration = InvestmentDuration { duration: (1_i64 << 32) + 1, timeframe: Timeframe::Hour };
        assert_eq!(inv.end_date(), None);

        inv.duration = InvestmentDuration { duration: -3, timeframe: Timeframe::Day };
        assert_eq!(inv.end_date(), None);
    }

    #[test]
    fn test_column_enum_strings() {
        assert_eq!(ConditionName::from_str("WELCOME_BONUS").unwrap(), ConditionName::WelcomeBonus);
        assert_eq!(TransactionType::ForexInvestmentRoi.to_string(), "FOREX_INVESTMENT_ROI");
        assert!(IcoStatus::from_str("open").is_err());
        assert_eq!(serde_json::to_string(&RewardType::Fixed).unwrap(), "\"FIXED\"");
    }

    #[test]
    fn test_ico_next_status() {
        let now = Utc::now();
        let mut ico = IcoOffering {
            id: Uuid::new_v4(),
            name: "Token".into(),
            status: IcoStatus::Upcoming,
            start_date: now - Duration::hours(1),
            end_date: now + Duration::days(1),
        };
        assert_eq!(ico.next_status(now), Some(IcoStatus::Active));
        ico.status = IcoStatus::Active;
        assert_eq!(ico.next_status(now), None);
        ico.end_date = now - Duration::seconds(1);
        assert_eq!(ico.next_status(now), Some(IcoStatus::Success));
    }

    #[test]
    fn test_binary_free_side() {
        let mut node = TreeNode::new(TreeKind::Binary, Uuid::new_v4(), None);
        assert_eq!(node.free_side(), Some(BinarySide::Left));
        node.left_child_id = Some(Uuid::new_v4());
        assert_eq!(node.free_side(), Some(BinarySide::Right));
        node.right_child_id = Some(Uuid::new_v4());
        assert_eq!(node.free_side(), None);
    }
}
