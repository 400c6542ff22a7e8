//! PostgreSQL ledger.
//!
//! Row locks use `SELECT ... FOR UPDATE`, with `SKIP LOCKED` where the
//! caller asks for it, so several scheduler processes can share one
//! database. Enum columns are stored as their upper-case strings.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use super::models::*;
use super::store::{IsolationLevel, LedgerStore, LedgerTx, LockMode};
use crate::config::DatabaseConfig;
use crate::error::{Result, SettlementError};
use crate::telemetry::SensitiveFieldRedactor;
use crate::notify::{NotificationDispatcher, PermissionNotification, UserNotification};
use crate::settings::SettingsStore;

/// Role that receives every permission-gated notification.
const SUPER_ADMIN_ROLE: &str = "Super Admin";

/// Postgres-backed store. Cheap to clone.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;
        tracing::info!(
            url = %SensitiveFieldRedactor::global().redact("database_url", &config.url),
            max_connections = config.max_connections,
            "Database pool ready"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Mapping
// ═══════════════════════════════════════════════════════════════════════════════

fn text_col<T>(row: &PgRow, name: &str) -> Result<T>
where
    T: FromStr<Err = SettlementError>,
{
    row.try_get::<String, _>(name)?.parse()
}

fn opt_text_col<T>(row: &PgRow, name: &str) -> Result<Option<T>>
where
    T: FromStr<Err = SettlementError>,
{
    row.try_get::<Option<String>, _>(name)?
        .map(|v| v.parse())
        .transpose()
}

const USER_COLUMNS: &str = "id, email, first_name, last_name, status, created_at";

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        status: text_col(row, "status")?,
        created_at: row.try_get("created_at")?,
    })
}

const WALLET_COLUMNS: &str = "id, user_id, type, currency, balance, in_order";

fn wallet_from_row(row: &PgRow) -> Result<Wallet> {
    Ok(Wallet {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        wallet_type: text_col(row, "type")?,
        currency: row.try_get("currency")?,
        balance: row.try_get("balance")?,
        in_order: row.try_get("in_order")?,
    })
}

const TRANSACTION_COLUMNS: &str =
    "id, user_id, wallet_id, type, status, amount, fee, description, reference_id, metadata, created_at";

fn transaction_from_row(row: &PgRow) -> Result<LedgerTransaction> {
    Ok(LedgerTransaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        wallet_id: row.try_get("wallet_id")?,
        kind: text_col(row, "type")?,
        status: text_col(row, "status")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        description: row.try_get("description")?,
        reference_id: row.try_get("reference_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

const INVESTMENT_COLUMNS: &str = "id, kind, user_id, plan_id, plan_title, wallet_type, currency, amount, \
     profit, result, status, duration, timeframe, failure_reason, created_at";

fn investment_from_row(row: &PgRow) -> Result<Investment> {
    Ok(Investment {
        id: row.try_get("id")?,
        kind: text_col(row, "kind")?,
        user_id: row.try_get("user_id")?,
        plan_id: row.try_get("plan_id")?,
        plan_title: row.try_get("plan_title")?,
        wallet_type: text_col(row, "wallet_type")?,
        currency: row.try_get("currency")?,
        amount: row.try_get("amount")?,
        profit: row.try_get("profit")?,
        result: opt_text_col(row, "result")?,
        status: text_col(row, "status")?,
        duration: InvestmentDuration {
            duration: row.try_get("duration")?,
            timeframe: text_col(row, "timeframe")?,
        },
        created_at: row.try_get("created_at")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

const POSITION_COLUMNS: &str = "id, user_id, pool_id, amount, start_date, end_date, status, completed_at";

fn position_from_row(row: &PgRow) -> Result<StakingPosition> {
    Ok(StakingPosition {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        pool_id: row.try_get("pool_id")?,
        amount: row.try_get("amount")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        status: text_col(row, "status")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn pool_from_row(row: &PgRow) -> Result<StakingPool> {
    Ok(StakingPool {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        wallet_type: text_col(row, "wallet_type")?,
        apr: row.try_get("apr")?,
        apr_method: opt_text_col(row, "apr_method")?,
        compound_frequency: row
            .try_get::<Option<i32>, _>("compound_frequency")?
            .and_then(|f| u32::try_from(f).ok()),
        admin_fee_percentage: row.try_get("admin_fee_percentage")?,
        auto_compound: row.try_get("auto_compound")?,
    })
}

const REFERRAL_COLUMNS: &str = "id, referrer_id, referred_id, status, created_at";

fn referral_from_row(row: &PgRow) -> Result<ReferralEdge> {
    Ok(ReferralEdge {
        id: row.try_get("id")?,
        referrer_id: row.try_get("referrer_id")?,
        referred_id: row.try_get("referred_id")?,
        status: text_col(row, "status")?,
        created_at: row.try_get("created_at")?,
    })
}

const NODE_COLUMNS: &str = "n.id, n.kind, n.referral_id, n.parent_id, n.left_child_id, n.right_child_id";

fn node_from_row(row: &PgRow) -> Result<TreeNode> {
    Ok(TreeNode {
        id: row.try_get("id")?,
        kind: text_col(row, "kind")?,
        referral_id: row.try_get("referral_id")?,
        parent_id: row.try_get("parent_id")?,
        left_child_id: row.try_get("left_child_id")?,
        right_child_id: row.try_get("right_child_id")?,
    })
}

fn condition_from_row(row: &PgRow) -> Result<ReferralCondition> {
    Ok(ReferralCondition {
        id: row.try_get("id")?,
        name: text_col(row, "name")?,
        title: row.try_get("title")?,
        status: row.try_get("status")?,
        reward: row.try_get("reward")?,
        reward_type: text_col(row, "reward_type")?,
        reward_wallet_type: text_col(row, "reward_wallet_type")?,
        reward_currency: row.try_get("reward_currency")?,
    })
}

fn ico_from_row(row: &PgRow) -> Result<IcoOffering> {
    Ok(IcoOffering {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: text_col(row, "status")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
    })
}

fn block_from_row(row: &PgRow) -> Result<UserBlock> {
    Ok(UserBlock {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        reason: row.try_get("reason")?,
        is_temporary: row.try_get("is_temporary")?,
        blocked_until: row.try_get("blocked_until")?,
        is_active: row.try_get("is_active")?,
    })
}

fn price_map(rows: Vec<PgRow>, key: &str) -> Result<HashMap<String, Decimal>> {
    rows.iter()
        .map(|row| Ok((row.try_get::<String, _>(key)?, row.try_get::<Decimal, _>("price")?)))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        let statement = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&statement).execute(&mut *tx).await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn active_users(&self) -> Result<Vec<User>> {
        let sql = format!(
            "SELECT {} FROM users WHERE status = 'ACTIVE' ORDER BY created_at",
            USER_COLUMNS
        );
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(user_from_row)
            .collect()
    }

    async fn user_wallets(&self, user_id: Uuid) -> Result<Vec<Wallet>> {
        let sql = format!("SELECT {} FROM wallets WHERE user_id = $1", WALLET_COLUMNS);
        sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(wallet_from_row)
            .collect()
    }

    async fn active_investments(&self, kind: InvestmentKind) -> Result<Vec<Investment>> {
        let sql = format!(
            "SELECT {} FROM investments WHERE kind = $1 AND status = 'ACTIVE' ORDER BY created_at",
            INVESTMENT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(investment_from_row)
            .collect()
    }

    async fn staking_pool(&self, id: Uuid) -> Result<Option<StakingPool>> {
        sqlx::query(
            r#"
            SELECT id, name, symbol, wallet_type, apr, apr_method, compound_frequency,
                   admin_fee_percentage, auto_compound
            FROM staking_pools
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(pool_from_row)
        .transpose()
    }

    async fn matured_staking_positions(&self, now: DateTime<Utc>) -> Result<Vec<StakingPosition>> {
        let sql = format!(
            "SELECT {} FROM staking_positions WHERE status = 'ACTIVE' AND end_date <= $1 ORDER BY end_date",
            POSITION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(position_from_row)
            .collect()
    }

    async fn count_overdue_staking_positions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM staking_positions WHERE status = 'ACTIVE' AND end_date < $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn pending_transactions(
        &self,
        kind: TransactionType,
        since: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE type = $1 AND status = 'PENDING' AND created_at >= $2 \
             ORDER BY created_at",
            TRANSACTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(transaction_from_row)
            .collect()
    }

    async fn fiat_currency_rates(&self) -> Result<HashMap<String, Decimal>> {
        let rows = sqlx::query("SELECT code, price FROM currencies WHERE status AND price IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        price_map(rows, "code")
    }

    async fn exchange_currency_prices(&self) -> Result<HashMap<String, Decimal>> {
        let rows = sqlx::query("SELECT currency, price FROM exchange_currencies WHERE price IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        price_map(rows, "currency")
    }

    async fn known_fiat_currencies(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT code FROM currencies ORDER BY code")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_fiat_rates(&self, rates: &HashMap<String, Decimal>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (code, price) in rates {
            updated += sqlx::query("UPDATE currencies SET price = $2 WHERE code = $1")
                .bind(code)
                .bind(price)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn upsert_pnl_snapshot(&self, user_id: Uuid, day: NaiveDate, balances: PnlBalances) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pnl_snapshots (id, user_id, day, fiat, spot, eco)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, day)
            DO UPDATE SET fiat = EXCLUDED.fiat, spot = EXCLUDED.spot, eco = EXCLUDED.eco
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(day)
        .bind(balances.fiat)
        .bind(balances.spot)
        .bind(balances.eco)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_pnl_snapshots_before(&self, day: NaiveDate) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM pnl_snapshots WHERE day < $1")
            .bind(day)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn delete_zero_pnl_snapshots_before(&self, day: NaiveDate) -> Result<u64> {
        Ok(sqlx::query(
            "DELETE FROM pnl_snapshots WHERE day < $1 AND fiat = 0 AND spot = 0 AND eco = 0",
        )
        .bind(day)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn ico_offerings(&self, statuses: &[IcoStatus]) -> Result<Vec<IcoOffering>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        sqlx::query(
            "SELECT id, name, status, start_date, end_date FROM ico_offerings \
             WHERE status = ANY($1) ORDER BY start_date",
        )
        .bind(statuses)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(ico_from_row)
        .collect()
    }

    async fn set_ico_status(&self, id: Uuid, status: IcoStatus) -> Result<()> {
        sqlx::query("UPDATE ico_offerings SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn expired_user_blocks(&self, now: DateTime<Utc>) -> Result<Vec<UserBlock>> {
        sqlx::query(
            r#"
            SELECT id, user_id, reason, is_temporary, blocked_until, is_active
            FROM user_blocks
            WHERE is_active AND is_temporary AND blocked_until <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(block_from_row)
        .collect()
    }

    async fn referral_by_referred(&self, user_id: Uuid) -> Result<Option<ReferralEdge>> {
        let sql = format!(
            "SELECT {} FROM referrals WHERE referred_id = $1 AND referrer_id <> referred_id",
            REFERRAL_COLUMNS
        );
        sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(referral_from_row)
            .transpose()
    }

    async fn referral(&self, id: Uuid) -> Result<Option<ReferralEdge>> {
        let sql = format!("SELECT {} FROM referrals WHERE id = $1", REFERRAL_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(referral_from_row)
            .transpose()
    }

    async fn referral_condition(&self, name: ConditionName) -> Result<Option<ReferralCondition>> {
        sqlx::query(
            r#"
            SELECT id, name, title, status, reward, reward_type, reward_wallet_type, reward_currency
            FROM referral_conditions
            WHERE name = $1 AND status
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(condition_from_row)
        .transpose()
    }

    async fn tree_node_for_user(&self, kind: TreeKind, user_id: Uuid) -> Result<Option<TreeNode>> {
        let sql = format!(
            "SELECT {} FROM tree_nodes n JOIN referrals r ON r.id = n.referral_id \
             WHERE n.kind = $1 AND r.referred_id = $2",
            NODE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn tree_node(&self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>> {
        let sql = format!("SELECT {} FROM tree_nodes n WHERE n.kind = $1 AND n.id = $2", NODE_COLUMNS);
        sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn active_campaigns(&self) -> Result<Vec<MailCampaign>> {
        sqlx::query("SELECT id, name, subject, speed, status FROM mail_campaigns WHERE status = 'ACTIVE'")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                Ok(MailCampaign {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    subject: row.try_get("subject")?,
                    speed: u32::try_from(row.try_get::<i32, _>("speed")?).unwrap_or(0),
                    status: text_col(row, "status")?,
                })
            })
            .collect()
    }

    async fn pending_campaign_targets(&self, campaign_id: Uuid, limit: u32) -> Result<Vec<MailTarget>> {
        sqlx::query(
            r#"
            SELECT id, campaign_id, email, user_id, status
            FROM mail_campaign_targets
            WHERE campaign_id = $1 AND status = 'PENDING'
            LIMIT $2
            "#,
        )
        .bind(campaign_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(MailTarget {
                id: row.try_get("id")?,
                campaign_id: row.try_get("campaign_id")?,
                email: row.try_get("email")?,
                user_id: row.try_get("user_id")?,
                status: text_col(row, "status")?,
            })
        })
        .collect()
    }

    async fn set_campaign_target_status(&self, id: Uuid, status: TargetStatus) -> Result<()> {
        sqlx::query("UPDATE mail_campaign_targets SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_campaign_status(&self, id: Uuid, status: CampaignStatus) -> Result<()> {
        sqlx::query("UPDATE mail_campaigns SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transaction
// ═══════════════════════════════════════════════════════════════════════════════

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn lock_wallet(
        &mut self,
        user_id: Uuid,
        wallet_type: WalletType,
        currency: &str,
    ) -> Result<Option<Wallet>> {
        let sql = format!(
            "SELECT {} FROM wallets WHERE user_id = $1 AND type = $2 AND currency = $3 FOR UPDATE",
            WALLET_COLUMNS
        );
        sqlx::query(&sql)
            .bind(user_id)
            .bind(wallet_type.as_str())
            .bind(currency)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(wallet_from_row)
            .transpose()
    }

    async fn lock_wallet_by_id(&mut self, id: Uuid) -> Result<Option<Wallet>> {
        let sql = format!("SELECT {} FROM wallets WHERE id = $1 FOR UPDATE", WALLET_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(wallet_from_row)
            .transpose()
    }

    async fn update_wallet_balance(&mut self, id: Uuid, balance: Decimal) -> Result<()> {
        let updated = sqlx::query("UPDATE wallets SET balance = $2 WHERE id = $1")
            .bind(id)
            .bind(balance)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(SettlementError::not_found("Wallet", id));
        }
        Ok(())
    }

    async fn insert_transaction(&mut self, t: &LedgerTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, user_id, wallet_id, type, status, amount, fee, description, reference_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(t.id)
        .bind(t.user_id)
        .bind(t.wallet_id)
        .bind(t.kind.as_str())
        .bind(t.status.as_str())
        .bind(t.amount)
        .bind(t.fee)
        .bind(&t.description)
        .bind(&t.reference_id)
        .bind(&t.metadata)
        .bind(t.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_transaction(&mut self, id: Uuid) -> Result<Option<LedgerTransaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1 FOR UPDATE", TRANSACTION_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(transaction_from_row)
            .transpose()
    }

    async fn set_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query("UPDATE transactions SET status = $2, metadata = COALESCE($3, metadata) WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(metadata)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_investment(&mut self, kind: InvestmentKind, id: Uuid) -> Result<Option<Investment>> {
        let sql = format!(
            "SELECT {} FROM investments WHERE id = $1 AND kind = $2 FOR UPDATE",
            INVESTMENT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(kind.as_str())
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(investment_from_row)
            .transpose()
    }

    async fn set_investment_status(
        &mut self,
        kind: InvestmentKind,
        id: Uuid,
        status: InvestmentStatus,
        failure_reason: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE investments SET status = $3, failure_reason = COALESCE($4, failure_reason) \
             WHERE id = $1 AND kind = $2",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(status.as_str())
        .bind(failure_reason)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_staking_position(&mut self, id: Uuid, mode: LockMode) -> Result<Option<StakingPosition>> {
        let lock = match mode {
            LockMode::Wait => "FOR UPDATE",
            LockMode::SkipLocked => "FOR UPDATE SKIP LOCKED",
        };
        let sql = format!("SELECT {} FROM staking_positions WHERE id = $1 {}", POSITION_COLUMNS, lock);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(position_from_row)
            .transpose()
    }

    async fn update_staking_position(&mut self, p: &StakingPosition) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE staking_positions
            SET amount = $2, start_date = $3, end_date = $4, status = $5, completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(p.id)
        .bind(p.amount)
        .bind(p.start_date)
        .bind(p.end_date)
        .bind(p.status.as_str())
        .bind(p.completed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_staking_earning(&mut self, e: &StakingEarning) -> Result<()> {
        sqlx::query(
            "INSERT INTO staking_earnings (id, position_id, amount, is_claimed, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(e.id)
        .bind(e.position_id)
        .bind(e.amount)
        .bind(e.is_claimed)
        .bind(e.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_admin_earning(&mut self, e: &AdminEarning) -> Result<()> {
        sqlx::query(
            "INSERT INTO staking_admin_earnings (id, pool_id, position_id, amount, currency, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(e.id)
        .bind(e.pool_id)
        .bind(e.position_id)
        .bind(e.amount)
        .bind(&e.currency)
        .bind(e.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, entity, entity_id, action, details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.id)
        .bind(&entry.entity)
        .bind(entry.entity_id)
        .bind(&entry.action)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn referral_for_referred(&mut self, user_id: Uuid) -> Result<Option<ReferralEdge>> {
        let sql = format!(
            "SELECT {} FROM referrals WHERE referred_id = $1 AND referrer_id <> referred_id FOR UPDATE",
            REFERRAL_COLUMNS
        );
        sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(referral_from_row)
            .transpose()
    }

    async fn referral(&mut self, id: Uuid) -> Result<Option<ReferralEdge>> {
        let sql = format!("SELECT {} FROM referrals WHERE id = $1", REFERRAL_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(referral_from_row)
            .transpose()
    }

    async fn insert_referral(&mut self, edge: &ReferralEdge) -> Result<()> {
        sqlx::query(
            "INSERT INTO referrals (id, referrer_id, referred_id, status, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(edge.id)
        .bind(edge.referrer_id)
        .bind(edge.referred_id)
        .bind(edge.status.as_str())
        .bind(edge.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_tree_node_for_user(&mut self, kind: TreeKind, user_id: Uuid) -> Result<Option<TreeNode>> {
        let sql = format!(
            "SELECT {} FROM tree_nodes n JOIN referrals r ON r.id = n.referral_id \
             WHERE n.kind = $1 AND r.referred_id = $2 FOR UPDATE OF n",
            NODE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn lock_tree_node(&mut self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>> {
        let sql = format!(
            "SELECT {} FROM tree_nodes n WHERE n.kind = $1 AND n.id = $2 FOR UPDATE",
            NODE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn tree_node(&mut self, kind: TreeKind, id: Uuid) -> Result<Option<TreeNode>> {
        let sql = format!("SELECT {} FROM tree_nodes n WHERE n.kind = $1 AND n.id = $2", NODE_COLUMNS);
        sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn insert_tree_node(&mut self, node: &TreeNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tree_nodes (id, kind, referral_id, parent_id, left_child_id, right_child_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(node.id)
        .bind(node.kind.as_str())
        .bind(node.referral_id)
        .bind(node.parent_id)
        .bind(node.left_child_id)
        .bind(node.right_child_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_binary_child(&mut self, parent_id: Uuid, side: BinarySide, child_id: Uuid) -> Result<()> {
        let sql = match side {
            BinarySide::Left => "UPDATE tree_nodes SET left_child_id = $2 WHERE id = $1 AND kind = 'BINARY'",
            BinarySide::Right => "UPDATE tree_nodes SET right_child_id = $2 WHERE id = $1 AND kind = 'BINARY'",
        };
        sqlx::query(sql)
            .bind(parent_id)
            .bind(child_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn reward_exists(
        &mut self,
        referrer_id: Uuid,
        condition_id: Uuid,
        since: Option<DateTime<Utc>>,
        source_id: Option<&str>,
    ) -> Result<bool> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM referral_rewards
                WHERE referrer_id = $1
                  AND condition_id = $2
                  AND ($3::timestamptz IS NULL OR created_at >= $3)
                  AND ($4::text IS NULL OR source_id = $4)
            )
            "#,
        )
        .bind(referrer_id)
        .bind(condition_id)
        .bind(since)
        .bind(source_id)
        .fetch_one(&mut *self.tx)
        .await?)
    }

    async fn insert_reward(&mut self, r: &RewardRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO referral_rewards (id, referrer_id, condition_id, reward, source_id, is_claimed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(r.id)
        .bind(r.referrer_id)
        .bind(r.condition_id)
        .bind(r.reward)
        .bind(&r.source_id)
        .bind(r.is_claimed)
        .bind(r.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn deactivate_block(&mut self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE user_blocks SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn count_active_blocks(&mut self, user_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_blocks WHERE user_id = $1 AND is_active")
            .bind(user_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn set_user_status(&mut self, user_id: Uuid, status: UserStatus) -> Result<()> {
        sqlx::query("UPDATE users SET status = $2 WHERE id = $1")
            .bind(user_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notifications & Settings
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl NotificationDispatcher for PgStore {
    async fn notify_user(&self, n: UserNotification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, type, title, message, link, actions)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(n.user_id)
        .bind(n.kind.as_str())
        .bind(&n.title)
        .bind(&n.message)
        .bind(&n.link)
        .bind(serde_json::to_value(&n.actions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn notify_users_with_permission(&self, n: PermissionNotification) -> Result<()> {
        let sent = sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, type, title, message, link, actions)
            SELECT gen_random_uuid(), u.id, $2, $3, $4, $5, '[]'::jsonb
            FROM users u
            WHERE u.role_id IN (
                SELECT rp.role_id
                FROM role_permissions rp
                JOIN permissions p ON p.id = rp.permission_id
                WHERE p.name = $1
                UNION
                SELECT id FROM roles WHERE name = $6
            )
            "#,
        )
        .bind(&n.permission)
        .bind(n.kind.as_str())
        .bind(&n.title)
        .bind(&n.message)
        .bind(&n.link)
        .bind(SUPER_ADMIN_ROLE)
        .execute(&self.pool)
        .await?
        .rows_affected();
        tracing::debug!(permission = %n.permission, recipients = sent, "Admin notification stored");
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.flatten())
    }
}
