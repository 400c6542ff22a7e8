//! Capability registry for optional platform extensions.
//!
//! Which extensions are installed is decided once at startup (from
//! configuration, or by whoever embeds this crate). Jobs never probe for an
//! extension themselves: they ask [`Capabilities`], and call through the
//! interfaces below, which have a null implementation when the extension
//! is absent.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::ledger::TransactionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Mlm,
    Staking,
    Forex,
    AiInvestment,
    Ico,
    Ecosystem,
    MailWizard,
    Exchange,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mlm => "mlm",
            Self::Staking => "staking",
            Self::Forex => "forex",
            Self::AiInvestment => "ai_investment",
            Self::Ico => "ico",
            Self::Ecosystem => "ecosystem",
            Self::MailWizard => "mail_wizard",
            Self::Exchange => "exchange",
        };
        f.write_str(name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Extension Interfaces
// ═══════════════════════════════════════════════════════════════════════════════

/// Live price lookup from the ecosystem matching engine.
#[async_trait]
pub trait TickerSource: Send + Sync {
    /// Last traded price of `currency` in the base currency.
    async fn last_price(&self, currency: &str) -> Result<Option<Decimal>>;
}

/// Stand-in used when the ecosystem extension is absent: every price is 0.
pub struct ZeroTicker;

#[async_trait]
impl TickerSource for ZeroTicker {
    async fn last_price(&self, _currency: &str) -> Result<Option<Decimal>> {
        Ok(Some(Decimal::ZERO))
    }
}

/// External exchange used to reconcile pending withdrawals and deposits.
/// Statuses come back in the exchange's own vocabulary; see
/// [`map_external_status`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn withdrawal_status(&self, reference: &str, currency: &str) -> Result<String>;

    async fn deposit_status(&self, reference: &str, currency: &str) -> Result<String>;
}

/// Map an exchange status string onto the ledger's transaction status.
pub fn map_external_status(status: &str) -> TransactionStatus {
    match status.trim().to_ascii_lowercase().as_str() {
        "ok" | "completed" | "complete" | "success" | "done" | "confirmed" => TransactionStatus::Completed,
        "canceled" | "cancelled" => TransactionStatus::Cancelled,
        "failed" | "failure" | "error" | "rejected" | "expired" => TransactionStatus::Failed,
        _ => TransactionStatus::Pending,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct Capabilities {
    installed: HashSet<Capability>,
    ticker: Arc<dyn TickerSource>,
    exchange: Option<Arc<dyn ExchangeGateway>>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

impl Capabilities {
    pub fn new(installed: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            installed: installed.into_iter().collect(),
            ticker: Arc::new(ZeroTicker),
            exchange: None,
        }
    }

    /// Attach the ecosystem ticker. Marks `Ecosystem` installed.
    pub fn with_ticker(mut self, ticker: Arc<dyn TickerSource>) -> Self {
        self.installed.insert(Capability::Ecosystem);
        self.ticker = ticker;
        self
    }

    /// Attach an exchange gateway. Marks `Exchange` installed.
    pub fn with_exchange(mut self, exchange: Arc<dyn ExchangeGateway>) -> Self {
        self.installed.insert(Capability::Exchange);
        self.exchange = Some(exchange);
        self
    }

    pub fn is_installed(&self, capability: Capability) -> bool {
        self.installed.contains(&capability)
    }

    pub fn installed(&self) -> impl Iterator<Item = Capability> + '_ {
        self.installed.iter().copied()
    }

    pub fn ticker(&self) -> &Arc<dyn TickerSource> {
        &self.ticker
    }

    pub fn exchange(&self) -> Option<&Arc<dyn ExchangeGateway>> {
        self.exchange.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_status_vocabulary() {
        assert_eq!(map_external_status("ok"), TransactionStatus::Completed);
        assert_eq!(map_external_status("Canceled"), TransactionStatus::Cancelled);
        assert_eq!(map_external_status("failed"), TransactionStatus::Failed);
        assert_eq!(map_external_status("pending"), TransactionStatus::Pending);
        assert_eq!(map_external_status("processing"), TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_absent_ecosystem_prices_zero() {
        let caps = Capabilities::new([Capability::Staking]);
        assert!(caps.is_installed(Capability::Staking));
        assert!(!caps.is_installed(Capability::Ecosystem));
        assert!(caps.exchange().is_none());
        assert_eq!(caps.ticker().last_price("BTC").await.unwrap(), Some(Decimal::ZERO));
    }
}
