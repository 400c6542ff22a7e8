//! Platform settings consumed by the settlement jobs.
//!
//! The raw store is a string key/value lookup ([`SettingsStore`]); the
//! [`Settings`] wrapper parses each key and applies the fallback used when
//! the key is absent or unreadable.

use async_trait::async_trait;
use chrono::NaiveTime;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::ledger::AprMethod;

pub const MLM_SYSTEM: &str = "mlmSystem";
pub const MLM_SETTINGS: &str = "mlmSettings";
pub const REFERRAL_STATUS: &str = "referralStatus";
pub const REFERRAL_APPROVAL_REQUIRED: &str = "referralApprovalRequired";
pub const STAKING_AUTOMATIC_DISTRIBUTION: &str = "stakingAutomaticEarningsDistribution";
pub const STAKING_DEFAULT_APR_METHOD: &str = "stakingDefaultAprCalculationMethod";
pub const STAKING_COMPOUND_FREQUENCY: &str = "stakingCompoundFrequency";
pub const STAKING_DISTRIBUTION_TIME: &str = "stakingEarningsDistributionTime";

const DEFAULT_COMPOUND_FREQUENCY: u32 = 365;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Referral compensation structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlmSystem {
    Direct,
    Binary,
    Unilevel,
}

impl MlmSystem {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DIRECT" => Some(Self::Direct),
            "BINARY" => Some(Self::Binary),
            "UNILEVEL" => Some(Self::Unilevel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "DIRECT",
            Self::Binary => "BINARY",
            Self::Unilevel => "UNILEVEL",
        }
    }
}

/// Typed access with fallbacks.
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn SettingsStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    async fn raw(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(err) => {
                tracing::warn!(key, error = %err, "Failed to read setting, using fallback");
                None
            }
        }
    }

    async fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key).await {
            Some(value) => parse_bool(&value).unwrap_or_else(|| {
                tracing::warn!(key, value = %value, "Unparseable boolean setting");
                default
            }),
            None => default,
        }
    }

    /// Raw `mlmSystem` value. `None` when unset.
    pub async fn mlm_system_raw(&self) -> Option<String> {
        self.raw(MLM_SYSTEM).await
    }

    /// Raw `mlmSettings` blob, validated by the reward engine.
    pub async fn mlm_settings(&self) -> Option<String> {
        self.raw(MLM_SETTINGS).await
    }

    pub async fn referral_enabled(&self) -> bool {
        self.flag(REFERRAL_STATUS, false).await
    }

    pub async fn referral_approval_required(&self) -> bool {
        self.flag(REFERRAL_APPROVAL_REQUIRED, false).await
    }

    pub async fn staking_automatic_distribution(&self) -> bool {
        self.flag(STAKING_AUTOMATIC_DISTRIBUTION, true).await
    }

    pub async fn staking_default_apr_method(&self) -> AprMethod {
        match self.raw(STAKING_DEFAULT_APR_METHOD).await {
            Some(v) if v.trim().eq_ignore_ascii_case("COMPOUND") => AprMethod::Compound,
            _ => AprMethod::Simple,
        }
    }

    /// Compounding periods per year: a number, or a named frequency.
    pub async fn staking_compound_frequency(&self) -> u32 {
        self.raw(STAKING_COMPOUND_FREQUENCY)
            .await
            .and_then(|v| parse_frequency(&v))
            .unwrap_or(DEFAULT_COMPOUND_FREQUENCY)
    }

    /// Daily distribution time (UTC). Defaults to midnight.
    pub async fn staking_distribution_time(&self) -> NaiveTime {
        self.raw(STAKING_DISTRIBUTION_TIME)
            .await
            .and_then(|v| NaiveTime::parse_from_str(v.trim(), "%H:%M").ok())
            .unwrap_or(NaiveTime::MIN)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_frequency(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Ok(n) = value.parse::<u32>() {
        return (n > 0).then_some(n);
    }
    match value.to_ascii_uppercase().as_str() {
        "DAILY" => Some(365),
        "WEEKLY" => Some(52),
        "MONTHLY" => Some(12),
        "QUARTERLY" => Some(4),
        "ANNUALLY" | "YEARLY" => Some(1),
        _ => None,
    }
}

/// Settings held in memory.
#[derive(Default)]
pub struct InMemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.values.write().insert(key.to_string(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

#[async_trait]
impl SettingsStore for InMemorySettings {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }
}
