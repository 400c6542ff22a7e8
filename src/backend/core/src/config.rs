//! Configuration management.
//!
//! Values are layered: built-in defaults, then an optional file named by
//! `SETTLEMENT_CONFIG`, then `SETTLEMENT__*` environment variables
//! (`SETTLEMENT__STAKING__CONCURRENCY=8`).

use serde::Deserialize;
use std::time::Duration;

use crate::capabilities::Capability;
use crate::jobs::backoff::RetryPolicy;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub staking: StakingConfig,

    #[serde(default)]
    pub forex: ForexConfig,

    #[serde(default)]
    pub rates: RatesConfig,

    #[serde(default)]
    pub pnl: PnlConfig,

    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub tracing: TracingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL. Empty selects the in-memory store.
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
}

/// Which durable backend fires the repeating jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Bypasses the staking distribution time-window gate.
    #[serde(default)]
    pub manual_run: bool,

    /// How long a finished job shows `completed`/`failed` before going idle.
    #[serde(default = "default_status_reset_delay", with = "humantime_serde")]
    pub status_reset_delay: Duration,

    /// Redis backend polling interval.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            manual_run: false,
            status_reset_delay: default_status_reset_delay(),
            poll_interval: default_poll_interval(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StakingConfig {
    #[serde(default = "default_staking_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_staking_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Tolerance either side of the configured daily distribution time.
    #[serde(default = "default_staking_window", with = "humantime_serde")]
    pub window: Duration,

    /// Positions overdue by more than this bypass the time-window gate.
    #[serde(default = "default_overdue_grace", with = "humantime_serde")]
    pub overdue_grace: Duration,
}

impl StakingConfig {
    /// Fixed-delay policy applied to a position failing transiently.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, self.retry_delay).transient_only()
    }
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_staking_concurrency(),
            max_retries: default_max_retries(),
            retry_delay: default_staking_retry_delay(),
            window: default_staking_window(),
            overdue_grace: default_overdue_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForexConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_forex_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl ForexConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.initial_delay, self.factor).transient_only()
    }
}

impl Default for ForexConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_forex_initial_delay(),
            factor: default_factor(),
        }
    }
}

/// Fiat rate provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateProviderKind {
    OpenExchangeRates,
    ExchangeRateApi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RatesConfig {
    #[serde(default = "default_primary_provider")]
    pub primary: RateProviderKind,

    #[serde(default = "default_fallback_provider")]
    pub fallback: Option<RateProviderKind>,

    #[serde(default)]
    pub openexchangerates_app_id: Option<String>,

    #[serde(default)]
    pub exchangerate_api_key: Option<String>,

    #[serde(default = "default_rates_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_base_currency")]
    pub base_currency: String,

    /// Overrides provider URLs (used to point at mock servers).
    #[serde(default)]
    pub openexchangerates_url: Option<String>,

    #[serde(default)]
    pub exchangerate_api_url: Option<String>,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_provider(),
            fallback: default_fallback_provider(),
            openexchangerates_app_id: None,
            exchangerate_api_key: None,
            timeout: default_rates_timeout(),
            base_currency: default_base_currency(),
            openexchangerates_url: None,
            exchangerate_api_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PnlConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_zero_balance_retention_days")]
    pub zero_balance_retention_days: i64,
}

impl Default for PnlConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            zero_balance_retention_days: default_zero_balance_retention_days(),
        }
    }
}

/// Extensions confirmed installed by the deployment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilitiesConfig {
    #[serde(default)]
    pub installed: Vec<Capability>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// OTLP collector endpoint; tracing export is disabled when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: default_service_name(),
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_status_reset_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_key_prefix() -> String {
    "settlement".to_string()
}

fn default_staking_concurrency() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_staking_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_staking_window() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_overdue_grace() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_forex_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_factor() -> f64 {
    2.0
}

fn default_primary_provider() -> RateProviderKind {
    RateProviderKind::OpenExchangeRates
}

fn default_fallback_provider() -> Option<RateProviderKind> {
    Some(RateProviderKind::ExchangeRateApi)
}

fn default_rates_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_base_currency() -> String {
    "USD".to_string()
}

fn default_retention_days() -> i64 {
    30
}

fn default_zero_balance_retention_days() -> i64 {
    1
}

fn default_service_name() -> String {
    "settlement-core".to_string()
}

impl Config {
    /// Load configuration from the environment, and from the file named by
    /// `SETTLEMENT_CONFIG` when set.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var("SETTLEMENT_CONFIG") {
            Ok(path) => Self::from_file(&path),
            Err(_) => {
                let config = config::Config::builder()
                    .add_source(config::Environment::with_prefix("SETTLEMENT").separator("__"))
                    .build()?;
                Ok(config.try_deserialize()?)
            }
        }
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SETTLEMENT").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
