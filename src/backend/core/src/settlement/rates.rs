//! Fiat exchange-rate refresh from external providers.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::{SettlementContext, SweepReport};
use crate::config::{RateProviderKind, RatesConfig};
use crate::error::{Result, SettlementError};
use crate::jobs::JobContext;
use crate::telemetry::SensitiveFieldRedactor;

const OPENEXCHANGERATES_URL: &str = "https://openexchangerates.org";
const EXCHANGERATE_API_URL: &str = "https://v6.exchangerate-api.com";

#[derive(Debug, Deserialize)]
struct OpenExchangeRatesResponse {
    rates: HashMap<String, Decimal>,
}

#[derive(Debug, Deserialize)]
struct ExchangeRateApiResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    conversion_rates: HashMap<String, Decimal>,
}

impl RateProviderKind {
    fn label(&self) -> &'static str {
        match self {
            Self::OpenExchangeRates => "openexchangerates",
            Self::ExchangeRateApi => "exchangerate-api",
        }
    }
}

/// HTTP client for the configured rate providers.
pub struct RateFetcher {
    client: reqwest::Client,
    config: RatesConfig,
}

impl RateFetcher {
    pub fn new(config: &RatesConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Rates keyed by currency code, as units per one base-currency unit.
    pub async fn fetch(&self, provider: RateProviderKind) -> Result<HashMap<String, Decimal>> {
        let base = &self.config.base_currency;
        match provider {
            RateProviderKind::OpenExchangeRates => {
                let app_id = self.config.openexchangerates_app_id.as_deref().ok_or_else(|| {
                    SettlementError::configuration("openexchangerates app id is not configured")
                })?;
                let root = self.config.openexchangerates_url.as_deref().unwrap_or(OPENEXCHANGERATES_URL);
                let url = format!("{}/api/latest.json?app_id={}&base={}", root, app_id, base);
                let body: OpenExchangeRatesResponse = self.get_json(provider, &url).await?;
                Ok(body.rates)
            }
            RateProviderKind::ExchangeRateApi => {
                let key = self.config.exchangerate_api_key.as_deref().ok_or_else(|| {
                    SettlementError::configuration("exchangerate-api key is not configured")
                })?;
                let root = self.config.exchangerate_api_url.as_deref().unwrap_or(EXCHANGERATE_API_URL);
                let url = format!("{}/v6/{}/latest/{}", root, key, base);
                let body: ExchangeRateApiResponse = self.get_json(provider, &url).await?;
                match body.result.as_deref() {
                    Some("success") | None => Ok(body.conversion_rates),
                    Some(other) => Err(SettlementError::external(
                        provider.label(),
                        format!("provider returned result {}", other),
                    )),
                }
            }
        }
    }

    /// Try the primary provider, then the fallback.
    pub async fn fetch_with_fallback(&self) -> Result<(RateProviderKind, HashMap<String, Decimal>)> {
        let primary = self.config.primary;
        let primary_err = match self.fetch(primary).await {
            Ok(rates) => return Ok((primary, rates)),
            Err(err) => err,
        };
        tracing::warn!(provider = primary.label(), error = %primary_err, "Primary rate provider failed");

        match self.config.fallback.filter(|fallback| *fallback != primary) {
            Some(fallback) => self.fetch(fallback).await.map(|rates| (fallback, rates)),
            None => Err(primary_err),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, provider: RateProviderKind, url: &str) -> Result<T> {
        let redacted = SensitiveFieldRedactor::global().redact_value(url);
        tracing::debug!(provider = provider.label(), url = %redacted, "Fetching fiat rates");

        let response = self.client.get(url).send().await.map_err(|e| {
            let err = SettlementError::from(e);
            let detail = format!("{}: {}", provider.label(), err.internal_message().unwrap_or_default());
            err.with_internal_message(detail)
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SettlementError::rate_limited(provider.label(), retry_after(response.headers())));
        }
        if !status.is_success() {
            return Err(SettlementError::external(
                provider.label(),
                format!("HTTP {} from {}", status, redacted),
            ));
        }

        response.json::<T>().await.map_err(|e| {
            SettlementError::external(
                provider.label(),
                format!("unreadable response: {}", SensitiveFieldRedactor::global().redact_value(&e.to_string())),
            )
        })
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Refresh stored fiat rates. Never fails: provider errors are logged and
/// the job returns an empty report.
pub async fn fetch_fiat_currency_prices(ctx: &SettlementContext, job: &JobContext) -> Result<SweepReport> {
    let fetcher = match RateFetcher::new(&ctx.config.rates) {
        Ok(fetcher) => fetcher,
        Err(err) => {
            job.log_error(&format!("Cannot build rate client: {}", err));
            return Ok(SweepReport::default());
        }
    };

    let (provider, rates) = match fetcher.fetch_with_fallback().await {
        Ok(found) => found,
        Err(err) => {
            err.log();
            job.log_error(&format!("All fiat rate providers failed: {}", err));
            return Ok(SweepReport::default());
        }
    };

    let known = match ctx.store.known_fiat_currencies().await {
        Ok(known) => known,
        Err(err) => {
            job.log_error(&format!("Cannot load known currencies: {}", err));
            return Ok(SweepReport::default());
        }
    };
    let relevant: HashMap<String, Decimal> = rates
        .into_iter()
        .filter(|(currency, rate)| *rate > Decimal::ZERO && known.contains(currency))
        .collect();

    match ctx.store.update_fiat_rates(&relevant).await {
        Ok(updated) => {
            let report = SweepReport {
                settled: updated as usize,
                skipped: known.len().saturating_sub(updated as usize),
                failed: 0,
            };
            job.log_success(&format!(
                "Updated {} fiat rates from {}",
                updated,
                provider.label()
            ));
            Ok(report)
        }
        Err(err) => {
            job.log_error(&format!("Failed to store fiat rates: {}", err));
            Ok(SweepReport::default())
        }
    }
}
