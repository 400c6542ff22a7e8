//! Fail-closed validation of reward inputs.
//!
//! Nothing here returns an error to the scheduler: an invalid settings blob
//! or transaction simply means no reward is distributed.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::ledger::ConditionName;

/// Upper bound for the stored `mlmSettings` blob.
pub const MAX_SETTINGS_BYTES: usize = 10_000;
/// Upper bound for the `binary` / `unilevel` sub-objects.
pub const MAX_MODE_SETTINGS_BYTES: usize = 5_000;

pub const MIN_LEVELS: u8 = 2;
pub const MAX_LEVELS: u8 = 7;

const BANNED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

const WELCOME_BONUS_MIN: Decimal = Decimal::ONE_HUNDRED;
const MONTHLY_VOLUME_MIN: Decimal = Decimal::ONE_THOUSAND;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsViolation {
    #[error("settings exceed {max} bytes ({actual})")]
    TooLarge { max: usize, actual: usize },
    #[error("settings contain a banned key")]
    BannedKey,
    #[error("settings are not valid JSON: {0}")]
    Malformed(String),
    #[error("settings must be a JSON object")]
    NotAnObject,
    #[error("levels must be between 2 and 7, got {0}")]
    LevelsOutOfRange(u8),
    #[error("level {0} is outside the configured depth")]
    UnknownLevel(u8),
    #[error("level percentage must be between 0 and 100, got {0}")]
    PercentageOutOfRange(Decimal),
    #[error("level percentages sum to {0}, above 100")]
    PercentageSumExceeded(Decimal),
}

/// Parse a stored settings blob into a JSON object, enforcing the size cap
/// and the banned-key list before parsing.
pub fn parse_settings_blob(raw: &str, max_bytes: usize) -> Result<Map<String, Value>, SettingsViolation> {
    if raw.len() > max_bytes {
        return Err(SettingsViolation::TooLarge {
            max: max_bytes,
            actual: raw.len(),
        });
    }
    if BANNED_KEYS.iter().any(|k| raw.contains(k)) {
        return Err(SettingsViolation::BannedKey);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SettingsViolation::NotAnObject),
        Err(e) => Err(SettingsViolation::Malformed(e.to_string())),
    }
}

/// Extract a mode's sub-object. Stored either inline or as a JSON string.
pub fn mode_settings(blob: &Map<String, Value>, key: &str) -> Result<Value, SettingsViolation> {
    match blob.get(key) {
        Some(Value::String(raw)) => parse_settings_blob(raw, MAX_MODE_SETTINGS_BYTES).map(Value::Object),
        Some(value @ Value::Object(_)) => {
            let size = value.to_string().len();
            if size > MAX_MODE_SETTINGS_BYTES {
                return Err(SettingsViolation::TooLarge {
                    max: MAX_MODE_SETTINGS_BYTES,
                    actual: size,
                });
            }
            Ok(value.clone())
        }
        Some(_) => Err(SettingsViolation::NotAnObject),
        None => Err(SettingsViolation::Malformed(format!("missing `{}` settings", key))),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LevelPercentage {
    pub level: u8,
    pub value: Decimal,
}

/// Per-level payout table for binary and unilevel trees.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelSettings {
    pub levels: u8,
    #[serde(default)]
    pub levels_percentage: Vec<LevelPercentage>,
}

impl LevelSettings {
    /// Deserialize and validate. The whole table is rejected when any
    /// entry is out of range or the percentages sum past 100.
    pub fn from_value(value: &Value) -> Result<Self, SettingsViolation> {
        let settings: Self =
            serde_json::from_value(value.clone()).map_err(|e| SettingsViolation::Malformed(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsViolation> {
        if !(MIN_LEVELS..=MAX_LEVELS).contains(&self.levels) {
            return Err(SettingsViolation::LevelsOutOfRange(self.levels));
        }
        let mut sum = Decimal::ZERO;
        for entry in &self.levels_percentage {
            if entry.level == 0 || entry.level > self.levels {
                return Err(SettingsViolation::UnknownLevel(entry.level));
            }
            if entry.value < Decimal::ZERO || entry.value > Decimal::ONE_HUNDRED {
                return Err(SettingsViolation::PercentageOutOfRange(entry.value));
            }
            sum += entry.value;
        }
        if sum > Decimal::ONE_HUNDRED {
            return Err(SettingsViolation::PercentageSumExceeded(sum));
        }
        Ok(())
    }

    /// Configured percentage for a level counted from the top of the walk.
    pub fn percentage_for(&self, level: u8) -> Option<Decimal> {
        self.levels_percentage
            .iter()
            .find(|p| p.level == level)
            .map(|p| p.value)
    }
}

/// Whether an event qualifies for a referral reward at all.
pub fn is_valid_transaction(condition: &str, amount: Decimal, currency: &str) -> bool {
    let Ok(condition) = ConditionName::from_str(condition) else {
        return false;
    };
    is_valid_event(condition, amount, currency)
}

pub(crate) fn is_valid_event(condition: ConditionName, amount: Decimal, currency: &str) -> bool {
    if amount <= Decimal::ZERO || currency.trim().is_empty() {
        return false;
    }
    match condition {
        ConditionName::WelcomeBonus => currency == "USDT" && amount >= WELCOME_BONUS_MIN,
        ConditionName::MonthlyTradeVolume => currency == "USDT" && amount > MONTHLY_VOLUME_MIN,
        _ => true,
    }
}
