//! Error handling for the settlement engine.
//!
//! Every fallible operation in the crate returns [`SettlementError`], which
//! carries:
//! - a stable machine-readable [`ErrorCode`]
//! - a message safe to surface on the admin dashboard
//! - an optional internal message and source chain for logs
//!
//! Codes are grouped the way the engine reacts to them. Validation and
//! not-found errors fail closed and are skipped, transient infrastructure
//! errors are retried with backoff, and invariant violations (a referral
//! loop) abort the enclosing transaction and always reach the caller.
//!
//! # Usage
//!
//! ```rust,ignore
//! use settlement_core::error::{ErrorContext, Result};
//!
//! fn load(store: &dyn LedgerStore, id: Uuid) -> Result<Wallet> {
//!     store.wallet(id).await?.context("wallet missing")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for settlement operations.
pub type Result<T> = std::result::Result<T, SettlementError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation (1000-1099)
    ValidationError,
    SelfReferral,

    // Not found (1100-1199)
    RecordNotFound,
    JobNotFound,
    WalletNotFound,

    // Conflict (1200-1299)
    DuplicateRecord,
    JobAlreadyRunning,

    // Invariant violations (1300-1399)
    ReferralLoopDetected,

    // Database (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    TransactionConflict,

    // Queue backend (2100-2199)
    QueueBackendError,
    QueueConnectionFailed,

    // Serialization (2200-2299)
    SerializationError,
    DeserializationError,

    // External services (3000-3099)
    ExternalServiceError,
    ExternalRateLimited,
    ExternalTimeout,
    NetworkError,

    // Configuration (5000-5099)
    ConfigurationError,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ValidationError => 1000,
            Self::SelfReferral => 1003,

            Self::RecordNotFound => 1100,
            Self::JobNotFound => 1101,
            Self::WalletNotFound => 1102,

            Self::DuplicateRecord => 1200,
            Self::JobAlreadyRunning => 1201,

            Self::ReferralLoopDetected => 1300,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::TransactionConflict => 2003,

            Self::QueueBackendError => 2100,
            Self::QueueConnectionFailed => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ExternalServiceError => 3000,
            Self::ExternalRateLimited => 3001,
            Self::ExternalTimeout => 3002,
            Self::NetworkError => 3003,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Transient failures that a retry loop may resolve.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::TransactionConflict
                | Self::QueueConnectionFailed
                | Self::ExternalServiceError
                | Self::ExternalRateLimited
                | Self::ExternalTimeout
                | Self::NetworkError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "validation",
            1100..=1199 => "not_found",
            1200..=1299 => "conflict",
            1300..=1399 => "invariant",
            2000..=2099 => "database",
            2100..=2199 => "queue",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input, skipped rows
    Low,
    /// Retryable operational issues
    Medium,
    /// Failed settlements, broken collaborators
    High,
    /// Lost connectivity or corrupted invariants
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::SelfReferral
            | ErrorCode::RecordNotFound
            | ErrorCode::JobNotFound
            | ErrorCode::WalletNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::JobAlreadyRunning => Self::Low,

            ErrorCode::TransactionConflict
            | ErrorCode::ExternalRateLimited
            | ErrorCode::ExternalTimeout => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::QueueBackendError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ExternalServiceError
            | ErrorCode::NetworkError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::ReferralLoopDetected
            | ErrorCode::DatabaseConnectionFailed
            | ErrorCode::QueueConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the settlement engine.
#[derive(Error, Debug)]
pub struct SettlementError {
    code: ErrorCode,

    /// Safe to show on the admin dashboard
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Delay requested by a rate-limited upstream
    retry_after: Option<Duration>,

    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SettlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl SettlementError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            retry_after: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    pub fn not_found(entity_type: &str, entity_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// The referrer's upline already contains the user being registered.
    pub fn referral_loop(referrer_id: impl fmt::Display, referred_id: impl fmt::Display) -> Self {
        Self::with_internal(
            ErrorCode::ReferralLoopDetected,
            "Referral loop detected",
            format!(
                "user {} is already an upline of referrer {}",
                referred_id, referrer_id
            ),
        )
    }

    pub fn job_not_found(name: &str) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", name))
    }

    pub fn external(service: &str, message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ExternalServiceError,
            format!("{} request failed", service),
            message,
        )
    }

    pub fn rate_limited(service: &str, retry_after: Option<Duration>) -> Self {
        let mut error = Self::new(
            ErrorCode::ExternalRateLimited,
            format!("{} rate limit exceeded", service),
        );
        if let Some(delay) = retry_after {
            error.internal_message = Some(format!("retry after {}s", delay.as_secs()));
        }
        error.retry_after = retry_after;
        error
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Missing wallet, pool, user or similar: the row is skipped.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_not_found(&self) -> bool {
        self.code.category() == "not_found"
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "settlement_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| SettlementError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| SettlementError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| SettlementError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| SettlementError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for SettlementError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure / deadlock_detected
                Some("40001") | Some("40P01") => (
                    ErrorCode::TransactionConflict,
                    "Concurrent update conflict",
                ),
                Some("23505") => {
                    let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        format!("Constraint violation: {}", constraint),
                    )
                    .with_source(error);
                }
                _ => (ErrorCode::DatabaseQueryFailed, "A database error occurred"),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for SettlementError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Database migration failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<redis::RedisError> for SettlementError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (
                ErrorCode::QueueConnectionFailed,
                "Unable to connect to the queue backend",
            )
        } else {
            (ErrorCode::QueueBackendError, "A queue backend error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for SettlementError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::ExternalTimeout, "External service request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to external service")
        } else if error.status().map(|s| s.as_u16()) == Some(429) {
            (ErrorCode::ExternalRateLimited, "External service rate limit exceeded")
        } else {
            (ErrorCode::ExternalServiceError, "External service returned an error")
        };

        // Request URLs carry provider keys.
        let detail = crate::telemetry::SensitiveFieldRedactor::global().redact_value(&error.to_string());
        Self::with_internal(code, user_msg, detail).with_source(error)
    }
}

impl From<std::io::Error> for SettlementError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for SettlementError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", error))
    }
}

impl From<config::ConfigError> for SettlementError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::TransactionConflict.is_retryable());
        assert!(ErrorCode::ExternalTimeout.is_retryable());
        assert!(!ErrorCode::ReferralLoopDetected.is_retryable());
        assert!(!ErrorCode::WalletNotFound.is_retryable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::SelfReferral.category(), "validation");
        assert_eq!(ErrorCode::WalletNotFound.category(), "not_found");
        assert_eq!(ErrorCode::ReferralLoopDetected.category(), "invariant");
        assert_eq!(ErrorCode::QueueBackendError.category(), "queue");
    }

    #[test]
    fn test_referral_loop_is_critical() {
        let err = SettlementError::referral_loop("a", "b");
        assert_eq!(err.code(), ErrorCode::ReferralLoopDetected);
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.user_message(), "Referral loop detected");
        assert!(err.internal_message().unwrap().contains("referrer a"));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let err = missing.context("wallet missing").unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
        assert_eq!(err.user_message(), "wallet missing");
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        let err: SettlementError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_error_display() {
        let err = SettlementError::with_internal(
            ErrorCode::WalletNotFound,
            "Wallet not found",
            "USDT spot wallet of user 42",
        );
        assert_eq!(
            err.to_string(),
            "[WalletNotFound] Wallet not found (internal: USDT spot wallet of user 42)"
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rate_limited_keeps_delay() {
        let err = SettlementError::rate_limited("openexchangerates", Some(Duration::from_secs(120)));
        assert_eq!(err.code(), ErrorCode::ExternalRateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(120)));
        assert_eq!(err.internal_message(), Some("retry after 120s"));
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
    }
}
