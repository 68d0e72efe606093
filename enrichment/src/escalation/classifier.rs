//! Failure classification and generic-version detection.
//!
//! Typed errors carry their own [`ErrorCategory`]. [`categorize_error`] is
//! kept for free-text messages: persisted `last_error` strings and data
//! written before categories were recorded.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed out|timeout|time-out|curl error 28|deadline exceeded)").unwrap()
});

static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate.?limit|too many requests|\b429\b|\b529\b|overloaded)").unwrap()
});

static GENERIC_VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(generic version|vers(ã|a)o gen(é|e)rica|generic_version)").unwrap()
});

static JSON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(json|syntax error|unexpected end|expected value|parse)").unwrap()
});

static VALIDATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(validation|missing field|required|insufficient|at least|must contain)")
        .unwrap()
});

/// Placeholder trim names that do not identify a real vehicle version.
const GENERIC_VERSION_PATTERNS: &[&str] = &[
    "comfort",
    "style",
    "premium",
    "base",
    "standard",
    "entry",
    "basic",
    "básic",
    "intermediári",
    "intermediari",
    "top de linha",
    "versão 1",
    "versão 2",
    "versao 1",
    "versao 2",
    "version 1",
    "version 2",
];

/// Failure categories driving escalation and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ApiTimeout,
    ApiRateLimit,
    JsonParseError,
    ValidationError,
    GenericVersionPersist,
    Other,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        Self::ApiTimeout,
        Self::ApiRateLimit,
        Self::JsonParseError,
        Self::ValidationError,
        Self::GenericVersionPersist,
        Self::Other,
    ];

    /// Retry at the same tier; a stronger model will not help.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ApiTimeout | Self::ApiRateLimit)
    }

    /// Failures that correlate with an under-powered model.
    pub fn warrants_escalation(self) -> bool {
        !self.is_transient()
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiTimeout => write!(f, "api_timeout"),
            Self::ApiRateLimit => write!(f, "api_rate_limit"),
            Self::JsonParseError => write!(f, "json_parse_error"),
            Self::ValidationError => write!(f, "validation_error"),
            Self::GenericVersionPersist => write!(f, "generic_version_persist"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Classify a free-text error message.
pub fn categorize_error(message: &str) -> ErrorCategory {
    if TIMEOUT_PATTERN.is_match(message) {
        return ErrorCategory::ApiTimeout;
    }
    if RATE_LIMIT_PATTERN.is_match(message) {
        return ErrorCategory::ApiRateLimit;
    }
    if GENERIC_VERSION_PATTERN.is_match(message) {
        return ErrorCategory::GenericVersionPersist;
    }
    if JSON_PATTERN.is_match(message) {
        return ErrorCategory::JsonParseError;
    }
    if VALIDATION_PATTERN.is_match(message) {
        return ErrorCategory::ValidationError;
    }
    ErrorCategory::Other
}

/// Whether `candidate` is a placeholder rather than a real trim name.
pub fn is_generic_version(candidate: &str) -> bool {
    let lower = candidate.trim().to_lowercase();
    if lower.is_empty() {
        return true;
    }
    GENERIC_VERSION_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}
