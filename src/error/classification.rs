//! Failure classification shared by the breaker, the retry policy and reporting.

use serde::{Deserialize, Serialize};

/// Category of a failure observed while talking to an external resource.
///
/// Only failures attributable to the resource itself (everything except
/// [`ErrorCategory::Permanent`]) are retried and counted toward a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "category", content = "detail")]
pub enum ErrorCategory {
    /// Connection failures and 5xx-style server errors.
    Transient(String),
    /// The resource asked us to slow down.
    RateLimited(String),
    /// No answer within the allotted time.
    Timeout(String),
    /// Authorization failures, malformed input, missing objects.
    Permanent(String),
}

impl ErrorCategory {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent(_))
    }

    /// Whether the failure counts against the resource's circuit breaker.
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_retryable()
    }

    /// Stable label used in reports and evidence.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Transient(_) => "transient",
            ErrorCategory::RateLimited(_) => "rate_limited",
            ErrorCategory::Timeout(_) => "timeout",
            ErrorCategory::Permanent(_) => "permanent",
        }
    }
}

/// Errors that know which [`ErrorCategory`] they belong to.
pub trait Classify {
    fn classify(&self) -> ErrorCategory;
}

/// Classify free-form error text coming back from an external tool.
///
/// Permanent markers win over transient ones so that a "400 bad request"
/// mentioning a timeout header is not retried.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let detail = message.trim().to_string();

    const PERMANENT: [&str; 8] = [
        "400",
        "401",
        "403",
        "404",
        "unauthorized",
        "forbidden",
        "not found",
        "invalid",
    ];
    if PERMANENT.iter().any(|marker| lower.contains(marker)) {
        return ErrorCategory::Permanent(detail);
    }
    if lower.contains("429") || lower.contains("rate limit") {
        return ErrorCategory::RateLimited(detail);
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return ErrorCategory::Timeout(detail);
    }
    ErrorCategory::Transient(detail)
}
