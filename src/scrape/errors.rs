//! Error classification for scrape operations.
//!
//! Errors are classified by message pattern into a category that decides
//! retry behaviour and user-visible severity. Patterns are compiled once.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Timeout / connection / DNS. Retryable.
    Network,
    /// Semaphore exhaustion, memory pressure. Retryable with larger backoff.
    Resource,
    /// Context/page/browser closed or unavailable.
    Browser,
    /// Expected selector or element absent. Degrade the record.
    Parsing,
    /// Bad input. Surface to the caller.
    Validation,
    /// HTTP status >= 400. 404 terminal, 5xx retryable.
    HttpClient,
    /// Classification of last resort, assumed transient.
    Recoverable,
    NonRecoverable,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Resource => "resource",
            Self::Browser => "browser",
            Self::Parsing => "parsing",
            Self::Validation => "validation",
            Self::HttpClient => "http_client",
            Self::Recoverable => "recoverable",
            Self::NonRecoverable => "non_recoverable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A classified error with user-visible context and recovery hints.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub recovery_suggestions: Vec<String>,
}

impl StructuredError {
    pub fn should_retry(&self, attempt: u32, retry_count: u32) -> bool {
        self.retryable && attempt < retry_count && self.severity != ErrorSeverity::Critical
    }
}

static NETWORK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"timeout|timed out|connection|network|dns|resolve|unreachable").expect("static regex")
});
static BROWSER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"browser|context|page|chromium|cdp|target|websocket|session").expect("static regex")
});
static RESOURCE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"memory|resource|limit|quota|exhausted|semaphore").expect("static regex")
});
static PARSING_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"selector|element|extract|parse|not found on page|missing field").expect("static regex")
});
static VALIDATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"validation|invalid|must be").expect("static regex"));
static HTTP_TERMINAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b404\b").expect("static regex"));
static HTTP_TRANSIENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(429|500|502|503|504)\b|too many requests").expect("static regex"));

/// Classify an error into a structured, user-visible record.
pub fn classify_error(error: &anyhow::Error, operation: &str) -> StructuredError {
    // {:#} preserves the context chain for pattern matching.
    let message = format!("{error:#}");
    let lower = message.to_lowercase();

    if HTTP_TRANSIENT_PATTERN.is_match(&lower) {
        return StructuredError {
            message: format!("HTTP error during {operation}: {message}"),
            category: ErrorCategory::HttpClient,
            severity: ErrorSeverity::Medium,
            retryable: true,
            recovery_suggestions: vec![
                "Retry after a short delay".to_string(),
                "Reduce request concurrency".to_string(),
            ],
        };
    }
    if HTTP_TERMINAL_PATTERN.is_match(&lower) {
        return StructuredError {
            message: format!("HTTP error during {operation}: {message}"),
            category: ErrorCategory::HttpClient,
            severity: ErrorSeverity::Medium,
            retryable: false,
            recovery_suggestions: vec!["Verify the listing still exists".to_string()],
        };
    }
    if NETWORK_PATTERN.is_match(&lower) {
        return StructuredError {
            message: format!("Network error during {operation}: {message}"),
            category: ErrorCategory::Network,
            severity: ErrorSeverity::Medium,
            retryable: true,
            recovery_suggestions: vec![
                "Retry the operation after a brief delay".to_string(),
                "Check network connectivity".to_string(),
                "Verify the target URL is accessible".to_string(),
            ],
        };
    }
    if RESOURCE_PATTERN.is_match(&lower) {
        return StructuredError {
            message: format!("Resource limitation during {operation}: {message}"),
            category: ErrorCategory::Resource,
            severity: ErrorSeverity::Medium,
            retryable: true,
            recovery_suggestions: vec![
                "Retry with longer backoff".to_string(),
                "Lower the concurrency settings".to_string(),
            ],
        };
    }
    if BROWSER_PATTERN.is_match(&lower) {
        return StructuredError {
            message: format!("Browser error during {operation}: {message}"),
            category: ErrorCategory::Browser,
            severity: ErrorSeverity::High,
            retryable: false,
            recovery_suggestions: vec![
                "Recreate the browser context".to_string(),
                "Retry with a fresh browser instance".to_string(),
            ],
        };
    }
    if PARSING_PATTERN.is_match(&lower) {
        return StructuredError {
            message: format!("Parsing error during {operation}: {message}"),
            category: ErrorCategory::Parsing,
            severity: ErrorSeverity::Low,
            retryable: false,
            recovery_suggestions: vec![
                "The page layout may have changed; record degraded".to_string(),
            ],
        };
    }
    if VALIDATION_PATTERN.is_match(&lower) {
        return StructuredError {
            message: format!("Validation error during {operation}: {message}"),
            category: ErrorCategory::Validation,
            severity: ErrorSeverity::Medium,
            retryable: false,
            recovery_suggestions: vec!["Check the request parameters".to_string()],
        };
    }

    StructuredError {
        message: format!("Error during {operation}: {message}"),
        category: ErrorCategory::Recoverable,
        severity: ErrorSeverity::Medium,
        retryable: true,
        recovery_suggestions: vec!["Retry the operation".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn network_errors_are_retryable() {
        let err = classify_error(&anyhow!("Page navigation timeout after 120s"), "fetch_list");
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.retryable);
        assert!(err.should_retry(0, 2));
        assert!(!err.should_retry(2, 2));
    }

    #[test]
    fn http_404_is_terminal() {
        let err = classify_error(&anyhow!("server returned 404 for ad"), "fetch_detail");
        assert_eq!(err.category, ErrorCategory::HttpClient);
        assert!(!err.retryable);
    }

    #[test]
    fn http_5xx_is_transient() {
        let err = classify_error(&anyhow!("upstream returned 503"), "fetch_detail");
        assert_eq!(err.category, ErrorCategory::HttpClient);
        assert!(err.retryable);
    }

    #[test]
    fn selector_errors_do_not_retry() {
        let err = classify_error(&anyhow!("Failed to query selector .breadcrump-link"), "detail");
        assert_eq!(err.category, ErrorCategory::Parsing);
        assert!(!err.should_retry(0, 2));
    }

    #[test]
    fn unknown_errors_default_to_recoverable() {
        let err = classify_error(&anyhow!("something odd happened"), "fetch_list");
        assert_eq!(err.category, ErrorCategory::Recoverable);
        assert!(err.retryable);
    }
}
