//! Structured warnings for partial failures.

use serde::Serialize;

use super::errors::{ErrorSeverity, StructuredError};

/// A non-fatal issue attached to a scrape report.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeWarning {
    pub message: String,
    pub severity: ErrorSeverity,
    /// Operation the warning originated from.
    pub context: String,
    /// IDs or descriptions of the affected items (page numbers, listing ids).
    pub affected_items: Vec<String>,
    pub impact: Option<String>,
}

/// Collects warnings across a pipeline run.
#[derive(Debug, Default)]
pub struct WarningSink {
    warnings: Vec<ScrapeWarning>,
}

impl WarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        message: impl Into<String>,
        severity: ErrorSeverity,
        context: impl Into<String>,
        affected_items: Vec<String>,
        impact: Option<String>,
    ) {
        self.warnings.push(ScrapeWarning {
            message: message.into(),
            severity,
            context: context.into(),
            affected_items,
            impact,
        });
    }

    /// Record a classified error as a warning, keeping its severity.
    pub fn add_error(&mut self, error: &StructuredError, affected_items: Vec<String>, impact: Option<String>) {
        self.warnings.push(ScrapeWarning {
            message: error.message.clone(),
            severity: error.severity,
            context: error.category.as_str().to_string(),
            affected_items,
            impact,
        });
    }

    pub fn has_severity_at_least(&self, severity: ErrorSeverity) -> bool {
        self.warnings.iter().any(|w| w.severity >= severity)
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn into_vec(self) -> Vec<ScrapeWarning> {
        self.warnings
    }
}
