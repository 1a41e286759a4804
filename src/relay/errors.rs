use thiserror::Error;

use super::bundle::BundleError;
use super::classifier::{ErrorCategory, ErrorClassification};

/// Failure of a single engine within a failover sequence
#[derive(Debug, Clone)]
pub struct EngineFailure {
    pub engine: String,
    pub error: SubmissionError,
}

/// Comprehensive submission error types
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    /// Transaction set could not be constructed
    #[error("Invalid transaction set: {0}")]
    Bundle(#[from] BundleError),

    /// Request rejected by the relay as inherently invalid
    #[error("Non-retryable {category} failure on {engine} via {endpoint}: {message}")]
    NonRetryable {
        engine: String,
        endpoint: String,
        category: ErrorCategory,
        attempts: u32,
        message: String,
    },

    /// Attempt budget used up on retryable failures
    #[error("{engine} exhausted {attempts} attempts, last {category} failure via {endpoint}: {message}")]
    Exhausted {
        engine: String,
        endpoint: String,
        category: ErrorCategory,
        attempts: u32,
        message: String,
    },

    /// Caller cancelled the submission
    #[error("Submission cancelled on {engine} after {attempts} attempts")]
    Cancelled { engine: String, attempts: u32 },

    /// The bundle source failed to produce or refresh a set
    #[error("Bundle source error: {0}")]
    Source(String),

    /// Engine lookup or configuration problem
    #[error("Engine error: {0}")]
    Engine(String),

    /// Every engine in the priority order failed
    #[error("All {} engines failed: {}", .failures.len(), format_failures(.failures))]
    AllEnginesFailed { failures: Vec<EngineFailure> },
}

fn format_failures(failures: &[EngineFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.engine, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SubmissionError {
    pub(crate) fn from_classification(
        engine: &str,
        endpoint: &str,
        attempts: u32,
        classification: &ErrorClassification,
    ) -> Self {
        let message = classification
            .reason
            .clone()
            .unwrap_or_else(|| classification.category.to_string());
        if classification.retry {
            SubmissionError::Exhausted {
                engine: engine.to_string(),
                endpoint: endpoint.to_string(),
                category: classification.category,
                attempts,
                message,
            }
        } else {
            SubmissionError::NonRetryable {
                engine: engine.to_string(),
                endpoint: endpoint.to_string(),
                category: classification.category,
                attempts,
                message,
            }
        }
    }

    /// Last failure category, if the error came from the network path
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            SubmissionError::NonRetryable { category, .. }
            | SubmissionError::Exhausted { category, .. } => Some(*category),
            SubmissionError::Bundle(_) => Some(ErrorCategory::Client),
            _ => None,
        }
    }

    /// Attempts consumed before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            SubmissionError::NonRetryable { attempts, .. }
            | SubmissionError::Exhausted { attempts, .. }
            | SubmissionError::Cancelled { attempts, .. } => *attempts,
            SubmissionError::AllEnginesFailed { failures } => {
                failures.iter().map(|f| f.error.attempts()).sum()
            }
            _ => 0,
        }
    }

    /// Engine messages for alerting, one per engine for aggregates
    pub fn reasons(&self) -> Vec<String> {
        match self {
            SubmissionError::AllEnginesFailed { failures } => failures
                .iter()
                .map(|f| format!("{}: {}", f.engine, f.error))
                .collect(),
            other => vec![other.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_lists_every_engine() {
        let failures = ["jito", "direct", "bloxroute"]
            .iter()
            .map(|e| EngineFailure {
                engine: e.to_string(),
                error: SubmissionError::Exhausted {
                    engine: e.to_string(),
                    endpoint: "https://relay".into(),
                    category: ErrorCategory::Backend,
                    attempts: 2,
                    message: "HTTP 503".into(),
                },
            })
            .collect();
        let err = SubmissionError::AllEnginesFailed { failures };
        assert_eq!(err.reasons().len(), 3);
        assert_eq!(err.attempts(), 6);
        let text = err.to_string();
        assert!(text.starts_with("All 3 engines failed"));
        assert!(text.contains("[jito]") && text.contains("[direct]") && text.contains("[bloxroute]"));
    }

    #[test]
    fn test_classification_maps_to_variant() {
        let c = ErrorClassification {
            category: ErrorCategory::Client,
            retry: false,
            retry_after_ms: None,
            status: Some(400),
            reason: Some("HTTP 400".into()),
        };
        let err = SubmissionError::from_classification("jito", "https://a", 1, &c);
        assert!(matches!(err, SubmissionError::NonRetryable { attempts: 1, .. }));
        assert_eq!(err.category(), Some(ErrorCategory::Client));
    }
}
