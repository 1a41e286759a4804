use thiserror::Error;

use crate::ledger::fixed_point::FixedAmount;
use crate::ledger::store::StoreError;
use crate::relay::errors::SubmissionError;

/// Orchestration failures. All are terminal for the current pass only.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Amount {amount} below minimum trigger {minimum}")]
    BelowMinimum { amount: FixedAmount, minimum: FixedAmount },

    #[error("Failed to decrypt signing key: {0}")]
    DecryptFailure(String),

    #[error("Insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: FixedAmount, required: FixedAmount },

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Transaction build failed: {0}")]
    Build(String),

    #[error("Chain query failed: {0}")]
    Chain(String),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Relay reported landing failure: {0}")]
    LandingFailed(String),

    #[error("Work unit {0} is already being processed")]
    InProgress(String),

    #[error("Work unit not found: {0}")]
    UnitNotFound(String),
}

impl OrchestrationError {
    /// Short machine-readable kind for summaries and ledger entries
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::BelowMinimum { .. } => "below_minimum",
            OrchestrationError::DecryptFailure(_) => "decrypt_failure",
            OrchestrationError::InsufficientFunds { .. } => "insufficient_funds",
            OrchestrationError::InvalidDestination(_) => "invalid_destination",
            OrchestrationError::Build(_) => "build",
            OrchestrationError::Chain(_) => "chain",
            OrchestrationError::Submission(_) => "submission",
            OrchestrationError::Store(_) => "store",
            OrchestrationError::LandingFailed(_) => "landing_failed",
            OrchestrationError::InProgress(_) => "in_progress",
            OrchestrationError::UnitNotFound(_) => "unit_not_found",
        }
    }

    /// Whether the next pass may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::Submission(e) => e.category().map_or(true, |c| c.is_retryable()),
            OrchestrationError::Chain(_)
            | OrchestrationError::InsufficientFunds { .. }
            | OrchestrationError::BelowMinimum { .. }
            | OrchestrationError::InProgress(_)
            | OrchestrationError::LandingFailed(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(OrchestrationError::Chain("rpc down".into()).is_retryable());
        assert!(OrchestrationError::LandingFailed("expired".into()).is_retryable());
        assert!(!OrchestrationError::DecryptFailure("bad tag".into()).is_retryable());
        assert!(!OrchestrationError::InvalidDestination("x".into()).is_retryable());
        assert_eq!(OrchestrationError::Build("x".into()).kind(), "build");
    }
}
