//! Launchpad relay library
//!
//! Transaction submission across competing relay engines with classified
//! retries, failover and landing confirmation, plus the scheduled automation
//! engines that drive it and the idempotent ledger they commit to.

pub mod automation;
pub mod config;
pub mod endpoints;
pub mod ledger;
pub mod metrics;
pub mod observability;
pub mod relay;
pub mod structured_logging;

pub use automation::{AutomationKind, ExecutionOrchestrator, PassSummary};
pub use config::{AutomationConfig, ConfigError, RelayConfig};
pub use ledger::{FixedAmount, LedgerStore};
pub use relay::{BundleResult, FailoverCoordinator, SendOptions, SubmissionError, TransactionSet};

#[cfg(test)]
mod tests {
    mod confirmation_tests;
    mod failover_tests;
    mod orchestrator_tests;
    mod submitter_tests;
    mod test_helpers;
}
