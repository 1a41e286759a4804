//! Relay submission layer
//!
//! Leaf-first: [`classifier`] and [`backoff`] are pure, [`engine`] holds the
//! immutable engine set, [`submitter`] delivers to one engine,
//! [`failover`] walks engines in order, [`confirmation`] polls for landing.

pub mod backoff;
pub mod bundle;
pub mod classifier;
pub mod confirmation;
pub mod engine;
pub mod errors;
pub mod failover;
pub mod submitter;
pub mod transport;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use bundle::{BundleSource, TransactionSet, MAX_BUNDLE_SIZE};
pub use classifier::{ErrorCategory, ErrorClassification, ErrorClassifier, RelayFailure};
pub use confirmation::{ConfirmationOutcome, ConfirmationPoller, ConfirmationStatus, StatusSource};
pub use engine::{Engine, EngineKey, EngineRegistry, SubmitMethod};
pub use errors::SubmissionError;
pub use failover::{FailoverCoordinator, SendOptions};
pub use submitter::{BundleResult, SubmitContext, Submitter, SubmitterConfig};
pub use transport::{HttpRelayTransport, RelayTransport};
