//! Scheduled automation engines
//!
//! Liquidity top-ups, fee harvests and token burns share one driver,
//! [`orchestrator::ExecutionOrchestrator`]; the modules here supply what it
//! needs per unit (sizing, chain reads, transaction building, signing, pricing).

pub mod chain;
pub mod errors;
pub mod oracle;
pub mod orchestrator;
pub mod planner;
pub mod signer;
pub mod tx_factory;
pub mod work_unit;

pub use chain::{ChainClient, ChainStatusSource, RpcChainClient};
pub use errors::OrchestrationError;
pub use oracle::{HttpPriceOracle, NoOracle, PriceOracle};
pub use orchestrator::{
    ExecutionOrchestrator, OrchestratorDeps, OrchestratorSettings, PassSummary, UnitOutcome, UnitReport,
};
pub use signer::{InstallationKeyStore, KdfParams, KeyContext, KeyStore};
pub use tx_factory::{BuildRequest, TransactionFactory, VenueTransactionFactory};
pub use work_unit::{AutomationKind, LifecycleStage, TriggerEvent, WorkUnit};
