//! Idempotent ledger and fixed-point accounting

pub mod fixed_point;
pub mod in_flight;
pub mod store;

pub use fixed_point::FixedAmount;
pub use in_flight::{InFlightGuard, InFlightRegistry};
pub use store::{LedgerEntry, LedgerStatus, LedgerStore, StoreError, UnitUpdate};
