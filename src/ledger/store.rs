//! Persistent work-unit and ledger store
//!
//! Backed by `sled` with four trees:
//!
//! - `units`: work units keyed by id
//! - `ledger`: append-only entries keyed `{unit}\0{nanos:020}\0{entry}`
//! - `triggers`: upstream events keyed `{unit}\0{trigger}`
//! - `aggregates`: per-kind display totals
//!
//! Every outcome is committed with [`LedgerStore::record_outcome`], a single
//! multi-tree transaction: the ledger append, the unit update and (for
//! trigger-derived work) the trigger's processed marker land together or
//! not at all.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::automation::work_unit::{AutomationKind, TriggerEvent, WorkUnit};
use crate::ledger::fixed_point::FixedAmount;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Record encoding error: {0}")]
    Codec(String),

    #[error("Work unit not found: {0}")]
    UnitNotFound(String),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Trigger already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Ledger entry already exists: {0}")]
    DuplicateEntry(String),
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(err: TransactionError<StoreError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::Sled(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Success,
    Failed,
    /// Nothing submitted (below minimum)
    Skipped,
    /// Dry-run submission
    Simulated,
    /// Submitted but landing could not be established
    Unconfirmed,
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub work_unit_id: String,
    pub kind: AutomationKind,
    pub amount: FixedAmount,
    pub tx_id: Option<String>,
    pub engine: Option<String>,
    pub status: LedgerStatus,
    pub error: Option<String>,
    pub trigger_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(unit: &WorkUnit, amount: FixedAmount, status: LedgerStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            work_unit_id: unit.id.clone(),
            kind: unit.kind,
            amount,
            tx_id: None,
            engine: None,
            status,
            error: None,
            trigger_id: None,
            timestamp,
        }
    }

    pub fn with_tx(mut self, tx_id: impl Into<String>, engine: impl Into<String>) -> Self {
        self.tx_id = Some(tx_id.into());
        self.engine = Some(engine.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_trigger(mut self, trigger_id: impl Into<String>) -> Self {
        self.trigger_id = Some(trigger_id.into());
        self
    }

    fn key(&self) -> Vec<u8> {
        let nanos = self.timestamp.timestamp_nanos_opt().unwrap_or(0).max(0);
        format!("{}\0{:020}\0{}", self.work_unit_id, nanos, self.id).into_bytes()
    }
}

/// Per-kind totals shown on dashboards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindAggregate {
    pub executions: u64,
    pub total_amount: FixedAmount,
    pub total_value: FixedAmount,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// Unit mutation applied together with a ledger entry
#[derive(Debug, Clone, PartialEq)]
pub struct UnitUpdate {
    pub executed_at: DateTime<Utc>,
    /// Landed amount; `None` leaves the cumulative totals untouched
    pub landed_amount: Option<FixedAmount>,
    /// Quote value of the landed amount
    pub landed_value: Option<FixedAmount>,
    pub price: Option<f64>,
}

impl UnitUpdate {
    /// Advance the clock only
    pub fn advance(executed_at: DateTime<Utc>) -> Self {
        Self {
            executed_at,
            landed_amount: None,
            landed_value: None,
            price: None,
        }
    }
}

/// `executed_at`, or one millisecond past `previous` when the clock has not moved
pub fn advanced_timestamp(previous: Option<DateTime<Utc>>, executed_at: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if executed_at <= prev => prev + ChronoDuration::milliseconds(1),
        _ => executed_at,
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn abort<T>(err: StoreError) -> Result<T, ConflictableTransactionError<StoreError>> {
    Err(ConflictableTransactionError::Abort(err))
}

fn trigger_key(unit_id: &str, trigger_id: &str) -> Vec<u8> {
    format!("{}\0{}", unit_id, trigger_id).into_bytes()
}

fn prefix(unit_id: &str) -> Vec<u8> {
    format!("{}\0", unit_id).into_bytes()
}

#[derive(Clone)]
pub struct LedgerStore {
    db: sled::Db,
    units: sled::Tree,
    ledger: sled::Tree,
    triggers: sled::Tree,
    aggregates: sled::Tree,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            units: db.open_tree("units")?,
            ledger: db.open_tree("ledger")?,
            triggers: db.open_tree("triggers")?,
            aggregates: db.open_tree("aggregates")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn put_unit(&self, unit: &WorkUnit) -> Result<(), StoreError> {
        self.units.insert(unit.id.as_bytes(), encode(unit)?)?;
        Ok(())
    }

    pub fn get_unit(&self, id: &str) -> Result<Option<WorkUnit>, StoreError> {
        self.units.get(id.as_bytes())?.map(|b| decode(&b)).transpose()
    }

    pub fn units(&self) -> Result<Vec<WorkUnit>, StoreError> {
        self.units
            .iter()
            .values()
            .map(|v| decode(&v?))
            .collect()
    }

    /// Enabled units of `kind` whose interval elapsed and whose activity clears `min_activity`
    pub fn eligible_units(
        &self,
        kind: AutomationKind,
        now: DateTime<Utc>,
        min_activity: f64,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        let mut eligible: Vec<WorkUnit> = self
            .units()?
            .into_iter()
            .filter(|u| u.kind == kind && u.is_due(now) && u.activity >= min_activity)
            .collect();
        // Longest-waiting first
        eligible.sort_by_key(|u| u.last_executed_at);
        Ok(eligible)
    }

    pub fn put_trigger(&self, trigger: &TriggerEvent) -> Result<(), StoreError> {
        self.triggers
            .insert(trigger_key(&trigger.unit_id, &trigger.id), encode(trigger)?)?;
        Ok(())
    }

    pub fn get_trigger(&self, unit_id: &str, trigger_id: &str) -> Result<Option<TriggerEvent>, StoreError> {
        self.triggers
            .get(trigger_key(unit_id, trigger_id))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Unprocessed triggers for a unit, oldest first
    pub fn pending_triggers(&self, unit_id: &str) -> Result<Vec<TriggerEvent>, StoreError> {
        let mut pending = Vec::new();
        for item in self.triggers.scan_prefix(prefix(unit_id)) {
            let (_, value) = item?;
            let trigger: TriggerEvent = decode(&value)?;
            if !trigger.processed {
                pending.push(trigger);
            }
        }
        pending.sort_by_key(|t| t.observed_at);
        Ok(pending)
    }

    /// Ledger entries for a unit in timestamp order
    pub fn entries_for(&self, unit_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        self.ledger
            .scan_prefix(prefix(unit_id))
            .values()
            .map(|v| decode(&v?))
            .collect()
    }

    pub fn aggregate(&self, kind: AutomationKind) -> Result<KindAggregate, StoreError> {
        Ok(self
            .aggregates
            .get(kind.as_str())?
            .map(|b| decode(&b))
            .transpose()?
            .unwrap_or_default())
    }

    /// Commit one unit outcome atomically
    ///
    /// Appends `entry`, advances `last_executed_at` strictly, applies landed
    /// totals and, when `entry.trigger_id` is set, marks that trigger processed.
    /// A trigger already marked processed aborts the whole commit with
    /// [`StoreError::AlreadyProcessed`].
    pub fn record_outcome(&self, entry: &LedgerEntry, update: &UnitUpdate) -> Result<WorkUnit, StoreError> {
        let entry_bytes = encode(entry)?;
        let entry_key = entry.key();
        let kind_key = entry.kind.as_str();

        let unit = (&self.units, &self.ledger, &self.triggers, &self.aggregates).transaction(
            |(units, ledger, triggers, aggregates)| {
                let mut unit: WorkUnit = match units.get(entry.work_unit_id.as_bytes())? {
                    Some(bytes) => decode(&bytes).or_else(abort)?,
                    None => return abort(StoreError::UnitNotFound(entry.work_unit_id.clone())),
                };

                if let Some(trigger_id) = &entry.trigger_id {
                    mark_trigger(triggers, &entry.work_unit_id, trigger_id, update.executed_at)?;
                }

                if ledger.get(&entry_key)?.is_some() {
                    return abort(StoreError::DuplicateEntry(entry.id.clone()));
                }
                ledger.insert(entry_key.as_slice(), entry_bytes.as_slice())?;

                let executed_at = advanced_timestamp(unit.last_executed_at, update.executed_at);
                unit.last_executed_at = Some(executed_at);
                if let Some(price) = update.price {
                    unit.last_known_price = Some(price);
                }

                if let Some(amount) = update.landed_amount {
                    let value = update.landed_value.unwrap_or_default();
                    unit.cumulative_total += amount;
                    unit.cumulative_value += value;
                    unit.execution_count += 1;
                    unit.last_amount = Some(amount);

                    let mut agg: KindAggregate = match aggregates.get(kind_key)? {
                        Some(bytes) => decode(&bytes).or_else(abort)?,
                        None => KindAggregate::default(),
                    };
                    agg.executions += 1;
                    agg.total_amount += amount;
                    agg.total_value += value;
                    agg.last_executed_at = Some(executed_at);
                    aggregates.insert(kind_key, encode(&agg).or_else(abort)?)?;
                }

                units.insert(unit.id.as_bytes(), encode(&unit).or_else(abort)?)?;
                Ok(unit)
            },
        )?;

        debug!(
            unit_id = %unit.id,
            status = ?entry.status,
            last_executed_at = ?unit.last_executed_at,
            "Ledger outcome committed"
        );
        Ok(unit)
    }
}

fn mark_trigger(
    triggers: &TransactionalTree,
    unit_id: &str,
    trigger_id: &str,
    processed_at: DateTime<Utc>,
) -> Result<(), ConflictableTransactionError<StoreError>> {
    let key = trigger_key(unit_id, trigger_id);
    let mut trigger: TriggerEvent = match triggers.get(&key)? {
        Some(bytes) => decode(&bytes).or_else(abort)?,
        None => return abort(StoreError::TriggerNotFound(trigger_id.to_string())),
    };
    if trigger.processed {
        return abort(StoreError::AlreadyProcessed(trigger_id.to_string()));
    }
    trigger.processed = true;
    trigger.processed_at = Some(processed_at);
    triggers.insert(key, encode(&trigger).or_else(abort)?)?;
    Ok(())
}
