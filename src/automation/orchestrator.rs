//! Scheduled execution driver
//!
//! One [`ExecutionOrchestrator::run_pass`] discovers due work units of a kind
//! and walks them sequentially: size the action, build, sign, submit through
//! the failover coordinator, wait for landing, then commit the outcome to the
//! ledger in one store transaction. A unit's failure is recorded and the pass
//! moves on; only discovery errors abort a pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chain::{ChainClient, ChainStatusSource};
use super::errors::OrchestrationError;
use super::oracle::{price_or_last, PriceOracle};
use super::planner::{plan_amount, spendable, PlanDecision};
use super::signer::{sign_messages, KeyContext, KeyStore};
use super::tx_factory::{BuildRequest, TransactionFactory};
use super::work_unit::{AutomationKind, TriggerEvent, WorkUnit};
use crate::ledger::fixed_point::FixedAmount;
use crate::ledger::in_flight::InFlightRegistry;
use crate::ledger::store::{LedgerEntry, LedgerStatus, LedgerStore, StoreError, UnitUpdate};
use crate::metrics::{metrics, Timer};
use crate::observability::TraceContext;
use crate::relay::bundle::{BundleSource, TransactionSet};
use crate::relay::confirmation::{ConfirmationPoller, ConfirmationStatus, HttpStatusSource, StatusSource};
use crate::relay::errors::SubmissionError;
use crate::relay::failover::{FailoverCoordinator, SendOptions};
use crate::relay::submitter::BundleResult;
use crate::relay::transport::RelayTransport;
use crate::structured_logging::StructuredLogger;

pub const DEFAULT_INTER_UNIT_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_FAILURE_REASONS: usize = 5;

/// Collaborators shared by every pass
pub struct OrchestratorDeps {
    pub store: LedgerStore,
    pub chain: Arc<dyn ChainClient>,
    pub factory: Arc<dyn TransactionFactory>,
    pub keys: Arc<dyn KeyStore>,
    pub oracle: Arc<dyn PriceOracle>,
    pub coordinator: Arc<FailoverCoordinator>,
    /// Used for engine status endpoints
    pub transport: Arc<dyn RelayTransport>,
    pub poller: ConfirmationPoller,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub inter_unit_delay: Duration,
    pub min_activity: f64,
    /// Lamports kept back from the funding wallet for fees
    pub fee_reserve: FixedAmount,
    pub max_failure_reasons: usize,
    pub in_flight_ttl: Duration,
    pub send_options: SendOptions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            inter_unit_delay: DEFAULT_INTER_UNIT_DELAY,
            min_activity: 0.0,
            fee_reserve: FixedAmount::from_lamports(5_000_000),
            max_failure_reasons: DEFAULT_MAX_FAILURE_REASONS,
            in_flight_ttl: Duration::from_secs(300),
            send_options: SendOptions::default(),
        }
    }
}

/// Result of one unit within a pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded { amount: FixedAmount, tx_id: String, engine: String },
    Simulated { amount: FixedAmount, tx_id: String },
    Skipped { reason: String },
    /// Submitted, landing unknown; needs manual reconciliation
    Unconfirmed { tx_id: String, reason: String },
    Failed { kind: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub unit_id: String,
    #[serde(flatten)]
    pub outcome: UnitOutcome,
}

/// Alerting summary of one pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassSummary {
    pub correlation_id: String,
    pub kind: AutomationKind,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub unconfirmed: u32,
    pub failure_reasons: Vec<String>,
    /// Another pass was still running; nothing was processed
    pub skipped_overlap: bool,
}

impl PassSummary {
    fn empty(trace: &TraceContext, kind: AutomationKind) -> Self {
        Self {
            correlation_id: trace.correlation_id().to_string(),
            kind,
            started_at: trace.started_at,
            duration_ms: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            unconfirmed: 0,
            failure_reasons: Vec::new(),
            skipped_overlap: false,
        }
    }

    fn tally(&mut self, report: &UnitReport, max_reasons: usize) {
        self.processed += 1;
        let reason = match &report.outcome {
            UnitOutcome::Succeeded { .. } | UnitOutcome::Simulated { .. } => {
                self.succeeded += 1;
                None
            }
            UnitOutcome::Skipped { .. } => {
                self.skipped += 1;
                None
            }
            UnitOutcome::Unconfirmed { reason, .. } => {
                self.unconfirmed += 1;
                Some(format!("{}: unconfirmed: {}", report.unit_id, reason))
            }
            UnitOutcome::Failed { error, .. } => {
                self.failed += 1;
                Some(format!("{}: {}", report.unit_id, error))
            }
        };
        if let Some(reason) = reason {
            if self.failure_reasons.len() < max_reasons {
                self.failure_reasons.push(reason);
            }
        }
    }
}

/// How a submitted action ended
enum ActionResult {
    Landed { result: BundleResult, slot: Option<u64> },
    Simulated { result: BundleResult },
    Unconfirmed { result: BundleResult, reason: String },
}

pub struct ExecutionOrchestrator {
    deps: Arc<OrchestratorDeps>,
    settings: OrchestratorSettings,
    pass_lock: AsyncMutex<()>,
    in_flight: InFlightRegistry,
}

impl ExecutionOrchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Self {
        let in_flight = InFlightRegistry::new(settings.in_flight_ttl);
        Self {
            deps: Arc::new(deps),
            settings,
            pass_lock: AsyncMutex::new(()),
            in_flight,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.deps.store
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Process every due unit of `kind` once
    pub async fn run_pass(
        &self,
        kind: AutomationKind,
        cancel: Option<&CancellationToken>,
    ) -> Result<PassSummary, OrchestrationError> {
        let trace = TraceContext::new("automation_pass");
        let logger = StructuredLogger::new(trace.correlation_id().clone());
        let mut summary = PassSummary::empty(&trace, kind);

        let Ok(_pass) = self.pass_lock.try_lock() else {
            warn!(kind = %kind, "Previous pass still running, skipping");
            metrics().passes_overlapped.inc();
            summary.skipped_overlap = true;
            return Ok(summary);
        };

        let timer = Timer::new();
        metrics().passes_total.inc();

        let units = self
            .deps
            .store
            .eligible_units(kind, Utc::now(), self.settings.min_activity)?;
        info!(
            kind = %kind,
            eligible = units.len(),
            correlation_id = %trace.correlation_id(),
            "Automation pass started"
        );

        for (index, unit) in units.into_iter().enumerate() {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                info!(kind = %kind, "Pass cancelled");
                break;
            }
            if index > 0 && !self.settings.inter_unit_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_unit_delay).await;
            }

            let report = match self.in_flight.try_acquire(&unit.id) {
                Some(_guard) => self.process_unit(&unit, &logger, cancel).await,
                None => UnitReport {
                    unit_id: unit.id.clone(),
                    outcome: UnitOutcome::Skipped {
                        reason: "in_progress".to_string(),
                    },
                },
            };
            record_unit_metrics(&report.outcome);
            summary.tally(&report, self.settings.max_failure_reasons);
        }

        summary.duration_ms = timer.elapsed_ms();
        timer.observe_duration(&metrics().pass_duration);
        logger.log_pass_summary(
            kind.as_str(),
            summary.processed,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.duration_ms,
        );
        Ok(summary)
    }

    /// Run one unit now, outside the cadence. Rejected while the unit is
    /// being processed elsewhere.
    pub async fn execute_unit(
        &self,
        unit_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<UnitReport, OrchestrationError> {
        let unit = self
            .deps
            .store
            .get_unit(unit_id)?
            .ok_or_else(|| OrchestrationError::UnitNotFound(unit_id.to_string()))?;
        let _guard = self
            .in_flight
            .try_acquire(unit_id)
            .ok_or_else(|| OrchestrationError::InProgress(unit_id.to_string()))?;

        let logger = StructuredLogger::new(TraceContext::new("manual_execution").correlation_id().clone());
        if !unit.enabled {
            logger.log_unit_skipped(unit_id, "disabled");
            return Ok(UnitReport {
                unit_id: unit.id,
                outcome: UnitOutcome::Skipped {
                    reason: "disabled".to_string(),
                },
            });
        }
        let report = self.process_unit(&unit, &logger, cancel).await;
        record_unit_metrics(&report.outcome);
        Ok(report)
    }

    async fn process_unit(
        &self,
        unit: &WorkUnit,
        logger: &StructuredLogger,
        cancel: Option<&CancellationToken>,
    ) -> UnitReport {
        let outcome = match unit.kind {
            AutomationKind::TokenBurn => self.process_burn(unit, logger, cancel).await,
            AutomationKind::LiquidityTopUp | AutomationKind::FeeHarvest => {
                self.process_balance_action(unit, logger, cancel).await
            }
        };
        match &outcome {
            UnitOutcome::Succeeded { amount, tx_id, .. } => {
                logger.log_unit_succeeded(&unit.id, &amount.to_string(), tx_id)
            }
            UnitOutcome::Simulated { amount, tx_id } => {
                logger.log_unit_succeeded(&unit.id, &amount.to_string(), tx_id)
            }
            UnitOutcome::Skipped { reason } => logger.log_unit_skipped(&unit.id, reason),
            UnitOutcome::Unconfirmed { reason, .. } => {
                logger.log_unit_failed(&unit.id, &format!("unconfirmed: {}", reason))
            }
            UnitOutcome::Failed { error, .. } => logger.log_unit_failed(&unit.id, error),
        }
        UnitReport {
            unit_id: unit.id.clone(),
            outcome,
        }
    }

    /// Top-ups and harvests: size from the funding wallet's SOL balance
    async fn process_balance_action(
        &self,
        unit: &WorkUnit,
        logger: &StructuredLogger,
        cancel: Option<&CancellationToken>,
    ) -> UnitOutcome {
        let amount = match self.plan_from_balance(unit).await {
            Ok(PlanDecision::Execute { amount, clamped }) => {
                if clamped {
                    debug!(unit_id = %unit.id, amount = %amount, "Amount clamped to per-interval maximum");
                }
                amount
            }
            Ok(PlanDecision::BelowMinimum { amount }) => {
                let reason = OrchestrationError::BelowMinimum {
                    amount,
                    minimum: unit.min_trigger,
                };
                return self.commit_skip(unit, amount, &reason.to_string(), None);
            }
            Err(err) => return self.commit_failure(unit, FixedAmount::ZERO, err),
        };

        let result = self.execute_action(unit, amount, None, logger, cancel).await;
        self.commit_action(unit, amount, result, None).await
    }

    async fn plan_from_balance(&self, unit: &WorkUnit) -> Result<PlanDecision, OrchestrationError> {
        let payer = parse_key("source wallet", &unit.source_wallet)?;
        let lamports = self.deps.chain.balance(&payer).await?;
        let available = spendable(FixedAmount::from_lamports(lamports), self.settings.fee_reserve);
        Ok(plan_amount(
            unit.rate_percent,
            available,
            unit.max_per_interval,
            unit.min_trigger,
        ))
    }

    /// Burns: one action per unprocessed trigger, each committed with its marker
    async fn process_burn(
        &self,
        unit: &WorkUnit,
        logger: &StructuredLogger,
        cancel: Option<&CancellationToken>,
    ) -> UnitOutcome {
        let triggers = match self.deps.store.pending_triggers(&unit.id) {
            Ok(t) => t,
            Err(err) => return self.commit_failure(unit, FixedAmount::ZERO, err.into()),
        };
        if triggers.is_empty() {
            return self.commit_skip(unit, FixedAmount::ZERO, "no pending triggers", None);
        }

        let mut outcomes = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                break;
            }
            outcomes.push(self.process_trigger(unit, trigger, logger, cancel).await);
        }
        merge_outcomes(outcomes)
    }

    async fn process_trigger(
        &self,
        unit: &WorkUnit,
        trigger: &TriggerEvent,
        logger: &StructuredLogger,
        cancel: Option<&CancellationToken>,
    ) -> UnitOutcome {
        let amount = match plan_amount(
            unit.rate_percent,
            trigger.amount,
            unit.max_per_interval,
            unit.min_trigger,
        ) {
            PlanDecision::Execute { amount, .. } => amount,
            PlanDecision::BelowMinimum { amount } => {
                let reason = OrchestrationError::BelowMinimum {
                    amount,
                    minimum: unit.min_trigger,
                };
                return self.commit_skip(unit, amount, &reason.to_string(), Some(&trigger.id));
            }
        };

        let result = self
            .execute_action(unit, amount, Some(trigger), logger, cancel)
            .await;
        self.commit_action(unit, amount, result, Some(&trigger.id)).await
    }

    async fn execute_action(
        &self,
        unit: &WorkUnit,
        amount: FixedAmount,
        trigger: Option<&TriggerEvent>,
        logger: &StructuredLogger,
        cancel: Option<&CancellationToken>,
    ) -> Result<ActionResult, OrchestrationError> {
        let payer = parse_key("source wallet", &unit.source_wallet)?;
        let mint = parse_key("mint", &unit.mint)?;

        let decimals = match unit.kind {
            AutomationKind::TokenBurn => {
                let balance = self.deps.chain.token_balance(&payer, &mint).await?;
                let available = FixedAmount::from_base_units(balance.amount, balance.decimals).ok_or_else(|| {
                    OrchestrationError::Chain(format!("unsupported token decimals {} for mint {}", balance.decimals, mint))
                })?;
                if amount > available {
                    return Err(OrchestrationError::InsufficientFunds {
                        available,
                        required: amount,
                    });
                }
                Some(balance.decimals)
            }
            _ => None,
        };
        if let Some(trigger) = trigger {
            debug!(unit_id = %unit.id, trigger_id = %trigger.id, amount = %amount, "Burning for trigger");
        }

        let source = SignedBundleSource::prepare(
            self.deps.chain.as_ref(),
            self.deps.factory.as_ref(),
            self.deps.keys.as_ref(),
            BuildRequest {
                kind: unit.kind,
                stage: unit.stage,
                amount,
                mint,
                payer,
                destination: unit.destination.clone(),
                decimals,
            },
            unit.encrypted_key.clone(),
            KeyContext {
                address: unit.source_wallet.clone(),
                session_id: unit.session_id.clone(),
            },
        )
        .await?;

        let mut options = self.settings.send_options.clone().with_logger(logger.clone());
        if let Some(cancel) = cancel {
            options = options.with_cancel(cancel.clone());
        }
        let result = self.deps.coordinator.send_bundle(&source, &options).await?;
        if result.simulated {
            return Ok(ActionResult::Simulated { result });
        }

        let signature = source.signature();
        let status_source: Box<dyn StatusSource> = match self.http_status_source(&result) {
            Some(http) => Box::new(http),
            None => match signature {
                Some(sig) => Box::new(ChainStatusSource::new(self.deps.chain.clone(), sig)),
                None => {
                    return Ok(ActionResult::Unconfirmed {
                        result,
                        reason: "no status source for submission".to_string(),
                    })
                }
            },
        };

        let outcome = self
            .deps
            .poller
            .wait(status_source.as_ref(), &result.id, cancel, logger)
            .await;
        match outcome.status {
            ConfirmationStatus::Landed => Ok(ActionResult::Landed {
                result,
                slot: outcome.slot,
            }),
            ConfirmationStatus::Failed => Err(OrchestrationError::LandingFailed(
                outcome.reason.unwrap_or_else(|| "relay reported failure".to_string()),
            )),
            _ => {
                let reason = outcome.reason.unwrap_or_else(|| outcome.status.to_string());
                self.reconcile(result, signature, reason).await
            }
        }
    }

    fn http_status_source(&self, result: &BundleResult) -> Option<HttpStatusSource> {
        let engine = self.deps.coordinator.registry().get(&result.engine)?;
        HttpStatusSource::for_engine(self.deps.transport.clone(), engine, self.deps.request_timeout)
    }

    /// One direct chain lookup after a confirmation timeout. Never resubmits.
    async fn reconcile(
        &self,
        result: BundleResult,
        signature: Option<Signature>,
        reason: String,
    ) -> Result<ActionResult, OrchestrationError> {
        let Some(signature) = signature else {
            return Ok(ActionResult::Unconfirmed { result, reason });
        };
        match self.deps.chain.signature_state(&signature).await {
            Ok(Some(state)) if state.err.is_some() => Err(OrchestrationError::LandingFailed(
                state.err.unwrap_or_default(),
            )),
            Ok(Some(state)) if state.confirmed => {
                info!(bundle_id = %result.id, slot = state.slot, "Landing found during reconciliation");
                Ok(ActionResult::Landed {
                    result,
                    slot: Some(state.slot),
                })
            }
            Ok(_) => Ok(ActionResult::Unconfirmed { result, reason }),
            Err(err) => {
                warn!(bundle_id = %result.id, error = %err, "Reconciliation lookup failed");
                Ok(ActionResult::Unconfirmed { result, reason })
            }
        }
    }

    async fn commit_action(
        &self,
        unit: &WorkUnit,
        amount: FixedAmount,
        result: Result<ActionResult, OrchestrationError>,
        trigger_id: Option<&str>,
    ) -> UnitOutcome {
        let now = Utc::now();
        match result {
            Ok(ActionResult::Landed { result, slot }) => {
                let price = price_or_last(self.deps.oracle.as_ref(), unit).await;
                let value = quote_value(unit.kind, amount, price);
                let entry = with_trigger(
                    LedgerEntry::new(unit, amount, LedgerStatus::Success, now)
                        .with_tx(result.id.clone(), result.engine.to_string()),
                    trigger_id,
                );
                let update = UnitUpdate {
                    executed_at: now,
                    landed_amount: Some(amount),
                    landed_value: value,
                    price,
                };
                debug!(unit_id = %unit.id, slot = ?slot, "Committing landed action");
                match self.commit(&entry, &update) {
                    Ok(()) => UnitOutcome::Succeeded {
                        amount,
                        tx_id: result.id,
                        engine: result.engine.to_string(),
                    },
                    Err(outcome) => outcome,
                }
            }
            Ok(ActionResult::Simulated { result }) => {
                let entry = with_trigger(
                    LedgerEntry::new(unit, amount, LedgerStatus::Simulated, now)
                        .with_tx(result.id.clone(), result.engine.to_string()),
                    trigger_id,
                );
                match self.commit(&entry, &UnitUpdate::advance(now)) {
                    Ok(()) => UnitOutcome::Simulated {
                        amount,
                        tx_id: result.id,
                    },
                    Err(outcome) => outcome,
                }
            }
            Ok(ActionResult::Unconfirmed { result, reason }) => {
                // Marks the trigger so a rerun cannot burn it twice
                let entry = with_trigger(
                    LedgerEntry::new(unit, amount, LedgerStatus::Unconfirmed, now)
                        .with_tx(result.id.clone(), result.engine.to_string())
                        .with_error(reason.clone()),
                    trigger_id,
                );
                match self.commit(&entry, &UnitUpdate::advance(now)) {
                    Ok(()) => UnitOutcome::Unconfirmed {
                        tx_id: result.id,
                        reason,
                    },
                    Err(outcome) => outcome,
                }
            }
            Err(err) => self.commit_failure(unit, amount, err),
        }
    }

    fn commit_skip(
        &self,
        unit: &WorkUnit,
        amount: FixedAmount,
        reason: &str,
        trigger_id: Option<&str>,
    ) -> UnitOutcome {
        let now = Utc::now();
        let entry = with_trigger(
            LedgerEntry::new(unit, amount, LedgerStatus::Skipped, now).with_error(reason),
            trigger_id,
        );
        match self.commit(&entry, &UnitUpdate::advance(now)) {
            Ok(()) => UnitOutcome::Skipped {
                reason: reason.to_string(),
            },
            Err(outcome) => outcome,
        }
    }

    /// Never marks a trigger; failed triggers are retried next pass
    fn commit_failure(&self, unit: &WorkUnit, amount: FixedAmount, err: OrchestrationError) -> UnitOutcome {
        let now = Utc::now();
        warn!(
            unit_id = %unit.id,
            kind = err.kind(),
            retryable = err.is_retryable(),
            error = %err,
            "Unit failed"
        );
        let entry = LedgerEntry::new(unit, amount, LedgerStatus::Failed, now).with_error(err.to_string());
        if let Err(outcome) = self.commit(&entry, &UnitUpdate::advance(now)) {
            return outcome;
        }
        UnitOutcome::Failed {
            kind: err.kind().to_string(),
            error: err.to_string(),
        }
    }

    /// Store failures become the unit's outcome; a trigger processed
    /// elsewhere becomes a skip.
    fn commit(&self, entry: &LedgerEntry, update: &UnitUpdate) -> Result<(), UnitOutcome> {
        match self.deps.store.record_outcome(entry, update) {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyProcessed(trigger)) => {
                warn!(unit_id = %entry.work_unit_id, trigger_id = %trigger, "Trigger already processed");
                Err(UnitOutcome::Skipped {
                    reason: format!("trigger {} already processed", trigger),
                })
            }
            Err(err) => {
                warn!(unit_id = %entry.work_unit_id, error = %err, "Failed to commit outcome");
                let err = OrchestrationError::from(err);
                Err(UnitOutcome::Failed {
                    kind: err.kind().to_string(),
                    error: err.to_string(),
                })
            }
        }
    }
}

fn with_trigger(entry: LedgerEntry, trigger_id: Option<&str>) -> LedgerEntry {
    match trigger_id {
        Some(id) => entry.with_trigger(id),
        None => entry,
    }
}

fn parse_key(what: &str, raw: &str) -> Result<Pubkey, OrchestrationError> {
    Pubkey::from_str(raw.trim()).map_err(|e| OrchestrationError::Build(format!("invalid {} {}: {}", what, raw, e)))
}

/// Burned tokens are valued at the token price; lamport actions are already in quote units
fn quote_value(kind: AutomationKind, amount: FixedAmount, price: Option<f64>) -> Option<FixedAmount> {
    match kind {
        AutomationKind::TokenBurn => price.map(|p| amount.mul_price(p)),
        AutomationKind::LiquidityTopUp | AutomationKind::FeeHarvest => Some(amount),
    }
}

/// Worst trigger outcome wins: failed, then unconfirmed, then succeeded
fn merge_outcomes(outcomes: Vec<UnitOutcome>) -> UnitOutcome {
    let rank = |o: &UnitOutcome| match o {
        UnitOutcome::Failed { .. } => 4,
        UnitOutcome::Unconfirmed { .. } => 3,
        UnitOutcome::Succeeded { .. } => 2,
        UnitOutcome::Simulated { .. } => 1,
        UnitOutcome::Skipped { .. } => 0,
    };
    outcomes
        .into_iter()
        .max_by_key(rank)
        .unwrap_or(UnitOutcome::Skipped {
            reason: "cancelled".to_string(),
        })
}

fn record_unit_metrics(outcome: &UnitOutcome) {
    let m = metrics();
    m.units_processed.inc();
    match outcome {
        UnitOutcome::Succeeded { .. } | UnitOutcome::Simulated { .. } => m.units_succeeded.inc(),
        UnitOutcome::Skipped { .. } => m.units_skipped.inc(),
        UnitOutcome::Unconfirmed { .. } | UnitOutcome::Failed { .. } => m.units_failed.inc(),
    }
}

/// Builds and signs on demand; `refreshed` rebuilds against a new blockhash
struct SignedBundleSource<'a> {
    chain: &'a dyn ChainClient,
    factory: &'a dyn TransactionFactory,
    keys: &'a dyn KeyStore,
    request: BuildRequest,
    encrypted_key: String,
    ctx: KeyContext,
    latest: Mutex<TransactionSet>,
}

impl<'a> SignedBundleSource<'a> {
    async fn prepare(
        chain: &'a dyn ChainClient,
        factory: &'a dyn TransactionFactory,
        keys: &'a dyn KeyStore,
        request: BuildRequest,
        encrypted_key: String,
        ctx: KeyContext,
    ) -> Result<SignedBundleSource<'a>, OrchestrationError> {
        let set = build_signed(chain, factory, keys, &request, &encrypted_key, &ctx).await?;
        Ok(Self {
            chain,
            factory,
            keys,
            request,
            encrypted_key,
            ctx,
            latest: Mutex::new(set),
        })
    }

    /// Signature of the most recently built set
    fn signature(&self) -> Option<Signature> {
        self.latest.lock().first_signature()
    }
}

async fn build_signed(
    chain: &dyn ChainClient,
    factory: &dyn TransactionFactory,
    keys: &dyn KeyStore,
    request: &BuildRequest,
    encrypted_key: &str,
    ctx: &KeyContext,
) -> Result<TransactionSet, OrchestrationError> {
    let blockhash = chain.latest_blockhash().await?;
    let messages = factory.build(request, blockhash)?;
    let signed = sign_messages(keys, encrypted_key, ctx, messages)?;
    TransactionSet::from_transactions(&signed).map_err(|e| OrchestrationError::Build(e.to_string()))
}

#[async_trait]
impl<'a> BundleSource for SignedBundleSource<'a> {
    async fn current(&self) -> Result<TransactionSet, SubmissionError> {
        Ok(self.latest.lock().clone())
    }

    async fn refreshed(&self) -> Result<TransactionSet, SubmissionError> {
        let set = build_signed(
            self.chain,
            self.factory,
            self.keys,
            &self.request,
            &self.encrypted_key,
            &self.ctx,
        )
        .await
        .map_err(|e| SubmissionError::Source(e.to_string()))?;
        *self.latest.lock() = set.clone();
        debug!(digest = %set.digest(), "Rebuilt transaction set with fresh blockhash");
        Ok(set)
    }
}
