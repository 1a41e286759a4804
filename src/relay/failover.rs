//! Failover across engines
//!
//! The coordinator walks engines in priority order and hands each one to the
//! [`Submitter`]. The first success wins; failures are collected and, when
//! every engine fails, returned as one aggregate.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::bundle::BundleSource;
use super::engine::{EngineKey, EngineRegistry};
use super::errors::{EngineFailure, SubmissionError};
use super::submitter::{BundleResult, SubmitContext, Submitter};
use crate::metrics::metrics;
use crate::structured_logging::StructuredLogger;

/// Options for one send
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Explicit engine order; `None` uses the registry's order
    pub engines: Option<Vec<EngineKey>>,
    /// When false, the first engine failure propagates immediately
    pub failover: bool,
    pub cancel: Option<CancellationToken>,
    pub logger: Option<StructuredLogger>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            engines: None,
            failover: true,
            cancel: None,
            logger: None,
        }
    }
}

impl SendOptions {
    pub fn with_engines(mut self, engines: Vec<EngineKey>) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn without_failover(mut self) -> Self {
        self.failover = false;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }
}

pub struct FailoverCoordinator {
    registry: Arc<EngineRegistry>,
    submitter: Arc<Submitter>,
}

impl FailoverCoordinator {
    pub fn new(registry: Arc<EngineRegistry>, submitter: Arc<Submitter>) -> Self {
        Self { registry, submitter }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Submit through engines in priority order until one accepts the set
    pub async fn send_bundle(
        &self,
        source: &dyn BundleSource,
        options: &SendOptions,
    ) -> Result<BundleResult, SubmissionError> {
        let engines = self.registry.ordered(options.engines.as_deref());
        if engines.is_empty() {
            return Err(SubmissionError::Engine(
                "no engine with configured endpoints is available".to_string(),
            ));
        }

        let ctx = SubmitContext {
            cancel: options.cancel.clone(),
            logger: options.logger.clone().unwrap_or_default(),
        };
        let mut failures: Vec<EngineFailure> = Vec::new();

        for (position, engine) in engines.iter().enumerate() {
            match self.submitter.submit(engine, source, &ctx).await {
                Ok(result) => {
                    if position > 0 {
                        info!(engine = %engine.key, failed_before = position, "Submitted after failover");
                    }
                    return Ok(result);
                }
                Err(err) => {
                    // Stop on a bad set or cancellation; other engines would fail the same way
                    let terminal = matches!(
                        err,
                        SubmissionError::Bundle(_) | SubmissionError::Cancelled { .. }
                    );
                    if !options.failover || terminal {
                        return Err(err);
                    }
                    warn!(engine = %engine.key, error = %err, "Engine failed, trying next");
                    failures.push(EngineFailure {
                        engine: engine.key.to_string(),
                        error: err,
                    });
                    if position + 1 < engines.len() {
                        metrics().engine_failovers.inc();
                    }
                }
            }
        }

        if failures.len() == 1 {
            return Err(failures.remove(0).error);
        }
        Err(SubmissionError::AllEnginesFailed { failures })
    }
}
