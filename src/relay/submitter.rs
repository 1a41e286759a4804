//! Single-engine submission with endpoint rotation and bounded retries
//!
//! ## Rotation
//!
//! The submitter walks the engine's endpoint list starting at index 0. After a
//! retryable failure it moves to `(index + 1) % len`, except when a rate limit
//! hits the primary endpoint within its first three attempts: the primary is
//! usually the whitelisted one and fallbacks tend to drop payloads silently,
//! so the submitter stays put.
//!
//! ## Stale sets
//!
//! A `blockhash` failure means resending the same bytes is pointless. The
//! submitter asks its [`BundleSource`] for a refreshed set before the next
//! attempt.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::backoff::BackoffPolicy;
use super::bundle::{BundleSource, TransactionSet};
use super::classifier::{ErrorCategory, ErrorClassifier, RelayFailure};
use super::engine::{Engine, EngineKey, SubmitMethod};
use super::errors::SubmissionError;
use super::transport::RelayTransport;
use crate::metrics::{metrics, Timer};
use crate::structured_logging::StructuredLogger;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;
pub const MAX_ATTEMPTS_CEILING: u32 = 12;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Rate-limited attempts the primary endpoint gets before rotation
const STICKY_PRIMARY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitterConfig {
    pub max_attempts: u32,
    pub request_timeout: Duration,
}

impl SubmitterConfig {
    /// Clamp `max_attempts` into `1..=12`
    pub fn new(max_attempts: u32, request_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_CEILING),
            request_timeout,
        }
    }
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT)
    }
}

/// Successful delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleResult {
    pub id: String,
    pub endpoint: String,
    pub engine: EngineKey,
    pub attempts: u32,
    /// True in dry-run mode; nothing reached the network
    pub simulated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Accepted { id: String },
    Failed {
        category: ErrorCategory,
        retry: bool,
        delay: Option<Duration>,
        reason: String,
    },
}

/// One POST against one endpoint; lives only for the duration of a submit call
#[derive(Debug, Clone)]
pub struct SubmissionAttempt {
    pub engine: EngineKey,
    pub endpoint: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Per-call context: cancellation and the logger carrying the correlation id
#[derive(Debug, Clone, Default)]
pub struct SubmitContext {
    pub cancel: Option<CancellationToken>,
    pub logger: StructuredLogger,
}

impl SubmitContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

pub struct Submitter {
    transport: Arc<dyn RelayTransport>,
    backoff: BackoffPolicy,
    classifier: ErrorClassifier,
    config: SubmitterConfig,
}

impl Submitter {
    pub fn new(transport: Arc<dyn RelayTransport>, backoff: BackoffPolicy, config: SubmitterConfig) -> Self {
        let classifier = ErrorClassifier::new(backoff.config().max_retry_after_ms);
        Self {
            transport,
            backoff,
            classifier,
            config,
        }
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Deliver the source's transaction set through one engine
    pub async fn submit(
        &self,
        engine: &Engine,
        source: &dyn BundleSource,
        ctx: &SubmitContext,
    ) -> Result<BundleResult, SubmissionError> {
        self.submit_recorded(engine, source, ctx, &mut Vec::new()).await
    }

    /// Like [`submit`](Self::submit), appending every attempt to `history`
    pub async fn submit_recorded(
        &self,
        engine: &Engine,
        source: &dyn BundleSource,
        ctx: &SubmitContext,
        history: &mut Vec<SubmissionAttempt>,
    ) -> Result<BundleResult, SubmissionError> {
        let mut set = source.current().await?;
        check_method(engine, &set)?;

        let mut endpoints = engine.endpoints.clone();
        if endpoints.is_empty() {
            return Err(SubmissionError::Engine(format!(
                "engine {} has no endpoints configured",
                engine.key
            )));
        }
        if engine.shuffle_endpoints {
            endpoints.shuffle(&mut rand::thread_rng());
        }

        metrics().submissions_total.inc();

        if engine.dry_run {
            return Ok(self.dry_run(engine, &endpoints, &set));
        }

        let timer = Timer::new();
        let engine_name = engine.key.as_str();
        let mut index = 0usize;
        let mut primary_attempts = 0u32;

        for attempt in 1..=self.config.max_attempts {
            if ctx.is_cancelled() {
                return Err(SubmissionError::Cancelled {
                    engine: engine_name.to_string(),
                    attempts: attempt - 1,
                });
            }

            let endpoint = endpoints[index].clone();
            if index == 0 {
                primary_attempts += 1;
            }

            let started_at = Utc::now();
            let body = build_request(engine.method, &set);
            ctx.logger
                .log_submission_attempt(engine_name, &endpoint, attempt, set.len());
            metrics().submission_attempts.inc();

            let outcome = self.post_once(engine, &endpoint, &body, ctx, attempt).await?;

            let failure = match outcome {
                Ok(id) => {
                    history.push(SubmissionAttempt {
                        engine: engine.key.clone(),
                        endpoint: endpoint.clone(),
                        attempt_number: attempt,
                        started_at,
                        outcome: AttemptOutcome::Accepted { id: id.clone() },
                    });
                    metrics().submissions_success.inc();
                    timer.observe_duration(&metrics().submission_latency);
                    ctx.logger
                        .log_submission_success(engine_name, &endpoint, &id, attempt, timer.elapsed_ms());
                    return Ok(BundleResult {
                        id,
                        endpoint,
                        engine: engine.key.clone(),
                        attempts: attempt,
                        simulated: false,
                    });
                }
                Err(failure) => failure,
            };

            let classification = self.classifier.classify(&failure);
            metrics().record_failure_category(classification.category.as_str());

            let give_up = !classification.retry || attempt == self.config.max_attempts;
            let delay = (!give_up).then(|| self.backoff.delay_for(&classification, attempt));

            ctx.logger.log_attempt_failed(
                engine_name,
                &endpoint,
                attempt,
                classification.category.as_str(),
                delay.map(|d| d.as_millis() as u64),
                &failure.message,
            );
            history.push(SubmissionAttempt {
                engine: engine.key.clone(),
                endpoint: endpoint.clone(),
                attempt_number: attempt,
                started_at,
                outcome: AttemptOutcome::Failed {
                    category: classification.category,
                    retry: classification.retry,
                    delay,
                    reason: failure.message.clone(),
                },
            });

            let Some(delay) = delay else {
                metrics().submissions_failed.inc();
                let err = SubmissionError::from_classification(engine_name, &endpoint, attempt, &classification);
                ctx.logger.log_submission_failure(engine_name, &err.to_string());
                return Err(err);
            };

            let sticky = classification.category == ErrorCategory::RateLimit
                && index == 0
                && primary_attempts < STICKY_PRIMARY_ATTEMPTS;
            if !sticky {
                index = (index + 1) % endpoints.len();
            }

            if classification.category == ErrorCategory::Blockhash {
                set = source.refreshed().await?;
                check_method(engine, &set)?;
            }

            self.sleep(delay, ctx, engine_name, attempt).await?;
        }

        // max_attempts >= 1 and the last iteration always returns
        Err(SubmissionError::Engine(format!(
            "engine {} made no attempts",
            engine.key
        )))
    }

    async fn post_once(
        &self,
        engine: &Engine,
        endpoint: &str,
        body: &Value,
        ctx: &SubmitContext,
        attempt: u32,
    ) -> Result<Result<String, RelayFailure>, SubmissionError> {
        let timeout = self.config.request_timeout;
        let request = async {
            match tokio::time::timeout(timeout, self.transport.post_rpc(engine, endpoint, body, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(RelayFailure::no_response(format!(
                    "request to {} timed out after {}ms",
                    endpoint,
                    timeout.as_millis()
                ))),
            }
        };

        match &ctx.cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SubmissionError::Cancelled {
                    engine: engine.key.to_string(),
                    attempts: attempt,
                }),
                result = request => Ok(result),
            },
            None => Ok(request.await),
        }
    }

    async fn sleep(
        &self,
        delay: Duration,
        ctx: &SubmitContext,
        engine: &str,
        attempt: u32,
    ) -> Result<(), SubmissionError> {
        match &ctx.cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SubmissionError::Cancelled {
                    engine: engine.to_string(),
                    attempts: attempt,
                }),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn dry_run(&self, engine: &Engine, endpoints: &[String], set: &TransactionSet) -> BundleResult {
        let digest = set.digest();
        info!(
            engine = %engine.key,
            endpoints = ?endpoints,
            tx_count = set.len(),
            method = engine.method.rpc_method(),
            "Dry run: skipping relay submission"
        );
        metrics().dry_run_submissions.inc();
        BundleResult {
            id: format!("dryrun-{}", &digest[..16]),
            endpoint: endpoints[0].clone(),
            engine: engine.key.clone(),
            attempts: 0,
            simulated: true,
        }
    }
}

fn check_method(engine: &Engine, set: &TransactionSet) -> Result<(), SubmissionError> {
    if engine.method == SubmitMethod::Transaction && set.len() > 1 {
        return Err(SubmissionError::NonRetryable {
            engine: engine.key.to_string(),
            endpoint: String::new(),
            category: ErrorCategory::Client,
            attempts: 0,
            message: format!(
                "sendTransaction accepts a single transaction, got {}",
                set.len()
            ),
        });
    }
    Ok(())
}

/// JSON-RPC envelope for the engine's method
pub fn build_request(method: SubmitMethod, set: &TransactionSet) -> Value {
    let params = match method {
        SubmitMethod::Bundle => json!([set.encoded(), {"encoding": "base64"}]),
        SubmitMethod::Transaction => json!([set.encoded()[0], {"encoding": "base64"}]),
    };
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method.rpc_method(),
        "params": params,
    })
}
