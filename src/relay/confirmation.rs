//! Landing confirmation
//!
//! Relay status indexers lag the write path, so `not_found` right after a
//! submission is normal. The poller only stops early on `landed` or `failed`;
//! every other status means "ask again". Running out of polls yields
//! [`ConfirmationStatus::Timeout`], which callers must treat as inconclusive,
//! never as a failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::engine::Engine;
use super::transport::RelayTransport;
use crate::metrics::{metrics, Timer};
use crate::structured_logging::StructuredLogger;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// `not_found` results between two log lines
const NOT_FOUND_LOG_EVERY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Landed,
    Failed,
    Pending,
    Processing,
    NotFound,
    NetworkError,
    ApiError,
    Unknown,
    Timeout,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Landed => "landed",
            ConfirmationStatus::Failed => "failed",
            ConfirmationStatus::Pending => "pending",
            ConfirmationStatus::Processing => "processing",
            ConfirmationStatus::NotFound => "not_found",
            ConfirmationStatus::NetworkError => "network_error",
            ConfirmationStatus::ApiError => "api_error",
            ConfirmationStatus::Unknown => "unknown",
            ConfirmationStatus::Timeout => "timeout",
        }
    }

    /// Only `landed` and `failed` end polling early
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConfirmationStatus::Landed | ConfirmationStatus::Failed)
    }

    /// Map a relay's status string
    pub fn from_relay(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "landed" | "confirmed" | "finalized" => ConfirmationStatus::Landed,
            "failed" | "invalid" | "rejected" => ConfirmationStatus::Failed,
            "pending" => ConfirmationStatus::Pending,
            "processing" | "processed" => ConfirmationStatus::Processing,
            "not_found" | "notfound" => ConfirmationStatus::NotFound,
            _ => ConfirmationStatus::Unknown,
        }
    }
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single status lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationProbe {
    pub status: ConfirmationStatus,
    pub slot: Option<u64>,
    pub reason: Option<String>,
}

impl ConfirmationProbe {
    pub fn of(status: ConfirmationStatus) -> Self {
        Self {
            status,
            slot: None,
            reason: None,
        }
    }

    pub fn landed(slot: Option<u64>) -> Self {
        Self {
            status: ConfirmationStatus::Landed,
            slot,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ConfirmationStatus::Failed,
            slot: None,
            reason: Some(reason.into()),
        }
    }
}

/// Final answer from the poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationOutcome {
    pub status: ConfirmationStatus,
    pub slot: Option<u64>,
    pub reason: Option<String>,
    pub polls: u32,
}

impl ConfirmationOutcome {
    pub fn is_landed(&self) -> bool {
        self.status == ConfirmationStatus::Landed
    }
}

/// Anything that can answer "where is this id now"
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn check(&self, id: &str) -> ConfirmationProbe;
}

/// Polls `GET {status_url}/{id}` on an engine
pub struct HttpStatusSource {
    transport: Arc<dyn RelayTransport>,
    engine: Arc<Engine>,
    base_url: String,
    request_timeout: Duration,
}

impl HttpStatusSource {
    /// `None` when the engine has no status endpoint
    pub fn for_engine(
        transport: Arc<dyn RelayTransport>,
        engine: Arc<Engine>,
        request_timeout: Duration,
    ) -> Option<Self> {
        let base_url = engine.status_url.clone()?;
        Some(Self {
            transport,
            engine,
            base_url,
            request_timeout,
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn check(&self, id: &str) -> ConfirmationProbe {
        let url = format!("{}/{}", self.base_url, id);
        match self.transport.get_json(&self.engine, &url, self.request_timeout).await {
            Err(failure) => ConfirmationProbe {
                status: ConfirmationStatus::NetworkError,
                slot: None,
                reason: Some(failure.message),
            },
            Ok(reply) => match reply.status {
                404 => ConfirmationProbe::of(ConfirmationStatus::NotFound),
                200..=299 => reply
                    .body
                    .as_ref()
                    .map(parse_status_body)
                    .unwrap_or_else(|| ConfirmationProbe::of(ConfirmationStatus::Unknown)),
                status => ConfirmationProbe {
                    status: ConfirmationStatus::ApiError,
                    slot: None,
                    reason: Some(format!("HTTP {}", status)),
                },
            },
        }
    }
}

/// Decode `{status, landedSlot?, error?}`
pub fn parse_status_body(body: &Value) -> ConfirmationProbe {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .map(ConfirmationStatus::from_relay)
        .unwrap_or(ConfirmationStatus::Unknown);
    let slot = body
        .get("landedSlot")
        .or_else(|| body.get("landed_slot"))
        .or_else(|| body.get("slot"))
        .and_then(Value::as_u64);
    let reason = body
        .get("error")
        .or_else(|| body.get("reason"))
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    ConfirmationProbe { status, slot, reason }
}

#[derive(Debug, Clone)]
pub struct ConfirmationPoller {
    interval: Duration,
    timeout: Duration,
}

impl ConfirmationPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    /// `ceil(timeout / interval)`, at least one
    pub fn max_polls(&self) -> u32 {
        let interval = self.interval.as_millis();
        let polls = self.timeout.as_millis().div_ceil(interval);
        polls.clamp(1, u32::MAX as u128) as u32
    }

    pub async fn wait(
        &self,
        source: &dyn StatusSource,
        id: &str,
        cancel: Option<&CancellationToken>,
        logger: &StructuredLogger,
    ) -> ConfirmationOutcome {
        let timer = Timer::new();
        let max_polls = self.max_polls();
        let mut not_found = 0u32;

        for poll in 1..=max_polls {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return self.finish(
                    ConfirmationOutcome {
                        status: ConfirmationStatus::Timeout,
                        slot: None,
                        reason: Some("cancelled".to_string()),
                        polls: poll - 1,
                    },
                    &timer,
                );
            }

            metrics().confirmation_polls.inc();
            let observed = source.check(id).await;

            match observed.status {
                ConfirmationStatus::Landed | ConfirmationStatus::Failed => {
                    logger.log_poll_progress(id, poll, observed.status.as_str());
                    return self.finish(
                        ConfirmationOutcome {
                            status: observed.status,
                            slot: observed.slot,
                            reason: observed.reason,
                            polls: poll,
                        },
                        &timer,
                    );
                }
                ConfirmationStatus::NotFound => {
                    not_found += 1;
                    if not_found % NOT_FOUND_LOG_EVERY == 0 {
                        logger.log_poll_progress(id, poll, observed.status.as_str());
                    }
                }
                _ => logger.log_poll_progress(id, poll, observed.status.as_str()),
            }

            if poll < max_polls {
                let sleep = tokio::time::sleep(self.interval);
                match cancel {
                    Some(c) => {
                        tokio::select! {
                            biased;
                            _ = c.cancelled() => {
                                return self.finish(
                                    ConfirmationOutcome {
                                        status: ConfirmationStatus::Timeout,
                                        slot: None,
                                        reason: Some("cancelled".to_string()),
                                        polls: poll,
                                    },
                                    &timer,
                                );
                            }
                            _ = sleep => {}
                        }
                    }
                    None => sleep.await,
                }
            }
        }

        self.finish(
            ConfirmationOutcome {
                status: ConfirmationStatus::Timeout,
                slot: None,
                reason: Some(format!("no terminal status after {} polls", max_polls)),
                polls: max_polls,
            },
            &timer,
        )
    }

    fn finish(&self, outcome: ConfirmationOutcome, timer: &Timer) -> ConfirmationOutcome {
        metrics().record_confirmation(outcome.status.as_str());
        timer.observe_duration(&metrics().confirmation_latency);
        outcome
    }
}

impl Default for ConfirmationPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_CONFIRM_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_max_polls_rounds_up() {
        assert_eq!(ConfirmationPoller::default().max_polls(), 30);
        let p = ConfirmationPoller::new(Duration::from_secs(2), Duration::from_secs(61));
        assert_eq!(p.max_polls(), 31);
        let p = ConfirmationPoller::new(Duration::from_secs(5), Duration::ZERO);
        assert_eq!(p.max_polls(), 1);
    }

    #[test]
    fn test_status_body_parsing() {
        let probe = parse_status_body(&json!({"status": "landed", "landedSlot": 250_000_123u64}));
        assert_eq!(probe, ConfirmationProbe::landed(Some(250_000_123)));

        let observed = parse_status_body(&json!({"status": "failed", "error": "simulation failed"}));
        assert_eq!(observed.status, ConfirmationStatus::Failed);
        assert_eq!(observed.reason.as_deref(), Some("simulation failed"));

        let observed = parse_status_body(&json!({"transactions": []}));
        assert_eq!(observed.status, ConfirmationStatus::Unknown);
    }

    #[test]
    fn test_only_landed_and_failed_are_terminal() {
        assert!(ConfirmationStatus::Landed.is_terminal());
        assert!(ConfirmationStatus::Failed.is_terminal());
        assert!(!ConfirmationStatus::NotFound.is_terminal());
        assert!(!ConfirmationStatus::ApiError.is_terminal());
        assert!(!ConfirmationStatus::Timeout.is_terminal());
    }
}
