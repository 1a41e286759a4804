//! Failure classification for relay submissions
//!
//! Turns a raw [`RelayFailure`] into an [`ErrorClassification`]: a category,
//! whether another attempt is worthwhile, and an optional server-provided
//! retry hint. Rules are evaluated in a fixed order; the first match wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Phrases relays use when throttling a caller
const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "rate limited",
    "too many requests",
    "quota exceeded",
];

/// Phrases indicating the backend is briefly unable to serve
const TRANSIENT_PHRASES: &[&str] = &[
    "service unavailable",
    "temporarily unavailable",
    "bad gateway",
    "gateway timeout",
    "timed out",
    "timeout",
    "try again later",
    "overloaded",
];

/// Signals that the submitted set is stale and must be rebuilt
const STALE_PHRASES: &[&str] = &[
    "blockhash not found",
    "blockhash expired",
    "block height exceeded",
    "already processed",
    "bundle already landed",
    "already landed",
    "bundle dropped",
    "bundle was dropped",
];

/// Transaction error names surfaced in `error.data.err` by preflight failures
const STALE_ERROR_CODES: &[&str] = &["BlockhashNotFound", "AlreadyProcessed"];

/// Submission failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Backend,
    Blockhash,
    Network,
    Client,
    Generic,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::RateLimit,
        ErrorCategory::Backend,
        ErrorCategory::Blockhash,
        ErrorCategory::Network,
        ErrorCategory::Client,
        ErrorCategory::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Backend => "backend",
            ErrorCategory::Blockhash => "blockhash",
            ErrorCategory::Network => "network",
            ErrorCategory::Client => "client",
            ErrorCategory::Generic => "generic",
        }
    }

    /// Permanent request errors are never retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Client)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-RPC error object returned inside a response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Raw failure observed while talking to a relay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayFailure {
    /// HTTP status when a response was received
    pub status: Option<u16>,
    /// Raw `Retry-After` header value
    pub retry_after_header: Option<String>,
    /// Response body, if any
    pub body: Option<String>,
    /// JSON-RPC error object parsed out of the body
    pub rpc_error: Option<RpcErrorObject>,
    /// Human-readable summary
    pub message: String,
    /// True when the request never produced an HTTP response
    pub no_response: bool,
}

impl RelayFailure {
    /// Failure where no HTTP response came back (DNS, connect, reset, local timeout)
    pub fn no_response(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            no_response: true,
            ..Default::default()
        }
    }

    /// Non-success HTTP response
    pub fn http(status: u16, body: Option<String>, retry_after_header: Option<String>) -> Self {
        let rpc_error = body.as_deref().and_then(parse_rpc_error);
        let message = match &rpc_error {
            Some(err) => format!("HTTP {}: {}", status, err.message),
            None => format!("HTTP {}", status),
        };
        Self {
            status: Some(status),
            retry_after_header,
            body,
            rpc_error,
            message,
            no_response: false,
        }
    }

    /// JSON-RPC level error carried by an otherwise successful HTTP response
    pub fn rpc(status: u16, error: RpcErrorObject, body: Option<String>) -> Self {
        Self {
            status: Some(status),
            retry_after_header: None,
            message: format!("RPC error {}: {}", error.code, error.message),
            rpc_error: Some(error),
            body,
            no_response: false,
        }
    }

    /// Anything that does not fit the other shapes (malformed response, local validation)
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    fn haystack(&self) -> String {
        let mut text = self.message.to_lowercase();
        if let Some(err) = &self.rpc_error {
            text.push(' ');
            text.push_str(&err.message.to_lowercase());
        }
        if let Some(body) = &self.body {
            text.push(' ');
            text.push_str(&body.to_lowercase());
        }
        text
    }

    fn body_json(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_str::<Value>(b).ok())
    }
}

impl fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn parse_rpc_error(body: &str) -> Option<RpcErrorObject> {
    let value: Value = serde_json::from_str(body).ok()?;
    serde_json::from_value(value.get("error")?.clone()).ok()
}

/// Derived description of a failure; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ErrorClassification {
    fn new(category: ErrorCategory, failure: &RelayFailure) -> Self {
        Self {
            category,
            retry: category.is_retryable(),
            retry_after_ms: None,
            status: failure.status,
            reason: Some(failure.message.clone()),
        }
    }
}

/// Pure failure classifier
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    max_retry_after_ms: u64,
}

impl ErrorClassifier {
    pub fn new(max_retry_after_ms: u64) -> Self {
        Self { max_retry_after_ms }
    }

    pub fn classify(&self, failure: &RelayFailure) -> ErrorClassification {
        self.classify_at(failure, Utc::now())
    }

    /// Classify relative to `now`, which is only consulted for HTTP-date `Retry-After` values
    pub fn classify_at(&self, failure: &RelayFailure, now: DateTime<Utc>) -> ErrorClassification {
        let text = failure.haystack();
        let retry_after_ms = self.retry_after_ms(failure, now);

        if failure.status == Some(429) || contains_any(&text, RATE_LIMIT_PHRASES) {
            let mut c = ErrorClassification::new(ErrorCategory::RateLimit, failure);
            c.retry_after_ms = retry_after_ms;
            return c;
        }

        if let Some(ms) = retry_after_ms {
            let mut c = ErrorClassification::new(ErrorCategory::RateLimit, failure);
            c.retry_after_ms = Some(ms);
            return c;
        }

        if failure.status.is_some_and(|s| s >= 500) || contains_any(&text, TRANSIENT_PHRASES) {
            return ErrorClassification::new(ErrorCategory::Backend, failure);
        }

        if is_stale_signal(failure, &text) {
            return ErrorClassification::new(ErrorCategory::Blockhash, failure);
        }

        if failure.no_response {
            return ErrorClassification::new(ErrorCategory::Network, failure);
        }

        if failure.status.is_some_and(|s| (400..500).contains(&s)) {
            return ErrorClassification::new(ErrorCategory::Client, failure);
        }

        ErrorClassification::new(ErrorCategory::Generic, failure)
    }

    fn retry_after_ms(&self, failure: &RelayFailure, now: DateTime<Utc>) -> Option<u64> {
        let from_header = failure
            .retry_after_header
            .as_deref()
            .and_then(|h| parse_retry_after_header(h, now));
        let ms = from_header.or_else(|| failure.body_json().and_then(|b| retry_after_from_body(&b)))?;
        Some(ms.min(self.max_retry_after_ms))
    }
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

fn is_stale_signal(failure: &RelayFailure, text: &str) -> bool {
    let coded = failure
        .rpc_error
        .as_ref()
        .and_then(|e| e.data.as_ref())
        .and_then(|d| d.get("err"))
        .and_then(|e| match e {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.keys().next().map(String::as_str),
            _ => None,
        })
        .is_some_and(|name| STALE_ERROR_CODES.contains(&name));
    coded || contains_any(text, STALE_PHRASES)
}

/// `Retry-After` is either delta-seconds or an HTTP-date
pub fn parse_retry_after_header(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some((secs * 1000.0).round() as u64);
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = at.signed_duration_since(now).num_milliseconds();
    Some(delta.max(0) as u64)
}

/// Looks for a retry hint at the top level of the body and under `error.data`
fn retry_after_from_body(body: &Value) -> Option<u64> {
    let scopes = [
        Some(body),
        body.get("error"),
        body.get("error").and_then(|e| e.get("data")),
    ];
    scopes
        .into_iter()
        .flatten()
        .find_map(retry_after_in_object)
}

fn retry_after_in_object(obj: &Value) -> Option<u64> {
    for key in ["retry_after_ms", "retryAfterMs"] {
        if let Some(ms) = obj.get(key).and_then(number_like) {
            return Some(ms.round() as u64);
        }
    }
    for key in ["retry_after", "retryAfter"] {
        if let Some(secs) = obj.get(key).and_then(number_like) {
            return Some((secs * 1000.0).round() as u64);
        }
    }
    None
}

fn number_like(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n >= 0.0).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(300_000)
    }

    #[test]
    fn test_http_429_is_rate_limit() {
        let c = classifier().classify(&RelayFailure::http(429, None, None));
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert!(c.retry);
        assert_eq!(c.retry_after_ms, None);
    }

    #[test]
    fn test_rate_limit_phrase_in_rpc_error() {
        let body = r#"{"jsonrpc":"2.0","error":{"code":-32097,"message":"Network congested. Endpoint is globally rate limited."},"id":1}"#;
        let c = classifier().classify(&RelayFailure::http(200, Some(body.into()), None));
        assert_eq!(c.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn test_retry_after_header_seconds() {
        let f = RelayFailure::http(429, None, Some("2".into()));
        let c = classifier().classify(&f);
        assert_eq!(c.retry_after_ms, Some(2_000));
    }

    #[test]
    fn test_retry_after_header_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        let f = RelayFailure::http(503, None, Some("Wed, 21 Oct 2015 07:28:30 GMT".into()));
        let c = classifier().classify_at(&f, now);
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert_eq!(c.retry_after_ms, Some(30_000));
    }

    #[test]
    fn test_retry_after_body_field_is_capped() {
        let body = r#"{"error":{"code":-1,"message":"slow down","data":{"retry_after":900}}}"#;
        let c = ErrorClassifier::new(120_000).classify(&RelayFailure::http(400, Some(body.into()), None));
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert_eq!(c.retry_after_ms, Some(120_000));
    }

    #[test]
    fn test_server_error_is_backend() {
        let c = classifier().classify(&RelayFailure::http(502, Some("bad gateway".into()), None));
        assert_eq!(c.category, ErrorCategory::Backend);
        assert!(c.retry);
        assert_eq!(c.status, Some(502));
    }

    #[test]
    fn test_stale_blockhash_by_data_code() {
        let err = RpcErrorObject {
            code: -32002,
            message: "Transaction simulation failed".into(),
            data: Some(serde_json::json!({"err": "BlockhashNotFound"})),
        };
        let c = classifier().classify(&RelayFailure::rpc(200, err, None));
        assert_eq!(c.category, ErrorCategory::Blockhash);
        assert!(c.retry);
    }

    #[test]
    fn test_bundle_dropped_message_is_blockhash() {
        let c = classifier().classify(&RelayFailure::other("bundle dropped: no leader"));
        assert_eq!(c.category, ErrorCategory::Blockhash);
    }

    #[test]
    fn test_no_response_is_network() {
        let c = classifier().classify(&RelayFailure::no_response("connection refused"));
        assert_eq!(c.category, ErrorCategory::Network);
        assert!(c.retry);
    }

    #[test]
    fn test_timeout_without_response_is_backend() {
        let c = classifier().classify(&RelayFailure::no_response("operation timed out"));
        assert_eq!(c.category, ErrorCategory::Backend);
    }

    #[test]
    fn test_client_error_not_retryable() {
        let body = r#"{"error":{"code":-32602,"message":"invalid signature"}}"#;
        let c = classifier().classify(&RelayFailure::http(400, Some(body.into()), None));
        assert_eq!(c.category, ErrorCategory::Client);
        assert!(!c.retry);
    }

    #[test]
    fn test_unknown_is_generic_retryable() {
        let c = classifier().classify(&RelayFailure::other("missing result field"));
        assert_eq!(c.category, ErrorCategory::Generic);
        assert!(c.retry);
    }

    proptest! {
        #[test]
        fn prop_4xx_without_hints_is_client(status in 400u16..500) {
            prop_assume!(status != 429);
            let c = classifier().classify(&RelayFailure::http(status, None, None));
            prop_assert_eq!(c.category, ErrorCategory::Client);
            prop_assert!(!c.retry);
        }

        #[test]
        fn prop_retry_after_never_exceeds_cap(secs in 0u64..100_000) {
            let f = RelayFailure::http(429, None, Some(secs.to_string()));
            let c = ErrorClassifier::new(60_000).classify(&f);
            prop_assert!(c.retry_after_ms.unwrap() <= 60_000);
        }
    }
}
