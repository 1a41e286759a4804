//! Submitter retry, rotation and cancellation scenarios

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::test_helpers::*;
use crate::relay::bundle::{BundleError, BundleSource, TransactionSet};
use crate::relay::classifier::ErrorCategory;
use crate::relay::engine::SubmitMethod;
use crate::relay::errors::SubmissionError;
use crate::relay::submitter::{AttemptOutcome, SubmitContext};

const E1: &str = "https://e1.relay.test";
const E2: &str = "https://e2.relay.test";
const E3: &str = "https://e3.relay.test";

fn set(n: usize) -> TransactionSet {
    TransactionSet::from_encoded((0..n).map(|i| format!("dHg{}", i)).collect()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_backend_errors_rotate_endpoints() {
    let transport = ScriptedTransport::new();
    transport.script(E1, vec![Err(unavailable())]);
    transport.script(E2, vec![Err(unavailable())]);
    transport.script(E3, vec![Ok("bundle-3".into())]);

    let result = submitter(transport.clone())
        .submit(&engine("jito", &[E1, E2, E3]), &set(1), &SubmitContext::default())
        .await
        .unwrap();

    assert_eq!(result.id, "bundle-3");
    assert_eq!(result.endpoint, E3);
    assert_eq!(result.attempts, 3);
    assert!(!result.simulated);
    assert_eq!(transport.calls(), vec![E1, E2, E3]);
}

#[tokio::test(start_paused = true)]
async fn test_rotation_wraps_to_first_endpoint() {
    let transport = ScriptedTransport::new();
    transport.script(E1, vec![Err(unavailable()), Ok("wrapped".into())]);
    transport.script(E2, vec![Err(unavailable())]);
    transport.script(E3, vec![Err(unavailable())]);

    let result = submitter(transport.clone())
        .submit(&engine("jito", &[E1, E2, E3]), &set(1), &SubmitContext::default())
        .await
        .unwrap();

    assert_eq!(transport.calls(), vec![E1, E2, E3, E1]);
    assert_eq!(result.id, "wrapped");
    assert_eq!(result.endpoint, E1);
    assert_eq!(result.attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_sticks_to_primary_three_times() {
    let transport = ScriptedTransport::new();
    transport.script(E1, vec![Err(rate_limited(None)), Err(rate_limited(None)), Err(rate_limited(None))]);
    transport.script(E2, vec![Ok("bundle-2".into())]);

    let result = submitter(transport.clone())
        .submit(&engine("jito", &[E1, E2]), &set(2), &SubmitContext::default())
        .await
        .unwrap();

    assert_eq!(transport.calls(), vec![E1, E1, E1, E2]);
    assert_eq!(result.attempts, 4);
    assert_eq!(result.endpoint, E2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_is_honoured_exactly() {
    let transport = ScriptedTransport::new();
    transport.script(E1, vec![Err(rate_limited(Some("2"))), Ok("abc123".into())]);

    let mut history = Vec::new();
    let started = tokio::time::Instant::now();
    let result = submitter(transport.clone())
        .submit_recorded(&engine("jito", &[E1, E2]), &set(1), &SubmitContext::default(), &mut history)
        .await
        .unwrap();

    assert_eq!(result.id, "abc123");
    assert_eq!(result.endpoint, E1);
    assert_eq!(result.attempts, 2);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_millis(2_100));

    match &history[0].outcome {
        AttemptOutcome::Failed { category, delay, .. } => {
            assert_eq!(*category, ErrorCategory::RateLimit);
            assert_eq!(*delay, Some(Duration::from_millis(2_000)));
        }
        other => panic!("unexpected first attempt {:?}", other),
    }
    assert!(matches!(history[1].outcome, AttemptOutcome::Accepted { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.script(E1, vec![Err(bad_request())]);

    let err = submitter(transport.clone())
        .submit(&engine("jito", &[E1, E2]), &set(1), &SubmitContext::default())
        .await
        .unwrap_err();

    assert_eq!(transport.calls().len(), 1);
    assert_eq!(err.category(), Some(ErrorCategory::Client));
    assert_eq!(err.attempts(), 1);
    assert!(matches!(err, SubmissionError::NonRetryable { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_exhausts_attempt_budget() {
    let transport = ScriptedTransport::new();

    let err = submitter(transport.clone())
        .submit(&engine("jito", &[E1]), &set(1), &SubmitContext::default())
        .await
        .unwrap_err();

    assert_eq!(transport.calls().len(), 7);
    match err {
        SubmissionError::Exhausted { attempts, category, .. } => {
            assert_eq!(attempts, 7);
            assert_eq!(category, ErrorCategory::Backend);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_sets_never_reach_the_network() {
    assert_eq!(
        TransactionSet::from_encoded((0..6).map(|i| i.to_string()).collect()),
        Err(BundleError::TooLarge(6))
    );

    let transport = ScriptedTransport::new();
    let mut single = engine("direct", &[E1]);
    single.method = SubmitMethod::Transaction;

    let err = submitter(transport.clone())
        .submit(&single, &set(2), &SubmitContext::default())
        .await
        .unwrap_err();

    assert!(transport.calls().is_empty());
    assert_eq!(err.category(), Some(ErrorCategory::Client));
    assert_eq!(err.attempts(), 0);
}

#[tokio::test]
async fn test_dry_run_skips_network() {
    let transport = ScriptedTransport::new();
    let mut dry = engine("jito", &[E1]);
    dry.dry_run = true;

    let result = submitter(transport.clone())
        .submit(&dry, &set(3), &SubmitContext::default())
        .await
        .unwrap();

    assert!(result.simulated);
    assert_eq!(result.attempts, 0);
    assert!(result.id.starts_with("dryrun-"));
    assert_eq!(result.id.len(), "dryrun-".len() + 16);
    assert!(transport.calls().is_empty());

    // Same set, same id
    let again = submitter(transport.clone())
        .submit(&dry, &set(3), &SubmitContext::default())
        .await
        .unwrap();
    assert_eq!(again.id, result.id);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_in_flight_request() {
    let transport = ScriptedTransport::new();
    transport.delay_posts(Duration::from_secs(10));
    transport.script(E1, vec![Ok("too-late".into())]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let ctx = SubmitContext {
        cancel: Some(cancel),
        ..SubmitContext::default()
    };
    let started = tokio::time::Instant::now();
    let err = submitter(transport.clone())
        .submit(&engine("jito", &[E1]), &set(1), &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, SubmissionError::Cancelled { attempts: 1, .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
}

/// Yields `v1`, then `v2` after a refresh
struct RebuildingSource {
    refreshes: AtomicUsize,
}

#[async_trait]
impl BundleSource for RebuildingSource {
    async fn current(&self) -> Result<TransactionSet, SubmissionError> {
        Ok(TransactionSet::from_encoded(vec!["v1".into()])?)
    }

    async fn refreshed(&self) -> Result<TransactionSet, SubmissionError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(TransactionSet::from_encoded(vec!["v2".into()])?)
    }
}

#[tokio::test(start_paused = true)]
async fn test_stale_blockhash_resends_refreshed_set() {
    let transport = ScriptedTransport::new();
    transport.script(E1, vec![Err(stale_blockhash())]);
    transport.script(E2, vec![Ok("fresh".into())]);

    let source = RebuildingSource {
        refreshes: AtomicUsize::new(0),
    };
    let result = submitter(transport.clone())
        .submit(&engine("jito", &[E1, E2]), &source, &SubmitContext::default())
        .await
        .unwrap();

    assert_eq!(result.id, "fresh");
    assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    let bodies = transport.bodies();
    assert_eq!(bodies[0]["params"][0], serde_json::json!(["v1"]));
    assert_eq!(bodies[1]["params"][0], serde_json::json!(["v2"]));
}
