//! Cross-engine failover scenarios

use tokio_util::sync::CancellationToken;

use super::test_helpers::*;
use crate::relay::bundle::TransactionSet;
use crate::relay::engine::EngineKey;
use crate::relay::errors::SubmissionError;
use crate::relay::failover::SendOptions;

const JITO: &str = "https://jito.relay.test";
const DIRECT: &str = "https://direct.relay.test";
const BLOX: &str = "https://blox.relay.test";

fn engines() -> Vec<crate::relay::engine::Engine> {
    vec![
        engine("jito", &[JITO]),
        engine("direct", &[DIRECT]),
        engine("bloxroute", &[BLOX]),
    ]
}

fn bundle() -> TransactionSet {
    TransactionSet::from_encoded(vec!["dHgx".into(), "dHgy".into()]).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_all_engines_failing_aggregates_reasons() {
    let transport = ScriptedTransport::new();
    for endpoint in [JITO, DIRECT, BLOX] {
        transport.script(endpoint, vec![Err(bad_request())]);
    }

    let err = coordinator(transport.clone(), engines())
        .send_bundle(&bundle(), &SendOptions::default())
        .await
        .unwrap_err();

    match &err {
        SubmissionError::AllEnginesFailed { failures } => {
            let names: Vec<&str> = failures.iter().map(|f| f.engine.as_str()).collect();
            assert_eq!(names, vec!["jito", "direct", "bloxroute"]);
        }
        other => panic!("expected aggregate, got {:?}", other),
    }
    assert_eq!(err.reasons().len(), 3);
    assert_eq!(err.attempts(), 3);
    assert_eq!(transport.calls(), vec![JITO, DIRECT, BLOX]);
}

#[tokio::test(start_paused = true)]
async fn test_next_engine_takes_over() {
    let transport = ScriptedTransport::new();
    transport.script(JITO, vec![Err(bad_request())]);
    transport.script(DIRECT, vec![Ok("direct-1".into())]);

    let result = coordinator(transport.clone(), engines())
        .send_bundle(&bundle(), &SendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.engine, EngineKey::new("direct"));
    assert_eq!(result.id, "direct-1");
    assert_eq!(transport.calls(), vec![JITO, DIRECT]);
}

#[tokio::test(start_paused = true)]
async fn test_failover_disabled_returns_first_error() {
    let transport = ScriptedTransport::new();
    transport.script(JITO, vec![Err(bad_request())]);
    transport.script(DIRECT, vec![Ok("never".into())]);

    let err = coordinator(transport.clone(), engines())
        .send_bundle(&bundle(), &SendOptions::default().without_failover())
        .await
        .unwrap_err();

    assert!(matches!(err, SubmissionError::NonRetryable { ref engine, .. } if engine == "jito"));
    assert_eq!(transport.calls(), vec![JITO]);
}

#[tokio::test(start_paused = true)]
async fn test_single_engine_error_is_not_wrapped() {
    let transport = ScriptedTransport::new();
    transport.script(BLOX, vec![Err(bad_request())]);

    let options = SendOptions::default().with_engines(vec![EngineKey::new("bloxroute")]);
    let err = coordinator(transport.clone(), engines())
        .send_bundle(&bundle(), &options)
        .await
        .unwrap_err();

    assert!(matches!(err, SubmissionError::NonRetryable { .. }));
    assert_eq!(transport.calls(), vec![BLOX]);
}

#[tokio::test]
async fn test_cancelled_send_stops_failover() {
    let transport = ScriptedTransport::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = coordinator(transport.clone(), engines())
        .send_bundle(&bundle(), &SendOptions::default().with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, SubmissionError::Cancelled { attempts: 0, .. }));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_no_usable_engine() {
    let transport = ScriptedTransport::new();
    let coordinator = coordinator(transport.clone(), vec![engine("jito", &[])]);
    assert!(coordinator.registry().order().is_empty());

    let err = coordinator
        .send_bundle(&bundle(), &SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SubmissionError::Engine(_)));
}
