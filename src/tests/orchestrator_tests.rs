//! End-to-end orchestration passes over a fake chain and scripted relay

use solana_sdk::{pubkey::Pubkey, signature::Keypair, signer::Signer};
use std::str::FromStr;
use std::time::Duration;

use super::test_helpers::*;
use crate::automation::errors::OrchestrationError;
use crate::automation::orchestrator::{OrchestratorSettings, UnitOutcome};
use crate::automation::work_unit::{AutomationKind, TriggerEvent, WorkUnit};
use crate::ledger::fixed_point::FixedAmount;
use crate::ledger::store::LedgerStatus;

const TEN_SOL: u64 = 10_000_000_000;

fn funded_unit(h: &Harness, id: &str, kind: AutomationKind, lamports: u64) -> WorkUnit {
    let wallet = Keypair::new();
    h.chain.set_balance(&wallet.pubkey(), lamports);
    let unit = work_unit(id, kind, &wallet);
    h.store.put_unit(&unit).unwrap();
    unit
}

fn land_next(h: &Harness, id: &str) {
    h.transport.script(RELAY_ENDPOINT, vec![Ok(id.to_string())]);
    h.transport
        .script_status(vec![Ok(status_reply(404, None)), Ok(status_reply(200, Some(landed_body(400))))]);
}

#[tokio::test(start_paused = true)]
async fn test_top_up_lands_and_updates_totals() {
    let h = harness();
    funded_unit(&h, "unit-a", AutomationKind::LiquidityTopUp, TEN_SOL);
    land_next(&h, "bundle-1");

    let summary = h
        .orchestrator
        .run_pass(AutomationKind::LiquidityTopUp, None)
        .await
        .unwrap();

    assert_eq!((summary.processed, summary.succeeded, summary.failed), (1, 1, 0));
    assert!(!summary.skipped_overlap);

    let unit = h.store.get_unit("unit-a").unwrap().unwrap();
    assert_eq!(unit.cumulative_total, FixedAmount::from_f64(0.2));
    assert_eq!(unit.cumulative_value, FixedAmount::from_f64(0.2));
    assert_eq!(unit.execution_count, 1);
    assert_eq!(unit.last_known_price, Some(0.5));
    assert!(unit.last_executed_at.is_some());

    let entries = h.store.entries_for("unit-a").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, LedgerStatus::Success);
    assert_eq!(entries[0].tx_id.as_deref(), Some("bundle-1"));
    assert_eq!(entries[0].engine.as_deref(), Some("jito"));

    let aggregate = h.store.aggregate(AutomationKind::LiquidityTopUp).unwrap();
    assert_eq!(aggregate.executions, 1);

    let bodies = h.transport.bodies();
    assert_eq!(bodies[0]["method"], "sendBundle");
}

#[tokio::test(start_paused = true)]
async fn test_below_minimum_advances_without_submitting() {
    let h = harness();
    let mut unit = funded_unit(&h, "unit-a", AutomationKind::LiquidityTopUp, 1_000_000_000);
    unit.min_trigger = FixedAmount::from_f64(0.5);
    h.store.put_unit(&unit).unwrap();

    let summary = h
        .orchestrator
        .run_pass(AutomationKind::LiquidityTopUp, None)
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(h.transport.calls().is_empty());

    let stored = h.store.get_unit("unit-a").unwrap().unwrap();
    assert!(stored.last_executed_at.is_some());
    assert_eq!(stored.cumulative_total, FixedAmount::ZERO);
    let entries = h.store.entries_for("unit-a").unwrap();
    assert_eq!(entries[0].status, LedgerStatus::Skipped);

    // Not due again within the interval
    let again = h
        .orchestrator
        .run_pass(AutomationKind::LiquidityTopUp, None)
        .await
        .unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_unit_does_not_abort_pass() {
    let h = harness();
    funded_unit(&h, "unit-a", AutomationKind::LiquidityTopUp, TEN_SOL);
    funded_unit(&h, "unit-b", AutomationKind::LiquidityTopUp, TEN_SOL);
    h.transport
        .script(RELAY_ENDPOINT, vec![Err(bad_request()), Ok("bundle-b".into())]);
    h.transport.script_status(vec![Ok(status_reply(200, Some(landed_body(9))))]);

    let summary = h
        .orchestrator
        .run_pass(AutomationKind::LiquidityTopUp, None)
        .await
        .unwrap();

    assert_eq!((summary.processed, summary.succeeded, summary.failed), (2, 1, 1));
    assert_eq!(summary.failure_reasons.len(), 1);
    assert!(summary.failure_reasons[0].starts_with("unit-a: "));

    let failed = h.store.get_unit("unit-a").unwrap().unwrap();
    assert!(failed.last_executed_at.is_some());
    assert_eq!(failed.execution_count, 0);
    let entries = h.store.entries_for("unit-a").unwrap();
    assert_eq!(entries[0].status, LedgerStatus::Failed);
    assert!(entries[0].error.is_some());

    assert_eq!(h.store.get_unit("unit-b").unwrap().unwrap().execution_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_burn_trigger_is_applied_once() {
    let h = harness();
    let wallet = Keypair::new();
    let mut unit = work_unit("burn-1", AutomationKind::TokenBurn, &wallet);
    unit.rate_percent = 50.0;
    h.store.put_unit(&unit).unwrap();
    let mint = Pubkey::from_str(&unit.mint).unwrap();
    h.chain.set_token_balance(&wallet.pubkey(), &mint, 100_000_000, 6);

    let trigger = TriggerEvent::new("burn-1", FixedAmount::from_f64(10.0), chrono::Utc::now());
    h.store.put_trigger(&trigger).unwrap();
    land_next(&h, "burn-bundle");

    let summary = h.orchestrator.run_pass(AutomationKind::TokenBurn, None).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let stored = h.store.get_unit("burn-1").unwrap().unwrap();
    assert_eq!(stored.cumulative_total, FixedAmount::from_f64(5.0));
    assert_eq!(stored.cumulative_value, FixedAmount::from_f64(2.5));
    assert!(h.store.get_trigger("burn-1", &trigger.id).unwrap().unwrap().processed);
    assert_eq!(
        h.store.entries_for("burn-1").unwrap()[0].trigger_id.as_deref(),
        Some(trigger.id.as_str())
    );

    // Rerun immediately, as after a restart
    let mut rewound = stored.clone();
    rewound.last_executed_at = None;
    h.store.put_unit(&rewound).unwrap();
    let rerun = h.orchestrator.run_pass(AutomationKind::TokenBurn, None).await.unwrap();

    assert_eq!(rerun.skipped, 1);
    assert_eq!(h.transport.calls().len(), 1);
    let after = h.store.get_unit("burn-1").unwrap().unwrap();
    assert_eq!(after.cumulative_total, FixedAmount::from_f64(5.0));
    assert_eq!(after.execution_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_burn_larger_than_balance_fails() {
    let h = harness();
    let wallet = Keypair::new();
    let mut unit = work_unit("burn-2", AutomationKind::TokenBurn, &wallet);
    unit.rate_percent = 100.0;
    h.store.put_unit(&unit).unwrap();
    let mint = Pubkey::from_str(&unit.mint).unwrap();
    h.chain.set_token_balance(&wallet.pubkey(), &mint, 1_000_000, 6);
    let trigger = TriggerEvent::new("burn-2", FixedAmount::from_f64(3.0), chrono::Utc::now());
    h.store.put_trigger(&trigger).unwrap();

    let report = h.orchestrator.execute_unit("burn-2", None).await.unwrap();

    assert!(matches!(report.outcome, UnitOutcome::Failed { ref kind, .. } if kind == "insufficient_funds"));
    assert!(h.transport.calls().is_empty());
    // Trigger stays pending for a later pass
    assert!(!h.store.get_trigger("burn-2", &trigger.id).unwrap().unwrap().processed);
}

#[tokio::test(start_paused = true)]
async fn test_absurd_token_decimals_fail_only_that_unit() {
    let h = harness();
    let wallet = Keypair::new();
    let unit = work_unit("burn-3", AutomationKind::TokenBurn, &wallet);
    h.store.put_unit(&unit).unwrap();
    let mint = Pubkey::from_str(&unit.mint).unwrap();
    h.chain.set_token_balance(&wallet.pubkey(), &mint, 1, 60);
    h.store
        .put_trigger(&TriggerEvent::new("burn-3", FixedAmount::from_f64(1.0), chrono::Utc::now()))
        .unwrap();

    let summary = h.orchestrator.run_pass(AutomationKind::TokenBurn, None).await.unwrap();

    assert_eq!((summary.processed, summary.failed), (1, 1));
    assert!(summary.failure_reasons[0].contains("decimals"));
    assert!(h.transport.calls().is_empty());
    assert_eq!(h.store.entries_for("burn-3").unwrap()[0].status, LedgerStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reconciled_from_chain() {
    let h = harness();
    funded_unit(&h, "unit-a", AutomationKind::FeeHarvest, TEN_SOL);
    h.transport.script(RELAY_ENDPOINT, vec![Ok("slow-bundle".into())]);
    h.chain.land_everything(1234);

    let summary = h.orchestrator.run_pass(AutomationKind::FeeHarvest, None).await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.transport.status_calls(), 30);
    assert_eq!(h.store.get_unit("unit-a").unwrap().unwrap().execution_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_landing_is_unconfirmed_and_not_resubmitted() {
    let h = harness();
    funded_unit(&h, "unit-a", AutomationKind::FeeHarvest, TEN_SOL);
    h.transport.script(RELAY_ENDPOINT, vec![Ok("lost-bundle".into())]);

    let summary = h.orchestrator.run_pass(AutomationKind::FeeHarvest, None).await.unwrap();

    assert_eq!(summary.unconfirmed, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(h.transport.calls().len(), 1);

    let entries = h.store.entries_for("unit-a").unwrap();
    assert_eq!(entries[0].status, LedgerStatus::Unconfirmed);
    assert_eq!(entries[0].tx_id.as_deref(), Some("lost-bundle"));
    let unit = h.store.get_unit("unit-a").unwrap().unwrap();
    assert_eq!(unit.execution_count, 0);
    assert!(unit.last_executed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_pass_is_skipped() {
    let h = harness();
    funded_unit(&h, "unit-a", AutomationKind::LiquidityTopUp, TEN_SOL);
    land_next(&h, "bundle-1");

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.run_pass(AutomationKind::LiquidityTopUp, None).await });

    for _ in 0..100 {
        if h.orchestrator.in_flight().is_held("unit-a") {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(h.orchestrator.in_flight().is_held("unit-a"));

    let second = h
        .orchestrator
        .run_pass(AutomationKind::LiquidityTopUp, None)
        .await
        .unwrap();
    assert!(second.skipped_overlap);
    assert_eq!(second.processed, 0);

    let manual = h.orchestrator.execute_unit("unit-a", None).await;
    assert!(matches!(manual, Err(OrchestrationError::InProgress(_))));

    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.succeeded, 1);
    assert!(!h.orchestrator.in_flight().is_held("unit-a"));
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_records_simulation() {
    let h = harness_with(
        |engine| engine.dry_run = true,
        OrchestratorSettings {
            inter_unit_delay: Duration::ZERO,
            fee_reserve: FixedAmount::ZERO,
            ..OrchestratorSettings::default()
        },
    );
    funded_unit(&h, "unit-a", AutomationKind::LiquidityTopUp, TEN_SOL);

    let report = h.orchestrator.execute_unit("unit-a", None).await.unwrap();

    assert!(matches!(report.outcome, UnitOutcome::Simulated { .. }));
    assert!(h.transport.calls().is_empty());
    let unit = h.store.get_unit("unit-a").unwrap().unwrap();
    assert_eq!(unit.cumulative_total, FixedAmount::ZERO);
    assert_eq!(h.store.entries_for("unit-a").unwrap()[0].status, LedgerStatus::Simulated);
}

#[tokio::test(start_paused = true)]
async fn test_orchestration_error_kinds_reach_the_ledger() {
    let h = harness();
    let mut harvest = funded_unit(&h, "unit-a", AutomationKind::FeeHarvest, TEN_SOL);
    harvest.destination = Some(harvest.source_wallet.clone());
    h.store.put_unit(&harvest).unwrap();

    let mut garbled = funded_unit(&h, "unit-b", AutomationKind::FeeHarvest, TEN_SOL);
    garbled.encrypted_key = "bm90LWEta2V5LWJsb2ItYXQtYWxs".into();
    h.store.put_unit(&garbled).unwrap();

    let a = h.orchestrator.execute_unit("unit-a", None).await.unwrap();
    let b = h.orchestrator.execute_unit("unit-b", None).await.unwrap();

    assert!(matches!(a.outcome, UnitOutcome::Failed { ref kind, .. } if kind == "invalid_destination"));
    assert!(matches!(b.outcome, UnitOutcome::Failed { ref kind, .. } if kind == "decrypt_failure"));
    assert!(h.transport.calls().is_empty());
    assert_eq!(h.store.entries_for("unit-b").unwrap()[0].status, LedgerStatus::Failed);
}

#[tokio::test]
async fn test_manual_execution_edge_cases() {
    let h = harness();
    assert!(matches!(
        h.orchestrator.execute_unit("missing", None).await,
        Err(OrchestrationError::UnitNotFound(_))
    ));

    let mut unit = funded_unit(&h, "unit-a", AutomationKind::LiquidityTopUp, TEN_SOL);
    unit.enabled = false;
    h.store.put_unit(&unit).unwrap();
    let report = h.orchestrator.execute_unit("unit-a", None).await.unwrap();
    assert_eq!(
        report.outcome,
        UnitOutcome::Skipped {
            reason: "disabled".into()
        }
    );
}
