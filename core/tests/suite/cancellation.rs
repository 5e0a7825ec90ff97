#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Cancellation semantics: observed at step boundaries and between
//! per-query iterations, never mutating state afterwards.

use std::time::Duration;

use pretty_assertions::assert_eq;
use quarry_core::AnalysisConfig;
use quarry_core::ConfigOverrides;
use quarry_core::DatasetChoice;
use quarry_core::ScriptedInputs;
use quarry_core::run_blocking;
use quarry_core::spawn_session;
use quarry_protocol::ErrorCode;
use quarry_protocol::EventMsg;
use quarry_protocol::Op;

use super::common::MockBackend;
use super::common::MockChat;
use super::common::accept_json;
use super::common::amount_rows;
use super::common::harness;
use super::common::is_sample;
use super::common::queries_json;
use super::common::total_row;

#[tokio::test]
async fn cancel_mid_execution_leaves_partial_results() {
    let queries = [
        "SELECT SUM(amount) AS total FROM orders WHERE order_id = 1",
        "SELECT SUM(amount) AS total FROM orders WHERE order_id = 2",
        "SELECT SUM(amount) AS total FROM orders WHERE order_id = 3",
    ];
    let backend = MockBackend::sales_delayed(|sql, options| {
        if is_sample(options) {
            return (Ok(amount_rows(1)), Duration::ZERO);
        }
        // The second and third executions are slow enough for the cancel to
        // land between per-query iterations.
        let delay = if sql.contains("order_id = 1") {
            Duration::ZERO
        } else {
            Duration::from_millis(500)
        };
        (Ok(total_row(1.0)), delay)
    });
    let chat = MockChat::new(vec![
        &accept_json("per-order totals"),
        &queries_json(&queries),
    ]);
    let config = AnalysisConfig::default();
    let harness = harness(backend, chat, &config);

    let session = spawn_session(config, harness.services.clone(), "acme-analytics");
    loop {
        let Some(event) = session.next_event().await else {
            break;
        };
        match event.msg {
            EventMsg::DatasetSelectionRequested(_) => {
                session.submit(Op::SelectDataset { index: 0 }).await.unwrap();
            }
            EventMsg::TaskRequested(_) => {
                session
                    .submit(Op::SubmitTask {
                        task: "per-order totals".to_string(),
                    })
                    .await
                    .unwrap();
            }
            EventMsg::QueryExecuted(ev) if ev.query_idx == 0 => {
                session.submit(Op::Interrupt).await.unwrap();
            }
            EventMsg::AnalysisComplete(_) => break,
            _ => {}
        }
    }

    let state = session.into_final_state().await.unwrap();
    assert_eq!(state.error_message.as_deref(), Some("cancelled"));
    assert_eq!(state.error_code, Some(ErrorCode::Cancelled));
    // Partially populated: the cancel landed before the batch finished.
    assert!(!state.query_results.is_empty());
    assert!(state.query_results.len() < queries.len());
    assert!(state.analysis_report.is_none());
}

#[tokio::test]
async fn session_wall_clock_deadline_forces_termination() {
    let backend = MockBackend::sales_delayed(|_, options| {
        let delay = if is_sample(options) {
            Duration::from_millis(400)
        } else {
            Duration::ZERO
        };
        (Ok(amount_rows(1)), delay)
    });
    let chat = MockChat::new(vec![
        &accept_json("sum order amounts"),
        &queries_json(&["SELECT SUM(amount) AS total FROM orders"]),
    ]);
    let config = AnalysisConfig::with_overrides(ConfigOverrides {
        deadline_session: Some(Duration::from_millis(200)),
        ..ConfigOverrides::default()
    });
    let harness = harness(backend, chat, &config);
    let services = harness.services.clone();

    let state = run_blocking(
        config,
        services,
        "acme-analytics",
        ScriptedInputs {
            dataset: DatasetChoice::Index(0),
            task: "sum order amounts".to_string(),
        },
    )
    .await
    .unwrap();

    assert_eq!(state.error_code, Some(ErrorCode::Cancelled));
    assert!(state.analysis_report.is_none());
}
