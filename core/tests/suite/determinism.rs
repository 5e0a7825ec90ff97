#![allow(clippy::unwrap_used, clippy::expect_used)]
//! With mocked adapters the machine is a pure function of its inputs:
//! running the same task twice produces identical queries and results.

use pretty_assertions::assert_eq;
use quarry_core::AnalysisConfig;
use quarry_core::DatasetChoice;
use quarry_core::ScriptedInputs;
use quarry_core::run_blocking;
use quarry_protocol::AnalysisState;

use super::common::MockBackend;
use super::common::MockChat;
use super::common::accept_json;
use super::common::amount_rows;
use super::common::harness;
use super::common::is_sample;
use super::common::queries_json;
use super::common::total_row;

async fn run_once() -> AnalysisState {
    let backend = MockBackend::sales(|sql, options| {
        if is_sample(options) {
            Ok(amount_rows(4))
        } else if sql.contains("SUM") {
            Ok(total_row(123.0))
        } else {
            Ok(amount_rows(42))
        }
    });
    let chat = MockChat::new(vec![
        &accept_json("revenue overview"),
        &queries_json(&[
            "SELECT SUM(amount) AS total FROM orders",
            "SELECT amount FROM orders",
        ]),
        "Revenue overview: total 123 across 42 orders.",
    ]);
    let config = AnalysisConfig::default();
    let harness = harness(backend, chat, &config);

    run_blocking(
        config,
        harness.services,
        "acme-analytics",
        ScriptedInputs {
            dataset: DatasetChoice::Name("sales".to_string()),
            task: "revenue overview".to_string(),
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn identical_inputs_produce_identical_outputs() {
    let first = run_once().await;
    let second = run_once().await;

    assert_eq!(
        serde_json::to_value(&first.generated_queries).unwrap(),
        serde_json::to_value(&second.generated_queries).unwrap()
    );
    assert_eq!(
        serde_json::to_value(&first.test_results).unwrap(),
        serde_json::to_value(&second.test_results).unwrap()
    );
    assert_eq!(
        serde_json::to_value(&first.query_results).unwrap(),
        serde_json::to_value(&second.query_results).unwrap()
    );
    assert_eq!(first.analysis_report, second.analysis_report);
}
