#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Spill-to-memory behavior and the inline/spill boundary.

use pretty_assertions::assert_eq;
use quarry_core::AnalysisConfig;
use quarry_core::DatasetChoice;
use quarry_core::MemoryStore;
use quarry_core::ScriptedInputs;
use quarry_core::run_blocking;
use quarry_protocol::AnalysisState;

use super::common::MockBackend;
use super::common::MockChat;
use super::common::TestHarness;
use super::common::accept_json;
use super::common::amount_rows;
use super::common::harness;
use super::common::is_sample;
use super::common::queries_json;

async fn run_with_result_size(n: usize) -> (TestHarness, AnalysisState) {
    let backend = MockBackend::sales(move |_, options| {
        if is_sample(options) {
            Ok(amount_rows(10))
        } else {
            Ok(amount_rows(n))
        }
    });
    let chat = MockChat::new(vec![
        &accept_json("list order amounts"),
        &queries_json(&["SELECT amount FROM orders"]),
        "The amounts span the full range; see the aggregate statistics.",
    ]);
    let config = AnalysisConfig::default();
    let harness = harness(backend, chat, &config);
    let services = harness.services.clone();

    let state = run_blocking(
        config,
        services,
        "acme-analytics",
        ScriptedInputs {
            dataset: DatasetChoice::Index(0),
            task: "list order amounts".to_string(),
        },
    )
    .await
    .unwrap();
    (harness, state)
}

#[tokio::test]
async fn oversized_result_is_spilled_and_summarized() {
    let (harness, state) = run_with_result_size(5_000).await;

    let result = &state.query_results[0];
    assert!(result.rows.is_none());
    let key = result.memory_key.as_deref().unwrap();
    assert_eq!(state.memory_keys, vec![key.to_string()]);
    assert!(result.summary.is_some());

    // The spilled rows round-trip through the store unchanged.
    let entry = harness.memory.get(key).await.unwrap();
    assert_eq!(entry.row_count, 5_000);
    assert_eq!(entry.rows.len(), 5_000);
    assert_eq!(entry.schema, result.schema);

    // The report prompt (third chat call) received a summary, not rows.
    let report_prompt = harness.chat.request_text(2);
    assert!(report_prompt.contains("stored externally"));
    assert!(!report_prompt.contains("{\"amount\""));
    // A raw dump of 5000 rows would be far larger than this.
    assert!(report_prompt.len() < 10_000, "prompt was {} bytes", report_prompt.len());

    let report = state.analysis_report.as_deref().unwrap();
    assert!(report.contains("aggregate"));
}

#[tokio::test]
async fn result_at_inline_limit_stays_inline() {
    let (harness, state) = run_with_result_size(100).await;

    let result = &state.query_results[0];
    assert_eq!(result.rows.as_ref().unwrap().len(), 100);
    assert!(result.memory_key.is_none());
    assert!(state.memory_keys.is_empty());
    assert!(harness.memory.list(&state.session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn result_one_past_inline_limit_is_spilled() {
    let (harness, state) = run_with_result_size(101).await;

    let result = &state.query_results[0];
    assert!(result.rows.is_none());
    assert!(result.memory_key.is_some());
    assert_eq!(
        harness.memory.list(&state.session_id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn byte_limit_spills_even_under_the_row_limit() {
    // Few rows, but each one enormous: the serialized size trips the spill.
    let backend = MockBackend::sales(|_, options| {
        if is_sample(options) {
            return Ok(amount_rows(1));
        }
        let mut outcome = amount_rows(10);
        for row in &mut outcome.rows {
            row.insert(
                "blob".to_string(),
                serde_json::json!("x".repeat(32 * 1024)),
            );
        }
        Ok(outcome)
    });
    let chat = MockChat::new(vec![
        &accept_json("inspect blobs"),
        &queries_json(&["SELECT amount FROM orders"]),
        "Blobs summarized.",
    ]);
    let config = AnalysisConfig::default();
    let harness = harness(backend, chat, &config);
    let services = harness.services.clone();

    let state = run_blocking(
        config,
        services,
        "acme-analytics",
        ScriptedInputs {
            dataset: DatasetChoice::Index(0),
            task: "inspect blobs".to_string(),
        },
    )
    .await
    .unwrap();

    assert!(state.query_results[0].memory_key.is_some());
    assert_eq!(state.memory_keys.len(), 1);
}
