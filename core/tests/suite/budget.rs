#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Token-budget enforcement: no call is made once the remaining budget
//! cannot cover it, and the session still ends with a usable digest.

use pretty_assertions::assert_eq;
use quarry_core::AnalysisConfig;
use quarry_core::ConfigOverrides;
use quarry_core::DatasetChoice;
use quarry_core::ScriptedInputs;
use quarry_core::run_blocking;
use quarry_protocol::ErrorCode;
use quarry_protocol::TokenUsage;

use super::common::MockBackend;
use super::common::MockChat;
use super::common::accept_json;
use super::common::amount_rows;
use super::common::harness;
use super::common::is_sample;
use super::common::queries_json;
use super::common::total_row;

fn usage(input: i64, output: i64) -> Option<TokenUsage> {
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    })
}

#[tokio::test]
async fn report_budget_exhaustion_degrades_without_an_llm_call() {
    let backend = MockBackend::sales(|_, options| {
        if is_sample(options) {
            Ok(amount_rows(2))
        } else {
            Ok(total_row(99.0))
        }
    });
    // The synthesis reply burns most of the budget; by report time there is
    // no room left for the composition call.
    let chat = MockChat::with_usage(vec![
        (&accept_json("sum order amounts"), usage(1_000, 200)),
        (
            &queries_json(&["SELECT SUM(amount) AS total FROM orders"]),
            usage(2_000, 500),
        ),
    ]);
    let config = AnalysisConfig::with_overrides(ConfigOverrides {
        token_budget_session: Some(5_600),
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

    assert_eq!(state.error_code, Some(ErrorCode::BudgetExhausted));
    // Exactly two model calls were made; composing the report would have
    // exceeded the remaining budget, so it was never attempted.
    assert_eq!(harness.chat.calls(), 2);
    // The degraded report is assembled mechanically from the summaries.
    let report = state.analysis_report.as_deref().unwrap();
    assert!(report.contains("Partial analysis"));
    assert!(report.contains("BUDGET_EXHAUSTED"));
    // Inline results were demoted to spilled summaries while trying to fit
    // the prompt.
    assert_eq!(state.memory_keys.len(), 1);
    assert!(state.query_results[0].memory_key.is_some());
}

#[tokio::test]
async fn generation_budget_exhaustion_is_terminal() {
    let backend = MockBackend::sales(|_, _| Ok(total_row(0.0)));
    let chat = MockChat::with_usage(vec![(
        &accept_json("sum order amounts"),
        usage(900, 50),
    )]);
    let config = AnalysisConfig::with_overrides(ConfigOverrides {
        token_budget_session: Some(1_200),
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

    assert_eq!(state.error_code, Some(ErrorCode::BudgetExhausted));
    assert_eq!(harness.chat.calls(), 1);
    assert!(state.generated_queries.is_empty());
    assert!(state.analysis_report.is_none());
}
