#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end scenarios over the full workflow graph.

use pretty_assertions::assert_eq;
use quarry_core::AnalysisConfig;
use quarry_core::DatasetChoice;
use quarry_core::ScriptedInputs;
use quarry_core::error::QuarryErr;
use quarry_core::run_blocking;
use quarry_protocol::AnalysisState;
use quarry_protocol::ErrorCode;

use super::common::MockBackend;
use super::common::MockChat;
use super::common::accept_json;
use super::common::amount_rows;
use super::common::harness;
use super::common::is_sample;
use super::common::queries_json;
use super::common::reject_json;
use super::common::sql_json;
use super::common::total_row;

async fn run_sales(
    backend: &std::sync::Arc<MockBackend>,
    chat: &std::sync::Arc<MockChat>,
    config: AnalysisConfig,
    task: &str,
) -> AnalysisState {
    let harness = harness(backend.clone(), chat.clone(), &config);
    run_blocking(
        config,
        harness.services,
        "acme-analytics",
        ScriptedInputs {
            dataset: DatasetChoice::Name("sales".to_string()),
            task: task.to_string(),
        },
    )
    .await
    .unwrap()
}

fn assert_core_invariants(state: &AnalysisState, config: &AnalysisConfig) {
    assert!(state.retry_count_gen <= config.max_retries_gen);
    assert!(state.retry_count_exec <= config.max_retries_exec);
    if !state.query_results.is_empty() {
        assert_eq!(state.query_results.len(), state.generated_queries.len());
    }
    for result in &state.query_results {
        if result.is_ok() {
            assert!(
                result.rows.is_some() ^ result.memory_key.is_some(),
                "query {} must have exactly one of rows/memory_key",
                result.query_idx
            );
        }
    }
}

#[tokio::test]
async fn happy_path_single_query() {
    let sql = "SELECT SUM(amount) AS total FROM orders \
               WHERE ts > TIMESTAMP_SUB(CURRENT_TIMESTAMP(), INTERVAL 7 DAY)";
    let backend = MockBackend::sales(|_, _| Ok(total_row(41_250.5)));
    let chat = MockChat::new(vec![
        &accept_json("compute total revenue for the last 7 days"),
        &queries_json(&[sql]),
        "Total revenue over the last 7 days was **41250.5**.",
    ]);
    let config = AnalysisConfig::default();

    let state = run_sales(&backend, &chat, config.clone(), "total revenue last 7 days").await;

    assert_eq!(state.selected_dataset.as_deref(), Some("sales"));
    assert_eq!(state.tables_in_dataset, vec!["orders"]);
    assert!(state.table_schemas.contains_key("orders"));
    assert_eq!(state.generated_queries.len(), 1);
    assert!(state.generated_queries[0].contains("amount"));
    assert!(state.test_results.iter().all(|test| test.ok));
    assert_eq!(state.query_results.len(), 1);
    assert_eq!(state.query_results[0].rows.as_ref().unwrap().len(), 1);
    assert!(state.memory_keys.is_empty());
    assert_eq!(state.retry_count_gen, 0);
    assert_eq!(state.retry_count_exec, 0);
    let report = state.analysis_report.as_deref().unwrap();
    assert!(report.contains("41250.5"));
    assert_core_invariants(&state, &config);

    // The sample pass runs strictly before full execution, with the limit
    // injected into the SQL.
    let log = backend.query_log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].max_rows, Some(config.sample_row_limit));
    assert!(log[0].sql.to_uppercase().contains("LIMIT 10"), "{}", log[0].sql);
    assert_eq!(log[1].max_rows, Some(config.exec_row_cap));
}

#[tokio::test]
async fn unsafe_task_is_rejected_before_any_query() {
    let backend = MockBackend::sales(|_, _| Ok(total_row(0.0)));
    let chat = MockChat::new(vec![&reject_json("the task asks to delete data")]);
    let config = AnalysisConfig::default();

    let state = run_sales(&backend, &chat, config.clone(), "delete rows older than 2020").await;

    assert_eq!(state.error_code, Some(ErrorCode::UnsafeTask));
    assert!(state.filtered_task.is_none());
    assert!(state.analysis_report.is_none());
    assert!(state.generated_queries.is_empty());
    // Nothing was sent to the warehouse after the filter: no schema reads,
    // no queries.
    assert_eq!(backend.schema_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(backend.queries_sent(), 0);
    assert_core_invariants(&state, &config);
}

#[tokio::test]
async fn generation_retry_recovers_from_bad_column() {
    // First synthesis references a column that does not exist; the sample
    // fails, the repair prompt fixes it, the second sample succeeds.
    let backend = MockBackend::sales(|sql, options| {
        if sql.contains("amont") {
            return Err(QuarryErr::SqlSemantic("Unrecognized name: amont".to_string()));
        }
        if is_sample(options) {
            Ok(amount_rows(3))
        } else {
            Ok(total_row(812.0))
        }
    });
    let chat = MockChat::new(vec![
        &accept_json("sum order amounts"),
        &queries_json(&["SELECT SUM(amont) AS total FROM orders"]),
        &sql_json("SELECT SUM(amount) AS total FROM orders"),
        "The total across all orders is 812.",
    ]);
    let config = AnalysisConfig::default();

    let state = run_sales(&backend, &chat, config.clone(), "sum order amounts").await;

    assert_eq!(state.retry_count_gen, 1);
    assert_eq!(state.retry_count_exec, 0);
    assert_eq!(
        state.generated_queries,
        vec!["SELECT SUM(amount) AS total FROM orders".to_string()]
    );
    assert!(state.test_results.iter().all(|test| test.ok));
    assert!(state.analysis_report.is_some());
    assert_core_invariants(&state, &config);
}

#[tokio::test]
async fn unsafe_generated_sql_is_regenerated() {
    // The first batch contains DML; the safety parse aborts it before any
    // warehouse call and the reprompt regenerates the whole batch.
    let backend = MockBackend::sales(|_, options| {
        if is_sample(options) {
            Ok(amount_rows(2))
        } else {
            Ok(total_row(10.0))
        }
    });
    let chat = MockChat::new(vec![
        &accept_json("sum order amounts"),
        &queries_json(&["DELETE FROM orders WHERE amount < 0"]),
        &queries_json(&["SELECT SUM(amount) AS total FROM orders"]),
        "Total is 10.",
    ]);
    let config = AnalysisConfig::default();

    let state = run_sales(&backend, &chat, config.clone(), "sum order amounts").await;

    assert_eq!(state.retry_count_gen, 1);
    assert!(state.analysis_report.is_some());
    // The rejected DML never reached the warehouse.
    let log = backend.query_log.lock().unwrap();
    assert!(log.iter().all(|call| !call.sql.to_uppercase().starts_with("DELETE")));
    assert_core_invariants(&state, &config);
}

#[tokio::test]
async fn execution_retries_exhaust_to_terminal_error() {
    // Samples pass but every full execution fails: initial attempt plus two
    // repair retries, then terminal.
    let backend = MockBackend::sales(|_, options| {
        if is_sample(options) {
            Ok(amount_rows(1))
        } else {
            Err(QuarryErr::SqlSemantic("resources exceeded".to_string()))
        }
    });
    let chat = MockChat::new(vec![
        &accept_json("sum order amounts"),
        &queries_json(&["SELECT SUM(amount) AS total FROM orders"]),
        &sql_json("SELECT SUM(amount) AS total FROM orders"),
        &sql_json("SELECT SUM(amount) AS total FROM orders"),
    ]);
    let config = AnalysisConfig::default();

    let state = run_sales(&backend, &chat, config.clone(), "sum order amounts").await;

    assert_eq!(state.retry_count_exec, config.max_retries_exec);
    assert_eq!(state.error_code, Some(ErrorCode::SqlSemantic));
    assert!(state.error_message.as_deref().unwrap().contains("resources exceeded"));
    // No query ever succeeded, so there is nothing to report on.
    assert!(state.analysis_report.is_none());
    assert_eq!(state.query_results.len(), 1);
    assert!(state.query_results[0].error.is_some());
    // 1 sample + 3 execution attempts.
    assert_eq!(backend.queries_sent(), 4);
    assert_core_invariants(&state, &config);
}

#[tokio::test]
async fn missing_table_schema_is_an_error_not_an_omission() {
    let backend = MockBackend::sales_with_ghost_table();
    let chat = MockChat::new(vec![&accept_json("count ghosts")]);
    let config = AnalysisConfig::default();

    let state = run_sales(&backend, &chat, config.clone(), "count ghosts").await;

    assert_eq!(state.error_code, Some(ErrorCode::TableNotFound));
    assert!(state.error_message.as_deref().unwrap().contains("ghost"));
    // read_schemas aborted; nothing was generated or executed.
    assert!(state.generated_queries.is_empty());
    assert_eq!(backend.queries_sent(), 0);
}

#[tokio::test]
async fn unknown_dataset_name_fails_after_bounded_reasks() {
    let backend = MockBackend::sales(|_, _| Ok(total_row(0.0)));
    let chat = MockChat::new(vec![]);
    let config = AnalysisConfig::default();
    let harness = harness(backend, chat, &config);

    let state = run_blocking(
        config,
        harness.services,
        "acme-analytics",
        ScriptedInputs {
            dataset: DatasetChoice::Name("nonexistent".to_string()),
            task: "anything".to_string(),
        },
    )
    .await
    .unwrap();

    assert_eq!(state.error_code, Some(ErrorCode::DatasetNotFound));
    assert!(state.selected_dataset.is_none());
}
