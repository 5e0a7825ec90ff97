//! Query generation, validation and execution steps.
//!
//! Generation failures (including safety-parse violations and sample-test
//! failures) re-enter through the generation retry edge with a repair
//! reprompt; execution failures re-enter through the execution retry edge,
//! re-executing only the queries that failed. The two counters are
//! independent: a failure in one family never resets the other.

use quarry_protocol::AnalysisState;
use quarry_protocol::ChatMessage;
use quarry_protocol::ErrorCode;
use quarry_protocol::EventMsg;
use quarry_protocol::QueryExecutedEvent;
use quarry_protocol::QueryResult;
use quarry_protocol::QueryTestedEvent;
use quarry_protocol::ResultSpilledEvent;
use quarry_protocol::RetryScheduledEvent;
use quarry_protocol::RetryStage;
use quarry_protocol::StateDelta;
use quarry_protocol::TestResult;
use quarry_protocol::WorkflowStep;
use tracing::warn;

use super::StepOutcome;
use super::WorkflowEngine;
use crate::error::QuarryErr;
use crate::prompts;
use crate::sql_safety;
use crate::summarize;

/// One executed query plus the error class the result string came from,
/// kept so retry routing does not have to re-parse error text.
struct ExecOutcome {
    result: QueryResult,
    err: Option<QuarryErr>,
}

impl WorkflowEngine {
    /// `generate_queries`: synthesize SQL for the filtered task and apply
    /// the read-only parse to every query before anything is sent anywhere.
    pub(super) async fn run_generate_queries(
        &self,
        state: &AnalysisState,
    ) -> (StateDelta, StepOutcome) {
        let Some(filtered_task) = state.filtered_task.as_deref() else {
            return self.fail(QuarryErr::Internal(
                "generate_queries entered without a filtered task".to_string(),
            ));
        };
        let schemas_block = prompts::render_schemas_block(&state.table_schemas);

        let exchange = match self
            .services
            .model
            .synthesize_queries(filtered_task, &schemas_block, self.config.max_queries, None)
            .await
        {
            Ok(exchange) => exchange,
            Err(err) => return self.fail(err),
        };

        match first_safety_violation(&exchange.value) {
            None => (
                StateDelta {
                    generated_queries: Some(exchange.value),
                    retry_count_gen: Some(0),
                    push_messages: exchange.transcript,
                    ..StateDelta::default()
                },
                StepOutcome::Next(WorkflowStep::TestQueries),
            ),
            Some((idx, sql, err)) => {
                warn!("generated query {idx} failed the safety parse: {err}");
                (
                    StateDelta {
                        retry_count_gen: Some(0),
                        push_messages: exchange.transcript,
                        ..StateDelta::from_error(
                            err.code(),
                            format!("query {} failed validation: {err}; offending sql: {sql}", idx + 1),
                        )
                    },
                    StepOutcome::Next(WorkflowStep::GenerateQueriesRetry),
                )
            }
        }
    }

    /// `generate_queries_retry`: bounded reprompt. With failing sample
    /// results in state the failed queries are individually repaired;
    /// otherwise (a safety abort) the whole batch is regenerated with the
    /// violation quoted back.
    pub(super) async fn run_generate_queries_retry(
        &self,
        state: &AnalysisState,
    ) -> (StateDelta, StepOutcome) {
        if state.retry_count_gen >= self.config.max_retries_gen {
            return (
                StateDelta::from_error(
                    state.error_code.unwrap_or(ErrorCode::SqlSemantic),
                    format!(
                        "query generation failed after {} retries: {}",
                        state.retry_count_gen,
                        state.error_message.as_deref().unwrap_or("unknown error"),
                    ),
                ),
                StepOutcome::Next(WorkflowStep::Error),
            );
        }
        let attempt = state.retry_count_gen + 1;
        self.emit(EventMsg::RetryScheduled(RetryScheduledEvent {
            stage: RetryStage::Generation,
            attempt,
            max_attempts: self.config.max_retries_gen,
            message: state
                .error_message
                .clone()
                .unwrap_or_else(|| "sample validation failed".to_string()),
        }))
        .await;

        let failing: Vec<(usize, String)> = state
            .test_results
            .iter()
            .filter(|test| !test.ok)
            .map(|test| {
                (
                    test.query_idx,
                    test.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                )
            })
            .collect();

        if failing.is_empty() {
            self.regenerate_batch(state, attempt).await
        } else {
            self.repair_failing_queries(state, attempt, failing).await
        }
    }

    async fn regenerate_batch(
        &self,
        state: &AnalysisState,
        attempt: u32,
    ) -> (StateDelta, StepOutcome) {
        let Some(filtered_task) = state.filtered_task.as_deref() else {
            return self.fail(QuarryErr::Internal(
                "generation retry entered without a filtered task".to_string(),
            ));
        };
        let schemas_block = prompts::render_schemas_block(&state.table_schemas);
        let prior_error = format!(
            "{} (all statements must be read-only SELECT queries)",
            state.error_message.as_deref().unwrap_or("validation failed"),
        );

        let exchange = match self
            .services
            .model
            .synthesize_queries(
                filtered_task,
                &schemas_block,
                self.config.max_queries,
                Some(&prior_error),
            )
            .await
        {
            Ok(exchange) => exchange,
            Err(err) => return self.fail(err),
        };

        match first_safety_violation(&exchange.value) {
            None => (
                StateDelta {
                    generated_queries: Some(exchange.value),
                    retry_count_gen: Some(attempt),
                    push_messages: exchange.transcript,
                    ..StateDelta::default()
                },
                StepOutcome::Next(WorkflowStep::TestQueries),
            ),
            Some((idx, sql, err)) => (
                StateDelta {
                    retry_count_gen: Some(attempt),
                    push_messages: exchange.transcript,
                    ..StateDelta::from_error(
                        err.code(),
                        format!("query {} failed validation: {err}; offending sql: {sql}", idx + 1),
                    )
                },
                StepOutcome::Next(WorkflowStep::GenerateQueriesRetry),
            ),
        }
    }

    async fn repair_failing_queries(
        &self,
        state: &AnalysisState,
        attempt: u32,
        failing: Vec<(usize, String)>,
    ) -> (StateDelta, StepOutcome) {
        let schemas_block = prompts::render_schemas_block(&state.table_schemas);
        let mut queries = state.generated_queries.clone();
        let mut transcript: Vec<ChatMessage> = Vec::new();

        for (idx, error) in failing {
            let Some(sql) = queries.get(idx).cloned() else {
                continue;
            };
            let exchange = match self
                .services
                .model
                .repair_query(&sql, &error, &schemas_block)
                .await
            {
                Ok(exchange) => exchange,
                Err(err) => {
                    return (
                        StateDelta {
                            push_messages: transcript,
                            ..StateDelta::from_error(err.code(), err.to_string())
                        },
                        StepOutcome::Next(WorkflowStep::Error),
                    );
                }
            };
            transcript.extend(exchange.transcript);

            if let Err(err) = sql_safety::ensure_read_only(&exchange.value) {
                warn!("repair for query {idx} produced invalid sql: {err}");
                return (
                    StateDelta {
                        retry_count_gen: Some(attempt),
                        push_messages: transcript,
                        ..StateDelta::from_error(
                            err.code(),
                            format!(
                                "repaired query {} failed validation: {err}; offending sql: {}",
                                idx + 1,
                                exchange.value,
                            ),
                        )
                    },
                    StepOutcome::Next(WorkflowStep::GenerateQueriesRetry),
                );
            }
            queries[idx] = exchange.value;
        }

        (
            StateDelta {
                generated_queries: Some(queries),
                retry_count_gen: Some(attempt),
                push_messages: transcript,
                ..StateDelta::default()
            },
            StepOutcome::Next(WorkflowStep::TestQueries),
        )
    }

    /// `test_queries`: sample-execute every query. All tests must pass
    /// before any full execution begins.
    pub(super) async fn run_test_queries(
        &self,
        state: &AnalysisState,
    ) -> (StateDelta, StepOutcome) {
        let mut results: Vec<TestResult> = Vec::new();
        let mut last_err: Option<QuarryErr> = None;

        for (query_idx, sql) in state.generated_queries.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let (mut delta, outcome) = self.cancelled_outcome().await;
                delta.test_results = Some(results);
                return (delta, outcome);
            }
            match self
                .services
                .warehouse
                .sample_execute(&state.project_id, sql, self.config.sample_row_limit)
                .await
            {
                Ok(sample) => {
                    self.emit(EventMsg::QueryTested(QueryTestedEvent {
                        query_idx,
                        ok: true,
                        row_count: sample.row_count,
                        error: None,
                    }))
                    .await;
                    results.push(TestResult {
                        query_idx,
                        ok: true,
                        row_count: sample.row_count,
                        sample_rows: sample.rows,
                        error: None,
                    });
                }
                Err(err) if err.is_query_repairable() => {
                    self.emit(EventMsg::QueryTested(QueryTestedEvent {
                        query_idx,
                        ok: false,
                        row_count: 0,
                        error: Some(err.to_string()),
                    }))
                    .await;
                    results.push(TestResult {
                        query_idx,
                        ok: false,
                        row_count: 0,
                        sample_rows: Vec::new(),
                        error: Some(err.to_string()),
                    });
                    last_err = Some(err);
                }
                Err(err) => return self.fail(err),
            }
        }

        match last_err {
            None => (
                StateDelta {
                    test_results: Some(results),
                    ..StateDelta::default()
                },
                StepOutcome::Next(WorkflowStep::ExecuteQueries),
            ),
            Some(err) => (
                StateDelta {
                    test_results: Some(results),
                    ..StateDelta::from_error(err.code(), err.to_string())
                },
                StepOutcome::Next(WorkflowStep::GenerateQueriesRetry),
            ),
        }
    }

    /// `execute_queries`: full execution with spill for oversized results.
    /// Cancellation is observed between queries, leaving `query_results`
    /// partially populated.
    pub(super) async fn run_execute_queries(
        &self,
        state: &AnalysisState,
    ) -> (StateDelta, StepOutcome) {
        let attempt = state.retry_count_exec + 1;
        let mut results: Vec<QueryResult> = Vec::new();
        let mut last_err: Option<QuarryErr> = None;
        let mut any_repairable = false;

        for (query_idx, sql) in state.generated_queries.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let (mut delta, outcome) = self.cancelled_outcome().await;
                delta.push_memory_keys = collect_keys(&results);
                delta.query_results = Some(results);
                return (delta, outcome);
            }
            let outcome = self.execute_one(state, query_idx, sql, attempt).await;
            if let Some(err) = outcome.err {
                any_repairable |= err.is_query_repairable();
                last_err = Some(err);
            }
            results.push(outcome.result);
        }

        let keys = collect_keys(&results);
        match last_err {
            None => (
                StateDelta {
                    query_results: Some(results),
                    push_memory_keys: keys,
                    retry_count_exec: Some(0),
                    ..StateDelta::default()
                },
                StepOutcome::Next(WorkflowStep::GenerateReport),
            ),
            Some(err) => {
                let next = if any_repairable {
                    WorkflowStep::ExecuteQueriesRetry
                } else {
                    WorkflowStep::Error
                };
                (
                    StateDelta {
                        query_results: Some(results),
                        push_memory_keys: keys,
                        retry_count_exec: Some(0),
                        ..StateDelta::from_error(err.code(), err.to_string())
                    },
                    StepOutcome::Next(next),
                )
            }
        }
    }

    /// `execute_queries_retry`: bounded repair-and-re-execute pass over the
    /// failed queries only. Successful results are never touched.
    pub(super) async fn run_execute_queries_retry(
        &self,
        state: &AnalysisState,
    ) -> (StateDelta, StepOutcome) {
        if state.retry_count_exec >= self.config.max_retries_exec {
            return (
                StateDelta::from_error(
                    state.error_code.unwrap_or(ErrorCode::SqlSemantic),
                    format!(
                        "execution failed after {} retries: {}",
                        state.retry_count_exec,
                        state.error_message.as_deref().unwrap_or("unknown error"),
                    ),
                ),
                StepOutcome::Next(WorkflowStep::Error),
            );
        }
        let retry_count = state.retry_count_exec + 1;
        self.emit(EventMsg::RetryScheduled(RetryScheduledEvent {
            stage: RetryStage::Execution,
            attempt: retry_count,
            max_attempts: self.config.max_retries_exec,
            message: state
                .error_message
                .clone()
                .unwrap_or_else(|| "execution failed".to_string()),
        }))
        .await;

        let schemas_block = prompts::render_schemas_block(&state.table_schemas);
        let mut queries = state.generated_queries.clone();
        let mut results = state.query_results.clone();
        let mut transcript: Vec<ChatMessage> = Vec::new();
        let mut new_keys: Vec<String> = Vec::new();
        let mut last_err: Option<QuarryErr> = None;

        for i in 0..results.len() {
            if results[i].is_ok() {
                continue;
            }
            if self.cancel.is_cancelled() {
                let (mut delta, outcome) = self.cancelled_outcome().await;
                delta.query_results = Some(results);
                delta.push_memory_keys = new_keys;
                delta.push_messages = transcript;
                delta.retry_count_exec = Some(retry_count);
                return (delta, outcome);
            }

            let query_idx = results[i].query_idx;
            let Some(sql) = queries.get(query_idx).cloned() else {
                continue;
            };
            let error = results[i]
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());

            let exchange = match self
                .services
                .model
                .repair_query(&sql, &error, &schemas_block)
                .await
            {
                Ok(exchange) => exchange,
                Err(err) => {
                    return (
                        StateDelta {
                            query_results: Some(results.clone()),
                            push_memory_keys: new_keys,
                            push_messages: transcript,
                            retry_count_exec: Some(retry_count),
                            ..StateDelta::from_error(err.code(), err.to_string())
                        },
                        StepOutcome::Next(WorkflowStep::Error),
                    );
                }
            };
            transcript.extend(exchange.transcript);

            if let Err(err) = sql_safety::ensure_read_only(&exchange.value) {
                warn!("repair for query {query_idx} produced invalid sql: {err}");
                results[i].error = Some(err.to_string());
                last_err = Some(err);
                continue;
            }
            queries[query_idx] = exchange.value.clone();

            let outcome = self
                .execute_one(state, query_idx, &exchange.value, retry_count + 1)
                .await;
            if let Some(key) = &outcome.result.memory_key {
                new_keys.push(key.clone());
            }
            if let Some(err) = outcome.err {
                last_err = Some(err);
            }
            results[i] = outcome.result;
        }

        let all_ok = results.iter().all(QueryResult::is_ok);
        let delta = StateDelta {
            generated_queries: Some(queries),
            query_results: Some(results),
            push_memory_keys: new_keys,
            push_messages: transcript,
            retry_count_exec: Some(retry_count),
            error_message: last_err.as_ref().map(ToString::to_string),
            error_code: last_err.as_ref().map(QuarryErr::code),
            ..StateDelta::default()
        };
        if all_ok {
            (delta, StepOutcome::Next(WorkflowStep::GenerateReport))
        } else {
            // Re-enter the retry edge; the counter bound terminates it.
            (delta, StepOutcome::Next(WorkflowStep::ExecuteQueriesRetry))
        }
    }

    /// Execute one query and classify the outcome; never terminal on its
    /// own. Oversized results are spilled to external memory and replaced
    /// by a key plus summary.
    async fn execute_one(
        &self,
        state: &AnalysisState,
        query_idx: usize,
        sql: &str,
        attempt: u32,
    ) -> ExecOutcome {
        let executed = match self
            .services
            .warehouse
            .execute(&state.project_id, sql, self.config.exec_row_cap)
            .await
        {
            Ok(executed) => executed,
            Err(err) => {
                return ExecOutcome {
                    result: failed_result(query_idx, &err),
                    err: Some(err),
                };
            }
        };

        let serialized_len = serde_json::to_vec(&executed.rows)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        let oversized = executed.rows.len() as u64 > self.config.inline_row_limit
            || serialized_len > self.config.inline_byte_limit;

        if !oversized {
            self.emit(EventMsg::QueryExecuted(QueryExecutedEvent {
                query_idx,
                row_count: executed.row_count,
                truncated: executed.truncated,
                spilled: false,
            }))
            .await;
            return ExecOutcome {
                result: QueryResult {
                    query_idx,
                    rows: Some(executed.rows),
                    memory_key: None,
                    row_count: executed.row_count,
                    schema: executed.schema,
                    truncated: executed.truncated,
                    error: None,
                    summary: None,
                },
                err: None,
            };
        }

        let summary = summarize::summarize_rows(&executed.schema, &executed.rows);
        let put = self.services.memory.put(
            &state.session_id,
            query_idx,
            attempt,
            executed.schema.clone(),
            executed.rows,
        );
        let key = match tokio::time::timeout(self.config.deadline_memory, put).await {
            Ok(Ok(key)) => key,
            Ok(Err(err)) => {
                return ExecOutcome {
                    result: failed_result(query_idx, &err),
                    err: Some(err),
                };
            }
            Err(_) => {
                let err = QuarryErr::Deadline(self.config.deadline_memory);
                return ExecOutcome {
                    result: failed_result(query_idx, &err),
                    err: Some(err),
                };
            }
        };

        self.emit(EventMsg::ResultSpilled(ResultSpilledEvent {
            query_idx,
            memory_key: key.clone(),
            row_count: summary.row_count,
        }))
        .await;
        self.emit(EventMsg::QueryExecuted(QueryExecutedEvent {
            query_idx,
            row_count: executed.row_count,
            truncated: executed.truncated,
            spilled: true,
        }))
        .await;

        ExecOutcome {
            result: QueryResult {
                query_idx,
                rows: None,
                memory_key: Some(key),
                row_count: executed.row_count,
                schema: executed.schema,
                truncated: executed.truncated,
                error: None,
                summary: Some(summary),
            },
            err: None,
        }
    }
}

fn failed_result(query_idx: usize, err: &QuarryErr) -> QueryResult {
    QueryResult {
        query_idx,
        rows: None,
        memory_key: None,
        row_count: 0,
        schema: Vec::new(),
        truncated: false,
        error: Some(err.to_string()),
        summary: None,
    }
}

fn collect_keys(results: &[QueryResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|result| result.memory_key.clone())
        .collect()
}

/// First query in the batch that fails the read-only parse, if any.
fn first_safety_violation(queries: &[String]) -> Option<(usize, &str, QuarryErr)> {
    for (idx, sql) in queries.iter().enumerate() {
        if let Err(err) = sql_safety::ensure_read_only(sql) {
            return Some((idx, sql.as_str(), err));
        }
    }
    None
}
