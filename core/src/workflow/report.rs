//! Report synthesis and the error sink.
//!
//! The report prompt receives inline rows for small results and summaries
//! for spilled ones. Before the call, the assembled prompt is budgeted
//! against the remaining session tokens; inline results are demoted to
//! spilled summaries until it fits, and only then does the engine give up
//! with `BUDGET_EXHAUSTED`. The error sink still produces a partial report
//! when any query succeeded — via the model when budget remains, otherwise
//! as a mechanical digest of the per-query summaries.

use quarry_protocol::AnalysisState;
use quarry_protocol::ErrorCode;
use quarry_protocol::ErrorEvent;
use quarry_protocol::EventMsg;
use quarry_protocol::QueryResult;
use quarry_protocol::ReportGeneratedEvent;
use quarry_protocol::ResultSpilledEvent;
use quarry_protocol::StateDelta;
use quarry_protocol::WorkflowStep;
use tracing::warn;

use super::StepOutcome;
use super::WorkflowEngine;
use crate::summarize;
use crate::token_budget::estimate_tokens;

/// Headroom reserved for the report completion and template overhead when
/// checking whether the assembled prompt still fits the session budget.
const REPORT_MARGIN_TOKENS: i64 = 2_048;

impl WorkflowEngine {
    /// `generate_report`: compose the written analysis from per-query
    /// results and summaries.
    pub(super) async fn run_generate_report(
        &self,
        state: &AnalysisState,
    ) -> (StateDelta, StepOutcome) {
        let task = task_of(state);
        let mut results = state.query_results.clone();
        let mut new_keys: Vec<String> = Vec::new();

        // Demote inline results to spilled summaries until the report
        // prompt fits what is left of the token budget.
        loop {
            let block = assemble_summaries(&state.generated_queries, &results);
            let needed = estimate_tokens(&block) + REPORT_MARGIN_TOKENS;
            if needed <= self.services.model.remaining_budget() {
                break;
            }
            let Some(target_idx) = largest_inline(&results) else {
                return (
                    StateDelta {
                        query_results: Some(results),
                        push_memory_keys: new_keys,
                        ..StateDelta::from_error(
                            ErrorCode::BudgetExhausted,
                            format!(
                                "report prompt needs ~{needed} tokens but only {} remain",
                                self.services.model.remaining_budget(),
                            ),
                        )
                    },
                    StepOutcome::Next(WorkflowStep::Error),
                );
            };

            let target = &mut results[target_idx];
            let Some(rows) = target.rows.take() else {
                continue;
            };
            let summary = summarize::summarize_rows(&target.schema, &rows);
            let attempt = state.retry_count_exec + 1;
            let put = self.services.memory.put(
                &state.session_id,
                target.query_idx,
                attempt,
                target.schema.clone(),
                rows.clone(),
            );
            match tokio::time::timeout(self.config.deadline_memory, put).await {
                Ok(Ok(key)) => {
                    self.emit(EventMsg::ResultSpilled(ResultSpilledEvent {
                        query_idx: target.query_idx,
                        memory_key: key.clone(),
                        row_count: summary.row_count,
                    }))
                    .await;
                    target.memory_key = Some(key.clone());
                    target.summary = Some(summary);
                    new_keys.push(key);
                }
                Ok(Err(err)) => {
                    warn!("failed to spill result for the report prompt: {err}");
                    target.rows = Some(rows);
                    return (
                        StateDelta {
                            query_results: Some(results),
                            push_memory_keys: new_keys,
                            ..StateDelta::from_error(err.code(), err.to_string())
                        },
                        StepOutcome::Next(WorkflowStep::Error),
                    );
                }
                Err(_) => {
                    target.rows = Some(rows);
                    return (
                        StateDelta {
                            query_results: Some(results),
                            push_memory_keys: new_keys,
                            ..StateDelta::from_error(
                                ErrorCode::Deadline,
                                "memory store deadline exceeded while spilling",
                            )
                        },
                        StepOutcome::Next(WorkflowStep::Error),
                    );
                }
            }
        }

        let block = assemble_summaries(&state.generated_queries, &results);
        match self.services.model.compose_report(&task, &block).await {
            Ok(exchange) => {
                self.emit(EventMsg::ReportGenerated(ReportGeneratedEvent {
                    report: exchange.value.clone(),
                }))
                .await;
                (
                    StateDelta {
                        analysis_report: Some(exchange.value),
                        query_results: Some(results),
                        push_memory_keys: new_keys,
                        push_messages: exchange.transcript,
                        ..StateDelta::default()
                    },
                    StepOutcome::Next(WorkflowStep::End),
                )
            }
            Err(err) => (
                StateDelta {
                    query_results: Some(results),
                    push_memory_keys: new_keys,
                    ..StateDelta::from_error(err.code(), err.to_string())
                },
                StepOutcome::Next(WorkflowStep::Error),
            ),
        }
    }

    /// `error`: surface the failure and, when any query result exists,
    /// still attempt a partial report. With the budget exhausted the
    /// partial report is assembled mechanically, without a model call.
    pub(super) async fn run_error_sink(&self, state: &AnalysisState) -> (StateDelta, StepOutcome) {
        let code = state.error_code.unwrap_or(ErrorCode::Internal);
        let message = state
            .error_message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        self.emit(EventMsg::Error(ErrorEvent {
            code,
            message: message.clone(),
        }))
        .await;

        let has_results = state.query_results.iter().any(QueryResult::is_ok);
        if !has_results || state.analysis_report.is_some() {
            return (StateDelta::default(), StepOutcome::Next(WorkflowStep::End));
        }

        let task = task_of(state);
        let block = assemble_summaries(&state.generated_queries, &state.query_results);
        let report = if code == ErrorCode::BudgetExhausted {
            degraded_report(&task, code, &message, &block)
        } else {
            let annotated = format!(
                "{block}\nNote: the session ended early ({code}: {message}); \
                 report on the results above and state what is missing.\n"
            );
            match self.services.model.compose_report(&task, &annotated).await {
                Ok(exchange) => exchange.value,
                Err(err) => {
                    warn!("partial report synthesis failed, degrading: {err}");
                    degraded_report(&task, code, &message, &block)
                }
            }
        };

        self.emit(EventMsg::ReportGenerated(ReportGeneratedEvent {
            report: report.clone(),
        }))
        .await;
        (
            StateDelta {
                analysis_report: Some(report),
                ..StateDelta::default()
            },
            StepOutcome::Next(WorkflowStep::End),
        )
    }
}

fn task_of(state: &AnalysisState) -> String {
    state
        .filtered_task
        .clone()
        .or_else(|| state.user_task.clone())
        .unwrap_or_default()
}

/// Render every query result as a prompt block: inline rows for small
/// results, stored summaries for spilled ones, an explicit failure note for
/// the rest.
fn assemble_summaries(queries: &[String], results: &[QueryResult]) -> String {
    let mut out = String::new();
    for result in results {
        let sql = queries
            .get(result.query_idx)
            .map(String::as_str)
            .unwrap_or("<unknown>");
        if let Some(error) = &result.error {
            out.push_str(&summarize::render_failure_block(result.query_idx, sql, error));
        } else if let Some(summary) = &result.summary {
            out.push_str(&summarize::render_summary_block(result.query_idx, sql, summary));
        } else if let Some(rows) = &result.rows {
            out.push_str(&summarize::render_inline_block(
                result.query_idx,
                sql,
                rows,
                result.truncated,
            ));
        }
        out.push('\n');
    }
    out
}

/// Index of the inline result with the most rows, if any.
fn largest_inline(results: &[QueryResult]) -> Option<usize> {
    results
        .iter()
        .enumerate()
        .filter(|(_, result)| result.rows.is_some())
        .max_by_key(|(_, result)| result.rows.as_ref().map(Vec::len).unwrap_or(0))
        .map(|(idx, _)| idx)
}

/// Mechanical fallback report: no model call, summaries only.
fn degraded_report(task: &str, code: ErrorCode, message: &str, block: &str) -> String {
    format!(
        "# Partial analysis\n\n\
         The session ended before a full report could be written ({code}: {message}).\n\n\
         Task: {task}\n\n\
         ## Available results\n\n{block}"
    )
}
