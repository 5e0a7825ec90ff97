//! Human-readable progress rendering.
//!
//! Progress goes to stderr; the only thing ever written to stdout is the
//! final report (or nothing, when the session failed without one).

use quarry_protocol::Event;
use quarry_protocol::EventMsg;
use quarry_protocol::RetryStage;

use crate::event_processor::EventProcessor;
use crate::event_processor::SessionStatus;

#[derive(Default)]
pub struct EventProcessorWithHumanOutput {}

impl EventProcessorWithHumanOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventProcessor for EventProcessorWithHumanOutput {
    #[allow(clippy::print_stderr)]
    fn process_event(&mut self, event: &Event) -> SessionStatus {
        match &event.msg {
            EventMsg::SessionConfigured(ev) => {
                eprintln!("session {} on project {}", ev.session_id, ev.project_id);
            }
            EventMsg::StepStarted(ev) => {
                eprintln!("» {}", ev.step);
            }
            EventMsg::DatasetSelectionRequested(ev) => {
                eprintln!("available datasets:");
                for (idx, dataset) in ev.datasets.iter().enumerate() {
                    eprintln!("  [{idx}] {dataset}");
                }
            }
            EventMsg::TaskFiltered(ev) => match &ev.verdict.filtered_task {
                Some(task) => eprintln!("task accepted: {task}"),
                None => eprintln!(
                    "task rejected: {}",
                    ev.verdict.rejection_reason.as_deref().unwrap_or("unsafe")
                ),
            },
            EventMsg::QueryTested(ev) => {
                if ev.ok {
                    eprintln!("query {} validated ({} sample rows)", ev.query_idx + 1, ev.row_count);
                } else {
                    eprintln!(
                        "query {} failed validation: {}",
                        ev.query_idx + 1,
                        ev.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            EventMsg::QueryExecuted(ev) => {
                let mut note = String::new();
                if ev.truncated {
                    note.push_str(", truncated");
                }
                if ev.spilled {
                    note.push_str(", spilled to memory");
                }
                eprintln!("query {} returned {} rows{note}", ev.query_idx + 1, ev.row_count);
            }
            EventMsg::ResultSpilled(ev) => {
                eprintln!(
                    "result {} ({} rows) stored under key {}",
                    ev.query_idx + 1,
                    ev.row_count,
                    ev.memory_key
                );
            }
            EventMsg::RetryScheduled(ev) => {
                let stage = match ev.stage {
                    RetryStage::Generation => "regenerating queries",
                    RetryStage::Execution => "repairing execution",
                };
                eprintln!(
                    "{stage} (attempt {}/{}): {}",
                    ev.attempt, ev.max_attempts, ev.message
                );
            }
            EventMsg::TokenCount(ev) => {
                if let Some(remaining) = ev.info.remaining() {
                    eprintln!(
                        "tokens used: {} (remaining budget: {remaining})",
                        ev.info.total_token_usage.blended_total()
                    );
                }
            }
            EventMsg::ReportGenerated(_) => {
                eprintln!("report ready");
            }
            EventMsg::Error(ev) => {
                eprintln!("error [{}]: {}", ev.code, ev.message);
            }
            EventMsg::AnalysisComplete(_) => {
                return SessionStatus::Shutdown;
            }
            EventMsg::StepCompleted(_) | EventMsg::TaskRequested(_) => {}
        }
        SessionStatus::Running
    }
}
