//! The analysis workflow state machine.
//!
//! A directed graph of steps sharing one [`AnalysisState`]. Each step is a
//! function of the current state that returns a [`StateDelta`] and the next
//! step; the engine owns the state, merges deltas, and emits an event after
//! every transition. Retries are edges, not loops: failed generation
//! re-enters through `generate_queries_retry` and failed execution through
//! `execute_queries_retry`, each gated by its own counter in state.

mod queries;
mod report;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use quarry_protocol::AnalysisState;
use quarry_protocol::DatasetSelectionRequestedEvent;
use quarry_protocol::ErrorCode;
use quarry_protocol::ErrorEvent;
use quarry_protocol::Event;
use quarry_protocol::EventMsg;
use quarry_protocol::Op;
use quarry_protocol::SessionConfiguredEvent;
use quarry_protocol::StateDelta;
use quarry_protocol::StepCompletedEvent;
use quarry_protocol::StepStartedEvent;
use quarry_protocol::Submission;
use quarry_protocol::TaskFilteredEvent;
use quarry_protocol::TaskRequestedEvent;
use quarry_protocol::TokenCountEvent;
use quarry_protocol::Verdict;
use quarry_protocol::WorkflowStep;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::AnalysisConfig;
use crate::driver::SessionServices;
use crate::error::QuarryErr;

pub(crate) const CANCELLED_MESSAGE: &str = "cancelled";

pub(crate) enum StepOutcome {
    Next(WorkflowStep),
    Done,
}

pub(crate) struct WorkflowEngine {
    pub(crate) services: SessionServices,
    pub(crate) config: Arc<AnalysisConfig>,
    tx_event: mpsc::Sender<Event>,
    rx_sub: async_channel::Receiver<Submission>,
    pub(crate) cancel: CancellationToken,
    event_seq: AtomicU64,
    last_reported_tokens: AtomicU64,
}

impl WorkflowEngine {
    pub(crate) fn new(
        services: SessionServices,
        config: Arc<AnalysisConfig>,
        tx_event: mpsc::Sender<Event>,
        rx_sub: async_channel::Receiver<Submission>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            services,
            config,
            tx_event,
            rx_sub,
            cancel,
            event_seq: AtomicU64::new(0),
            last_reported_tokens: AtomicU64::new(0),
        }
    }

    /// Drive the graph from `welcome` to termination and return the final
    /// state. Cancellation is observed at step boundaries; once observed,
    /// no further step runs and no further delta is merged.
    pub(crate) async fn run(self, mut state: AnalysisState) -> AnalysisState {
        self.emit(EventMsg::SessionConfigured(SessionConfiguredEvent {
            session_id: state.session_id.clone(),
            project_id: state.project_id.clone(),
        }))
        .await;

        let mut step = WorkflowStep::Welcome;
        loop {
            if self.cancel.is_cancelled() {
                state.apply(self.cancelled_delta().await);
                break;
            }

            state.current_step = step;
            self.emit(EventMsg::StepStarted(StepStartedEvent { step }))
                .await;
            debug!("entering step {step}");

            let (delta, outcome) = self.run_step(step, &state).await;
            state.apply(delta.clone());
            self.emit(EventMsg::StepCompleted(StepCompletedEvent { step, delta }))
                .await;
            self.maybe_emit_token_count().await;

            match outcome {
                StepOutcome::Next(next) => step = next,
                StepOutcome::Done => break,
            }
        }

        self.emit(EventMsg::AnalysisComplete(
            quarry_protocol::AnalysisCompleteEvent {
                report: state.analysis_report.clone(),
            },
        ))
        .await;
        info!("session {} finished at {}", state.session_id, state.current_step);
        state
    }

    async fn run_step(&self, step: WorkflowStep, state: &AnalysisState) -> (StateDelta, StepOutcome) {
        match step {
            WorkflowStep::Welcome => self.run_welcome(state).await,
            WorkflowStep::SelectDataset => self.run_select_dataset(state).await,
            WorkflowStep::ShowTables => self.run_show_tables(state).await,
            WorkflowStep::GetTask => self.run_get_task().await,
            WorkflowStep::FilterTask => self.run_filter_task(state).await,
            WorkflowStep::ReadSchemas => self.run_read_schemas(state).await,
            WorkflowStep::GenerateQueries => self.run_generate_queries(state).await,
            WorkflowStep::GenerateQueriesRetry => self.run_generate_queries_retry(state).await,
            WorkflowStep::TestQueries => self.run_test_queries(state).await,
            WorkflowStep::ExecuteQueries => self.run_execute_queries(state).await,
            WorkflowStep::ExecuteQueriesRetry => self.run_execute_queries_retry(state).await,
            WorkflowStep::GenerateReport => self.run_generate_report(state).await,
            WorkflowStep::Error => self.run_error_sink(state).await,
            WorkflowStep::End => (StateDelta::default(), StepOutcome::Done),
        }
    }

    /// `welcome`: enumerate accessible datasets.
    async fn run_welcome(&self, state: &AnalysisState) -> (StateDelta, StepOutcome) {
        match self
            .services
            .warehouse
            .list_datasets(&state.project_id)
            .await
        {
            Ok(datasets) if datasets.is_empty() => (
                StateDelta::from_error(
                    ErrorCode::DatasetNotFound,
                    format!("no datasets accessible in project {}", state.project_id),
                ),
                StepOutcome::Next(WorkflowStep::Error),
            ),
            Ok(datasets) => (
                StateDelta {
                    available_datasets: Some(datasets),
                    ..StateDelta::default()
                },
                StepOutcome::Next(WorkflowStep::SelectDataset),
            ),
            Err(err) => self.fail(err),
        }
    }

    /// `select_dataset`: ask the front-end for an index, bounded re-asks.
    async fn run_select_dataset(&self, state: &AnalysisState) -> (StateDelta, StepOutcome) {
        for attempt in 1..=self.config.max_select_attempts {
            self.emit(EventMsg::DatasetSelectionRequested(
                DatasetSelectionRequestedEvent {
                    datasets: state.available_datasets.clone(),
                    attempt,
                },
            ))
            .await;

            loop {
                let Some(op) = self.next_op().await else {
                    return self.cancelled_outcome().await;
                };
                match op {
                    Op::SelectDataset { index } => {
                        match state.available_datasets.get(index) {
                            Some(dataset) => {
                                return (
                                    StateDelta {
                                        selected_dataset: Some(dataset.clone()),
                                        ..StateDelta::default()
                                    },
                                    StepOutcome::Next(WorkflowStep::ShowTables),
                                );
                            }
                            None => {
                                warn!(
                                    "dataset index {index} out of range \
                                     (attempt {attempt}/{})",
                                    self.config.max_select_attempts
                                );
                                break;
                            }
                        }
                    }
                    other => {
                        debug!("ignoring out-of-phase submission: {other:?}");
                    }
                }
            }
        }

        (
            StateDelta::from_error(
                ErrorCode::DatasetNotFound,
                format!(
                    "no valid dataset selected after {} attempts",
                    self.config.max_select_attempts
                ),
            ),
            StepOutcome::Next(WorkflowStep::Error),
        )
    }

    /// `show_tables`: enumerate tables of the chosen dataset.
    async fn run_show_tables(&self, state: &AnalysisState) -> (StateDelta, StepOutcome) {
        let Some(dataset) = state.selected_dataset.as_deref() else {
            return self.fail(QuarryErr::Internal(
                "show_tables entered without a selected dataset".to_string(),
            ));
        };
        match self
            .services
            .warehouse
            .list_tables(&state.project_id, dataset)
            .await
        {
            Ok(tables) if tables.is_empty() => (
                StateDelta::from_error(
                    ErrorCode::TableNotFound,
                    format!("dataset {dataset} contains no tables"),
                ),
                StepOutcome::Next(WorkflowStep::Error),
            ),
            Ok(tables) => (
                StateDelta {
                    tables_in_dataset: Some(tables),
                    ..StateDelta::default()
                },
                StepOutcome::Next(WorkflowStep::GetTask),
            ),
            Err(err) => self.fail(err),
        }
    }

    /// `get_task`: collect the free-form analytical request.
    async fn run_get_task(&self) -> (StateDelta, StepOutcome) {
        self.emit(EventMsg::TaskRequested(TaskRequestedEvent {})).await;
        loop {
            let Some(op) = self.next_op().await else {
                return self.cancelled_outcome().await;
            };
            match op {
                Op::SubmitTask { task } => {
                    let task = task.trim().to_string();
                    if task.is_empty() {
                        debug!("ignoring empty task submission");
                        continue;
                    }
                    return (
                        StateDelta {
                            user_task: Some(task),
                            ..StateDelta::default()
                        },
                        StepOutcome::Next(WorkflowStep::FilterTask),
                    );
                }
                other => debug!("ignoring out-of-phase submission: {other:?}"),
            }
        }
    }

    /// `filter_task`: classify the task; rejection is terminal.
    async fn run_filter_task(&self, state: &AnalysisState) -> (StateDelta, StepOutcome) {
        let Some(user_task) = state.user_task.as_deref() else {
            return self.fail(QuarryErr::Internal(
                "filter_task entered without a task".to_string(),
            ));
        };
        let dataset = state.selected_dataset.as_deref().unwrap_or_default();

        let exchange = match self
            .services
            .model
            .classify_safety(user_task, dataset, &state.tables_in_dataset)
            .await
        {
            Ok(exchange) => exchange,
            Err(err) => return self.fail(err),
        };

        self.emit(EventMsg::TaskFiltered(TaskFilteredEvent {
            verdict: exchange.value.clone(),
        }))
        .await;

        match exchange.value.verdict {
            Verdict::Accept => {
                let filtered = exchange
                    .value
                    .filtered_task
                    .unwrap_or_else(|| user_task.to_string());
                (
                    StateDelta {
                        filtered_task: Some(filtered),
                        push_messages: exchange.transcript,
                        ..StateDelta::default()
                    },
                    StepOutcome::Next(WorkflowStep::ReadSchemas),
                )
            }
            Verdict::Reject => {
                let reason = exchange
                    .value
                    .rejection_reason
                    .unwrap_or_else(|| "the task is not a read-only analysis".to_string());
                (
                    StateDelta {
                        push_messages: exchange.transcript,
                        ..StateDelta::from_error(ErrorCode::UnsafeTask, reason)
                    },
                    StepOutcome::Next(WorkflowStep::Error),
                )
            }
        }
    }

    /// `read_schemas`: load the schema of every table in the dataset. A
    /// missing table is an error, never silently omitted.
    async fn run_read_schemas(&self, state: &AnalysisState) -> (StateDelta, StepOutcome) {
        let Some(dataset) = state.selected_dataset.as_deref() else {
            return self.fail(QuarryErr::Internal(
                "read_schemas entered without a selected dataset".to_string(),
            ));
        };
        let mut schemas = std::collections::BTreeMap::new();
        for table in &state.tables_in_dataset {
            match self
                .services
                .warehouse
                .get_schema(&state.project_id, dataset, table)
                .await
            {
                Ok(fields) => {
                    schemas.insert(table.clone(), fields);
                }
                Err(err) => return self.fail(err),
            }
        }
        (
            StateDelta {
                table_schemas: Some(schemas),
                ..StateDelta::default()
            },
            StepOutcome::Next(WorkflowStep::GenerateQueries),
        )
    }

    /// Route an adapter failure to the error sink.
    pub(crate) fn fail(&self, err: QuarryErr) -> (StateDelta, StepOutcome) {
        warn!("step failed: {err}");
        (
            StateDelta::from_error(err.code(), err.to_string()),
            StepOutcome::Next(WorkflowStep::Error),
        )
    }

    /// Await the next submission, or `None` once cancellation is observed.
    /// An `Interrupt` submission trips the token itself.
    async fn next_op(&self) -> Option<Op> {
        let sub = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            sub = self.rx_sub.recv() => sub.ok()?,
        };
        match sub.op {
            Op::Interrupt => {
                self.cancel.cancel();
                None
            }
            op => Some(op),
        }
    }

    pub(crate) async fn cancelled_outcome(&self) -> (StateDelta, StepOutcome) {
        (self.cancelled_delta().await, StepOutcome::Done)
    }

    async fn cancelled_delta(&self) -> StateDelta {
        self.emit(EventMsg::Error(ErrorEvent {
            code: ErrorCode::Cancelled,
            message: CANCELLED_MESSAGE.to_string(),
        }))
        .await;
        StateDelta::from_error(ErrorCode::Cancelled, CANCELLED_MESSAGE)
    }

    pub(crate) async fn emit(&self, msg: EventMsg) {
        let id = self.event_seq.fetch_add(1, Ordering::SeqCst);
        if self
            .tx_event
            .send(Event {
                id: id.to_string(),
                msg,
            })
            .await
            .is_err()
        {
            debug!("event receiver dropped, discarding event {id}");
        }
    }

    /// Emit a token-count event when the model usage moved since the last
    /// report.
    async fn maybe_emit_token_count(&self) {
        let info = self.services.model.usage_info();
        let total = info.total_token_usage.blended_total().max(0) as u64;
        let last = self.last_reported_tokens.swap(total, Ordering::SeqCst);
        if total != last {
            self.emit(EventMsg::TokenCount(TokenCountEvent { info })).await;
        }
    }
}
