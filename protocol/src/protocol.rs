//! Defines the protocol for a Quarry analysis session between a front-end
//! and the workflow engine.
//!
//! Uses a SQ (Submission Queue) / EQ (Event Queue) pattern: the front-end
//! submits [`Op`]s and consumes [`Event`]s. The engine advances one workflow
//! step at a time and emits an event after every transition, so a front-end
//! can render progress without polling session state.

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::state::SafetyVerdict;
use crate::state::StateDelta;
use crate::state::WorkflowStep;

/// Submission Queue Entry - requests from the front-end.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Submission {
    /// Unique id for this Submission to correlate with Events.
    pub id: String,
    /// Payload.
    pub op: Op,
}

/// Submission operation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Answer to a pending [`EventMsg::DatasetSelectionRequested`].
    SelectDataset { index: usize },
    /// Answer to a pending [`EventMsg::TaskRequested`].
    SubmitTask { task: String },
    /// Cancel the session. The engine stops at the next step boundary and
    /// never mutates state afterwards.
    Interrupt,
}

/// Event Queue Entry - events from the engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Event {
    /// Monotonic id for ordering within a session.
    pub id: String,
    /// Payload.
    pub msg: EventMsg,
}

/// Stable error categories surfaced to front-ends. Raw provider errors are
/// carried in the human-readable message, never as a category of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WarehouseUnavailable,
    DatasetNotFound,
    TableNotFound,
    UnsafeTask,
    UnsafeSql,
    LlmMalformedOutput,
    SqlSyntax,
    SqlSemantic,
    BudgetExhausted,
    Deadline,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    SessionConfigured(SessionConfiguredEvent),
    StepStarted(StepStartedEvent),
    /// Emitted after a step's delta has been merged into session state.
    StepCompleted(StepCompletedEvent),
    DatasetSelectionRequested(DatasetSelectionRequestedEvent),
    TaskRequested(TaskRequestedEvent),
    TaskFiltered(TaskFilteredEvent),
    QueryTested(QueryTestedEvent),
    QueryExecuted(QueryExecutedEvent),
    ResultSpilled(ResultSpilledEvent),
    /// A bounded retry of a failed generation or execution pass is about to
    /// run. Surfaced so the user is not staring at a seemingly frozen
    /// session while the engine reprompts.
    RetryScheduled(RetryScheduledEvent),
    TokenCount(TokenCountEvent),
    ReportGenerated(ReportGeneratedEvent),
    Error(ErrorEvent),
    AnalysisComplete(AnalysisCompleteEvent),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfiguredEvent {
    pub session_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepStartedEvent {
    pub step: WorkflowStep,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepCompletedEvent {
    pub step: WorkflowStep,
    pub delta: StateDelta,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetSelectionRequestedEvent {
    pub datasets: Vec<String>,
    /// 1-based ask attempt; selection is re-asked a bounded number of times.
    pub attempt: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskRequestedEvent {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskFilteredEvent {
    pub verdict: SafetyVerdict,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryTestedEvent {
    pub query_idx: usize,
    pub ok: bool,
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryExecutedEvent {
    pub query_idx: usize,
    pub row_count: u64,
    pub truncated: bool,
    pub spilled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultSpilledEvent {
    pub query_idx: usize,
    pub memory_key: String,
    pub row_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetryStage {
    Generation,
    Execution,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryScheduledEvent {
    pub stage: RetryStage,
    /// 1-based retry attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenCountEvent {
    pub info: TokenUsageInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportGeneratedEvent {
    pub report: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisCompleteEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

/// Input + output token counts for one LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }

    /// Primary count for display and budgeting: input + output.
    pub fn blended_total(&self) -> i64 {
        (self.input_tokens.max(0) + self.output_tokens.max(0)).max(self.total_tokens)
    }

    pub fn add_assign(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Running token totals for a session, surfaced via [`EventMsg::TokenCount`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageInfo {
    pub total_token_usage: TokenUsage,
    pub last_token_usage: TokenUsage,
    pub session_token_budget: Option<i64>,
}

impl TokenUsageInfo {
    pub fn new(session_token_budget: Option<i64>) -> Self {
        Self {
            total_token_usage: TokenUsage::default(),
            last_token_usage: TokenUsage::default(),
            session_token_budget,
        }
    }

    pub fn append_last_usage(&mut self, last: &TokenUsage) {
        self.total_token_usage.add_assign(last);
        self.last_token_usage = *last;
    }

    /// Tokens left before the session budget is exhausted, if one is set.
    pub fn remaining(&self) -> Option<i64> {
        self.session_token_budget
            .map(|budget| (budget - self.total_token_usage.blended_total()).max(0))
    }
}
