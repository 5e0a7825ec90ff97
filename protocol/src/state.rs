//! The shared per-session analysis state and the deltas that mutate it.
//!
//! Workflow nodes are functions of the current state that return a
//! [`StateDelta`]; the engine owns the single [`AnalysisState`] record and
//! merges each delta before routing to the next step. Keeping mutation in
//! one place makes every node testable in isolation and makes cancellation
//! trivial: once a cancel is observed, no further delta is merged.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::models::ChatMessage;
use crate::models::Field;
use crate::models::Row;
use crate::protocol::ErrorCode;

/// Nodes of the analysis workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowStep {
    Welcome,
    SelectDataset,
    ShowTables,
    GetTask,
    FilterTask,
    ReadSchemas,
    GenerateQueries,
    GenerateQueriesRetry,
    TestQueries,
    ExecuteQueries,
    ExecuteQueriesRetry,
    GenerateReport,
    Error,
    End,
}

/// The single mutable record threaded through every workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisState {
    pub session_id: String,
    pub project_id: String,
    pub available_datasets: Vec<String>,
    pub selected_dataset: Option<String>,
    pub tables_in_dataset: Vec<String>,
    /// Table name to ordered field list; populated once schemas are read.
    pub table_schemas: BTreeMap<String, Vec<Field>>,
    pub user_task: Option<String>,
    /// Sanitized read-only restatement of the task; `None` iff the safety
    /// filter rejected it.
    pub filtered_task: Option<String>,
    pub generated_queries: Vec<String>,
    pub test_results: Vec<TestResult>,
    pub query_results: Vec<QueryResult>,
    /// Keys of results spilled to the external memory store.
    pub memory_keys: Vec<String>,
    pub analysis_report: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub retry_count_gen: u32,
    pub retry_count_exec: u32,
    /// Advisory, for observability.
    pub current_step: WorkflowStep,
    /// Role-tagged LLM turns, appended as the session progresses.
    pub messages: Vec<ChatMessage>,
}

impl AnalysisState {
    pub fn new(session_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            available_datasets: Vec::new(),
            selected_dataset: None,
            tables_in_dataset: Vec::new(),
            table_schemas: BTreeMap::new(),
            user_task: None,
            filtered_task: None,
            generated_queries: Vec::new(),
            test_results: Vec::new(),
            query_results: Vec::new(),
            memory_keys: Vec::new(),
            analysis_report: None,
            error_message: None,
            error_code: None,
            retry_count_gen: 0,
            retry_count_exec: 0,
            current_step: WorkflowStep::Welcome,
            messages: Vec::new(),
        }
    }

    /// Merge a step's delta into the owning record. Scalar fields replace,
    /// `push_*` fields append.
    pub fn apply(&mut self, delta: StateDelta) {
        let StateDelta {
            available_datasets,
            selected_dataset,
            tables_in_dataset,
            table_schemas,
            user_task,
            filtered_task,
            generated_queries,
            test_results,
            query_results,
            push_memory_keys,
            analysis_report,
            error_message,
            error_code,
            retry_count_gen,
            retry_count_exec,
            push_messages,
        } = delta;

        if let Some(v) = available_datasets {
            self.available_datasets = v;
        }
        if let Some(v) = selected_dataset {
            self.selected_dataset = Some(v);
        }
        if let Some(v) = tables_in_dataset {
            self.tables_in_dataset = v;
        }
        if let Some(v) = table_schemas {
            self.table_schemas = v;
        }
        if let Some(v) = user_task {
            self.user_task = Some(v);
        }
        if let Some(v) = filtered_task {
            self.filtered_task = Some(v);
        }
        if let Some(v) = generated_queries {
            self.generated_queries = v;
        }
        if let Some(v) = test_results {
            self.test_results = v;
        }
        if let Some(v) = query_results {
            self.query_results = v;
        }
        self.memory_keys.extend(push_memory_keys);
        if let Some(v) = analysis_report {
            self.analysis_report = Some(v);
        }
        if let Some(v) = error_message {
            self.error_message = Some(v);
        }
        if let Some(v) = error_code {
            self.error_code = Some(v);
        }
        if let Some(v) = retry_count_gen {
            self.retry_count_gen = v;
        }
        if let Some(v) = retry_count_exec {
            self.retry_count_exec = v;
        }
        self.messages.extend(push_messages);
    }
}

/// The write-set of one workflow step. All fields optional; `Vec`-valued
/// `push_*` fields are appended rather than replaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_datasets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables_in_dataset: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_schemas: Option<BTreeMap<String, Vec<Field>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_queries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_results: Option<Vec<TestResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_results: Option<Vec<QueryResult>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub push_memory_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count_gen: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count_exec: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub push_messages: Vec<ChatMessage>,
}

impl StateDelta {
    /// A delta that records a failure for routing to the error sink or a
    /// retry edge.
    pub fn from_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            error_code: Some(code),
            ..Self::default()
        }
    }
}

/// Outcome of sample-executing one generated query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub query_idx: usize,
    pub ok: bool,
    pub row_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of fully executing one generated query. On success exactly one
/// of `rows` (inline) or `memory_key` (spilled) is set; failed entries carry
/// `error` and neither, so every query index stays accounted for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_idx: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_key: Option<String>,
    pub row_count: u64,
    pub schema: Vec<Field>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ResultSummary>,
}

impl QueryResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Compact description of a result set, small enough for a report prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub row_count: u64,
    pub schema: Vec<Field>,
    pub columns: Vec<ColumnSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    #[serde(flatten)]
    pub kind: ColumnSummaryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnSummaryKind {
    Numeric {
        min: f64,
        max: f64,
        mean: f64,
        null_count: u64,
    },
    Categorical {
        /// Most frequent values with their counts, descending.
        top: Vec<(String, u64)>,
        distinct_count: u64,
    },
}

/// Output of the task safety filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject,
}

/// A spilled result set persisted in the external memory store. Entries are
/// self-describing so a store survives crash-resume without side tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub session_id: String,
    pub query_idx: usize,
    /// Execution attempt that produced the rows; part of the key so retried
    /// executions never collide.
    pub attempt: u32,
    pub schema: Vec<Field>,
    pub row_count: u64,
    pub created_at: DateTime<Utc>,
    pub rows: Vec<Row>,
}
