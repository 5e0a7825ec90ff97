//! Error taxonomy for the analysis workflow.
//!
//! Recoverable failures are routed to a local retry edge by the workflow
//! engine; terminal failures flow to the error sink. Raw provider payloads
//! live in the message strings only, never in the category.

use std::time::Duration;

use quarry_protocol::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuarryErr>;

#[derive(Debug, Error)]
pub enum QuarryErr {
    /// Transient transport failure talking to the warehouse. Retried inside
    /// the warehouse adapter with exponential backoff.
    #[error("warehouse unavailable: {0}")]
    WarehouseUnavailable(String),

    /// Warehouse rejected our credentials. Never retried.
    #[error("warehouse authentication failed: {0}")]
    WarehouseAuth(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The safety filter rejected the user task.
    #[error("task rejected: {0}")]
    UnsafeTask(String),

    /// A SQL string failed the read-only safety parse. Caught before any
    /// network call.
    #[error("unsafe sql: {0}")]
    UnsafeSql(String),

    #[error("sql syntax error: {0}")]
    SqlSyntax(String),

    #[error("sql semantic error: {0}")]
    SqlSemantic(String),

    /// The model's output could not be parsed against the declared schema,
    /// even after the stricter reprompt.
    #[error("model returned malformed output: {0}")]
    LlmMalformedOutput(String),

    #[error("token budget exhausted: call needs {needed} tokens, {remaining} remaining")]
    BudgetExhausted { needed: i64, remaining: i64 },

    #[error("deadline of {0:?} exceeded")]
    Deadline(Duration),

    /// Transient LLM transport failure.
    #[error("llm transport error: {0}")]
    LlmTransport(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("memory store error: {0}")]
    Memory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl QuarryErr {
    /// Stable category surfaced to front-ends.
    pub fn code(&self) -> ErrorCode {
        match self {
            QuarryErr::WarehouseUnavailable(_) | QuarryErr::WarehouseAuth(_) => {
                ErrorCode::WarehouseUnavailable
            }
            QuarryErr::DatasetNotFound(_) => ErrorCode::DatasetNotFound,
            QuarryErr::TableNotFound(_) => ErrorCode::TableNotFound,
            QuarryErr::UnsafeTask(_) => ErrorCode::UnsafeTask,
            QuarryErr::UnsafeSql(_) => ErrorCode::UnsafeSql,
            QuarryErr::SqlSyntax(_) => ErrorCode::SqlSyntax,
            QuarryErr::SqlSemantic(_) => ErrorCode::SqlSemantic,
            QuarryErr::LlmMalformedOutput(_) => ErrorCode::LlmMalformedOutput,
            QuarryErr::BudgetExhausted { .. } => ErrorCode::BudgetExhausted,
            QuarryErr::Deadline(_) => ErrorCode::Deadline,
            QuarryErr::Cancelled => ErrorCode::Cancelled,
            QuarryErr::LlmTransport(_)
            | QuarryErr::Memory(_)
            | QuarryErr::Io(_)
            | QuarryErr::Json(_)
            | QuarryErr::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the warehouse adapter may retry the call. Authentication
    /// failures and anything the caller must repair are final.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(
            self,
            QuarryErr::WarehouseUnavailable(_) | QuarryErr::Deadline(_)
        )
    }

    /// Whether a failed query should re-enter a repair/retry edge rather
    /// than terminate the session.
    pub fn is_query_repairable(&self) -> bool {
        matches!(
            self,
            QuarryErr::SqlSyntax(_) | QuarryErr::SqlSemantic(_) | QuarryErr::UnsafeSql(_)
        )
    }
}
