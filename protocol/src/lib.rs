//! Shared types for a Quarry analysis session.
//!
//! This crate is intentionally I/O-free: it defines the session state record,
//! the submission/event queue payloads exchanged between a front-end and the
//! workflow engine, and the row/schema/token-accounting models the adapters
//! traffic in. Everything here is serde-serializable so sessions can be
//! rendered as JSONL by headless front-ends.

mod models;
mod protocol;
mod state;

pub use models::ChatMessage;
pub use models::Field;
pub use models::FieldMode;
pub use models::Role;
pub use models::Row;
pub use models::is_numeric_type;
pub use protocol::AnalysisCompleteEvent;
pub use protocol::DatasetSelectionRequestedEvent;
pub use protocol::ErrorCode;
pub use protocol::ErrorEvent;
pub use protocol::Event;
pub use protocol::EventMsg;
pub use protocol::Op;
pub use protocol::QueryExecutedEvent;
pub use protocol::QueryTestedEvent;
pub use protocol::ReportGeneratedEvent;
pub use protocol::ResultSpilledEvent;
pub use protocol::RetryScheduledEvent;
pub use protocol::RetryStage;
pub use protocol::SessionConfiguredEvent;
pub use protocol::StepCompletedEvent;
pub use protocol::StepStartedEvent;
pub use protocol::Submission;
pub use protocol::TaskFilteredEvent;
pub use protocol::TaskRequestedEvent;
pub use protocol::TokenCountEvent;
pub use protocol::TokenUsage;
pub use protocol::TokenUsageInfo;
pub use state::AnalysisState;
pub use state::ColumnSummary;
pub use state::ColumnSummaryKind;
pub use state::MemoryEntry;
pub use state::QueryResult;
pub use state::ResultSummary;
pub use state::SafetyVerdict;
pub use state::StateDelta;
pub use state::TestResult;
pub use state::Verdict;
pub use state::WorkflowStep;
