//! Root of the `quarry-core` library.
//!
//! Quarry turns a free-form analytical request into validated read-only SQL
//! against a columnar warehouse and a written report grounded in the
//! retrieved data. This crate owns the workflow state machine plus the
//! warehouse, LLM and external-memory adapters it coordinates; front-ends
//! live in separate crates and talk to a session over the submission/event
//! queues defined in `quarry-protocol`.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the event stream.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod memory;
pub mod prompts;
pub mod sql_safety;
pub mod summarize;
pub mod token_budget;
pub mod transport;
pub mod util;
pub mod warehouse;
mod workflow;

pub use client::ModelClient;
pub use config::AnalysisConfig;
pub use config::ConfigOverrides;
pub use driver::AnalysisSession;
pub use driver::DatasetChoice;
pub use driver::ScriptedInputs;
pub use driver::SessionServices;
pub use driver::run_blocking;
pub use driver::spawn_session;
pub use error::QuarryErr;
pub use error::Result;
pub use memory::FileMemoryStore;
pub use memory::InMemoryStore;
pub use memory::MemoryStore;
pub use token_budget::TokenBudget;
pub use transport::ChatTransport;
pub use transport::ReqwestChatTransport;
pub use warehouse::HttpWarehouseBackend;
pub use warehouse::Warehouse;
pub use warehouse::WarehouseBackend;

// Re-export the protocol types so embedders can use `quarry_core::protocol::...`
// without a separate dependency edge.
pub use quarry_protocol as protocol;
