//! External memory store for oversized intermediate results.
//!
//! LLM token budgets cannot accommodate raw tabular result sets beyond a
//! few dozen rows, so the workflow spills large results here and keeps only
//! a key plus a summary in session state. Stores must be safe for
//! concurrent put/get across sessions with key-level atomicity; within a
//! session writes never race because the workflow is single-threaded.

mod file_store;
mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
pub use file_store::FileMemoryStore;
pub use in_memory::InMemoryStore;
use quarry_protocol::Field;
use quarry_protocol::MemoryEntry;
use quarry_protocol::Row;

use crate::error::Result;

/// Build the store key for one spilled result. The attempt number is part
/// of the key so a retried execution never collides with the result it
/// replaces.
pub fn memory_key(session_id: &str, query_idx: usize, attempt: u32) -> String {
    format!("{session_id}-q{query_idx}-a{attempt}")
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist a result set and return its key.
    async fn put(
        &self,
        session_id: &str,
        query_idx: usize,
        attempt: u32,
        schema: Vec<Field>,
        rows: Vec<Row>,
    ) -> Result<String>;

    /// Retrieve a previously stored entry. Reads are idempotent.
    async fn get(&self, key: &str) -> Result<MemoryEntry>;

    /// Keys stored for a session, in insertion order where the backend can
    /// provide it.
    async fn list(&self, session_id: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete entries older than `older_than`; returns how many went away.
    async fn sweep(&self, older_than: Duration) -> Result<usize>;
}
