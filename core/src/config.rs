//! Session configuration.
//!
//! All tunables are collected in one immutable [`AnalysisConfig`] passed at
//! driver construction. There is no process-wide mutable state; two sessions
//! with different configs can run side by side in one process.

use std::time::Duration;

use serde::Serialize;

/// Immutable per-session configuration.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisConfig {
    /// Bounded retries for the SQL generation edge.
    pub max_retries_gen: u32,
    /// Bounded retries for the execution/repair edge. Counted independently
    /// of generation retries.
    pub max_retries_exec: u32,
    /// Upper bound on queries synthesized per task.
    pub max_queries: usize,
    /// Row cap applied when sample-executing a query for self-validation.
    pub sample_row_limit: u64,
    /// Row cap for full execution; results beyond it are truncated.
    pub exec_row_cap: u64,
    /// Results with more rows than this are spilled to external memory.
    pub inline_row_limit: u64,
    /// Results whose serialized size exceeds this are spilled.
    pub inline_byte_limit: usize,
    /// Aggregate cap on LLM input+output tokens for the session.
    pub token_budget_session: i64,
    pub deadline_warehouse: Duration,
    pub deadline_llm: Duration,
    pub deadline_memory: Duration,
    /// Wall-clock bound on the whole session.
    pub deadline_session: Duration,
    /// Memory-store entries older than this are eligible for sweeping.
    pub memory_ttl: Duration,
    /// Bounded re-asks when a dataset selection is out of range.
    pub max_select_attempts: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_retries_gen: 2,
            max_retries_exec: 2,
            max_queries: 5,
            sample_row_limit: 10,
            exec_row_cap: 10_000,
            inline_row_limit: 100,
            inline_byte_limit: 128 * 1024,
            token_budget_session: 200_000,
            deadline_warehouse: Duration::from_secs(120),
            deadline_llm: Duration::from_secs(60),
            deadline_memory: Duration::from_secs(10),
            deadline_session: Duration::from_secs(600),
            memory_ttl: Duration::from_secs(24 * 60 * 60),
            max_select_attempts: 3,
        }
    }
}

impl AnalysisConfig {
    pub fn with_overrides(overrides: ConfigOverrides) -> Self {
        let mut config = Self::default();
        config.apply(overrides);
        config
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            max_retries_gen,
            max_retries_exec,
            max_queries,
            sample_row_limit,
            exec_row_cap,
            inline_row_limit,
            inline_byte_limit,
            token_budget_session,
            deadline_warehouse,
            deadline_llm,
            deadline_memory,
            deadline_session,
            memory_ttl,
        } = overrides;

        if let Some(v) = max_retries_gen {
            self.max_retries_gen = v;
        }
        if let Some(v) = max_retries_exec {
            self.max_retries_exec = v;
        }
        if let Some(v) = max_queries {
            self.max_queries = v;
        }
        if let Some(v) = sample_row_limit {
            self.sample_row_limit = v;
        }
        if let Some(v) = exec_row_cap {
            self.exec_row_cap = v;
        }
        if let Some(v) = inline_row_limit {
            self.inline_row_limit = v;
        }
        if let Some(v) = inline_byte_limit {
            self.inline_byte_limit = v;
        }
        if let Some(v) = token_budget_session {
            self.token_budget_session = v;
        }
        if let Some(v) = deadline_warehouse {
            self.deadline_warehouse = v;
        }
        if let Some(v) = deadline_llm {
            self.deadline_llm = v;
        }
        if let Some(v) = deadline_memory {
            self.deadline_memory = v;
        }
        if let Some(v) = deadline_session {
            self.deadline_session = v;
        }
        if let Some(v) = memory_ttl {
            self.memory_ttl = v;
        }
    }
}

/// Optional overrides collected by a front-end (CLI flags, profile files)
/// and applied once at construction.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_retries_gen: Option<u32>,
    pub max_retries_exec: Option<u32>,
    pub max_queries: Option<usize>,
    pub sample_row_limit: Option<u64>,
    pub exec_row_cap: Option<u64>,
    pub inline_row_limit: Option<u64>,
    pub inline_byte_limit: Option<usize>,
    pub token_budget_session: Option<i64>,
    pub deadline_warehouse: Option<Duration>,
    pub deadline_llm: Option<Duration>,
    pub deadline_memory: Option<Duration>,
    pub deadline_session: Option<Duration>,
    pub memory_ttl: Option<Duration>,
}
