//! Warehouse adapter: read-only SQL execution plus catalog enumeration.
//!
//! [`Warehouse`] wraps a raw [`WarehouseBackend`] client with the pieces the
//! workflow relies on: the read-only safety parse before every network call,
//! a per-call deadline, and bounded retry with exponential backoff for
//! transient transport failures. Authentication failures are never retried.

mod http;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
pub use http::HttpWarehouseBackend;
use quarry_protocol::Field;
use quarry_protocol::Row;
use tracing::warn;

use crate::error::QuarryErr;
use crate::error::Result;
use crate::sql_safety;
use crate::util::backoff;

/// Transport retry policy for transient failures.
const MAX_TRANSPORT_ATTEMPTS: u64 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Cap on rows returned to the caller; the backend may report a larger
    /// total row count.
    pub max_rows: Option<u64>,
    /// Validate only; never touches data.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub rows: Vec<Row>,
    pub schema: Vec<Field>,
    /// Total rows the query produced server-side, before `max_rows`.
    pub total_rows: u64,
    pub bytes_estimate: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DryRunResult {
    pub valid: bool,
    pub bytes_estimate: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SampleResult {
    pub rows: Vec<Row>,
    pub row_count: u64,
    pub schema: Vec<Field>,
}

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub rows: Vec<Row>,
    /// True when the server produced more rows than `max_rows`; the caller
    /// must treat `rows` as a preview.
    pub truncated: bool,
    pub row_count: u64,
    pub schema: Vec<Field>,
}

/// The raw warehouse client this adapter is generic over. Implementations
/// carry their own connection safety; the adapter adds no locking.
#[async_trait]
pub trait WarehouseBackend: Send + Sync {
    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>>;
    async fn list_tables(&self, project_id: &str, dataset: &str) -> Result<Vec<String>>;
    async fn get_schema(&self, project_id: &str, dataset: &str, table: &str)
    -> Result<Vec<Field>>;
    async fn run_query(
        &self,
        project_id: &str,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryOutcome>;
}

pub struct Warehouse {
    backend: Arc<dyn WarehouseBackend>,
    deadline: Duration,
}

impl Warehouse {
    pub fn new(backend: Arc<dyn WarehouseBackend>, deadline: Duration) -> Self {
        Self { backend, deadline }
    }

    pub async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>> {
        self.with_retries(|| self.backend.list_datasets(project_id))
            .await
    }

    pub async fn list_tables(&self, project_id: &str, dataset: &str) -> Result<Vec<String>> {
        self.with_retries(|| self.backend.list_tables(project_id, dataset))
            .await
    }

    pub async fn get_schema(
        &self,
        project_id: &str,
        dataset: &str,
        table: &str,
    ) -> Result<Vec<Field>> {
        self.with_retries(|| self.backend.get_schema(project_id, dataset, table))
            .await
    }

    /// Server-side validation without data retrieval. SQL failures come back
    /// in the result rather than as errors; transport failures still error.
    pub async fn dry_run(&self, project_id: &str, sql: &str) -> Result<DryRunResult> {
        sql_safety::ensure_read_only(sql)?;
        let options = QueryOptions {
            max_rows: None,
            dry_run: true,
        };
        match self
            .with_retries(|| self.backend.run_query(project_id, sql, options))
            .await
        {
            Ok(outcome) => Ok(DryRunResult {
                valid: true,
                bytes_estimate: outcome.bytes_estimate,
                error: None,
            }),
            Err(err) if err.is_query_repairable() => Ok(DryRunResult {
                valid: false,
                bytes_estimate: None,
                error: Some(err.to_string()),
            }),
            Err(err) => Err(err),
        }
    }

    /// Execute capped at `limit` rows for self-validation. A missing `LIMIT`
    /// is injected; a larger one is clamped.
    pub async fn sample_execute(
        &self,
        project_id: &str,
        sql: &str,
        limit: u64,
    ) -> Result<SampleResult> {
        sql_safety::ensure_read_only(sql)?;
        let limited = sql_safety::enforce_sample_limit(sql, limit)?;
        let options = QueryOptions {
            max_rows: Some(limit),
            dry_run: false,
        };
        let outcome = self
            .with_retries(|| self.backend.run_query(project_id, &limited, options))
            .await?;
        Ok(SampleResult {
            row_count: outcome.rows.len() as u64,
            schema: outcome.schema,
            rows: outcome.rows,
        })
    }

    /// Full execution capped at `max_rows` returned rows.
    pub async fn execute(
        &self,
        project_id: &str,
        sql: &str,
        max_rows: u64,
    ) -> Result<ExecuteResult> {
        sql_safety::ensure_read_only(sql)?;
        let options = QueryOptions {
            max_rows: Some(max_rows),
            dry_run: false,
        };
        let outcome = self
            .with_retries(|| self.backend.run_query(project_id, sql, options))
            .await?;

        let mut rows = outcome.rows;
        if rows.len() as u64 > max_rows {
            rows.truncate(max_rows as usize);
        }
        let total_rows = outcome.total_rows.max(rows.len() as u64);
        Ok(ExecuteResult {
            truncated: total_rows > rows.len() as u64,
            row_count: total_rows,
            schema: outcome.schema,
            rows,
        })
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.deadline, call()).await {
                Ok(result) => result,
                Err(_) => Err(QuarryErr::Deadline(self.deadline)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable_transport() && attempt < MAX_TRANSPORT_ATTEMPTS => {
                    let delay = backoff(attempt, BACKOFF_BASE, BACKOFF_CAP);
                    warn!(
                        "transient warehouse failure (attempt {attempt}/{MAX_TRANSPORT_ATTEMPTS}), \
                         retrying in {delay:?}: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
