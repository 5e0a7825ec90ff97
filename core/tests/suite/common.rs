#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Scripted in-process adapters for driving the real engine
//! deterministically.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use quarry_core::AnalysisConfig;
use quarry_core::InMemoryStore;
use quarry_core::ModelClient;
use quarry_core::SessionServices;
use quarry_core::Warehouse;
use quarry_core::WarehouseBackend;
use quarry_core::error::QuarryErr;
use quarry_core::error::Result;
use quarry_core::transport::ChatCompletion;
use quarry_core::transport::ChatRequest;
use quarry_core::transport::ChatTransport;
use quarry_core::warehouse::QueryOptions;
use quarry_core::warehouse::QueryOutcome;
use quarry_protocol::ChatMessage;
use quarry_protocol::Field;
use quarry_protocol::Row;
use quarry_protocol::TokenUsage;
use serde_json::json;

pub type QueryFn =
    Box<dyn Fn(&str, QueryOptions) -> (Result<QueryOutcome>, Duration) + Send + Sync>;

pub struct QueryCall {
    pub sql: String,
    pub max_rows: Option<u64>,
    pub dry_run: bool,
}

/// Scripted warehouse backend over the canned `sales` catalog.
pub struct MockBackend {
    datasets: Vec<String>,
    tables: BTreeMap<String, Vec<String>>,
    schemas: BTreeMap<String, Vec<Field>>,
    on_query: QueryFn,
    pub query_log: Mutex<Vec<QueryCall>>,
    pub schema_calls: AtomicU64,
}

impl MockBackend {
    /// Catalog: datasets `sales`/`ops`, table `orders` with
    /// `{order_id INT64, amount FLOAT64, ts TIMESTAMP}`.
    pub fn sales(
        on_query: impl Fn(&str, QueryOptions) -> Result<QueryOutcome> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::sales_delayed(move |sql, options| (on_query(sql, options), Duration::ZERO))
    }

    pub fn sales_delayed(
        on_query: impl Fn(&str, QueryOptions) -> (Result<QueryOutcome>, Duration)
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Self::catalog(vec!["orders".to_string()], on_query)
    }

    /// Like [`MockBackend::sales`], but the `sales` dataset also lists a
    /// table whose schema cannot be read.
    pub fn sales_with_ghost_table() -> Arc<Self> {
        Self::catalog(vec!["orders".to_string(), "ghost".to_string()], |_, _| {
            (Ok(QueryOutcome::default()), Duration::ZERO)
        })
    }

    fn catalog(
        sales_tables: Vec<String>,
        on_query: impl Fn(&str, QueryOptions) -> (Result<QueryOutcome>, Duration)
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        let mut tables = BTreeMap::new();
        tables.insert("sales".to_string(), sales_tables);
        tables.insert("ops".to_string(), vec!["tickets".to_string()]);
        let mut schemas = BTreeMap::new();
        schemas.insert(
            "orders".to_string(),
            vec![
                Field::new("order_id", "INT64"),
                Field::new("amount", "FLOAT64"),
                Field::new("ts", "TIMESTAMP"),
            ],
        );
        schemas.insert("tickets".to_string(), vec![Field::new("id", "INT64")]);
        Arc::new(Self {
            datasets: vec!["sales".to_string(), "ops".to_string()],
            tables,
            schemas,
            on_query: Box::new(on_query),
            query_log: Mutex::new(Vec::new()),
            schema_calls: AtomicU64::new(0),
        })
    }

    pub fn queries_sent(&self) -> usize {
        self.query_log.lock().unwrap().len()
    }
}

#[async_trait]
impl WarehouseBackend for MockBackend {
    async fn list_datasets(&self, _project_id: &str) -> Result<Vec<String>> {
        Ok(self.datasets.clone())
    }

    async fn list_tables(&self, _project_id: &str, dataset: &str) -> Result<Vec<String>> {
        self.tables
            .get(dataset)
            .cloned()
            .ok_or_else(|| QuarryErr::DatasetNotFound(dataset.to_string()))
    }

    async fn get_schema(
        &self,
        _project_id: &str,
        _dataset: &str,
        table: &str,
    ) -> Result<Vec<Field>> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        self.schemas
            .get(table)
            .cloned()
            .ok_or_else(|| QuarryErr::TableNotFound(table.to_string()))
    }

    async fn run_query(
        &self,
        _project_id: &str,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryOutcome> {
        self.query_log.lock().unwrap().push(QueryCall {
            sql: sql.to_string(),
            max_rows: options.max_rows,
            dry_run: options.dry_run,
        });
        let (result, delay) = (self.on_query)(sql, options);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

/// Scripted chat transport: pops one canned reply per call and logs every
/// request it receives.
pub struct MockChat {
    replies: Mutex<VecDeque<(String, Option<TokenUsage>)>>,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockChat {
    pub fn new(replies: Vec<&str>) -> Arc<Self> {
        Self::with_usage(replies.into_iter().map(|reply| (reply, None)).collect())
    }

    pub fn with_usage(replies: Vec<(&str, Option<TokenUsage>)>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|(reply, usage)| (reply.to_string(), usage))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Concatenated content of the messages in the `n`th request.
    pub fn request_text(&self, n: usize) -> String {
        self.requests.lock().unwrap()[n]
            .iter()
            .map(|message| message.content.clone())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ChatTransport for MockChat {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion> {
        self.requests.lock().unwrap().push(request.messages);
        let (reply, usage) = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| QuarryErr::Internal("chat script exhausted".to_string()))?;
        Ok(ChatCompletion {
            message: ChatMessage::assistant(reply),
            usage,
        })
    }
}

pub struct TestHarness {
    pub backend: Arc<MockBackend>,
    pub chat: Arc<MockChat>,
    pub memory: Arc<InMemoryStore>,
    pub services: SessionServices,
}

pub fn harness(
    backend: Arc<MockBackend>,
    chat: Arc<MockChat>,
    config: &AnalysisConfig,
) -> TestHarness {
    let memory = Arc::new(InMemoryStore::new());
    let services = SessionServices {
        warehouse: Arc::new(Warehouse::new(backend.clone(), Duration::from_secs(5))),
        model: Arc::new(ModelClient::new(chat.clone(), config)),
        memory: memory.clone(),
    };
    TestHarness {
        backend,
        chat,
        memory,
        services,
    }
}

// Canned model replies.

pub fn accept_json(filtered_task: &str) -> String {
    json!({"verdict": "accept", "filtered_task": filtered_task}).to_string()
}

pub fn reject_json(reason: &str) -> String {
    json!({"verdict": "reject", "rejection_reason": reason}).to_string()
}

pub fn queries_json(queries: &[&str]) -> String {
    json!({ "queries": queries }).to_string()
}

pub fn sql_json(sql: &str) -> String {
    json!({ "sql": sql }).to_string()
}

// Canned warehouse outcomes.

pub fn total_row(total: f64) -> QueryOutcome {
    let mut row = Row::new();
    row.insert("total".to_string(), json!(total));
    QueryOutcome {
        rows: vec![row],
        schema: vec![Field::new("total", "FLOAT64")],
        total_rows: 1,
        bytes_estimate: None,
    }
}

pub fn amount_rows(n: usize) -> QueryOutcome {
    let rows: Vec<Row> = (0..n)
        .map(|i| {
            let mut row = Row::new();
            row.insert("amount".to_string(), json!(i as f64));
            row
        })
        .collect();
    QueryOutcome {
        total_rows: n as u64,
        schema: vec![Field::new("amount", "FLOAT64")],
        bytes_estimate: None,
        rows,
    }
}

/// A sample call is recognizable by its row cap.
pub fn is_sample(options: QueryOptions) -> bool {
    options.max_rows == Some(AnalysisConfig::default().sample_row_limit)
}
