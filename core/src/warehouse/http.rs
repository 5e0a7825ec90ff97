//! REST/JSON warehouse backend.
//!
//! Speaks a BigQuery-shaped API: dataset/table/schema listings as GET
//! resources and a POST query endpoint taking `{query, maxResults, dryRun}`.
//! Rows come back as JSON objects keyed by column name.

use async_trait::async_trait;
use quarry_protocol::Field;
use quarry_protocol::Row;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;

use super::QueryOptions;
use super::QueryOutcome;
use super::WarehouseBackend;
use crate::error::QuarryErr;
use crate::error::Result;

pub struct HttpWarehouseBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpWarehouseBackend {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        not_found: impl FnOnce() -> QuarryErr,
    ) -> Result<T> {
        let mut builder = self.client.get(self.url(path));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(not_found());
        }
        if !status.is_success() {
            return Err(map_status(status, &response.text().await.unwrap_or_default()));
        }
        response
            .json()
            .await
            .map_err(|err| QuarryErr::WarehouseUnavailable(err.to_string()))
    }
}

fn map_transport_error(err: reqwest::Error) -> QuarryErr {
    QuarryErr::WarehouseUnavailable(err.to_string())
}

fn map_status(status: StatusCode, body: &str) -> QuarryErr {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            QuarryErr::WarehouseAuth(format!("{status}: {body}"))
        }
        status if status.is_server_error() => {
            QuarryErr::WarehouseUnavailable(format!("{status}: {body}"))
        }
        status => QuarryErr::Internal(format!("unexpected warehouse response {status}: {body}")),
    }
}

#[derive(Deserialize)]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<NamedResource>,
}

#[derive(Deserialize)]
struct TableList {
    #[serde(default)]
    tables: Vec<NamedResource>,
}

#[derive(Deserialize)]
struct NamedResource {
    id: String,
}

#[derive(Deserialize)]
struct TableResource {
    schema: SchemaResource,
}

#[derive(Deserialize)]
struct SchemaResource {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    dry_run: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<Row>,
    #[serde(default)]
    schema: Option<SchemaResource>,
    #[serde(default)]
    total_rows: Option<u64>,
    #[serde(default)]
    total_bytes_processed: Option<u64>,
    #[serde(default)]
    error: Option<QueryError>,
}

#[derive(Deserialize)]
struct QueryError {
    #[serde(default)]
    reason: String,
    message: String,
}

#[async_trait]
impl WarehouseBackend for HttpWarehouseBackend {
    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>> {
        let list: DatasetList = self
            .get_json(&format!("projects/{project_id}/datasets"), || {
                QuarryErr::DatasetNotFound(project_id.to_string())
            })
            .await?;
        Ok(list.datasets.into_iter().map(|dataset| dataset.id).collect())
    }

    async fn list_tables(&self, project_id: &str, dataset: &str) -> Result<Vec<String>> {
        let list: TableList = self
            .get_json(
                &format!("projects/{project_id}/datasets/{dataset}/tables"),
                || QuarryErr::DatasetNotFound(dataset.to_string()),
            )
            .await?;
        Ok(list.tables.into_iter().map(|table| table.id).collect())
    }

    async fn get_schema(
        &self,
        project_id: &str,
        dataset: &str,
        table: &str,
    ) -> Result<Vec<Field>> {
        let resource: TableResource = self
            .get_json(
                &format!("projects/{project_id}/datasets/{dataset}/tables/{table}"),
                || QuarryErr::TableNotFound(table.to_string()),
            )
            .await?;
        Ok(resource.schema.fields)
    }

    async fn run_query(
        &self,
        project_id: &str,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryOutcome> {
        let request = QueryRequest {
            query: sql,
            max_results: options.max_rows,
            dry_run: options.dry_run,
        };
        let mut builder = self
            .client
            .post(self.url(&format!("projects/{project_id}/queries")))
            .json(&request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            return Err(map_status(status, &response.text().await.unwrap_or_default()));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|err| QuarryErr::WarehouseUnavailable(err.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(map_query_error(&error));
        }

        let total_rows = parsed.total_rows.unwrap_or(parsed.rows.len() as u64);
        Ok(QueryOutcome {
            schema: parsed.schema.map(|schema| schema.fields).unwrap_or_default(),
            total_rows,
            bytes_estimate: parsed.total_bytes_processed,
            rows: parsed.rows,
        })
    }
}

/// Invalid-query responses split into syntax and semantic classes so the
/// workflow can choose the right retry prompt.
fn map_query_error(error: &QueryError) -> QuarryErr {
    let message = format!("{}: {}", error.reason, error.message);
    let lowered = error.message.to_ascii_lowercase();
    if lowered.contains("syntax error") {
        QuarryErr::SqlSyntax(message)
    } else {
        QuarryErr::SqlSemantic(message)
    }
}
