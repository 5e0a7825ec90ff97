//! Compact result-set descriptions for report prompts.
//!
//! Spilled results never reach the model as raw rows; they are reduced to a
//! row count, the schema, and per-column descriptive statistics (min/max/
//! mean for numeric columns, top-k value counts for the rest). Inline
//! results are rendered as bounded JSON lines.

use std::collections::HashMap;

use quarry_protocol::ColumnSummary;
use quarry_protocol::ColumnSummaryKind;
use quarry_protocol::Field;
use quarry_protocol::ResultSummary;
use quarry_protocol::Row;
use quarry_protocol::is_numeric_type;

/// How many most-frequent values to keep per categorical column.
const TOP_K: usize = 5;

pub fn summarize_rows(schema: &[Field], rows: &[Row]) -> ResultSummary {
    let columns = schema
        .iter()
        .map(|field| ColumnSummary {
            name: field.name.clone(),
            kind: if is_numeric_type(&field.ty) {
                summarize_numeric(&field.name, rows)
            } else {
                summarize_categorical(&field.name, rows)
            },
        })
        .collect();

    ResultSummary {
        row_count: rows.len() as u64,
        schema: schema.to_vec(),
        columns,
    }
}

fn summarize_numeric(name: &str, rows: &[Row]) -> ColumnSummaryKind {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0u64;
    let mut null_count = 0u64;

    for row in rows {
        match row.get(name).and_then(as_number) {
            Some(value) => {
                min = min.min(value);
                max = max.max(value);
                sum += value;
                count += 1;
            }
            None => null_count += 1,
        }
    }

    if count == 0 {
        return ColumnSummaryKind::Numeric {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            null_count,
        };
    }
    ColumnSummaryKind::Numeric {
        min,
        max,
        mean: sum / count as f64,
        null_count,
    }
}

fn summarize_categorical(name: &str, rows: &[Row]) -> ColumnSummaryKind {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for row in rows {
        let rendered = match row.get(name) {
            None | Some(serde_json::Value::Null) => continue,
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        *counts.entry(rendered).or_insert(0) += 1;
    }

    let distinct_count = counts.len() as u64;
    let mut top: Vec<(String, u64)> = counts.into_iter().collect();
    // Sort by descending count, tie-broken by value for determinism.
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(TOP_K);

    ColumnSummaryKind::Categorical { top, distinct_count }
}

/// BigQuery-style results often carry numerics as strings; accept both.
fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Render a spilled result for the report prompt: key, shape and stats but
/// never the raw rows.
pub fn render_summary_block(query_idx: usize, sql: &str, summary: &ResultSummary) -> String {
    let mut out = format!(
        "#### Query {n}\n```sql\n{sql}\n```\nResult: {rows} rows (stored externally; summarized)\n",
        n = query_idx + 1,
        rows = summary.row_count,
    );
    for column in &summary.columns {
        match &column.kind {
            ColumnSummaryKind::Numeric {
                min,
                max,
                mean,
                null_count,
            } => {
                out.push_str(&format!(
                    "- {name}: numeric, min {min}, max {max}, mean {mean:.4}, {null_count} nulls\n",
                    name = column.name,
                ));
            }
            ColumnSummaryKind::Categorical { top, distinct_count } => {
                let rendered: Vec<String> = top
                    .iter()
                    .map(|(value, count)| format!("{value} ({count})"))
                    .collect();
                out.push_str(&format!(
                    "- {name}: {distinct_count} distinct, top: {values}\n",
                    name = column.name,
                    values = rendered.join(", "),
                ));
            }
        }
    }
    out
}

/// Render an inline result for the report prompt as JSON lines.
pub fn render_inline_block(query_idx: usize, sql: &str, rows: &[Row], truncated: bool) -> String {
    let mut out = format!(
        "#### Query {n}\n```sql\n{sql}\n```\nResult: {rows_len} rows{note}\n",
        n = query_idx + 1,
        rows_len = rows.len(),
        note = if truncated {
            " (truncated preview)"
        } else {
            ""
        },
    );
    for row in rows {
        out.push_str(&serde_json::Value::Object(row.clone()).to_string());
        out.push('\n');
    }
    out
}

/// Render a failed query for the report prompt so the model can acknowledge
/// the gap instead of inventing numbers.
pub fn render_failure_block(query_idx: usize, sql: &str, error: &str) -> String {
    format!(
        "#### Query {n}\n```sql\n{sql}\n```\nResult: FAILED — {error}\n",
        n = query_idx + 1,
    )
}
