//! The prompt catalog: four named, versioned templates.
//!
//! The set is deliberately closed — new analytical behaviors belong in new
//! workflow steps, not in new prompts. Templates are askama-rendered
//! markdown files; if rendering fails we fall back to a simple string
//! replacement over the same file so a bad template can never take the
//! session down.

use std::collections::BTreeMap;

use askama::Template;
use quarry_protocol::Field;
use quarry_protocol::FieldMode;
use tracing::warn;

pub const TASK_SAFETY_FILTER_VERSION: &str = "task_safety_filter/v1";
pub const INTENT_ANALYSIS_AND_SQL_VERSION: &str = "intent_analysis_and_sql/v1";
pub const ERROR_ANALYSIS_AND_REPAIR_VERSION: &str = "error_analysis_and_repair/v1";
pub const ANALYSIS_REPORT_VERSION: &str = "analysis_report/v1";

/// System message shared by every call in the catalog.
pub const ANALYST_SYSTEM_PROMPT: &str = "You are a careful data analyst working \
against a read-only SQL warehouse. You follow instructions exactly and, when a \
response schema is specified, you respond with JSON matching it and nothing else.";

#[derive(Template)]
#[template(path = "task_safety_filter.md", escape = "none")]
struct TaskSafetyFilterTemplate<'a> {
    user_task: &'a str,
    dataset: &'a str,
    tables: &'a str,
}

#[derive(Template)]
#[template(path = "intent_analysis_and_sql.md", escape = "none")]
struct IntentAnalysisTemplate<'a> {
    filtered_task: &'a str,
    schemas: &'a str,
    max_queries: usize,
}

#[derive(Template)]
#[template(path = "error_analysis_and_repair.md", escape = "none")]
struct ErrorRepairTemplate<'a> {
    sql: &'a str,
    error: &'a str,
    schemas: &'a str,
}

#[derive(Template)]
#[template(path = "analysis_report.md", escape = "none")]
struct AnalysisReportTemplate<'a> {
    task: &'a str,
    summaries: &'a str,
}

pub fn task_safety_filter_prompt(user_task: &str, dataset: &str, tables: &[String]) -> String {
    let tables = tables.join(", ");
    let template = TaskSafetyFilterTemplate {
        user_task,
        dataset,
        tables: &tables,
    };
    match template.render() {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!("failed to render task safety filter template: {err}");
            include_str!("../templates/task_safety_filter.md")
                .replace("{{ user_task }}", user_task)
                .replace("{{ dataset }}", dataset)
                .replace("{{ tables }}", &tables)
        }
    }
}

pub fn intent_analysis_prompt(filtered_task: &str, schemas: &str, max_queries: usize) -> String {
    let template = IntentAnalysisTemplate {
        filtered_task,
        schemas,
        max_queries,
    };
    match template.render() {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!("failed to render intent analysis template: {err}");
            include_str!("../templates/intent_analysis_and_sql.md")
                .replace("{{ filtered_task }}", filtered_task)
                .replace("{{ schemas }}", schemas)
                .replace("{{ max_queries }}", &max_queries.to_string())
        }
    }
}

pub fn error_repair_prompt(sql: &str, error: &str, schemas: &str) -> String {
    let template = ErrorRepairTemplate {
        sql,
        error,
        schemas,
    };
    match template.render() {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!("failed to render error repair template: {err}");
            include_str!("../templates/error_analysis_and_repair.md")
                .replace("{{ sql }}", sql)
                .replace("{{ error }}", error)
                .replace("{{ schemas }}", schemas)
        }
    }
}

pub fn analysis_report_prompt(task: &str, summaries: &str) -> String {
    let template = AnalysisReportTemplate { task, summaries };
    match template.render() {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!("failed to render analysis report template: {err}");
            include_str!("../templates/analysis_report.md")
                .replace("{{ task }}", task)
                .replace("{{ summaries }}", summaries)
        }
    }
}

/// Render table schemas as the markdown block the SQL-synthesis and repair
/// prompts expect.
pub fn render_schemas_block(schemas: &BTreeMap<String, Vec<Field>>) -> String {
    let mut out = String::new();
    for (table, fields) in schemas {
        out.push_str(&format!("### {table}\n"));
        for field in fields {
            let mode = match field.mode {
                FieldMode::Nullable => "NULLABLE",
                FieldMode::Required => "REQUIRED",
                FieldMode::Repeated => "REPEATED",
            };
            match &field.description {
                Some(description) => out.push_str(&format!(
                    "- {} {} {mode} — {description}\n",
                    field.name, field.ty
                )),
                None => out.push_str(&format!("- {} {} {mode}\n", field.name, field.ty)),
            }
        }
        out.push('\n');
    }
    out
}
