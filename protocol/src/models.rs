//! Row, schema and chat-message models shared by the adapters.

use serde::Deserialize;
use serde::Serialize;

/// A single result row, keyed by column name. Warehouse adapters surface
/// typed rows as JSON objects so the engine never depends on a concrete
/// client's row representation.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// One field of a table schema, in warehouse column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Warehouse type name, e.g. `INT64`, `FLOAT64`, `STRING`, `TIMESTAMP`.
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            mode: FieldMode::default(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// Whether a warehouse type name denotes a numeric column. Used when
/// summarizing spilled results (numeric columns get min/max/mean, the rest
/// get top-k value counts).
pub fn is_numeric_type(ty: &str) -> bool {
    matches!(
        ty.to_ascii_uppercase().as_str(),
        "INT64"
            | "INTEGER"
            | "INT"
            | "SMALLINT"
            | "BIGINT"
            | "FLOAT64"
            | "FLOAT"
            | "DOUBLE"
            | "NUMERIC"
            | "BIGNUMERIC"
            | "DECIMAL"
    )
}

/// One role-tagged turn of the session's LLM conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}
