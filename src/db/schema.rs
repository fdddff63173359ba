use serde::{Deserialize, Serialize};

/// Represents a database row as a map of column names to JSON values
pub type Row = std::collections::HashMap<String, serde_json::Value>;

/// Normalized result of a statement, identical in shape for every backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Column metadata in select-list order, when the driver reports it
    pub fields: Option<Vec<FieldInfo>>,
    pub affected_rows: Option<u64>,
    /// Generated key of the last inserted row
    pub last_insert_id: Option<serde_json::Value>,
    /// Row count before truncation to the manager's result ceiling
    pub total_rows: usize,
    pub truncated: bool,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>, fields: Option<Vec<FieldInfo>>) -> Self {
        let total_rows = rows.len();
        Self {
            rows,
            fields,
            affected_rows: None,
            last_insert_id: None,
            total_rows,
            truncated: false,
        }
    }

    pub fn affected(count: u64, last_insert_id: Option<serde_json::Value>) -> Self {
        Self {
            affected_rows: Some(count),
            last_insert_id,
            ..Default::default()
        }
    }

    /// Drop rows past `max_rows`. Returns true when rows were dropped.
    pub fn truncate_to(&mut self, max_rows: usize) -> bool {
        self.total_rows = self.total_rows.max(self.rows.len());
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            self.truncated = true;
        }
        self.truncated
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Column metadata reported alongside a result set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub data_type: Option<String>,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, data_type: Option<String>) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Represents a single table (or collection / resource)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub schema_name: Option<String>,
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    /// True when columns were inferred from sampled data
    pub inferred: bool,
}

/// Represents a column in a table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub key: KeyRole,
    pub max_length: Option<i64>,
    pub ordinal_position: i32,
}

impl ColumnInfo {
    pub fn is_primary_key(&self) -> bool {
        self.key == KeyRole::Primary
    }
}

/// Role a column plays in the table's keys
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    #[default]
    None,
    Primary,
    Unique,
    Foreign,
}

impl KeyRole {
    /// Map an information_schema constraint type or MySQL COLUMN_KEY value.
    pub fn from_constraint(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "PRIMARY KEY" | "PRI" => KeyRole::Primary,
            "UNIQUE" | "UNI" => KeyRole::Unique,
            "FOREIGN KEY" => KeyRole::Foreign,
            _ => KeyRole::None,
        }
    }
}

/// Server-level description returned by introspection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub product: String,
    pub version: String,
    pub database: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Render an exact decimal as a JSON number when f64 holds every digit,
/// otherwise keep the text.
pub fn decimal_to_json(text: &str) -> serde_json::Value {
    let significant = text
        .trim_start_matches('-')
        .trim_start_matches(['0', '.'])
        .chars()
        .filter(char::is_ascii_digit)
        .count();
    if significant <= 15 {
        if let Some(n) = text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(text.to_string())
}

/// JSON type name for a sampled value, used when inferring schemas.
pub fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "number",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
