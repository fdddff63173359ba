use std::time::Duration;

use super::{ensure_param_count, with_connect_timeout, BackendKind, DatabaseConnector};
use crate::db::config::RestConfig;
use crate::db::schema::{json_type_name, ColumnInfo, FieldInfo, KeyRole, QueryResult, Row, TableSchema};
use crate::db::sql_text::{count_placeholders, inline_parameters};
use crate::db::translate::{parse_simple_select, Filter, FilterOp, SimpleSelect};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;

/// PostgREST-style resource connector (Supabase projects expose it under `/rest/v1`).
///
/// Simple single-table reads become resource GETs with filter query pairs.
/// Other statements go to the configured SQL RPC function, if any.
pub struct RestConnector {
    config: RestConfig,
    http: Option<reqwest::Client>,
    last_error: Option<String>,
}

/// How a statement will be served.
#[derive(Debug, PartialEq)]
enum Route {
    Resource(SimpleSelect),
    Rpc { function: String, body: Value },
}

impl RestConnector {
    pub fn new(config: RestConfig) -> Self {
        Self {
            config,
            http: None,
            last_error: None,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.url.as_deref().unwrap_or_default().trim_end_matches('/');
        format!("{}/rest/v1", base)
    }

    fn profile<'a>(&'a self, database: Option<&'a str>) -> &'a str {
        database
            .or(self.config.schema.as_deref())
            .unwrap_or("public")
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let options = &self.config.options;
        let mut builder = reqwest::Client::builder();
        if options.connect_timeout_ms > 0 {
            builder = builder.connect_timeout(Duration::from_millis(options.connect_timeout_ms));
        }
        if let Some(ms) = options.query_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        builder
            .build()
            .map_err(|e| DbError::connection("Failed to build HTTP client", e))
    }

    fn request(&self, method: Method, path: &str, profile: &str) -> Result<RequestBuilder> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| DbError::Connection("Not connected to REST resource".to_string()))?;
        Ok(with_auth(
            http.request(method, format!("{}/{}", self.endpoint(), path)),
            self.config.api_key.as_deref().unwrap_or_default(),
            profile,
        ))
    }

    fn route(&self, statement: &str, params: &[Value]) -> Result<Route> {
        ensure_param_count(count_placeholders(statement), params.len())?;

        if let Some(select) = parse_simple_select(statement, params) {
            return Ok(Route::Resource(select));
        }
        match self.config.sql_function.as_deref() {
            Some(function) if !function.trim().is_empty() => Ok(Route::Rpc {
                function: function.to_string(),
                body: serde_json::json!({ "query": inline_parameters(statement, params)? }),
            }),
            _ => Err(DbError::unsupported(
                BackendKind::Rest,
                "statements other than single-table reads (configure sql_function to enable them)",
            )),
        }
    }

    async fn fetch_openapi(&self, profile: &str) -> Result<Value> {
        let resp = self
            .request(Method::GET, "", profile)?
            .header(reqwest::header::ACCEPT, "application/openapi+json")
            .send()
            .await
            .map_err(|e| DbError::connection("REST resource unreachable", e))?;
        read_json(resp, "OpenAPI description").await
    }
}

fn with_auth(builder: RequestBuilder, api_key: &str, profile: &str) -> RequestBuilder {
    builder
        .header("apikey", api_key)
        .bearer_auth(api_key)
        .header("Accept-Profile", profile)
        .header("Content-Profile", profile)
}

async fn read_json(resp: Response, context: &str) -> Result<Value> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| DbError::query(&format!("Failed to read {}", context), e))?;
    if !status.is_success() {
        return Err(DbError::Query(format!(
            "{} request failed with {}: {}",
            context, status, text
        )));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| DbError::query(&format!("Invalid {} body", context), e))
}

/// Render a scalar filter operand the way PostgREST expects it in a query string.
fn operand(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn in_list(values: &Value) -> String {
    let items: Vec<String> = values
        .as_array()
        .map(|vals| {
            vals.iter()
                .map(|v| {
                    let s = operand(v);
                    if s.contains([',', '(', ')', '"', ' ']) {
                        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
                    } else {
                        s
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    format!("({})", items.join(","))
}

fn filter_pair(filter: &Filter) -> (String, String) {
    let value = match filter.op {
        FilterOp::Eq => format!("eq.{}", operand(&filter.value)),
        FilterOp::Ne => format!("neq.{}", operand(&filter.value)),
        FilterOp::Lt => format!("lt.{}", operand(&filter.value)),
        FilterOp::Le => format!("lte.{}", operand(&filter.value)),
        FilterOp::Gt => format!("gt.{}", operand(&filter.value)),
        FilterOp::Ge => format!("gte.{}", operand(&filter.value)),
        FilterOp::Like => format!("like.{}", operand(&filter.value).replace('%', "*")),
        FilterOp::ILike => format!("ilike.{}", operand(&filter.value).replace('%', "*")),
        FilterOp::IsNull => "is.null".to_string(),
        FilterOp::IsNotNull => "not.is.null".to_string(),
        FilterOp::In => format!("in.{}", in_list(&filter.value)),
    };
    (filter.column.clone(), value)
}

/// Query pairs for a resource GET.
fn query_pairs(select: &SimpleSelect) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if !select.columns.is_empty() {
        pairs.push(("select".to_string(), select.columns.join(",")));
    }
    pairs.extend(select.filters.iter().map(filter_pair));
    if !select.order_by.is_empty() {
        let order: Vec<String> = select
            .order_by
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.descending { "desc" } else { "asc" }))
            .collect();
        pairs.push(("order".to_string(), order.join(",")));
    }
    if let Some(limit) = select.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = select.offset {
        pairs.push(("offset".to_string(), offset.to_string()));
    }
    pairs
}

fn body_to_rows(body: Value) -> Vec<Row> {
    match body {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => map.into_iter().collect(),
                other => Row::from([("value".to_string(), other)]),
            })
            .collect(),
        Value::Object(map) => vec![map.into_iter().collect()],
        Value::Null => Vec::new(),
        scalar => vec![Row::from([("value".to_string(), scalar)])],
    }
}

fn fields_for(select_columns: &[String], rows: &[Row]) -> Option<Vec<FieldInfo>> {
    if !select_columns.is_empty() {
        return Some(select_columns.iter().map(|c| FieldInfo::new(c.as_str(), None)).collect());
    }
    rows.first().map(|row| {
        let mut names: Vec<&String> = row.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|n| FieldInfo::new(n.as_str(), Some(json_type_name(&row[n]).to_string())))
            .collect()
    })
}

/// Column list from an OpenAPI definition (PostgREST marks keys in descriptions).
fn columns_from_definition(definition: &Value) -> Vec<ColumnInfo> {
    let required: Vec<&str> = definition
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = definition.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    properties
        .iter()
        .enumerate()
        .map(|(idx, (name, prop))| {
            let description = prop.get("description").and_then(Value::as_str).unwrap_or("");
            let key = if description.contains("<pk/>") {
                KeyRole::Primary
            } else if description.contains("<fk ") {
                KeyRole::Foreign
            } else {
                KeyRole::None
            };
            let data_type = prop
                .get("format")
                .or_else(|| prop.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            ColumnInfo {
                name: name.clone(),
                data_type,
                is_nullable: !required.contains(&name.as_str()),
                default_value: prop.get("default").map(operand),
                key,
                max_length: prop.get("maxLength").and_then(Value::as_i64),
                ordinal_position: idx as i32 + 1,
            }
        })
        .collect()
}

fn columns_from_sample(row: &Row) -> Vec<ColumnInfo> {
    let mut names: Vec<&String> = row.keys().collect();
    names.sort();
    names
        .into_iter()
        .enumerate()
        .map(|(idx, name)| ColumnInfo {
            name: name.clone(),
            data_type: json_type_name(&row[name]).to_string(),
            is_nullable: true,
            default_value: None,
            key: KeyRole::None,
            max_length: None,
            ordinal_position: idx as i32 + 1,
        })
        .collect()
}

#[async_trait]
impl DatabaseConnector for RestConnector {
    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await?;

        let opened = match self.build_client() {
            Ok(client) => {
                self.http = Some(client);
                let profile = self.profile(None).to_string();
                with_connect_timeout(self.config.options.connect_timeout_ms, async {
                    self.fetch_openapi(&profile).await.map(|_| ())
                })
                .await
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok(()) => {
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.http = None;
                let e = match e {
                    DbError::Query(msg) => DbError::Connection(msg),
                    other => other,
                };
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.http = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.http.is_some()
    }

    async fn test_connection(&mut self) -> bool {
        let profile = self.profile(None).to_string();
        match self.fetch_openapi(&profile).await {
            Ok(_) => true,
            Err(e) => {
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    async fn query(&self, statement: &str, params: &[Value]) -> Result<QueryResult> {
        let profile = self.profile(None);
        match self.route(statement, params)? {
            Route::Resource(select) => {
                log::debug!("REST read of '{}' with {} filter(s)", select.table, select.filters.len());
                let resp = self
                    .request(Method::GET, &select.table, profile)?
                    .query(&query_pairs(&select))
                    .send()
                    .await
                    .map_err(|e| DbError::query("REST request failed", e))?;
                let rows = body_to_rows(read_json(resp, "resource").await?);
                let fields = fields_for(&select.columns, &rows);
                Ok(QueryResult::from_rows(rows, fields))
            }
            Route::Rpc { function, body } => {
                log::debug!("Routing statement through RPC function '{}'", function);
                let resp = self
                    .request(Method::POST, &format!("rpc/{}", function), profile)?
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| DbError::query("REST RPC request failed", e))?;
                let rows = body_to_rows(read_json(resp, "RPC").await?);
                let fields = fields_for(&[], &rows);
                Ok(QueryResult::from_rows(rows, fields))
            }
        }
    }

    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let doc = self.fetch_openapi(self.profile(database)).await?;
        let mut tables: Vec<String> = doc
            .get("definitions")
            .and_then(Value::as_object)
            .map(|defs| defs.keys().cloned().collect())
            .unwrap_or_default();
        tables.sort();
        Ok(tables)
    }

    async fn get_table_schema(&self, table: &str, database: Option<&str>) -> Result<TableSchema> {
        let profile = self.profile(database);
        let doc = self.fetch_openapi(profile).await?;
        if let Some(definition) = doc.get("definitions").and_then(|d| d.get(table)) {
            return Ok(TableSchema {
                schema_name: Some(profile.to_string()),
                table_name: table.to_string(),
                columns: columns_from_definition(definition),
                inferred: false,
            });
        }

        // Not described by the API document; infer from one sampled row
        let resp = self
            .request(Method::GET, table, profile)?
            .query(&[("limit", "1")])
            .send()
            .await
            .map_err(|e| DbError::query("REST request failed", e))?;
        let rows = body_to_rows(read_json(resp, "resource").await?);
        match rows.first() {
            Some(row) => Ok(TableSchema {
                schema_name: Some(profile.to_string()),
                table_name: table.to_string(),
                columns: columns_from_sample(row),
                inferred: true,
            }),
            None => Err(DbError::Query(format!("table '{}' not found", table))),
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Rest
    }
}
