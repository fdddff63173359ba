use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    ensure_param_count, with_connect_timeout, BackendKind, DatabaseConnector, ServerIntrospection,
};
use crate::db::config::DocumentConfig;
use crate::db::schema::{
    decimal_to_json, ColumnInfo, FieldInfo, KeyRole, QueryResult, Row, ServerInfo, TableSchema,
};
use crate::db::sql_text::count_placeholders;
use crate::db::translate::{parse_simple_select, Filter, FilterOp, SimpleSelect};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::{ClientOptions, FindOptions, Tls, TlsOptions};
use mongodb::{Client, Database};
use serde_json::Value;

/// Documents sampled when inferring a collection's fields
const SCHEMA_SAMPLE_SIZE: i64 = 100;

/// MongoDB connector using the official mongodb driver.
///
/// MongoDB is schema-less, so schema introspection works by sampling
/// documents from each collection to infer field names and types. Simple
/// single-collection reads are translated into `find` calls and a statement
/// that is itself a JSON object runs as a database command.
pub struct MongoDbConnector {
    config: DocumentConfig,
    client: Option<Client>,
    database: Option<Database>,
    last_error: Option<String>,
}

impl MongoDbConnector {
    pub fn new(config: DocumentConfig) -> Self {
        Self {
            config,
            client: None,
            database: None,
            last_error: None,
        }
    }

    /// Build a MongoDB connection URI from config.
    fn build_uri(&self) -> String {
        if let Some(uri) = self.config.uri.as_deref().filter(|u| !u.trim().is_empty()) {
            return uri.to_string();
        }

        let host = self.config.host.as_deref().unwrap_or("localhost");
        let port = self.config.port.unwrap_or(27017);

        let mut uri = match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) => format!(
                "mongodb://{}:{}@{}:{}",
                encode_userinfo(user),
                encode_userinfo(pass),
                host,
                port
            ),
            (Some(user), None) => format!("mongodb://{}@{}:{}", encode_userinfo(user), host, port),
            _ => format!("mongodb://{}:{}", host, port),
        };
        if let Some(source) = &self.config.auth_source {
            uri.push_str(&format!("/?authSource={}", source));
        }
        uri
    }

    fn database_name(&self) -> &str {
        self.config.database.as_deref().unwrap_or("test")
    }

    fn db(&self) -> Result<&Database> {
        self.database
            .as_ref()
            .ok_or_else(|| DbError::Connection("Not connected to MongoDB".to_string()))
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| DbError::Connection("Not connected to MongoDB".to_string()))
    }

    /// The configured database, or another one on the same deployment.
    fn db_for(&self, database: Option<&str>) -> Result<Database> {
        match database {
            Some(name) => Ok(self.client()?.database(name)),
            None => Ok(self.db()?.clone()),
        }
    }

    async fn client_options(&self) -> Result<ClientOptions> {
        let options = &self.config.options;
        let mut opts = ClientOptions::parse(self.build_uri())
            .await
            .map_err(|e| DbError::connection("Invalid MongoDB connection string", e))?;
        if options.connect_timeout_ms > 0 {
            let timeout = Duration::from_millis(options.connect_timeout_ms);
            opts.connect_timeout = Some(timeout);
            opts.server_selection_timeout = Some(timeout);
        }
        opts.max_pool_size = Some(options.pool_size as u32);
        if options.ssl && opts.tls.is_none() {
            opts.tls = Some(Tls::Enabled(TlsOptions::default()));
        }
        opts.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        Ok(opts)
    }

    /// Infer the BSON type as a string for schema purposes.
    fn bson_type_name(value: &Bson) -> &'static str {
        match value {
            Bson::Double(_) => "double",
            Bson::String(_) => "string",
            Bson::Document(_) => "object",
            Bson::Array(_) => "array",
            Bson::Binary(_) => "binData",
            Bson::ObjectId(_) => "objectId",
            Bson::Boolean(_) => "bool",
            Bson::DateTime(_) => "date",
            Bson::Null => "null",
            Bson::Int32(_) => "int",
            Bson::Int64(_) => "long",
            Bson::Timestamp(_) => "timestamp",
            Bson::Decimal128(_) => "decimal",
            _ => "unknown",
        }
    }

    async fn run_find(&self, select: &SimpleSelect) -> Result<QueryResult> {
        let collection = self.db()?.collection::<Document>(&select.table);
        let filter = filter_document(&select.filters)?;

        let mut options = FindOptions::default();
        options.projection = projection_document(&select.columns);
        options.sort = sort_document(select);
        options.limit = select.limit.map(|n| n as i64);
        options.skip = select.offset;

        let mut cursor = collection
            .find(filter)
            .with_options(options)
            .await
            .map_err(|e| DbError::query("MongoDB find failed", e))?;

        let mut rows = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| DbError::query("Failed to read MongoDB cursor", e))?
        {
            rows.push(bson_doc_to_row(&doc));
        }

        let fields = if select.columns.is_empty() {
            rows.first().map(|row| {
                let mut names: Vec<&String> = row.keys().collect();
                names.sort();
                names.into_iter().map(|n| FieldInfo::new(n.as_str(), None)).collect()
            })
        } else {
            Some(select.columns.iter().map(|c| FieldInfo::new(c.as_str(), None)).collect())
        };
        Ok(QueryResult::from_rows(rows, fields))
    }

    async fn run_command(&self, command: Document) -> Result<QueryResult> {
        let result = self
            .db()?
            .run_command(command)
            .await
            .map_err(|e| DbError::query("Failed to execute MongoDB command", e))?;

        // Cursor-shaped replies (find, aggregate) carry their rows in firstBatch
        if let Ok(cursor) = result.get_document("cursor") {
            if let Ok(batch) = cursor.get_array("firstBatch") {
                let rows = batch
                    .iter()
                    .filter_map(|item| item.as_document().map(bson_doc_to_row))
                    .collect();
                return Ok(QueryResult::from_rows(rows, None));
            }
        }

        let mut single = QueryResult::from_rows(vec![bson_doc_to_row(&result)], None);
        if let Ok(n) = result.get_i32("n") {
            single.affected_rows = Some(n.max(0) as u64);
        }
        Ok(single)
    }
}

fn encode_userinfo(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn json_to_bson(column: &str, value: &Value) -> Result<Bson> {
    if column == "_id" {
        if let Some(oid) = value.as_str().and_then(|s| ObjectId::parse_str(s).ok()) {
            return Ok(Bson::ObjectId(oid));
        }
    }
    mongodb::bson::to_bson(value).map_err(|e| DbError::query("Cannot convert parameter", e))
}

/// Translate a LIKE pattern into an anchored regular expression.
fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn condition(filter: &Filter) -> Result<Bson> {
    let value = || json_to_bson(&filter.column, &filter.value);
    let pattern = || filter.value.as_str().map(like_to_regex).unwrap_or_default();
    Ok(match filter.op {
        FilterOp::Eq => value()?,
        FilterOp::Ne => Bson::Document(doc! { "$ne": value()? }),
        FilterOp::Lt => Bson::Document(doc! { "$lt": value()? }),
        FilterOp::Le => Bson::Document(doc! { "$lte": value()? }),
        FilterOp::Gt => Bson::Document(doc! { "$gt": value()? }),
        FilterOp::Ge => Bson::Document(doc! { "$gte": value()? }),
        FilterOp::Like => Bson::Document(doc! { "$regex": pattern() }),
        FilterOp::ILike => Bson::Document(doc! { "$regex": pattern(), "$options": "i" }),
        FilterOp::IsNull => Bson::Null,
        FilterOp::IsNotNull => Bson::Document(doc! { "$ne": Bson::Null }),
        FilterOp::In => {
            let items = filter
                .value
                .as_array()
                .map(|vals| {
                    vals.iter()
                        .map(|v| json_to_bson(&filter.column, v))
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            Bson::Document(doc! { "$in": items })
        }
    })
}

/// Filter document for a conjunction of simple conditions.
fn filter_document(filters: &[Filter]) -> Result<Document> {
    let mut clauses = filters
        .iter()
        .map(|f| {
            let mut clause = Document::new();
            clause.insert(f.column.clone(), condition(f)?);
            Ok(clause)
        })
        .collect::<Result<Vec<Document>>>()?;
    Ok(match clauses.len() {
        0 => Document::new(),
        1 => clauses.remove(0),
        _ => doc! { "$and": clauses },
    })
}

fn projection_document(columns: &[String]) -> Option<Document> {
    if columns.is_empty() {
        return None;
    }
    let mut projection = Document::new();
    for column in columns {
        projection.insert(column.clone(), 1);
    }
    if !columns.iter().any(|c| c == "_id") {
        projection.insert("_id", 0);
    }
    Some(projection)
}

fn sort_document(select: &SimpleSelect) -> Option<Document> {
    if select.order_by.is_empty() {
        return None;
    }
    let mut sort = Document::new();
    for order in &select.order_by {
        sort.insert(order.column.clone(), if order.descending { -1 } else { 1 });
    }
    Some(sort)
}

/// Field list inferred from sampled documents, sorted by name.
fn infer_columns(docs: &[Document]) -> Vec<ColumnInfo> {
    let mut field_types: BTreeMap<String, &'static str> = BTreeMap::new();
    for doc in docs {
        for (key, value) in doc.iter() {
            // First non-null sample wins
            let entry = field_types.entry(key.clone()).or_insert("null");
            if *entry == "null" {
                *entry = MongoDbConnector::bson_type_name(value);
            }
        }
    }

    field_types
        .into_iter()
        .enumerate()
        .map(|(i, (name, dtype))| ColumnInfo {
            key: if name == "_id" {
                KeyRole::Primary
            } else {
                KeyRole::None
            },
            is_nullable: name != "_id",
            name,
            data_type: dtype.to_string(),
            default_value: None,
            max_length: None,
            ordinal_position: (i + 1) as i32,
        })
        .collect()
}

#[async_trait]
impl DatabaseConnector for MongoDbConnector {
    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await?;

        let db_name = self.database_name().to_string();
        let timeout = self.config.options.connect_timeout_ms;
        let opened = match self.client_options().await {
            Ok(opts) => {
                with_connect_timeout(timeout, async move {
                    let client = Client::with_options(opts)
                        .map_err(|e| DbError::connection("Failed to create MongoDB client", e))?;
                    let db = client.database(&db_name);
                    db.run_command(doc! { "ping": 1 })
                        .await
                        .map_err(|e| {
                            DbError::connection(
                                "MongoDB ping failed - check connection settings",
                                e,
                            )
                        })?;
                    Ok((client, db))
                })
                .await
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok((client, db)) => {
                self.client = Some(client);
                self.database = Some(db);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.database = None;
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.database.is_some()
    }

    async fn test_connection(&mut self) -> bool {
        match self.ping().await {
            Ok(()) => true,
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
        let trimmed = statement.trim();
        if trimmed.starts_with('{') {
            let command: Document = serde_json::from_str(trimmed)
                .map_err(|e| DbError::query("Command must be a valid JSON document", e))?;
            if !params.is_empty() {
                return Err(DbError::Query(
                    "JSON commands do not take positional parameters".to_string(),
                ));
            }
            return self.run_command(command).await;
        }

        ensure_param_count(count_placeholders(statement), params.len())?;
        match parse_simple_select(statement, params) {
            Some(select) => self.run_find(&select).await,
            None => Err(DbError::unsupported(
                BackendKind::Document,
                "statements other than single-collection reads or JSON commands",
            )),
        }
    }

    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let db = self.db_for(database)?;
        let mut names = db
            .list_collection_names()
            .await
            .map_err(|e| DbError::query("Failed to list MongoDB collections", e))?;
        names.sort();
        Ok(names)
    }

    async fn get_table_schema(&self, table: &str, database: Option<&str>) -> Result<TableSchema> {
        let db = self.db_for(database)?;

        let exists = db
            .list_collection_names()
            .filter(doc! { "name": table })
            .await
            .map_err(|e| DbError::query("Failed to list MongoDB collections", e))?;
        if exists.is_empty() {
            return Err(DbError::Query(format!("collection '{}' not found", table)));
        }

        let mut cursor = db
            .collection::<Document>(table)
            .find(doc! {})
            .limit(SCHEMA_SAMPLE_SIZE)
            .await
            .map_err(|e| DbError::query("Failed to query collection for schema inference", e))?;
        let mut sample = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| DbError::query("Failed to read MongoDB cursor", e))?
        {
            sample.push(doc);
        }

        Ok(TableSchema {
            schema_name: Some(db.name().to_string()),
            table_name: table.to_string(),
            columns: infer_columns(&sample),
            inferred: true,
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn introspection(&self) -> Option<&dyn ServerIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl ServerIntrospection for MongoDbConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.client()?
            .list_database_names()
            .await
            .map_err(|e| DbError::query("Failed to list MongoDB databases", e))
    }

    async fn ping(&self) -> Result<()> {
        self.db()?
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| DbError::connection("MongoDB ping failed", e))
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let info = self
            .db()?
            .run_command(doc! { "buildInfo": 1 })
            .await
            .map_err(|e| DbError::query("Failed to read MongoDB build info", e))?;
        let version = info.get_str("version").unwrap_or("unknown").to_string();
        let details = serde_json::json!({
            "git_version": info.get_str("gitVersion").ok(),
            "max_bson_object_size": info.get_i32("maxBsonObjectSize").ok(),
        });
        Ok(ServerInfo {
            product: "MongoDB".to_string(),
            version,
            database: Some(self.database_name().to_string()),
            details: Some(details),
        })
    }
}

/// Convert a BSON Document to our Row type (HashMap<String, serde_json::Value>).
fn bson_doc_to_row(doc: &Document) -> Row {
    doc.iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

/// Convert a BSON value to serde_json::Value.
fn bson_to_json(bson: &Bson) -> Value {
    match bson {
        Bson::Double(v) => serde_json::Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(v) => Value::String(v.clone()),
        Bson::Array(arr) => Value::Array(arr.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(k, v)| (k.clone(), bson_to_json(v)))
                .collect(),
        ),
        Bson::Boolean(v) => Value::Bool(*v),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Int32(v) => Value::from(*v),
        Bson::Int64(v) => Value::from(*v),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        Bson::Decimal128(d) => decimal_to_json(&d.to_string()),
        Bson::Timestamp(ts) => serde_json::json!({
            "t": ts.time,
            "i": ts.increment
        }),
        Bson::Binary(bin) => Value::String(hex::encode(&bin.bytes)),
        other => Value::String(other.to_string()),
    }
}
