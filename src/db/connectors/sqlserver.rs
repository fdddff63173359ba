use super::{
    ensure_param_count, with_connect_timeout, BackendKind, DatabaseConnector, ServerIntrospection,
};
use crate::db::config::ServerConfig;
use crate::db::schema::{
    ColumnInfo, FieldInfo, KeyRole, QueryResult, Row, ServerInfo, TableSchema,
};
use crate::db::sql_text::{
    contains_keyword, is_read_statement, leading_keyword, translate_placeholders, PlaceholderStyle,
};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use serde_json::Value;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server connector using tiberius
pub struct SqlServerConnector {
    config: ServerConfig,
    client: Mutex<Option<TdsClient>>,
    connected: bool,
    last_error: Option<String>,
}

impl SqlServerConnector {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            connected: false,
            last_error: None,
        }
    }

    /// Build a tiberius Config and return (Config, host, port)
    fn build_tiberius_config(&self) -> (Config, String, u16) {
        let mut tib_config = Config::new();

        let host = self.config.host.clone().unwrap_or_else(|| "localhost".to_string());
        let port = self.config.port.unwrap_or(1433);

        tib_config.host(&host);
        tib_config.port(port);

        if let Some(ref db) = self.config.database {
            tib_config.database(db);
        }

        let user = self.config.user.clone().unwrap_or_default();
        let password = self.config.password.clone().unwrap_or_default();
        tib_config.authentication(AuthMethod::sql_server(user, password));

        if self.config.options.ssl {
            tib_config.trust_cert();
            tib_config.encryption(EncryptionLevel::Required);
        } else {
            tib_config.encryption(EncryptionLevel::Off);
        }

        (tib_config, host, port)
    }

    async fn open_client(&self) -> Result<TdsClient> {
        let (tib_config, host, port) = self.build_tiberius_config();
        let addr = format!("{}:{}", host, port);

        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| DbError::connection(&format!("Failed to connect to SQL Server at {}", addr), e))?;
        tcp.set_nodelay(true)
            .map_err(|e| DbError::connection("Failed to configure socket", e))?;

        Client::connect(tib_config, tcp.compat_write())
            .await
            .map_err(|e| DbError::connection("TDS connection/authentication failed", e))
    }

    /// Convert a tiberius Row into our Row type
    fn row_to_map(row: &tiberius::Row) -> Row {
        let mut map = Row::new();
        for (idx, col) in row.columns().iter().enumerate() {
            map.insert(col.name().to_string(), Self::column_to_json(row, idx, col));
        }
        map
    }

    /// Convert a single tiberius column value to serde_json::Value
    fn column_to_json(row: &tiberius::Row, idx: usize, col: &tiberius::Column) -> Value {
        use tiberius::ColumnType;

        match col.column_type() {
            ColumnType::Null => Value::Null,
            ColumnType::Bit | ColumnType::Bitn => match row.try_get::<bool, _>(idx) {
                Ok(Some(v)) => Value::Bool(v),
                _ => Value::Null,
            },
            ColumnType::Int1 => match row.try_get::<u8, _>(idx) {
                Ok(Some(v)) => serde_json::json!(v),
                _ => Value::Null,
            },
            ColumnType::Int2 => match row.try_get::<i16, _>(idx) {
                Ok(Some(v)) => serde_json::json!(v),
                _ => Value::Null,
            },
            ColumnType::Int4 => match row.try_get::<i32, _>(idx) {
                Ok(Some(v)) => serde_json::json!(v),
                _ => Value::Null,
            },
            ColumnType::Int8 => match row.try_get::<i64, _>(idx) {
                Ok(Some(v)) => serde_json::json!(v),
                _ => Value::Null,
            },
            ColumnType::Intn => {
                if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
                    serde_json::json!(v)
                } else if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
                    serde_json::json!(v)
                } else if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
                    serde_json::json!(v)
                } else if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
                    serde_json::json!(v)
                } else {
                    Value::Null
                }
            }
            ColumnType::Float4 => match row.try_get::<f32, _>(idx) {
                Ok(Some(v)) => serde_json::json!(v),
                _ => Value::Null,
            },
            ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => {
                match row.try_get::<f64, _>(idx) {
                    Ok(Some(v)) => serde_json::json!(v),
                    _ => Value::Null,
                }
            }
            ColumnType::Floatn => {
                if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
                    serde_json::json!(v)
                } else if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
                    serde_json::json!(v)
                } else {
                    Value::Null
                }
            }
            ColumnType::Numericn | ColumnType::Decimaln => {
                match row.try_get::<tiberius::numeric::Numeric, _>(idx) {
                    Ok(Some(v)) => {
                        let text = v.to_string();
                        text.parse::<f64>()
                            .ok()
                            .and_then(serde_json::Number::from_f64)
                            .map(Value::Number)
                            .unwrap_or(Value::String(text))
                    }
                    _ => Value::Null,
                }
            }
            ColumnType::Datetime
            | ColumnType::Datetime4
            | ColumnType::Datetimen
            | ColumnType::Datetime2 => match row.try_get::<chrono::NaiveDateTime, _>(idx) {
                Ok(Some(v)) => Value::String(v.to_string()),
                _ => Value::Null,
            },
            ColumnType::DatetimeOffsetn => {
                match row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx) {
                    Ok(Some(v)) => Value::String(v.to_rfc3339()),
                    _ => Value::Null,
                }
            }
            ColumnType::Daten => match row.try_get::<chrono::NaiveDate, _>(idx) {
                Ok(Some(v)) => Value::String(v.to_string()),
                _ => Value::Null,
            },
            ColumnType::Timen => match row.try_get::<chrono::NaiveTime, _>(idx) {
                Ok(Some(v)) => Value::String(v.to_string()),
                _ => Value::Null,
            },
            ColumnType::Guid => match row.try_get::<tiberius::Uuid, _>(idx) {
                Ok(Some(v)) => Value::String(v.to_string()),
                _ => Value::Null,
            },
            ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => {
                match row.try_get::<&[u8], _>(idx) {
                    Ok(Some(v)) => Value::String(hex::encode(v)),
                    _ => Value::Null,
                }
            }
            _ => match row.try_get::<&str, _>(idx) {
                Ok(Some(v)) => Value::String(v.to_string()),
                _ => Value::Null,
            },
        }
    }

    fn bind_json(query: &mut Query<'_>, value: &Value) {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        }
    }

    fn not_connected() -> DbError {
        DbError::Connection("Not connected to SQL Server".to_string())
    }

    /// Run a parameterized read and return the raw tiberius rows.
    async fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<tiberius::Row>> {
        let mut query = Query::new(sql.to_string());
        for param in params {
            Self::bind_json(&mut query, param);
        }

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(Self::not_connected)?;
        let stream = query
            .query(client)
            .await
            .map_err(|e| DbError::query("Failed to execute query", e))?;
        stream
            .into_first_result()
            .await
            .map_err(|e| DbError::query("Failed to read query results", e))
    }

    /// Like `fetch`, but keeps every result set of the batch.
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<tiberius::Row>>> {
        let mut query = Query::new(sql.to_string());
        for param in params {
            Self::bind_json(&mut query, param);
        }

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(Self::not_connected)?;
        let stream = query
            .query(client)
            .await
            .map_err(|e| DbError::query("Failed to execute statement", e))?;
        stream
            .into_results()
            .await
            .map_err(|e| DbError::query("Failed to read statement results", e))
    }

    fn rows_result(rows: &[tiberius::Row]) -> QueryResult {
        let fields = rows.first().map(|row| {
            row.columns()
                .iter()
                .map(|c| FieldInfo::new(c.name(), Some(format!("{:?}", c.column_type()))))
                .collect()
        });
        QueryResult::from_rows(rows.iter().map(Self::row_to_map).collect(), fields)
    }
}

/// How a statement has to be run so nothing it produces is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    /// Reads, procedure calls and writes with an `OUTPUT` clause return rows
    Rows,
    /// Plain `INSERT`: report the row count and the new identity value
    Identity,
    /// Other writes: row count only
    Count,
}

fn statement_output(statement: &str) -> Output {
    if is_read_statement(statement) || contains_keyword(statement, "OUTPUT") {
        return Output::Rows;
    }
    match leading_keyword(statement).as_deref() {
        Some("EXEC") | Some("EXECUTE") => Output::Rows,
        Some("INSERT") => Output::Identity,
        _ => Output::Count,
    }
}

/// Appended to a plain INSERT so the same batch reports what it did.
const IDENTITY_TRAILER: &str =
    "\nSELECT CAST(@@ROWCOUNT AS BIGINT) AS affected, CAST(SCOPE_IDENTITY() AS BIGINT) AS last_insert_id";

fn split_table_name(table: &str) -> (String, String) {
    match table.split_once('.') {
        Some((schema, name)) => (schema.to_string(), name.to_string()),
        None => ("dbo".to_string(), table.to_string()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

#[async_trait]
impl DatabaseConnector for SqlServerConnector {
    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            self.disconnect().await?;
        }

        let timeout = self.config.options.connect_timeout_ms;
        let opened = with_connect_timeout(timeout, self.open_client()).await;
        match opened {
            Ok(client) => {
                *self.client.get_mut() = Some(client);
                self.connected = true;
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
        if let Some(client) = self.client.get_mut().take() {
            if let Err(e) = client.close().await {
                log::debug!("SQL Server close reported: {}", e);
            }
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn test_connection(&mut self) -> bool {
        let probe = self.fetch("SELECT 1", &[]).await;
        match probe {
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
        let (sql, expected) = translate_placeholders(statement, PlaceholderStyle::AtP);
        ensure_param_count(expected, params.len())?;

        match statement_output(statement) {
            Output::Rows => {
                let rows = self.fetch(&sql, params).await?;
                Ok(Self::rows_result(&rows))
            }
            Output::Identity => {
                let batch = format!("{}{}", sql, IDENTITY_TRAILER);
                let mut sets = self.fetch_all(&batch, params).await?;
                let summary = sets.pop().unwrap_or_default();
                let row = summary.first();
                let affected = row
                    .and_then(|r| r.try_get::<i64, _>("affected").ok().flatten())
                    .unwrap_or(0);
                let last_insert_id = row
                    .and_then(|r| r.try_get::<i64, _>("last_insert_id").ok().flatten())
                    .map(Value::from);
                Ok(QueryResult::affected(affected.max(0) as u64, last_insert_id))
            }
            Output::Count => {
                let mut query = Query::new(sql);
                for param in params {
                    Self::bind_json(&mut query, param);
                }
                let mut guard = self.client.lock().await;
                let client = guard.as_mut().ok_or_else(Self::not_connected)?;
                let result = query
                    .execute(client)
                    .await
                    .map_err(|e| DbError::query("Failed to execute statement", e))?;
                Ok(QueryResult::affected(result.total(), None))
            }
        }
    }

    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let catalog = match database {
            Some(db) => format!("{}.INFORMATION_SCHEMA.TABLES", quote_ident(db)),
            None => "INFORMATION_SCHEMA.TABLES".to_string(),
        };
        let query = format!(
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM {} \
             WHERE TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_SCHEMA, TABLE_NAME",
            catalog
        );

        let rows = self.fetch(&query, &[]).await?;
        let mut tables = Vec::new();
        for row in &rows {
            let schema: &str = row.try_get(0).ok().flatten().unwrap_or("dbo");
            let name: &str = row.try_get(1).ok().flatten().unwrap_or("");
            if schema == "dbo" {
                tables.push(name.to_string());
            } else {
                tables.push(format!("{}.{}", schema, name));
            }
        }
        Ok(tables)
    }

    async fn get_table_schema(&self, table: &str, database: Option<&str>) -> Result<TableSchema> {
        let (schema_name, bare_table) = split_table_name(table);
        let prefix = database
            .map(|db| format!("{}.", quote_ident(db)))
            .unwrap_or_default();

        let query = format!(
            "SELECT c.COLUMN_NAME, c.DATA_TYPE, c.IS_NULLABLE, c.CHARACTER_MAXIMUM_LENGTH, \
                    c.COLUMN_DEFAULT, c.ORDINAL_POSITION, \
                    (SELECT TOP 1 tc.CONSTRAINT_TYPE \
                       FROM {p}INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                       JOIN {p}INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
                         ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
                        AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA \
                      WHERE kcu.TABLE_SCHEMA = c.TABLE_SCHEMA \
                        AND kcu.TABLE_NAME = c.TABLE_NAME \
                        AND kcu.COLUMN_NAME = c.COLUMN_NAME \
                      ORDER BY CASE tc.CONSTRAINT_TYPE WHEN 'PRIMARY KEY' THEN 0 \
                                                       WHEN 'UNIQUE' THEN 1 ELSE 2 END) \
             FROM {p}INFORMATION_SCHEMA.COLUMNS c \
             WHERE c.TABLE_SCHEMA = @P1 AND c.TABLE_NAME = @P2 \
             ORDER BY c.ORDINAL_POSITION",
            p = prefix
        );

        let rows = self
            .fetch(
                &query,
                &[Value::String(schema_name.clone()), Value::String(bare_table.clone())],
            )
            .await?;

        let mut columns = Vec::new();
        for row in &rows {
            let name: &str = row.try_get(0).ok().flatten().unwrap_or("");
            let data_type: &str = row.try_get(1).ok().flatten().unwrap_or("");
            let nullable: &str = row.try_get(2).ok().flatten().unwrap_or("YES");
            let max_length: Option<i32> = row.try_get(3).ok().flatten();
            let default_value: Option<&str> = row.try_get(4).ok().flatten();
            let ordinal: i32 = row.try_get(5).ok().flatten().unwrap_or(0);
            let key: Option<&str> = row.try_get(6).ok().flatten();

            columns.push(ColumnInfo {
                name: name.to_string(),
                data_type: data_type.to_string(),
                is_nullable: nullable == "YES",
                default_value: default_value.map(|s| s.to_string()),
                key: key.map(KeyRole::from_constraint).unwrap_or_default(),
                max_length: max_length.map(i64::from),
                ordinal_position: ordinal,
            });
        }

        if columns.is_empty() {
            return Err(DbError::Query(format!("table '{}' not found", table)));
        }

        Ok(TableSchema {
            schema_name: Some(schema_name),
            table_name: bare_table,
            columns,
            inferred: false,
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::SqlServer
    }

    fn introspection(&self) -> Option<&dyn ServerIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl ServerIntrospection for SqlServerConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = self
            .fetch("SELECT name FROM sys.databases ORDER BY name", &[])
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<&str, _>(0).ok().flatten().map(|s| s.to_string()))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.fetch("SELECT 1", &[]).await.map(|_| ())
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let rows = self
            .fetch(
                "SELECT @@VERSION, DB_NAME(), CAST(SERVERPROPERTY('Edition') AS NVARCHAR(128))",
                &[],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::Query("No result from version query".to_string()))?;

        let version: &str = row.try_get(0).ok().flatten().unwrap_or("");
        let database: Option<&str> = row.try_get(1).ok().flatten();
        let edition: Option<&str> = row.try_get(2).ok().flatten();

        Ok(ServerInfo {
            product: "Microsoft SQL Server".to_string(),
            version: version.lines().next().unwrap_or("").trim().to_string(),
            database: database.map(|s| s.to_string()),
            details: Some(serde_json::json!({ "edition": edition })),
        })
    }
}
