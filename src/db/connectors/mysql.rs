use super::{
    ensure_param_count, with_connect_timeout, BackendKind, DatabaseConnector, ServerIntrospection,
};
use crate::db::config::ServerConfig;
use crate::db::schema::{
    decimal_to_json, ColumnInfo, FieldInfo, KeyRole, QueryResult, Row, ServerInfo, TableSchema,
};
use crate::db::sql_text::count_placeholders;
use crate::error::{DbError, Result};
use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, SslOpts};
use serde_json::Value;

/// MySQL connector using the mysql_async pool
pub struct MySqlConnector {
    config: ServerConfig,
    pool: Option<Pool>,
    last_error: Option<String>,
}

impl MySqlConnector {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            pool: None,
            last_error: None,
        }
    }

    fn build_opts(&self) -> Result<OptsBuilder> {
        let options = &self.config.options;
        let constraints = PoolConstraints::new(0, options.pool_size)
            .ok_or_else(|| DbError::configuration("pool_size", "must be at least 1"))?;

        let mut opts = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone().unwrap_or_else(|| "localhost".to_string()))
            .tcp_port(self.config.port.unwrap_or(3306))
            .user(self.config.user.clone())
            .pass(self.config.password.clone())
            .db_name(self.config.database.clone())
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        if options.ssl {
            opts = opts.ssl_opts(Some(SslOpts::default()));
        }
        Ok(opts)
    }

    async fn conn(&self) -> Result<Conn> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| DbError::Connection("Not connected to MySQL".to_string()))?;
        pool.get_conn()
            .await
            .map_err(|e| DbError::connection("Failed to acquire MySQL connection", e))
    }

    async fn ping_pool(pool: &Pool) -> Result<()> {
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| DbError::connection("Failed to connect to MySQL", e))?;
        conn.ping()
            .await
            .map_err(|e| DbError::connection("MySQL liveness probe failed", e))
    }
}

fn json_to_mysql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                mysql_async::Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                mysql_async::Value::UInt(u)
            } else {
                mysql_async::Value::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => mysql_async::Value::from(s.clone()),
        other => mysql_async::Value::from(other.to_string()),
    }
}

/// Convert a MySQL value to JSON, using the column type to interpret raw bytes.
fn mysql_to_json(value: mysql_async::Value, column_type: ColumnType) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(bytes) => match column_type {
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                decimal_to_json(&String::from_utf8_lossy(&bytes))
            }
            ColumnType::MYSQL_TYPE_JSON => serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
            _ => match String::from_utf8(bytes) {
                Ok(s) => Value::String(s),
                Err(e) => Value::String(hex::encode(e.into_bytes())),
            },
        },
        mysql_async::Value::Int(n) => Value::from(n),
        mysql_async::Value::UInt(n) => Value::from(n),
        mysql_async::Value::Float(f) => serde_json::json!(f),
        mysql_async::Value::Double(d) => serde_json::json!(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let date = format!("{:04}-{:02}-{:02}", year, month, day);
            if column_type == ColumnType::MYSQL_TYPE_DATE {
                Value::String(date)
            } else if micro > 0 {
                Value::String(format!(
                    "{} {:02}:{:02}:{:02}.{:06}",
                    date, hour, min, sec, micro
                ))
            } else {
                Value::String(format!("{} {:02}:{:02}:{:02}", date, hour, min, sec))
            }
        }
        mysql_async::Value::Time(negative, days, hour, min, sec, micro) => {
            let hours = days * 24 + u32::from(hour);
            let sign = if negative { "-" } else { "" };
            if micro > 0 {
                Value::String(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, min, sec, micro
                ))
            } else {
                Value::String(format!("{}{:02}:{:02}:{:02}", sign, hours, min, sec))
            }
        }
    }
}

fn row_to_map(row: &mysql_async::Row) -> Row {
    let columns = row.columns_ref();
    let mut map = Row::new();
    for (idx, col) in columns.iter().enumerate() {
        let value: mysql_async::Value = row.get(idx).unwrap_or(mysql_async::Value::NULL);
        map.insert(col.name_str().to_string(), mysql_to_json(value, col.column_type()));
    }
    map
}

fn positional(params: &[Value]) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.iter().map(json_to_mysql).collect())
    }
}

fn split_table_name<'a>(table: &'a str, database: Option<&'a str>) -> (Option<&'a str>, &'a str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (database, table),
    }
}

#[async_trait]
impl DatabaseConnector for MySqlConnector {
    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await?;

        let timeout = self.config.options.connect_timeout_ms;
        let opened = match self.build_opts() {
            Ok(opts) => {
                let pool = Pool::new(opts);
                with_connect_timeout(timeout, async move {
                    match Self::ping_pool(&pool).await {
                        Ok(()) => Ok(pool),
                        Err(e) => {
                            let _ = pool.disconnect().await;
                            Err(e)
                        }
                    }
                })
                .await
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok(pool) => {
                self.pool = Some(pool);
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
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.disconnect().await {
                log::debug!("MySQL pool disconnect reported: {}", e);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    async fn test_connection(&mut self) -> bool {
        let probe = match self.pool.as_ref() {
            Some(pool) => Self::ping_pool(pool).await,
            None => Err(DbError::Connection("Not connected to MySQL".to_string())),
        };
        match probe {
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
        ensure_param_count(count_placeholders(statement), params.len())?;

        let mut conn = self.conn().await?;
        let mut result = conn
            .exec_iter(statement, positional(params))
            .await
            .map_err(|e| DbError::query("Failed to execute query", e))?;

        let columns = result.columns().filter(|cols| !cols.is_empty());
        match columns {
            None => {
                let affected = result.affected_rows();
                let last_insert_id = result.last_insert_id().map(Value::from);
                result
                    .drop_result()
                    .await
                    .map_err(|e| DbError::query("Failed to finish statement", e))?;
                Ok(QueryResult::affected(affected, last_insert_id))
            }
            Some(cols) => {
                let fields = cols
                    .iter()
                    .map(|c| FieldInfo::new(c.name_str(), Some(format!("{:?}", c.column_type()))))
                    .collect();
                let rows: Vec<mysql_async::Row> = result
                    .collect()
                    .await
                    .map_err(|e| DbError::query("Failed to read query results", e))?;
                Ok(QueryResult::from_rows(
                    rows.iter().map(row_to_map).collect(),
                    Some(fields),
                ))
            }
        }
    }

    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.exec(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_NAME",
            (database,),
        )
        .await
        .map_err(|e| DbError::query("Failed to list tables", e))
    }

    async fn get_table_schema(&self, table: &str, database: Option<&str>) -> Result<TableSchema> {
        let (schema_name, bare_table) = split_table_name(table, database);
        let mut conn = self.conn().await?;

        type ColumnRow = (
            String,
            String,
            String,
            Option<u64>,
            Option<String>,
            u64,
            String,
            i64,
            String,
        );
        let rows: Vec<ColumnRow> = conn
            .exec(
                "SELECT c.COLUMN_NAME, c.COLUMN_TYPE, c.IS_NULLABLE, c.CHARACTER_MAXIMUM_LENGTH, \
                        c.COLUMN_DEFAULT, c.ORDINAL_POSITION, c.COLUMN_KEY, \
                        EXISTS(SELECT 1 FROM information_schema.KEY_COLUMN_USAGE k \
                                WHERE k.TABLE_SCHEMA = c.TABLE_SCHEMA \
                                  AND k.TABLE_NAME = c.TABLE_NAME \
                                  AND k.COLUMN_NAME = c.COLUMN_NAME \
                                  AND k.REFERENCED_TABLE_NAME IS NOT NULL), \
                        c.TABLE_SCHEMA \
                 FROM information_schema.COLUMNS c \
                 WHERE c.TABLE_SCHEMA = COALESCE(?, DATABASE()) AND c.TABLE_NAME = ? \
                 ORDER BY c.ORDINAL_POSITION",
                (schema_name, bare_table),
            )
            .await
            .map_err(|e| DbError::query("Failed to describe table", e))?;

        let resolved_schema = rows.first().map(|r| r.8.clone());
        let columns: Vec<ColumnInfo> = rows
            .into_iter()
            .map(|(name, data_type, nullable, max_length, default_value, ordinal, key, is_fk, _)| {
                let key = match KeyRole::from_constraint(&key) {
                    KeyRole::None if is_fk != 0 => KeyRole::Foreign,
                    role => role,
                };
                ColumnInfo {
                    name,
                    data_type,
                    is_nullable: nullable == "YES",
                    default_value,
                    key,
                    max_length: max_length.and_then(|v| i64::try_from(v).ok()),
                    ordinal_position: ordinal as i32,
                }
            })
            .collect();

        if columns.is_empty() {
            return Err(DbError::Query(format!("table '{}' not found", table)));
        }

        Ok(TableSchema {
            schema_name: resolved_schema,
            table_name: bare_table.to_string(),
            columns,
            inferred: false,
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    fn introspection(&self) -> Option<&dyn ServerIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl ServerIntrospection for MySqlConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.query("SHOW DATABASES")
            .await
            .map_err(|e| DbError::query("Failed to list databases", e))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.ping()
            .await
            .map_err(|e| DbError::connection("MySQL ping failed", e))
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let mut conn = self.conn().await?;
        let row: Option<(String, Option<String>, Option<String>)> = conn
            .query_first("SELECT VERSION(), DATABASE(), @@version_comment")
            .await
            .map_err(|e| DbError::query("Failed to read server version", e))?;
        let (version, database, comment) =
            row.ok_or_else(|| DbError::Query("No result from version query".to_string()))?;

        let product = if version.to_lowercase().contains("mariadb") {
            "MariaDB"
        } else {
            "MySQL"
        };
        Ok(ServerInfo {
            product: product.to_string(),
            version,
            database,
            details: comment.map(|c| serde_json::json!({ "version_comment": c })),
        })
    }
}
