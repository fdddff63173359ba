use std::str::FromStr;
use std::time::Duration;

use super::{
    ensure_param_count, with_connect_timeout, BackendKind, DatabaseConnector, ServerIntrospection,
};
use crate::db::config::ServerConfig;
use crate::db::schema::{
    decimal_to_json, ColumnInfo, FieldInfo, KeyRole, QueryResult, Row, ServerInfo, TableSchema,
};
use crate::db::sql_text::{translate_placeholders, PlaceholderStyle};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, SslMode, Timeouts,
};
use serde_json::Value;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use tokio_postgres_rustls::MakeRustlsConnect;

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL connector using a deadpool-postgres pool
pub struct PostgresConnector {
    config: ServerConfig,
    pool: Option<Pool>,
    last_error: Option<String>,
}

impl PostgresConnector {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            pool: None,
            last_error: None,
        }
    }

    fn build_pool_config(&self) -> Config {
        let options = &self.config.options;
        let timeout =
            (options.connect_timeout_ms > 0).then(|| Duration::from_millis(options.connect_timeout_ms));

        let mut cfg = Config::new();
        cfg.host = self.config.host.clone();
        cfg.port = self.config.port;
        cfg.user = self.config.user.clone();
        cfg.password = self.config.password.clone();
        cfg.dbname = self.config.database.clone();
        cfg.connect_timeout = timeout;
        cfg.ssl_mode = Some(if options.ssl {
            SslMode::Require
        } else {
            SslMode::Disable
        });

        cfg.pool = Some(PoolConfig {
            max_size: options.pool_size,
            timeouts: Timeouts {
                wait: timeout,
                create: timeout,
                recycle: Some(Duration::from_secs(5)),
            },
            ..Default::default()
        });
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        cfg
    }

    fn create_pool(&self) -> Result<Pool> {
        let cfg = self.build_pool_config();
        let created = if self.config.options.ssl {
            let _ = rustls::crypto::ring::default_provider().install_default();
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            cfg.create_pool(Some(Runtime::Tokio1), MakeRustlsConnect::new(tls_config))
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        };
        created.map_err(|e| DbError::connection("Failed to create PostgreSQL pool", e))
    }

    fn pool(&self) -> Result<&Pool> {
        self.pool
            .as_ref()
            .ok_or_else(|| DbError::Connection("Not connected to PostgreSQL".to_string()))
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        self.pool()?
            .get()
            .await
            .map_err(|e| DbError::connection("Failed to acquire PostgreSQL connection", e))
    }

    async fn ping_pool(pool: &Pool) -> Result<()> {
        let client = pool
            .get()
            .await
            .map_err(|e| DbError::connection("Failed to connect to PostgreSQL", e))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| DbError::connection("PostgreSQL liveness probe failed", e))?;
        Ok(())
    }

    /// Run a query with already-typed parameters and return the raw rows.
    async fn fetch(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        let client = self.client().await?;
        client
            .query(sql, params)
            .await
            .map_err(|e| DbError::query("PostgreSQL query failed", e))
    }
}

/// Bind a JSON parameter as the type the server inferred for its placeholder.
fn json_to_sql(position: usize, value: &Value, ty: &Type) -> Result<BoxedParam> {
    let mismatch = || {
        DbError::Query(format!(
            "parameter {} cannot be bound as {}",
            position + 1,
            ty.name()
        ))
    };

    if value.is_null() {
        return Ok(typed_null(ty));
    }

    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let boxed: BoxedParam = match *ty {
        Type::BOOL => Box::new(value.as_bool().ok_or_else(mismatch)?),
        Type::INT2 => Box::new(int_param::<i16>(value, &text).ok_or_else(mismatch)?),
        Type::INT4 => Box::new(int_param::<i32>(value, &text).ok_or_else(mismatch)?),
        Type::INT8 => Box::new(int_param::<i64>(value, &text).ok_or_else(mismatch)?),
        Type::OID => Box::new(int_param::<u32>(value, &text).ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(float_param(value, &text).ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => Box::new(float_param(value, &text).ok_or_else(mismatch)?),
        Type::NUMERIC => {
            Box::new(rust_decimal::Decimal::from_str(&text).map_err(|_| mismatch())?)
        }
        Type::JSON | Type::JSONB => Box::new(value.clone()),
        Type::UUID => Box::new(uuid::Uuid::parse_str(&text).map_err(|_| mismatch())?),
        Type::DATE => Box::new(
            chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|_| mismatch())?,
        ),
        Type::TIME => Box::new(
            chrono::NaiveTime::parse_from_str(&text, "%H:%M:%S%.f").map_err(|_| mismatch())?,
        ),
        Type::TIMESTAMP => Box::new(parse_naive_datetime(&text).ok_or_else(mismatch)?),
        Type::TIMESTAMPTZ => Box::new(
            chrono::DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|_| mismatch())?,
        ),
        Type::BYTEA => Box::new(hex::decode(text.trim_start_matches("\\x")).map_err(|_| mismatch())?),
        _ => Box::new(text),
    };
    Ok(boxed)
}

fn typed_null(ty: &Type) -> BoxedParam {
    match *ty {
        Type::BOOL => Box::new(Option::<bool>::None),
        Type::INT2 => Box::new(Option::<i16>::None),
        Type::INT4 => Box::new(Option::<i32>::None),
        Type::INT8 => Box::new(Option::<i64>::None),
        Type::OID => Box::new(Option::<u32>::None),
        Type::FLOAT4 => Box::new(Option::<f32>::None),
        Type::FLOAT8 => Box::new(Option::<f64>::None),
        Type::NUMERIC => Box::new(Option::<rust_decimal::Decimal>::None),
        Type::JSON | Type::JSONB => Box::new(Option::<Value>::None),
        Type::UUID => Box::new(Option::<uuid::Uuid>::None),
        Type::DATE => Box::new(Option::<chrono::NaiveDate>::None),
        Type::TIME => Box::new(Option::<chrono::NaiveTime>::None),
        Type::TIMESTAMP => Box::new(Option::<chrono::NaiveDateTime>::None),
        Type::TIMESTAMPTZ => Box::new(Option::<chrono::DateTime<chrono::Utc>>::None),
        Type::BYTEA => Box::new(Option::<Vec<u8>>::None),
        _ => Box::new(Option::<String>::None),
    }
}

fn int_param<T>(value: &Value, text: &str) -> Option<T>
where
    T: TryFrom<i64> + FromStr,
{
    match value {
        Value::Number(n) => n.as_i64().and_then(|v| T::try_from(v).ok()),
        Value::String(_) => text.trim().parse().ok(),
        _ => None,
    }
}

fn float_param(value: &Value, text: &str) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(_) => text.trim().parse().ok(),
        _ => None,
    }
}

fn parse_naive_datetime(text: &str) -> Option<chrono::NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(text, fmt).ok())
}

/// Convert a tokio-postgres row to our Row type
fn row_to_map(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| (col.name().to_string(), column_to_json(row, idx, col.type_())))
        .collect()
}

fn column_to_json(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::OID => get::<u32>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| serde_json::json!(v)),
        Type::FLOAT8 => get::<f64>(row, idx).map(|v| serde_json::json!(v)),
        Type::NUMERIC => {
            get::<rust_decimal::Decimal>(row, idx).map(|d| decimal_to_json(&d.to_string()))
        }
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        Type::TIMESTAMP => {
            get::<chrono::NaiveDateTime>(row, idx).map(|t| Value::String(t.to_string()))
        }
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|t| Value::String(t.to_rfc3339())),
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(|b| Value::String(hex::encode(b))),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            get::<Vec<Option<String>>>(row, idx).map(|v| serde_json::json!(v))
        }
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx).map(|v| serde_json::json!(v)),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx).map(|v| serde_json::json!(v)),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn split_table_name<'a>(table: &'a str, database: Option<&'a str>) -> (&'a str, &'a str) {
    match table.split_once('.') {
        Some((schema, name)) => (schema, name),
        None => (database.unwrap_or("public"), table),
    }
}

#[async_trait]
impl DatabaseConnector for PostgresConnector {
    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await?;

        let timeout = self.config.options.connect_timeout_ms;
        let opened = match self.create_pool() {
            Ok(pool) => {
                with_connect_timeout(timeout, async move {
                    Self::ping_pool(&pool).await?;
                    Ok(pool)
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
            pool.close();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.as_ref().map_or(false, |p| !p.is_closed())
    }

    async fn test_connection(&mut self) -> bool {
        let probe = match self.pool() {
            Ok(pool) => Self::ping_pool(pool).await,
            Err(e) => Err(e),
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
        let (sql, expected) = translate_placeholders(statement, PlaceholderStyle::Dollar);
        ensure_param_count(expected, params.len())?;

        let client = self.client().await?;
        let stmt = client
            .prepare_cached(&sql)
            .await
            .map_err(|e| DbError::query("Failed to prepare statement", e))?;

        let boxed: Vec<BoxedParam> = stmt
            .params()
            .iter()
            .zip(params)
            .enumerate()
            .map(|(i, (ty, value))| json_to_sql(i, value, ty))
            .collect::<Result<_>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        if stmt.columns().is_empty() {
            let affected = client
                .execute(&stmt, &refs)
                .await
                .map_err(|e| DbError::query("Failed to execute statement", e))?;
            return Ok(QueryResult::affected(affected, None));
        }

        let rows = client
            .query(&stmt, &refs)
            .await
            .map_err(|e| DbError::query("Failed to execute query", e))?;
        let fields = stmt
            .columns()
            .iter()
            .map(|c| FieldInfo::new(c.name(), Some(c.type_().name().to_string())))
            .collect();

        Ok(QueryResult::from_rows(
            rows.iter().map(row_to_map).collect(),
            Some(fields),
        ))
    }

    /// `database` names a schema; PostgreSQL cannot read another database's
    /// catalog over the same session.
    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let rows = self
            .fetch(
                "SELECT table_schema::text, table_name::text \
                 FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                   AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                   AND ($1::text IS NULL OR table_schema = $1) \
                 ORDER BY 1, 2",
                &[&database],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let schema: String = row.get(0);
                let name: String = row.get(1);
                if schema == "public" {
                    name
                } else {
                    format!("{}.{}", schema, name)
                }
            })
            .collect())
    }

    async fn get_table_schema(&self, table: &str, database: Option<&str>) -> Result<TableSchema> {
        let (schema_name, bare_table) = split_table_name(table, database);

        // information_schema columns are domain types, cast for plain decoding
        let rows = self
            .fetch(
                "SELECT c.column_name::text, c.data_type::text, c.is_nullable::text, \
                        c.character_maximum_length::int8, c.column_default::text, \
                        c.ordinal_position::int4, \
                        (SELECT tc.constraint_type::text \
                           FROM information_schema.table_constraints tc \
                           JOIN information_schema.key_column_usage kcu \
                             ON tc.constraint_name = kcu.constraint_name \
                            AND tc.table_schema = kcu.table_schema \
                            AND tc.table_name = kcu.table_name \
                          WHERE kcu.table_schema = c.table_schema \
                            AND kcu.table_name = c.table_name \
                            AND kcu.column_name = c.column_name \
                          ORDER BY CASE tc.constraint_type WHEN 'PRIMARY KEY' THEN 0 \
                                                           WHEN 'UNIQUE' THEN 1 ELSE 2 END \
                          LIMIT 1) \
                 FROM information_schema.columns c \
                 WHERE c.table_schema = $1 AND c.table_name = $2 \
                 ORDER BY c.ordinal_position",
                &[&schema_name, &bare_table],
            )
            .await?;

        let columns: Vec<ColumnInfo> = rows
            .iter()
            .map(|row| {
                let nullable: String = row.get(2);
                let key: Option<String> = row.get(6);
                ColumnInfo {
                    name: row.get(0),
                    data_type: row.get(1),
                    is_nullable: nullable == "YES",
                    default_value: row.get(4),
                    key: key.as_deref().map(KeyRole::from_constraint).unwrap_or_default(),
                    max_length: row.get(3),
                    ordinal_position: row.get(5),
                }
            })
            .collect();

        if columns.is_empty() {
            return Err(DbError::Query(format!("table '{}' not found", table)));
        }

        Ok(TableSchema {
            schema_name: Some(schema_name.to_string()),
            table_name: bare_table.to_string(),
            columns,
            inferred: false,
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn introspection(&self) -> Option<&dyn ServerIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl ServerIntrospection for PostgresConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = self
            .fetch(
                "SELECT datname::text FROM pg_database WHERE NOT datistemplate ORDER BY datname",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn ping(&self) -> Result<()> {
        Self::ping_pool(self.pool()?).await
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let rows = self
            .fetch(
                "SELECT version(), current_database()::text, current_setting('server_version')",
                &[],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::Query("No result from version query".to_string()))?;

        let banner: String = row.get(0);
        Ok(ServerInfo {
            product: "PostgreSQL".to_string(),
            version: row.get(2),
            database: row.get(1),
            details: Some(serde_json::json!({ "banner": banner })),
        })
    }
}
