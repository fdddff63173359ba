use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ensure_param_count, BackendKind, DatabaseConnector, ServerIntrospection};
use crate::db::config::FileConfig;
use crate::db::schema::{ColumnInfo, FieldInfo, KeyRole, QueryResult, Row, ServerInfo, TableSchema};
use crate::db::sql_text::leading_keyword;
use crate::error::{DbError, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::Value;

/// SQLite connector using rusqlite.
///
/// rusqlite is synchronous, so every call runs on the blocking pool behind a
/// shared mutex-guarded connection.
pub struct SqliteConnector {
    config: FileConfig,
    conn: Option<Arc<Mutex<Connection>>>,
    last_error: Option<String>,
}

impl SqliteConnector {
    pub fn new(config: FileConfig) -> Self {
        Self {
            config,
            conn: None,
            last_error: None,
        }
    }

    fn path(&self) -> &str {
        self.config.path.as_deref().unwrap_or(":memory:")
    }

    fn open(path: &str, read_only: bool, busy_timeout_ms: u64) -> Result<Connection> {
        let conn = if read_only {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        } else {
            Connection::open(path)
        }
        .map_err(|e| DbError::connection("Failed to open SQLite database", e))?;

        if busy_timeout_ms > 0 {
            conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
                .map_err(|e| DbError::connection("Failed to set busy timeout", e))?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| DbError::connection("Failed to enable foreign keys", e))?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| DbError::connection("SQLite liveness probe failed", e))?;
        Ok(conn)
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self
            .conn
            .clone()
            .ok_or_else(|| DbError::Connection("Not connected to SQLite".to_string()))?;
        tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|e| DbError::Internal(format!("Lock error: {}", e)))?;
            f(&c)
        })
        .await
        .map_err(|e| DbError::Internal(format!("spawn_blocking join error: {}", e)))?
    }
}

fn json_to_sqlite(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn split_table_name(table: &str, database: Option<&str>) -> (String, String) {
    match table.split_once('.') {
        Some((schema, name)) => (schema.to_string(), name.to_string()),
        None => (database.unwrap_or("main").to_string(), table.to_string()),
    }
}

fn execute_statement(c: &Connection, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let mut stmt = c
        .prepare(sql)
        .map_err(|e| DbError::query("Failed to prepare statement", e))?;
    ensure_param_count(stmt.parameter_count(), params.len())?;
    let bound = params_from_iter(params.iter().map(json_to_sqlite));

    let column_count = stmt.column_count();
    if column_count == 0 {
        let affected = stmt
            .execute(bound)
            .map_err(|e| DbError::query("Failed to execute statement", e))?;
        let last_insert_id = match leading_keyword(sql).as_deref() {
            Some("INSERT") | Some("REPLACE") => Some(Value::from(c.last_insert_rowid())),
            _ => None,
        };
        return Ok(QueryResult::affected(affected as u64, last_insert_id));
    }

    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt
        .query(bound)
        .map_err(|e| DbError::query("Failed to execute query", e))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| DbError::query("Failed to read row", e))?
    {
        let mut map = Row::new();
        for (idx, name) in names.iter().enumerate() {
            let value = row
                .get_ref(idx)
                .map_err(|e| DbError::query("Failed to read column", e))?;
            map.insert(name.clone(), value_ref_to_json(value));
        }
        out.push(map);
    }

    let fields = names.into_iter().map(|n| FieldInfo::new(n, None)).collect();
    Ok(QueryResult::from_rows(out, Some(fields)))
}

fn describe_table(c: &Connection, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
    let foreign: HashSet<String> = c
        .prepare("SELECT \"from\" FROM pragma_foreign_key_list(?1, ?2)")
        .and_then(|mut stmt| {
            let names = stmt
                .query_map([table, schema], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>();
            names
        })
        .map_err(|e| DbError::query("Failed to read foreign keys", e))?;

    // Single-column UNIQUE constraints only
    let unique: HashSet<String> = c
        .prepare(
            "SELECT ii.name FROM pragma_index_list(?1, ?2) AS il \
             JOIN pragma_index_info(il.name, ?2) AS ii \
             WHERE il.\"unique\" = 1 AND il.origin = 'u' \
               AND (SELECT COUNT(*) FROM pragma_index_info(il.name, ?2)) = 1",
        )
        .and_then(|mut stmt| {
            let names = stmt
                .query_map([table, schema], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>();
            names
        })
        .map_err(|e| DbError::query("Failed to read unique constraints", e))?;

    let mut stmt = c
        .prepare(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk \
             FROM pragma_table_info(?1, ?2) ORDER BY cid",
        )
        .map_err(|e| DbError::query("Failed to describe table", e))?;

    let columns = stmt
        .query_map([table, schema], |row| {
            let cid: i32 = row.get(0)?;
            let name: String = row.get(1)?;
            let data_type: String = row.get(2)?;
            let not_null: i32 = row.get(3)?;
            let default_value: Option<String> = row.get(4)?;
            let pk: i32 = row.get(5)?;
            Ok((cid, name, data_type, not_null, default_value, pk))
        })
        .map_err(|e| DbError::query("Failed to describe table", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| DbError::query("Failed to read column info", e))?
        .into_iter()
        .map(|(cid, name, data_type, not_null, default_value, pk)| {
            let key = if pk > 0 {
                KeyRole::Primary
            } else if foreign.contains(&name) {
                KeyRole::Foreign
            } else if unique.contains(&name) {
                KeyRole::Unique
            } else {
                KeyRole::None
            };
            ColumnInfo {
                name,
                data_type,
                is_nullable: not_null == 0 && pk == 0,
                default_value,
                key,
                max_length: None,
                ordinal_position: cid + 1,
            }
        })
        .collect();

    Ok(columns)
}

#[async_trait]
impl DatabaseConnector for SqliteConnector {
    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await?;

        let path = self.path().to_string();
        let read_only = self.config.read_only;
        let busy_timeout = self.config.options.connect_timeout_ms;
        let opened = tokio::task::spawn_blocking(move || Self::open(&path, read_only, busy_timeout))
            .await
            .map_err(|e| DbError::Internal(format!("spawn_blocking join error: {}", e)))
            .and_then(|r| r);

        match opened {
            Ok(conn) => {
                log::debug!("Opened SQLite database at {}", self.path());
                self.conn = Some(Arc::new(Mutex::new(conn)));
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
        // The connection closes when the last handle is dropped
        self.conn = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn test_connection(&mut self) -> bool {
        let probe = self
            .run_blocking(|c| {
                c.query_row("SELECT 1", [], |_| Ok(()))
                    .map_err(|e| DbError::connection("SQLite liveness probe failed", e))
            })
            .await;
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
        let sql = statement.to_string();
        let params = params.to_vec();
        self.run_blocking(move |c| execute_statement(c, &sql, &params))
            .await
    }

    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote_ident(database.unwrap_or("main"))
        );
        self.run_blocking(move |c| {
            let mut stmt = c
                .prepare(&sql)
                .map_err(|e| DbError::query("Failed to list tables", e))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| DbError::query("Failed to list tables", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| DbError::query("Failed to read table names", e))?;
            Ok(names)
        })
        .await
    }

    async fn get_table_schema(&self, table: &str, database: Option<&str>) -> Result<TableSchema> {
        let (schema, name) = split_table_name(table, database);
        let requested = table.to_string();
        self.run_blocking(move |c| {
            let columns = describe_table(c, &schema, &name)?;
            if columns.is_empty() {
                return Err(DbError::Query(format!("table '{}' not found", requested)));
            }
            Ok(TableSchema {
                schema_name: Some(schema),
                table_name: name,
                columns,
                inferred: false,
            })
        })
        .await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn introspection(&self) -> Option<&dyn ServerIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl ServerIntrospection for SqliteConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.run_blocking(|c| {
            let mut stmt = c
                .prepare("SELECT name FROM pragma_database_list ORDER BY seq")
                .map_err(|e| DbError::query("Failed to list databases", e))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| DbError::query("Failed to list databases", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| DbError::query("Failed to read database names", e))?;
            Ok(names)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.run_blocking(|c| {
            c.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| DbError::connection("SQLite ping failed", e))
        })
        .await
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let path = self.path().to_string();
        let read_only = self.config.read_only;
        let version = self
            .run_blocking(|c| {
                c.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
                    .map_err(|e| DbError::query("Failed to read SQLite version", e))
            })
            .await?;
        Ok(ServerInfo {
            product: "SQLite".to_string(),
            version,
            database: Some(path),
            details: Some(serde_json::json!({ "read_only": read_only })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_config(path: &std::path::Path) -> FileConfig {
        FileConfig {
            path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    async fn connected(dir: &tempfile::TempDir) -> SqliteConnector {
        let mut connector = SqliteConnector::new(file_config(&dir.path().join("test.db")));
        connector.connect().await.unwrap();
        connector
            .query(
                "CREATE TABLE teams (id INTEGER PRIMARY KEY, code TEXT NOT NULL UNIQUE)",
                &[],
            )
            .await
            .unwrap();
        connector
            .query(
                "CREATE TABLE players (\
                   id INTEGER PRIMARY KEY, \
                   name TEXT NOT NULL, \
                   rating REAL DEFAULT 1.0, \
                   avatar BLOB, \
                   team_id INTEGER REFERENCES teams(id))",
                &[],
            )
            .await
            .unwrap();
        connector
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connected(&dir).await;

        let insert = connector
            .query("INSERT INTO teams (code) VALUES (?)", &[json!("red")])
            .await
            .unwrap();
        assert_eq!(insert.affected_rows, Some(1));
        assert_eq!(insert.last_insert_id, Some(json!(1)));

        connector
            .query(
                "INSERT INTO players (name, rating, avatar, team_id) VALUES (?, ?, X'CAFE', ?)",
                &[json!("Ada"), json!(2.5), json!(1)],
            )
            .await
            .unwrap();

        let result = connector
            .query("SELECT name, rating, avatar, team_id FROM players WHERE name = ?", &[json!("Ada")])
            .await
            .unwrap();
        assert_eq!(result.row_count(), 1);
        let row = &result.rows[0];
        assert_eq!(row["name"], json!("Ada"));
        assert_eq!(row["rating"], json!(2.5));
        assert_eq!(row["avatar"], json!("cafe"));
        assert_eq!(row["team_id"], json!(1));
        let names: Vec<_> = result.fields.unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["name", "rating", "avatar", "team_id"]);
    }

    #[tokio::test]
    async fn test_update_has_no_insert_id() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connected(&dir).await;
        connector
            .query("INSERT INTO teams (code) VALUES ('a'), ('b')", &[])
            .await
            .unwrap();
        let result = connector
            .query("UPDATE teams SET code = code || '!'", &[])
            .await
            .unwrap();
        assert_eq!(result.affected_rows, Some(2));
        assert_eq!(result.last_insert_id, None);
    }

    #[tokio::test]
    async fn test_param_count_checked() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connected(&dir).await;
        let err = connector
            .query("SELECT * FROM teams WHERE id = ?", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query(_)));
    }

    #[tokio::test]
    async fn test_list_tables_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connected(&dir).await;

        let tables = connector.list_tables(None).await.unwrap();
        assert_eq!(tables, vec!["players", "teams"]);

        let schema = connector.get_table_schema("players", None).await.unwrap();
        assert_eq!(schema.schema_name.as_deref(), Some("main"));
        assert_eq!(schema.columns.len(), 5);
        assert_eq!(schema.columns[0].key, KeyRole::Primary);
        assert!(!schema.columns[0].is_nullable);
        assert!(!schema.columns[1].is_nullable);
        assert_eq!(schema.columns[2].default_value.as_deref(), Some("1.0"));
        assert_eq!(schema.columns[4].key, KeyRole::Foreign);
        assert_eq!(schema.columns[4].ordinal_position, 5);

        let teams = connector.get_table_schema("main.teams", None).await.unwrap();
        assert_eq!(teams.columns[1].key, KeyRole::Unique);
    }

    #[tokio::test]
    async fn test_missing_table_schema() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connected(&dir).await;
        let err = connector.get_table_schema("ghosts", None).await.unwrap_err();
        assert!(err.to_string().contains("ghosts"));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        drop(connected(&dir).await);

        let mut config = file_config(&path);
        config.read_only = true;
        let mut connector = SqliteConnector::new(config);
        connector.connect().await.unwrap();
        assert!(connector.query("SELECT * FROM teams", &[]).await.is_ok());
        assert!(connector
            .query("INSERT INTO teams (code) VALUES ('x')", &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_introspection() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connected(&dir).await;
        let introspection = connector.introspection().unwrap();
        assert_eq!(introspection.list_databases().await.unwrap(), vec!["main"]);
        introspection.ping().await.unwrap();
        let info = introspection.server_info().await.unwrap();
        assert_eq!(info.product, "SQLite");
        assert!(info.version.starts_with('3'));
    }

    #[tokio::test]
    async fn test_disconnect_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = connected(&dir).await;
        assert!(connector.test_connection().await);
        connector.disconnect().await.unwrap();
        assert!(!connector.is_connected());
        assert!(!connector.test_connection().await);
        assert!(connector.query("SELECT 1", &[]).await.is_err());
    }
}
