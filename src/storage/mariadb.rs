//! MariaDB Storage
//!
//! Executes statements against a local MariaDB/MySQL server and produces or
//! loads full logical dumps.

use std::collections::BTreeSet;
use std::time::Duration;
use sqlx::mysql::{MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Connection, Executor, MySqlPool, Row as _, TypeInfo};

use super::{classify, sql_literal, storage_error, DumpSnapshot, QueryOutput, Row, StatementKind, StorageAdapter, TableDump};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Databases that are never dumped or dropped
const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

/// Rows per INSERT when loading a snapshot
const INSERT_BATCH_ROWS: usize = 500;

/// Key marking a non-UTF-8 binary value in a dumped row
const BINARY_KEY: &str = "$binary";

/// MariaDB-backed storage adapter
pub struct MariaDbStorage {
    pool: MySqlPool,
    /// Database in scope, or every non-system database when `None`
    database: Option<String>,
}

impl MariaDbStorage {
    /// Connect a pool using the node's database configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url())
            .await?;

        Ok(Self {
            pool,
            database: config.database.clone(),
        })
    }

    /// Check if connection is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }

    /// Databases covered by dumps and restores
    async fn scoped_databases(&self, conn: &mut MySqlConnection) -> Result<Vec<String>> {
        if let Some(db) = &self.database {
            return Ok(vec![db.clone()]);
        }

        let rows = conn.fetch_all("SHOW DATABASES").await?;
        Ok(rows
            .iter()
            .filter_map(|row| text_column(row, 0))
            .filter(|db| !SYSTEM_DATABASES.contains(&db.to_ascii_lowercase().as_str()))
            .collect())
    }

    /// Base tables of one database
    async fn list_tables(conn: &mut MySqlConnection, database: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SHOW FULL TABLES FROM {} WHERE Table_type = 'BASE TABLE'",
            quote_ident(database)
        );
        let rows = conn.fetch_all(sql.as_str()).await?;
        Ok(rows.iter().filter_map(|row| text_column(row, 0)).collect())
    }

    /// Split a dump key into database and table
    fn split_key<'a>(&'a self, key: &'a str) -> Result<(&'a str, &'a str)> {
        match key.split_once('.') {
            Some((db, table)) => Ok((db, table)),
            None => match &self.database {
                Some(db) => Ok((db.as_str(), key)),
                None => Err(storage_error(format!("dump key '{}' has no database", key))),
            },
        }
    }

    async fn load_snapshot(&self, conn: &mut MySqlConnection, snapshot: &DumpSnapshot) -> Result<()> {
        // Drop every table in scope, including databases only the snapshot names
        let mut databases: BTreeSet<String> = self.scoped_databases(conn).await?.into_iter().collect();
        for key in snapshot.tables.keys() {
            databases.insert(self.split_key(key)?.0.to_string());
        }

        for db in &databases {
            conn.execute(format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(db)).as_str()).await?;
            for table in Self::list_tables(conn, db).await? {
                let sql = format!("DROP TABLE IF EXISTS {}.{}", quote_ident(db), quote_ident(&table));
                conn.execute(sql.as_str()).await?;
            }
        }

        for (key, dump) in &snapshot.tables {
            let (db, table) = self.split_key(key)?;
            // SHOW CREATE TABLE output is unqualified
            conn.execute(format!("USE {}", quote_ident(db)).as_str()).await?;
            conn.execute(dump.schema.as_str()).await.map_err(|e| {
                Error::Storage(format!("failed to recreate {}: {}", key, e))
            })?;

            for batch in dump.rows.chunks(INSERT_BATCH_ROWS) {
                if let Some(sql) = insert_statement(db, table, batch) {
                    conn.execute(sql.as_str()).await.map_err(|e| {
                        Error::Storage(format!("failed to load rows into {}: {}", key, e))
                    })?;
                }
            }
            tracing::debug!("Restored {} ({} rows)", key, dump.rows.len());
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageAdapter for MariaDbStorage {
    async fn execute(&self, sql: &str) -> Result<QueryOutput> {
        let mut conn = self.pool.acquire().await?;
        let mut output = QueryOutput::default();

        // sqlx runs one statement per call
        for stmt in split_sql_statements(sql) {
            tracing::debug!("Executing: {}", log_preview(stmt, 100));

            output = match classify(stmt) {
                StatementKind::Read => {
                    let rows = (&mut *conn)
                        .fetch_all(stmt)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                    QueryOutput {
                        rows: Some(rows.iter().map(row_to_json).collect()),
                        affected_rows: 0,
                    }
                }
                StatementKind::Write => {
                    let done = (&mut *conn)
                        .execute(stmt)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                    QueryOutput { rows: None, affected_rows: done.rows_affected() }
                }
            };
        }

        Ok(output)
    }

    async fn full_dump(&self) -> Result<DumpSnapshot> {
        let mut conn = self.pool.acquire().await?;
        let mut snapshot = DumpSnapshot::default();

        for db in self.scoped_databases(&mut conn).await? {
            for table in Self::list_tables(&mut conn, &db).await? {
                let qualified = format!("{}.{}", quote_ident(&db), quote_ident(&table));

                let create = (&mut *conn)
                    .fetch_one(format!("SHOW CREATE TABLE {}", qualified).as_str())
                    .await?;
                let schema = text_column(&create, 1)
                    .ok_or_else(|| storage_error(format!("no DDL returned for {}", qualified)))?;

                let rows = (&mut *conn)
                    .fetch_all(format!("SELECT * FROM {}", qualified).as_str())
                    .await?;

                snapshot.tables.insert(
                    format!("{}.{}", db, table),
                    TableDump { schema, rows: rows.iter().map(row_to_json).collect() },
                );
            }
        }

        tracing::info!(
            "Dumped {} tables ({} rows)",
            snapshot.tables.len(),
            snapshot.row_count()
        );
        Ok(snapshot)
    }

    async fn restore_from_dump(&self, snapshot: &DumpSnapshot) -> Result<()> {
        // Detached: the session is switched between databases with USE
        let mut conn = self.pool.acquire().await?.detach();

        conn.execute("SET FOREIGN_KEY_CHECKS=0").await?;
        let loaded = self.load_snapshot(&mut conn, snapshot).await;
        let reenabled = conn.execute("SET FOREIGN_KEY_CHECKS=1").await;

        if let Err(e) = conn.close().await {
            tracing::debug!("Closing restore connection: {}", e);
        }

        loaded?;
        reenabled?;
        tracing::info!(
            "Restored snapshot: {} tables, {} rows",
            snapshot.tables.len(),
            snapshot.row_count()
        );
        Ok(())
    }
}

/// At most `max` characters of a statement, cut on a character boundary
fn log_preview(stmt: &str, max: usize) -> &str {
    match stmt.char_indices().nth(max) {
        Some((end, _)) => &stmt[..end],
        None => stmt,
    }
}

/// Quote an identifier with backticks
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Read a column as text regardless of its declared type
fn text_column(row: &MySqlRow, index: usize) -> Option<String> {
    row.try_get_unchecked::<Option<String>, _>(index)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get_unchecked::<Option<Vec<u8>>, _>(index)
                .ok()
                .flatten()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        })
}

/// Convert a result row to a JSON row, using the column type to pick a
/// representation
fn row_to_json(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .map(|col| {
            let value = column_value(row, col.ordinal(), col.type_info().name());
            (col.name().to_string(), value)
        })
        .collect()
}

fn column_value(row: &MySqlRow, index: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    let type_name = type_name.to_ascii_uppercase();
    let typed = if type_name == "BOOLEAN" {
        row.try_get::<Option<bool>, _>(index).ok().map(|v| v.map(Value::from))
    } else if type_name.contains("INT") && type_name.contains("UNSIGNED") {
        row.try_get::<Option<u64>, _>(index).ok().map(|v| v.map(Value::from))
    } else if type_name.contains("INT") {
        row.try_get::<Option<i64>, _>(index).ok().map(|v| v.map(Value::from))
    } else if type_name == "FLOAT" || type_name == "DOUBLE" {
        row.try_get::<Option<f64>, _>(index).ok().map(|v| v.map(Value::from))
    } else if type_name.contains("BLOB") || type_name.contains("BINARY") {
        row.try_get_unchecked::<Option<Vec<u8>>, _>(index)
            .ok()
            .map(|v| v.map(binary_value))
    } else {
        None
    };

    match typed {
        Some(Some(value)) => value,
        Some(None) => Value::Null,
        // Text protocol: everything else (DECIMAL, dates, strings, JSON) as text
        None => match row.try_get_unchecked::<Option<String>, _>(index) {
            Ok(Some(s)) => Value::String(s),
            Ok(None) => Value::Null,
            Err(_) => match row.try_get_unchecked::<Option<Vec<u8>>, _>(index) {
                Ok(Some(bytes)) => binary_value(bytes),
                _ => {
                    tracing::warn!("Could not decode column {} of type {}", index, type_name);
                    Value::Null
                }
            },
        },
    }
}

fn binary_value(bytes: Vec<u8>) -> serde_json::Value {
    match String::from_utf8(bytes) {
        Ok(s) => serde_json::Value::String(s),
        Err(e) => serde_json::json!({ BINARY_KEY: hex::encode(e.into_bytes()) }),
    }
}

/// SQL literal for a dumped value, restoring binary markers
fn dump_literal(value: &serde_json::Value) -> String {
    if let Some(obj) = value.as_object() {
        if obj.len() == 1 {
            if let Some(hex) = obj.get(BINARY_KEY).and_then(|v| v.as_str()) {
                return format!("X'{}'", hex);
            }
        }
    }
    sql_literal(value)
}

/// Multi-row INSERT for a batch of dumped rows
fn insert_statement(database: &str, table: &str, rows: &[Row]) -> Option<String> {
    let first = rows.first()?;
    let columns: Vec<&String> = first.keys().collect();
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

    let tuples = rows
        .iter()
        .map(|row| {
            let values = columns
                .iter()
                .map(|c| row.get(c.as_str()).map(dump_literal).unwrap_or_else(|| "NULL".to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", values)
        })
        .collect::<Vec<_>>()
        .join(", ");

    Some(format!(
        "INSERT INTO {}.{} ({}) VALUES {}",
        quote_ident(database),
        quote_ident(table),
        column_list,
        tuples
    ))
}

/// Split SQL string on semicolons, respecting string literals
/// This handles cases like: "USE db; CREATE TABLE foo (name VARCHAR(50));"
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut string_char = '"';
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_string {
            if c == '\\' {
                chars.next();
            } else if c == string_char {
                if chars.peek().map(|(_, nc)| *nc == string_char).unwrap_or(false) {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
        } else {
            match c {
                '\'' | '"' | '`' => {
                    in_string = true;
                    string_char = c;
                }
                ';' => {
                    let stmt = sql[start..i].trim();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
    }

    let remaining = sql[start..].trim();
    if !remaining.is_empty() {
        statements.push(remaining);
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let parts = split_sql_statements("USE ddb; INSERT INTO t VALUES ('a;b'); ");
        assert_eq!(parts, vec!["USE ddb", "INSERT INTO t VALUES ('a;b')"]);

        let parts = split_sql_statements("INSERT INTO t VALUES ('it''s; fine', 'x\\'y;z')");
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn test_log_preview_respects_char_boundaries() {
        let stmt = format!("INSERT INTO clientes (nome) VALUES ('{}')", "João".repeat(40));
        let preview = log_preview(&stmt, 100);
        assert_eq!(preview.chars().count(), 100);
        assert!(stmt.starts_with(preview));

        assert_eq!(log_preview("SELECT 1", 100), "SELECT 1");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("clientes"), "`clientes`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_insert_statement() {
        let mut row = Row::new();
        row.insert("id".into(), serde_json::json!(1));
        row.insert("nome".into(), serde_json::json!("Ana"));
        row.insert("foto".into(), binary_value(vec![0xff, 0x00]));

        let sql = insert_statement("ddb", "clientes", &[row]).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `ddb`.`clientes` (`foto`, `id`, `nome`) VALUES (X'ff00', 1, 'Ana')"
        );
        assert!(insert_statement("ddb", "clientes", &[]).is_none());
    }
}
