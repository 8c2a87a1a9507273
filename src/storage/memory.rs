//! In-Memory Storage
//!
//! An in-process SQLite database in place of a local MariaDB server, for
//! demo clusters and tests. Statements use the SQLite dialect; `SHOW TABLES`
//! is accepted as well.

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, Statement};
use tokio::sync::Mutex;

use super::{storage_error, DumpSnapshot, QueryOutput, Row, StorageAdapter, TableDump};
use crate::error::{Error, Result};

/// User tables with their DDL
const LIST_TABLES: &str =
    "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";

/// Key marking a BLOB value in a dumped row
const BINARY_KEY: &str = "$binary";

/// In-process storage engine backed by an in-memory SQLite database
pub struct MemoryStorage {
    /// Database connection
    conn: Mutex<Connection>,
    /// Every statement passed to `execute`
    executed: Mutex<Vec<String>>,
}

impl MemoryStorage {
    /// Open an empty database
    pub fn new() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Mutex::new(conn),
            executed: Mutex::new(Vec::new()),
        })
    }

    /// Every statement passed to `execute`, in call order
    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }

    /// Rows of a table, `None` if it does not exist
    pub async fn table_rows(&self, table: &str) -> Option<Vec<Row>> {
        let conn = self.conn.lock().await;
        if !table_exists(&conn, table).ok()? {
            return None;
        }
        select_all(&conn, table).ok()
    }

    /// Names of all tables
    pub async fn table_names(&self) -> Vec<String> {
        let conn = self.conn.lock().await;
        list_tables(&conn)
            .map(|tables| tables.into_iter().map(|(name, _)| name).collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl StorageAdapter for MemoryStorage {
    async fn execute(&self, sql: &str) -> Result<QueryOutput> {
        self.executed.lock().await.push(sql.to_string());

        let conn = self.conn.lock().await;
        run_statement(&conn, sql)
    }

    async fn full_dump(&self) -> Result<DumpSnapshot> {
        let conn = self.conn.lock().await;
        let mut snapshot = DumpSnapshot::default();

        for (name, schema) in list_tables(&conn)? {
            let rows = select_all(&conn, &name)?;
            snapshot.tables.insert(name, TableDump { schema, rows });
        }
        Ok(snapshot)
    }

    async fn restore_from_dump(&self, snapshot: &DumpSnapshot) -> Result<()> {
        let mut conn = self.conn.lock().await;

        // Has no effect inside a transaction, so it wraps the whole load
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        let loaded = load_snapshot(&mut conn, snapshot);
        let reenabled = conn.execute_batch("PRAGMA foreign_keys = ON;");

        loaded?;
        reenabled?;
        tracing::debug!(
            "Restored snapshot: {} tables, {} rows",
            snapshot.tables.len(),
            snapshot.row_count()
        );
        Ok(())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

fn run_statement(conn: &Connection, sql: &str) -> Result<QueryOutput> {
    let sql = sql.trim().trim_end_matches(';').trim_end();

    if is_show_tables(sql) {
        let rows = list_tables(conn)?
            .into_iter()
            .map(|(name, _)| Row::from([("table".to_string(), serde_json::Value::String(name))]))
            .collect();
        return Ok(QueryOutput { rows: Some(rows), affected_rows: 0 });
    }

    let mut stmt = conn.prepare(sql)?;
    if stmt.column_count() > 0 {
        let rows = collect_rows(&mut stmt)?;
        return Ok(QueryOutput { rows: Some(rows), affected_rows: 0 });
    }

    let changed = stmt.execute([])?;
    // SQLite keeps the last DML count across DDL statements
    let affected_rows = if changes_rows(sql) { changed as u64 } else { 0 };
    Ok(QueryOutput { rows: None, affected_rows })
}

fn is_show_tables(sql: &str) -> bool {
    let words: Vec<&str> = sql.split_whitespace().collect();
    matches!(words.as_slice(), [show, tables] if show.eq_ignore_ascii_case("SHOW") && tables.eq_ignore_ascii_case("TABLES"))
}

fn changes_rows(sql: &str) -> bool {
    let keyword = sql.split_whitespace().next().unwrap_or_default();
    ["INSERT", "UPDATE", "DELETE", "REPLACE"]
        .iter()
        .any(|k| k.eq_ignore_ascii_case(keyword))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn list_tables(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(LIST_TABLES)?;
    let tables = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
    Ok(tables)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn select_all(conn: &Connection, table: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
    collect_rows(&mut stmt)
}

fn collect_rows(stmt: &mut Statement<'_>) -> Result<Vec<Row>> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();

    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (i, name) in names.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(i)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::json!({ BINARY_KEY: hex::encode(b) }),
    }
}

fn to_sql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Real).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Object(obj) => {
            let blob = obj
                .get(BINARY_KEY)
                .and_then(|v| v.as_str())
                .filter(|_| obj.len() == 1)
                .and_then(|h| hex::decode(h).ok());
            match blob {
                Some(bytes) => Value::Blob(bytes),
                None => Value::Text(value.to_string()),
            }
        }
        serde_json::Value::Array(_) => Value::Text(value.to_string()),
    }
}

/// Replace every table in one transaction; a failure leaves the old tables
fn load_snapshot(conn: &mut Connection, snapshot: &DumpSnapshot) -> Result<()> {
    let tx = conn.transaction()?;

    for (name, _) in list_tables(&tx)? {
        tx.execute_batch(&format!("DROP TABLE {}", quote_ident(&name)))?;
    }

    for (name, dump) in &snapshot.tables {
        tx.execute_batch(&dump.schema)
            .map_err(|e| storage_error(format!("failed to recreate {}: {}", name, e)))?;
        insert_rows(&tx, name, &dump.rows)
            .map_err(|e| storage_error(format!("failed to load rows into {}: {}", name, e)))?;
    }

    tx.commit()?;
    Ok(())
}

fn insert_rows(conn: &Connection, table: &str, rows: &[Row]) -> rusqlite::Result<()> {
    for row in rows {
        if row.is_empty() {
            conn.execute(&format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table)), [])?;
            continue;
        }

        let columns = row.keys().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=row.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", quote_ident(table), columns, placeholders);
        conn.execute(&sql, params_from_iter(row.values().map(to_sql)))?;
    }
    Ok(())
}
