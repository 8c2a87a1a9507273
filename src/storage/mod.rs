//! Storage Module
//!
//! The boundary to the local relational engine. The cluster layer only ever
//! executes statements, takes a full logical dump, and restores one.

mod mariadb;
mod memory;

pub use mariadb::MariaDbStorage;
pub use memory::MemoryStorage;

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single result row, column name to value
pub type Row = BTreeMap<String, serde_json::Value>;

/// Read/write classification of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

/// Leading keywords that mark a statement as a read
const READ_KEYWORDS: [&str; 4] = ["SELECT", "SHOW", "DESCRIBE", "EXPLAIN"];

/// Classify a statement by its leading keyword. Anything that is not
/// provably a read is a write.
pub fn classify(sql: &str) -> StatementKind {
    let keyword: String = sql
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();

    if READ_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(&keyword)) {
        StatementKind::Read
    } else {
        StatementKind::Write
    }
}

/// Successful statement output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    /// Result rows for reads
    pub rows: Option<Vec<Row>>,
    /// Rows changed by writes
    pub affected_rows: u64,
}

/// Status of an executed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryStatus {
    Ok,
    Error,
}

/// Result of a statement as seen by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub affected_rows: u64,
}

impl QueryResult {
    /// Successful result
    pub fn ok(output: QueryOutput) -> Self {
        Self {
            status: QueryStatus::Ok,
            rows: output.rows,
            message: None,
            affected_rows: output.affected_rows,
        }
    }

    /// Failed result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Error,
            rows: None,
            message: Some(message.into()),
            affected_rows: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == QueryStatus::Ok
    }
}

impl From<Result<QueryOutput>> for QueryResult {
    fn from(result: Result<QueryOutput>) -> Self {
        match result {
            Ok(output) => QueryResult::ok(output),
            Err(e) => QueryResult::error(e.to_string()),
        }
    }
}

/// Contents of one table in a dump
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    /// DDL that recreates the table
    pub schema: String,
    /// Rows in storage order
    pub rows: Vec<Row>,
}

/// Full logical dump, keyed by table-qualified name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpSnapshot {
    pub tables: BTreeMap<String, TableDump>,
}

impl DumpSnapshot {
    /// Total rows across all tables
    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }
}

/// Local storage engine, consumed by the cluster layer
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Execute one statement
    async fn execute(&self, sql: &str) -> Result<QueryOutput>;

    /// Produce a point-in-time logical dump of all in-scope tables
    async fn full_dump(&self) -> Result<DumpSnapshot>;

    /// Replace all local tables with the snapshot contents. Integrity
    /// constraints are not enforced while loading.
    async fn restore_from_dump(&self, snapshot: &DumpSnapshot) -> Result<()>;
}

/// Quote a JSON value as a SQL literal
pub fn sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => quote_string(s),
        other => quote_string(&other.to_string()),
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

/// Reject a value that cannot be expressed by the adapter
pub(crate) fn storage_error(reason: impl Into<String>) -> Error {
    Error::Storage(reason.into())
}
