use crate::pipeline::error::{ExecutionError, ExecutionErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Coarse type of a result column, as far as chart selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Temporal,
    Categorical,
    Other,
}

impl ColumnKind {
    /// Classifies a declared SQL type name (`DOUBLE`, `DECIMAL(10,2)`, `TIMESTAMP WITH TIME ZONE`, ...).
    pub fn from_sql_type(data_type: &str) -> Self {
        let upper = data_type.to_uppercase();
        let base = upper.split(['(', ' ']).next().unwrap_or("");
        match base {
            "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT" | "USMALLINT"
            | "UINTEGER" | "UBIGINT" | "UHUGEINT" | "FLOAT" | "REAL" | "DOUBLE" | "DECIMAL" | "NUMERIC" => {
                ColumnKind::Numeric
            }
            "DATE" | "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" | "TIME" => ColumnKind::Temporal,
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "BPCHAR" | "BOOLEAN" | "BOOL" | "ENUM" | "UUID" => {
                ColumnKind::Categorical
            }
            _ => ColumnKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub kind: ColumnKind,
}

impl ResultColumn {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// A single cell. Temporal values keep the database's text rendering so they sort naturally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Rows returned by one execution, capped at `row_cap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<Value>>,
    /// Set when the statement produced more rows than `row_cap`
    pub truncated: bool,
    pub row_cap: usize,
}

impl TabularResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Enforces the cap on results produced by a backend that over-fetched.
    fn enforce_cap(mut self, row_cap: usize) -> Self {
        if self.rows.len() > row_cap {
            self.rows.truncate(row_cap);
            self.truncated = true;
        }
        self.row_cap = row_cap;
        self
    }
}

pub type ExecutionResult = Result<TabularResult, ExecutionError>;

/// Database capability the executor runs statements through.
///
/// Implementations run `sql` in their own transaction, materialize at most `row_cap`
/// rows and report `truncated` when more were available.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn execute(&self, sql: &str, row_cap: usize) -> ExecutionResult;
}

pub struct QueryExecutor {
    backend: Arc<dyn QueryBackend>,
    timeout: Duration,
    row_cap: usize,
}

impl QueryExecutor {
    pub fn new(backend: Arc<dyn QueryBackend>, timeout: Duration, row_cap: usize) -> Self {
        Self {
            backend,
            timeout,
            row_cap,
        }
    }

    pub async fn execute(&self, sql: &str) -> ExecutionResult {
        let started = Instant::now();
        debug!("Executing SQL: {}", sql);

        let result = match tokio::time::timeout(self.timeout, self.backend.execute(sql, self.row_cap)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Query timed out after {}ms", self.timeout.as_millis());
                return Err(ExecutionError::new(
                    ExecutionErrorKind::Timeout,
                    format!("statement exceeded the {}ms timeout", self.timeout.as_millis()),
                ));
            }
        };

        match result {
            Ok(table) => {
                let table = table.enforce_cap(self.row_cap);
                info!(
                    "Query executed successfully. Row count: {}, truncated: {}, execution time: {}ms",
                    table.row_count(),
                    table.truncated,
                    started.elapsed().as_millis()
                );
                Ok(table)
            }
            Err(e) => {
                warn!("Query failed: {}", e);
                Err(e)
            }
        }
    }
}
