use crate::db::db_pool::Database;
use crate::pipeline::error::{ExecutionError, ExecutionErrorKind};
use crate::pipeline::executor::{ColumnKind, ExecutionResult, QueryBackend, ResultColumn, TabularResult, Value};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StructArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Schema};
use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema, from_ffi};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use async_trait::async_trait;
use duckdb::ffi;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Runs generated statements against the shared DuckDB database.
///
/// Each statement gets its own connection so it can be interrupted without touching
/// pooled connections other requests are using.
pub struct DuckDbBackend {
    database: Arc<Database>,
    running: Arc<AtomicUsize>,
}

impl DuckDbBackend {
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Statements still executing, including abandoned ones that have not yet stopped.
    pub fn running_statements(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryBackend for DuckDbBackend {
    async fn execute(&self, sql: &str, row_cap: usize) -> ExecutionResult {
        let conn = Arc::new(StatementConnection::open(&self.database)?);

        // Interrupts the statement if this future is dropped by a timeout or a cancellation
        let guard = InterruptOnDrop {
            conn: conn.clone(),
            armed: true,
        };
        let capped = capped_sql(sql, row_cap);
        let running = self.running.clone();
        running.fetch_add(1, Ordering::SeqCst);

        let result = tokio::task::spawn_blocking(move || {
            let result = run_in_rollback(&conn, &capped, row_cap);
            let left = running.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!("Statement finished, {} still running", left);
            result
        })
        .await
        .map_err(|e| ExecutionError::new(ExecutionErrorKind::Unknown, format!("database task failed: {}", e)));

        guard.disarm();
        result?
    }
}

/// A raw DuckDB connection owned by one statement.
struct StatementConnection {
    con: ffi::duckdb_connection,
}

// DuckDB connections may be interrupted from any thread; statements run on one thread at a time
unsafe impl Send for StatementConnection {}
unsafe impl Sync for StatementConnection {}

impl StatementConnection {
    fn open(database: &Database) -> Result<Self, ExecutionError> {
        let mut con: ffi::duckdb_connection = ptr::null_mut();
        let state = unsafe { ffi::duckdb_connect(database.raw(), &mut con) };
        if state != ffi::DuckDBSuccess {
            unsafe { ffi::duckdb_disconnect(&mut con) };
            return Err(ExecutionError::new(
                ExecutionErrorKind::ConnectionLost,
                "could not open a database connection",
            ));
        }
        Ok(Self { con })
    }

    fn interrupt(&self) {
        unsafe { ffi::duckdb_interrupt(self.con) }
    }

    /// Runs `sql` to completion and returns its schema and record batches.
    fn query(&self, sql: &str) -> Result<(Schema, Vec<RecordBatch>), ExecutionError> {
        let c_sql = CString::new(sql)
            .map_err(|_| ExecutionError::new(ExecutionErrorKind::Unknown, "statement contains a NUL byte"))?;

        let mut raw: ffi::duckdb_arrow = ptr::null_mut();
        let state = unsafe { ffi::duckdb_query_arrow(self.con, c_sql.as_ptr(), &mut raw) };
        let result = ArrowResult { raw };
        if state != ffi::DuckDBSuccess {
            return Err(ExecutionError::classify(result.error_message()));
        }

        let ffi_schema = result.schema()?;
        let schema = Schema::try_from(&ffi_schema).map_err(arrow_error)?;
        let mut batches = Vec::new();
        while let Some(batch) = result.next_batch(&ffi_schema)? {
            batches.push(batch);
        }
        Ok((schema, batches))
    }
}

impl Drop for StatementConnection {
    fn drop(&mut self) {
        // Disconnecting rolls back a transaction an interrupt left open
        unsafe { ffi::duckdb_disconnect(&mut self.con) }
    }
}

struct ArrowResult {
    raw: ffi::duckdb_arrow,
}

impl ArrowResult {
    fn error_message(&self) -> String {
        if self.raw.is_null() {
            return "query returned no result".to_string();
        }
        let message = unsafe { ffi::duckdb_query_arrow_error(self.raw) };
        if message.is_null() {
            return "query failed".to_string();
        }
        unsafe { CStr::from_ptr(message) }.to_string_lossy().to_string()
    }

    fn schema(&self) -> Result<FFI_ArrowSchema, ExecutionError> {
        let mut schema = FFI_ArrowSchema::empty();
        let mut out = ptr::addr_of_mut!(schema);
        let state = unsafe {
            ffi::duckdb_query_arrow_schema(self.raw, &mut out as *mut _ as *mut ffi::duckdb_arrow_schema)
        };
        if state != ffi::DuckDBSuccess {
            return Err(ExecutionError::new(ExecutionErrorKind::Unknown, "could not read the result schema"));
        }
        Ok(schema)
    }

    fn next_batch(&self, schema: &FFI_ArrowSchema) -> Result<Option<RecordBatch>, ExecutionError> {
        let mut array = FFI_ArrowArray::empty();
        let mut out = ptr::addr_of_mut!(array);
        let state =
            unsafe { ffi::duckdb_query_arrow_array(self.raw, &mut out as *mut _ as *mut ffi::duckdb_arrow_array) };
        if state != ffi::DuckDBSuccess {
            return Err(ExecutionError::classify(self.error_message()));
        }
        if array.is_empty() {
            return Ok(None);
        }

        let data = unsafe { from_ffi(array, schema) }.map_err(arrow_error)?;
        Ok(Some(RecordBatch::from(StructArray::from(data))))
    }
}

impl Drop for ArrowResult {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { ffi::duckdb_destroy_arrow(&mut self.raw) }
        }
    }
}

fn arrow_error(e: arrow::error::ArrowError) -> ExecutionError {
    ExecutionError::new(ExecutionErrorKind::Unknown, e.to_string())
}

struct InterruptOnDrop {
    conn: Arc<StatementConnection>,
    armed: bool,
}

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!("Interrupting abandoned statement");
            self.conn.interrupt();
        }
    }
}

/// Wraps the statement so the database stops after one row past the cap.
fn capped_sql(sql: &str, row_cap: usize) -> String {
    let body = sql.trim().trim_end_matches(';').trim_end();
    // Newlines keep a trailing line comment from swallowing the wrapper
    format!("SELECT * FROM (\n{}\n) AS capped_result LIMIT {}", body, row_cap.saturating_add(1))
}

fn run_in_rollback(conn: &StatementConnection, sql: &str, row_cap: usize) -> ExecutionResult {
    conn.query("BEGIN TRANSACTION")?;

    let result = conn
        .query(sql)
        .and_then(|(schema, batches)| collect_rows(&schema, &batches, row_cap));

    // Nothing a read runs should persist
    if let Err(e) = conn.query("ROLLBACK") {
        warn!("Rollback after query failed: {}", e);
    }

    result
}

fn collect_rows(schema: &Schema, batches: &[RecordBatch], row_cap: usize) -> ExecutionResult {
    let columns: Vec<ResultColumn> = schema
        .fields()
        .iter()
        .map(|field| ResultColumn::new(field.name(), column_kind(field.data_type())))
        .collect();

    let mut rows = Vec::new();
    let mut truncated = false;

    'batches: for batch in batches {
        let arrays = batch
            .columns()
            .iter()
            .zip(&columns)
            .map(|(array, column)| normalize_array(array, column.kind))
            .collect::<Result<Vec<_>, _>>()?;

        for row in 0..batch.num_rows() {
            if rows.len() == row_cap {
                truncated = true;
                break 'batches;
            }
            let values = arrays
                .iter()
                .map(|array| cell_value(array, row))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(values);
        }
    }

    Ok(TabularResult {
        columns,
        rows,
        truncated,
        row_cap,
    })
}

fn column_kind(data_type: &DataType) -> ColumnKind {
    match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => ColumnKind::Numeric,
        DataType::Date32
        | DataType::Date64
        | DataType::Timestamp(_, _)
        | DataType::Time32(_)
        | DataType::Time64(_) => ColumnKind::Temporal,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Boolean | DataType::Dictionary(_, _) => {
            ColumnKind::Categorical
        }
        _ => ColumnKind::Other,
    }
}

/// Casts numeric arrays to a single representation so cells can be read uniformly.
fn normalize_array(array: &ArrayRef, kind: ColumnKind) -> Result<ArrayRef, ExecutionError> {
    let target = match (kind, array.data_type()) {
        (ColumnKind::Numeric, dt) if dt.is_integer() => DataType::Int64,
        (ColumnKind::Numeric, _) => DataType::Float64,
        _ => return Ok(array.clone()),
    };
    cast(array, &target).map_err(|e| ExecutionError::new(ExecutionErrorKind::Unknown, e.to_string()))
}

fn cell_value(array: &ArrayRef, row: usize) -> Result<Value, ExecutionError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    if let Some(ints) = array.as_any().downcast_ref::<Int64Array>() {
        return Ok(Value::Int(ints.value(row)));
    }
    if let Some(floats) = array.as_any().downcast_ref::<Float64Array>() {
        return Ok(Value::Float(floats.value(row)));
    }
    if let Some(bools) = array.as_any().downcast_ref::<BooleanArray>() {
        return Ok(Value::Bool(bools.value(row)));
    }
    array_value_to_string(array.as_ref(), row)
        .map(Value::Text)
        .map_err(|e| ExecutionError::new(ExecutionErrorKind::Unknown, e.to_string()))
}
