use duckdb::{Connection, ffi};
use r2d2::ManageConnection;
use std::ffi::{CStr, CString, c_void};
use std::ptr;
use std::sync::Arc;

pub const IN_MEMORY: &str = ":memory:";

/// A DuckDB database instance.
///
/// Pooled connections and the statement connections the backend opens all attach to
/// this one instance, so an in-memory database is shared by every connection.
pub struct Database {
    raw: ffi::duckdb_database,
}

// DuckDB database handles may be shared across threads
unsafe impl Send for Database {}
unsafe impl Sync for Database {}

impl Database {
    pub fn open(path: &str, read_only: bool) -> Result<Arc<Self>, duckdb::Error> {
        let c_path = CString::new(path).map_err(|_| failure(ffi::DuckDBError, "path contains a NUL byte"))?;

        unsafe {
            let mut config: ffi::duckdb_config = ptr::null_mut();
            if ffi::duckdb_create_config(&mut config) != ffi::DuckDBSuccess {
                return Err(failure(ffi::DuckDBError, "could not allocate a database config"));
            }
            if read_only {
                let state = ffi::duckdb_set_config(config, c"access_mode".as_ptr(), c"READ_ONLY".as_ptr());
                if state != ffi::DuckDBSuccess {
                    ffi::duckdb_destroy_config(&mut config);
                    return Err(failure(state, "could not set read-only access"));
                }
            }

            let mut raw: ffi::duckdb_database = ptr::null_mut();
            let mut c_err: *mut std::os::raw::c_char = ptr::null_mut();
            let state = ffi::duckdb_open_ext(c_path.as_ptr(), &mut raw, config, &mut c_err);
            ffi::duckdb_destroy_config(&mut config);

            if state != ffi::DuckDBSuccess {
                let message = if c_err.is_null() {
                    format!("could not open {}", path)
                } else {
                    let message = CStr::from_ptr(c_err).to_string_lossy().to_string();
                    ffi::duckdb_free(c_err as *mut c_void);
                    message
                };
                return Err(failure(state, &message));
            }

            Ok(Arc::new(Self { raw }))
        }
    }

    /// Raw handle for opening connections. Valid for as long as `self` lives.
    pub fn raw(&self) -> ffi::duckdb_database {
        self.raw
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Open connections keep the underlying instance alive past this point
        unsafe { ffi::duckdb_close(&mut self.raw) }
    }
}

fn failure(state: ffi::duckdb_state, message: &str) -> duckdb::Error {
    duckdb::Error::DuckDBFailure(ffi::Error::new(state), Some(message.to_string()))
}

/// r2d2 manager handing out connections to one shared [`Database`].
pub struct DuckDBConnectionManager {
    database: Arc<Database>,
}

impl DuckDBConnectionManager {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        // The manager holds the database for as long as the pool exists
        unsafe { Connection::open_from_raw(self.database.raw()) }
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub type DbPool = r2d2::Pool<DuckDBConnectionManager>;

/// Builds a pool of `size` connections to `database`.
pub fn build_pool(database: &Arc<Database>, size: u32) -> Result<DbPool, Box<dyn std::error::Error>> {
    let manager = DuckDBConnectionManager::new(database.clone());
    let pool = r2d2::Pool::builder().max_size(size.max(1)).build(manager)?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_connections_share_one_database() {
        let database = Database::open(IN_MEMORY, false).unwrap();
        let pool = build_pool(&database, 2).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TABLE shared (id INTEGER); INSERT INTO shared VALUES (1), (2);")
                .unwrap();
        }

        let other = pool.get().unwrap();
        let count: i64 = other.query_row("SELECT count(*) FROM shared", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn read_only_databases_reject_writes() {
        let dir = std::env::temp_dir().join(format!("nl-query-ro-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ro.duckdb");
        let path = path.to_str().unwrap();
        {
            let database = Database::open(path, false).unwrap();
            let conn = build_pool(&database, 1).unwrap().get().unwrap();
            conn.execute_batch("CREATE TABLE IF NOT EXISTS t (id INTEGER);").unwrap();
        }

        let database = Database::open(path, true).unwrap();
        let conn = build_pool(&database, 1).unwrap().get().unwrap();
        assert!(conn.execute_batch("INSERT INTO t VALUES (1);").is_err());
        drop(conn);
        drop(database);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
