use crate::db::db_pool::DbPool;
use crate::pipeline::QueryPipeline;
use crate::schema::{ColumnSchema, ForeignKey, SchemaError, SchemaSnapshot, TableSchema};
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const COLUMNS_QUERY: &str = "
    SELECT table_schema, table_name, column_name, data_type, is_nullable
    FROM information_schema.columns
    WHERE table_catalog = current_database()
      AND table_schema NOT IN ('information_schema', 'pg_catalog')
    ORDER BY table_schema, table_name, ordinal_position";

const FOREIGN_KEYS_QUERY: &str = "
    SELECT fk.table_schema, fk.table_name, fk.constraint_name, fk.column_name,
           pk.table_name, pk.column_name
    FROM information_schema.referential_constraints rc
    JOIN information_schema.key_column_usage fk
      ON fk.constraint_name = rc.constraint_name
    JOIN information_schema.key_column_usage pk
      ON pk.constraint_name = rc.unique_constraint_name
     AND pk.ordinal_position = fk.ordinal_position
    ORDER BY fk.table_schema, fk.table_name, fk.constraint_name, fk.ordinal_position";

/// Holds the current schema snapshot read from the database
pub struct SchemaManager {
    pool: DbPool,
    snapshot: RwLock<Arc<SchemaSnapshot>>,
    /// Last refresh timestamp
    last_refresh: RwLock<DateTime<Utc>>,
}

impl SchemaManager {
    /// Creates a manager with an empty snapshot; call `reload` or `refresh` to populate it.
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            snapshot: RwLock::new(Arc::new(SchemaSnapshot::new(Vec::new()))),
            last_refresh: RwLock::new(Utc::now()),
        }
    }

    pub async fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn last_refresh(&self) -> DateTime<Utc> {
        *self.last_refresh.read().await
    }

    /// Re-reads the schema. Returns the new snapshot when its version differs from the
    /// one held before.
    pub async fn reload(&self) -> Result<Option<Arc<SchemaSnapshot>>, SchemaError> {
        info!("Refreshing schema snapshot");
        let pool = self.pool.clone();

        let loaded = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| SchemaError::Database(e.to_string()))?;
            load_snapshot(&conn)
        })
        .await
        .map_err(|e| SchemaError::Database(format!("schema task failed: {}", e)))??;

        *self.last_refresh.write().await = Utc::now();

        let mut current = self.snapshot.write().await;
        if current.version() == loaded.version() {
            debug!("Schema unchanged at version {}", loaded.version());
            return Ok(None);
        }

        info!(
            "Schema version {} -> {} ({} tables)",
            current.version(),
            loaded.version(),
            loaded.tables().len()
        );
        let loaded = Arc::new(loaded.with_generation(current.generation() + 1));
        *current = loaded.clone();
        Ok(Some(loaded))
    }

    /// Reloads the schema and drops the pipeline's cached answers if it changed.
    pub async fn refresh(&self, pipeline: &QueryPipeline) -> Result<bool, SchemaError> {
        match self.reload().await? {
            Some(snapshot) => {
                pipeline.invalidate_schema(&snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Reads every user table with its columns and foreign keys.
pub fn load_snapshot(conn: &Connection) -> Result<SchemaSnapshot, SchemaError> {
    let db_error = |e: duckdb::Error| SchemaError::Database(e.to_string());

    let mut tables: BTreeMap<(String, String), TableSchema> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(COLUMNS_QUERY).map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_error)?;

        for row in rows {
            let (schema, table, column, data_type, nullable) = row.map_err(db_error)?;
            tables
                .entry((schema.clone(), table.clone()))
                .or_insert_with(|| TableSchema::new(&schema, &table, Vec::new()))
                .columns
                .push(ColumnSchema::new(&column, &data_type, nullable.eq_ignore_ascii_case("YES")));
        }
    }

    match load_foreign_keys(conn) {
        Ok(keys) => {
            for ((schema, table), fk) in keys {
                if let Some(entry) = tables.get_mut(&(schema, table)) {
                    entry.foreign_keys.push(fk);
                }
            }
        }
        Err(e) => warn!("Could not read foreign keys, continuing without them: {}", e),
    }

    debug!("Loaded {} tables from information_schema", tables.len());
    Ok(SchemaSnapshot::new(tables.into_values().collect()))
}

fn load_foreign_keys(conn: &Connection) -> Result<Vec<((String, String), ForeignKey)>, duckdb::Error> {
    let mut stmt = conn.prepare(FOREIGN_KEYS_QUERY)?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    // Multi-column keys arrive as consecutive rows of one constraint
    let mut keys: Vec<((String, String), String, ForeignKey)> = Vec::new();
    for row in rows {
        let (schema, table, constraint, column, referenced_table, referenced_column) = row?;
        let continues = matches!(
            keys.last(),
            Some((owner, name, _)) if *name == constraint && owner.0 == schema && owner.1 == table
        );
        if continues {
            if let Some((_, _, fk)) = keys.last_mut() {
                fk.columns.push(column);
                fk.referenced_columns.push(referenced_column);
            }
        } else {
            keys.push((
                (schema, table),
                constraint,
                ForeignKey {
                    columns: vec![column],
                    referenced_table,
                    referenced_columns: vec![referenced_column],
                },
            ));
        }
    }

    Ok(keys.into_iter().map(|(owner, _, fk)| (owner, fk)).collect())
}
