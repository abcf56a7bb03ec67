use crate::config::AppConfig;
use crate::db::schema_manager::SchemaManager;
use crate::pipeline::QueryPipeline;
use crate::pipeline::history::SessionStore;
use chrono::{DateTime, Utc};

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: QueryPipeline,
    pub sessions: SessionStore,
    pub schema_manager: SchemaManager,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: QueryPipeline, schema_manager: SchemaManager) -> Self {
        Self {
            config,
            pipeline,
            sessions: SessionStore::new(),
            schema_manager,
            startup_time: Utc::now(),
        }
    }
}
