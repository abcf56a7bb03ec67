use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

mod config;
mod db;
mod llm;
mod pipeline;
mod schema;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::db::backend::DuckDbBackend;
use crate::db::db_pool::{Database, build_pool};
use crate::db::schema_manager::SchemaManager;
use crate::llm::LlmManager;
use crate::pipeline::QueryPipeline;
use crate::schema::ExemplarCatalog;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging
    init_tracing(config.logging.format);

    info!(
        "Initializing DuckDB connection pool for {} (read-only: {})",
        config.database.path, config.database.read_only
    );
    let database = Database::open(&config.database.path, config.database.read_only)?;
    let pool = build_pool(&database, config.database.pool_size as u32)?;

    // Initialize LLM manager
    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = LlmManager::new(&config.llm)?;

    let catalog = match &config.pipeline.exemplars_path {
        Some(path) => {
            let catalog = ExemplarCatalog::load(Path::new(path))?;
            info!("Loaded {} exemplars from {}", catalog.len(), path);
            catalog
        }
        None => {
            warn!("No exemplars configured; prompts will carry the schema only");
            ExemplarCatalog::default()
        }
    };

    let pipeline = QueryPipeline::from_config(
        &config,
        Arc::new(llm_manager),
        Arc::new(DuckDbBackend::new(database)),
        Arc::new(catalog),
    );

    // Initialize schema snapshot
    info!("Loading database schema");
    let schema_manager = SchemaManager::new(pool);
    if let Err(e) = schema_manager.reload().await {
        error!("Failed to load database schema: {}", e);
        // Continue anyway, it can be refreshed through the API
    }

    let app_state = Arc::new(AppState::new(config.clone(), pipeline, schema_manager));

    // Start the web server
    info!("Starting nl-query server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
