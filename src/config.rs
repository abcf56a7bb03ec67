use crate::pipeline::cache::CacheScope;
use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// DuckDB file, or `:memory:`
    pub path: String,
    pub pool_size: usize,
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "nl-query.db".to_string(),
            pool_size: 5,
            read_only: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,   // Model name
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: f32,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "sqlcoder".to_string(),
            api_key: None,
            api_url: None,
            temperature: 0.1,
            timeout_ms: 30_000,
        }
    }
}

/// Knobs for the question → SQL → chart pipeline.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub execution_timeout_ms: u64,
    pub row_cap: usize,
    pub max_joins: usize,
    pub max_nesting_depth: usize,
    pub top_k_exemplars: usize,
    pub max_schema_tables: usize,
    pub bar_max_rows: usize,
    pub history_window: usize,
    /// Adds a one-line model-written answer to every result
    pub summarize_answers: bool,
    /// Rows shown to the model when summarizing
    pub summary_max_rows: usize,
    /// Runs kept for `/api/status`
    pub metrics_history: usize,
    pub slow_query_ms: u64,
    pub exemplars_path: Option<String>,
    pub superlative_keywords: Vec<String>,
    pub minimum_keywords: Vec<String>,
    pub proportion_keywords: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            execution_timeout_ms: 10_000,
            row_cap: 1_000,
            max_joins: 6,
            max_nesting_depth: 3,
            top_k_exemplars: 3,
            max_schema_tables: 8,
            bar_max_rows: 25,
            history_window: 5,
            summarize_answers: false,
            summary_max_rows: 20,
            metrics_history: 100,
            slow_query_ms: 5_000,
            exemplars_path: None,
            superlative_keywords: words(&["top", "highest", "best", "most", "largest", "biggest", "maximum"]),
            minimum_keywords: words(&["lowest", "least", "worst", "bottom", "smallest", "minimum"]),
            proportion_keywords: words(&["percentage", "percent", "distribution", "share", "proportion", "breakdown"]),
        }
    }
}

impl PipelineConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub scope: CacheScope,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            scope: CacheScope::Global,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// DuckDB database file to query
    #[arg(long)]
    pub database: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = ["config.toml", "config/config.toml", "/etc/nl-query/config.toml"];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder = config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NLQ__LLM__MODEL=... style overrides
        config_builder = config_builder.add_source(Environment::with_prefix("NLQ").separator("__").try_parsing(true));

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(database) = &args.database {
            config.database.path = database.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.database.pool_size == 0 {
            return fail("database.pool_size must be at least 1");
        }
        if !matches!(self.llm.backend.as_str(), "ollama" | "remote") {
            return Err(ConfigError::Message(format!(
                "llm.backend must be \"ollama\" or \"remote\", got \"{}\"",
                self.llm.backend
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return fail("llm.temperature must be within [0, 2]");
        }
        if self.llm.timeout_ms == 0 {
            return fail("llm.timeout_ms must be positive");
        }
        if self.pipeline.max_attempts == 0 {
            return fail("pipeline.max_attempts must be at least 1");
        }
        if self.pipeline.execution_timeout_ms == 0 {
            return fail("pipeline.execution_timeout_ms must be positive");
        }
        if self.pipeline.row_cap == 0 {
            return fail("pipeline.row_cap must be at least 1");
        }
        if self.pipeline.top_k_exemplars == 0 {
            return fail("pipeline.top_k_exemplars must be at least 1");
        }
        if self.pipeline.max_schema_tables == 0 {
            return fail("pipeline.max_schema_tables must be at least 1");
        }
        if self.pipeline.metrics_history == 0 {
            return fail("pipeline.metrics_history must be at least 1");
        }
        if self.cache.capacity == 0 {
            return fail("cache.capacity must be at least 1");
        }
        Ok(())
    }
}
