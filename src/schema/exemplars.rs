use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A curated question/SQL pair used to ground generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub question: String,
    pub sql: String,
    /// Business note shown to the model next to the example
    #[serde(default)]
    pub context: Option<String>,
}

impl Exemplar {
    pub fn new(question: &str, sql: &str) -> Self {
        Self {
            question: question.to_string(),
            sql: sql.to_string(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }
}

#[derive(Debug)]
pub enum SchemaError {
    Io(String),
    Parse(String),
    Database(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Io(msg) => write!(f, "Schema I/O error: {}", msg),
            SchemaError::Parse(msg) => write!(f, "Schema parse error: {}", msg),
            SchemaError::Database(msg) => write!(f, "Schema database error: {}", msg),
        }
    }
}

impl std::error::Error for SchemaError {}

/// Exemplars in registration order; position doubles as recency (later is newer).
#[derive(Debug, Clone, Default)]
pub struct ExemplarCatalog {
    exemplars: Vec<Exemplar>,
}

impl ExemplarCatalog {
    pub fn new(exemplars: Vec<Exemplar>) -> Self {
        Self { exemplars }
    }

    /// Loads a JSON array of exemplars.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Io(format!("{}: {}", path.display(), e)))?;
        let exemplars: Vec<Exemplar> = serde_json::from_str(&raw)
            .map_err(|e| SchemaError::Parse(format!("{}: {}", path.display(), e)))?;
        Ok(Self { exemplars })
    }

    pub fn exemplars(&self) -> &[Exemplar] {
        &self.exemplars
    }

    pub fn len(&self) -> usize {
        self.exemplars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exemplars.is_empty()
    }
}
