use crate::pipeline::correction::LoopState;
use crate::pipeline::metrics::StageTimings;
use serde::Serialize;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationKind {
    Unsafe,
    UnknownIdentifier,
    TooComplex,
    Unparseable,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Unsafe => write!(f, "Unsafe"),
            ViolationKind::UnknownIdentifier => write!(f, "UnknownIdentifier"),
            ViolationKind::TooComplex => write!(f, "TooComplex"),
            ViolationKind::Unparseable => write!(f, "Unparseable"),
        }
    }
}

/// Reason a candidate statement was rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub kind: ViolationKind,
    /// Token or clause that triggered the rejection
    pub offending: String,
    pub message: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQL rejected ({}): {}", self.kind, self.message)
    }
}

impl Error for ValidationFailure {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionErrorKind {
    Timeout,
    ConstraintViolation,
    ConnectionLost,
    Unknown,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::Timeout => write!(f, "Timeout"),
            ExecutionErrorKind::ConstraintViolation => write!(f, "ConstraintViolation"),
            ExecutionErrorKind::ConnectionLost => write!(f, "ConnectionLost"),
            ExecutionErrorKind::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Maps a database error message onto the execution taxonomy.
    ///
    /// Only the error type DuckDB puts before the first colon (`Constraint Error: ...`)
    /// is considered, so identifiers quoted in the detail never change the kind.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let error_type = message
            .split_once(':')
            .map(|(prefix, _)| prefix.trim().to_lowercase())
            .and_then(|prefix| prefix.strip_suffix("error").map(|t| t.trim().to_string()));

        let kind = match error_type.as_deref() {
            Some("interrupt") => ExecutionErrorKind::Timeout,
            Some("constraint") => ExecutionErrorKind::ConstraintViolation,
            Some("io") | Some("connection") | Some("network") => ExecutionErrorKind::ConnectionLost,
            _ => ExecutionErrorKind::Unknown,
        };
        Self { kind, message }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Execution error ({}): {}", self.kind, self.message)
    }
}

impl Error for ExecutionError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GenerationFailure {
    /// Model call failed or timed out
    Model(String),
    /// Model declined to answer
    Refused(String),
    /// Output contained no usable SQL
    Malformed(String),
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationFailure::Model(msg) => write!(f, "Generation failed: {}", msg),
            GenerationFailure::Refused(msg) => write!(f, "Model refused the question: {}", msg),
            GenerationFailure::Malformed(msg) => write!(f, "Model output had no usable SQL: {}", msg),
        }
    }
}

impl Error for GenerationFailure {}

/// What happened to one attempt of the correction loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    GenerationFailed { error: GenerationFailure },
    Rejected { failure: ValidationFailure },
    ExecutionFailed { error: ExecutionError },
    Succeeded { row_count: usize, truncated: bool },
}

impl AttemptOutcome {
    pub fn error_message(&self) -> Option<String> {
        match self {
            AttemptOutcome::GenerationFailed { error } => Some(error.to_string()),
            AttemptOutcome::Rejected { failure } => Some(failure.to_string()),
            AttemptOutcome::ExecutionFailed { error } => Some(error.to_string()),
            AttemptOutcome::Succeeded { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub index: u32,
    /// Absent when generation itself failed
    pub sql: Option<String>,
    pub rationale: Option<String>,
    pub outcome: AttemptOutcome,
    pub timings: StageTimings,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome.error_message() {
            Some(msg) => write!(f, "attempt {}: {}", self.index, msg),
            None => write!(f, "attempt {}: succeeded", self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    GenerationExhausted,
    ValidationExhausted,
    ExecutionExhausted,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::GenerationExhausted => write!(f, "GenerationExhausted"),
            FailureKind::ValidationExhausted => write!(f, "ValidationExhausted"),
            FailureKind::ExecutionExhausted => write!(f, "ExecutionExhausted"),
            FailureKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Terminal pipeline error, carrying every attempt for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineFailure {
    pub kind: FailureKind,
    pub attempts: Vec<Attempt>,
    pub last_error: String,
    /// States the correction loop passed through
    pub trace: Vec<LoopState>,
}

impl PipelineFailure {
    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            attempts: Vec::new(),
            last_error: "query cancelled by caller".to_string(),
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} attempt(s): {}", self.kind, self.attempts.len(), self.last_error)
    }
}

impl Error for PipelineFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_database_messages() {
        assert_eq!(ExecutionError::classify("INTERRUPT Error: Interrupted!").kind, ExecutionErrorKind::Timeout);
        assert_eq!(
            ExecutionError::classify("Constraint Error: NOT NULL constraint failed").kind,
            ExecutionErrorKind::ConstraintViolation
        );
        assert_eq!(
            ExecutionError::classify("IO Error: Could not read file").kind,
            ExecutionErrorKind::ConnectionLost
        );
        assert_eq!(
            ExecutionError::classify("Catalog Error: Table with name Foo does not exist!").kind,
            ExecutionErrorKind::Unknown
        );
    }

    #[test]
    fn identifiers_in_the_detail_do_not_change_the_kind() {
        let catalog_errors = [
            "Binder Error: Referenced column \"connection_id\" not found in FROM clause!",
            "Binder Error: Referenced column \"timeout_ms\" not found in FROM clause!",
            "Catalog Error: Table with name constraints does not exist!",
            "Parser Error: syntax error at or near \"interrupt\"",
        ];
        for message in catalog_errors {
            assert_eq!(ExecutionError::classify(message).kind, ExecutionErrorKind::Unknown, "{}", message);
        }

        assert_eq!(
            ExecutionError::classify("Connection Error: Connection already closed!").kind,
            ExecutionErrorKind::ConnectionLost
        );
        assert_eq!(ExecutionError::classify("no prefix at all").kind, ExecutionErrorKind::Unknown);
    }

    #[test]
    fn attempt_display_names_the_reason() {
        let attempt = Attempt {
            index: 2,
            sql: Some("SELECT * FROM Foo".to_string()),
            rationale: None,
            outcome: AttemptOutcome::Rejected {
                failure: ValidationFailure {
                    kind: ViolationKind::UnknownIdentifier,
                    offending: "Foo".to_string(),
                    message: "table Foo does not exist".to_string(),
                },
            },
            timings: StageTimings::default(),
        };
        assert_eq!(
            attempt.to_string(),
            "attempt 2: SQL rejected (UnknownIdentifier): table Foo does not exist"
        );
    }
}
