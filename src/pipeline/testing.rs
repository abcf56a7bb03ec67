//! Deterministic stand-ins for the model and the database.

use crate::llm::{CompletionModel, LlmError, Prompt};
use crate::pipeline::error::{ExecutionError, ExecutionErrorKind};
use crate::pipeline::executor::{ColumnKind, ExecutionResult, QueryBackend, ResultColumn, TabularResult, Value};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn numbers_table(rows: usize) -> TabularResult {
    TabularResult {
        columns: vec![ResultColumn::new("n", ColumnKind::Numeric)],
        rows: (0..rows).map(|i| vec![Value::Int(i as i64)]).collect(),
        truncated: false,
        row_cap: 0,
    }
}

pub fn revenue_by_product() -> TabularResult {
    TabularResult {
        columns: vec![
            ResultColumn::new("ProductName", ColumnKind::Categorical),
            ResultColumn::new("revenue", ColumnKind::Numeric),
        ],
        rows: vec![
            vec![Value::Text("Laptop".into()), Value::Float(1200.0)],
            vec![Value::Text("Phone".into()), Value::Float(800.0)],
            vec![Value::Text("Tablet".into()), Value::Float(450.5)],
        ],
        truncated: false,
        row_cap: 0,
    }
}

/// Backend that replays scripted results, then falls back to a fixed one.
pub struct FakeBackend {
    script: Mutex<VecDeque<ExecutionResult>>,
    fallback: ExecutionResult,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeBackend {
    pub fn returning(table: TabularResult) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(table),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Ignores the cap it is handed, so callers must enforce it.
    pub fn with_rows(rows: usize) -> Self {
        Self::returning(numbers_table(rows))
    }

    pub fn failing(kind: ExecutionErrorKind, message: &str) -> Self {
        Self {
            fallback: Err(ExecutionError::new(kind, message)),
            ..Self::with_rows(0)
        }
    }

    pub fn then(self, result: ExecutionResult) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryBackend for FakeBackend {
    async fn execute(&self, _sql: &str, _row_cap: usize) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Model that answers from a queue, repeating the last answer once the queue is drained.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<String>,
    prompts: Mutex<Vec<Prompt>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<S: AsRef<str>>(replies: &[S]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| Ok(r.as_ref().to_string())).collect()),
            last: Mutex::new(replies.last().map(|r| r.as_ref().to_string()).unwrap_or_default()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call answers with the same text.
    pub fn always(reply: &str) -> Self {
        Self::new(&[reply])
    }

    /// Queues a transport failure ahead of the scripted replies.
    pub fn failing_first(self, message: &str) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_front(Err(message.to_string()));
        }
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(LlmError::ConnectionError(message)),
            None => Ok(self.last.lock().map(|l| l.clone()).unwrap_or_default()),
        }
    }
}

/// Wraps a reply the way the prompt asks the model to answer.
pub fn fenced(sql: &str) -> String {
    format!("```sql\n{}\n```\nRationale: generated for the test.", sql)
}
