use crate::pipeline::executor::TabularResult;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One submitted question. `replaces` points at the sequence number of an earlier
/// question that failed and is being retried in other words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    pub text: String,
    pub sequence: u64,
    pub replaces: Option<u64>,
}

impl Question {
    /// A question outside any conversation.
    pub fn standalone(text: &str) -> Self {
        Self {
            text: text.to_string(),
            sequence: 0,
            replaces: None,
        }
    }
}

/// A question that ran to completion, kept for follow-up prompts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub question: Question,
    pub sql: String,
    pub row_count: usize,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The last `window` turns, oldest first.
    pub fn recent(&self, window: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(window);
        &self.turns[start..]
    }

    /// Prompt section listing recent turns, or `None` when there is nothing to show.
    pub fn render_for_prompt(&self, window: usize) -> Option<String> {
        let recent = self.recent(window);
        if recent.is_empty() {
            return None;
        }

        let mut out = String::from("# PREVIOUS QUESTIONS IN THIS CONVERSATION\n\n");
        for turn in recent {
            out.push_str(&format!("Q{}: {}\n", turn.question.sequence, turn.question.text));
            out.push_str(&format!("SQL: {}\n", turn.sql));
            out.push_str(&format!(
                "Returned {} row(s) with columns: {}\n\n",
                turn.row_count,
                turn.columns.join(", ")
            ));
        }
        Some(out)
    }
}

/// Per-conversation state. Hold the session's lock for the duration of a run so
/// questions in one conversation are answered in submission order.
#[derive(Debug, Default)]
pub struct Session {
    next_sequence: u64,
    history: ConversationHistory,
}

impl Session {
    pub fn next_question(&mut self, text: &str, replaces: Option<u64>) -> Question {
        self.next_sequence += 1;
        Question {
            text: text.to_string(),
            sequence: self.next_sequence,
            replaces: replaces.filter(|r| *r < self.next_sequence),
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn record_success(&mut self, question: Question, sql: &str, table: &TabularResult) {
        self.history.push(ConversationTurn {
            question,
            sql: sql.to_string(),
            row_count: table.row_count(),
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
        });
    }
}

/// Sessions keyed by conversation id. Created lazily, kept for the process lifetime.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session, creating it on first use. tokio's mutex is fair, so
    /// waiters acquire it in the order they queued.
    pub fn session(&self, id: &str) -> Arc<tokio::sync::Mutex<Session>> {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("Creating session {}", id);
                Arc::new(tokio::sync::Mutex::new(Session::default()))
            })
            .clone()
    }

    /// Snapshot of a session's history; `None` for unknown ids.
    pub async fn history(&self, id: &str) -> Option<ConversationHistory> {
        let session = {
            let sessions = match self.sessions.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sessions.get(id).cloned()
        }?;
        let guard = session.lock().await;
        Some(guard.history().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}
