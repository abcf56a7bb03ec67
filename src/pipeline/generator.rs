use crate::llm::{CompletionModel, Prompt};
use crate::pipeline::error::GenerationFailure;
use crate::pipeline::history::{ConversationHistory, Question};
use crate::pipeline::retrieval::RetrievalContext;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const REFUSAL_MARKER: &str = "NOT_RELEVANT";

const SYSTEM_RULES: &str = r#"You are an expert SQL developer. Write one DuckDB SELECT query that answers the question using only the tables and columns in the schema.

IMPORTANT RULES:
1. Only read data: never write INSERT, UPDATE, DELETE, DROP, ALTER, CREATE or any other statement that changes the database
2. Return a single statement
3. Quote identifiers with double quotes when they are mixed case or reserved words (e.g. "Order")
4. Return only 2-3 columns so the result can be charted
5. When selecting columns from multiple tables, join them on the listed foreign keys
6. Use table aliases for clarity (e.g., o for Order, p for Product)
7. For rankings and breakdowns add a LIMIT
8. If the question cannot be answered from the schema, respond with exactly: NOT_RELEVANT

Answer with the query in a ```sql code block, followed by one line starting with "Rationale:" that explains the query."#;

/// Why a new attempt is being made.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feedback {
    /// Missing when the previous generation produced no SQL at all
    pub failed_sql: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSql {
    pub sql: String,
    pub attempt: u32,
    pub rationale: String,
    pub feedback: Option<Feedback>,
}

pub struct SqlGenerator {
    model: Arc<dyn CompletionModel>,
    timeout: Duration,
    history_window: usize,
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn CompletionModel>, timeout: Duration, history_window: usize) -> Self {
        Self {
            model,
            timeout,
            history_window,
        }
    }

    /// Makes exactly one model call.
    pub async fn generate(
        &self,
        question: &Question,
        context: &RetrievalContext,
        history: &ConversationHistory,
        attempt: u32,
        feedback: Option<Feedback>,
    ) -> Result<CandidateSql, GenerationFailure> {
        let prompt = self.build_prompt(question, context, history, feedback.as_ref());
        debug!("Generation prompt for attempt {}:\n{}", attempt, prompt.user);

        let reply = match tokio::time::timeout(self.timeout, self.model.complete(&prompt)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Model call failed on attempt {}: {}", attempt, e);
                return Err(GenerationFailure::Model(e.to_string()));
            }
            Err(_) => {
                warn!("Model call timed out on attempt {}", attempt);
                return Err(GenerationFailure::Model(format!(
                    "model did not answer within {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        if reply.trim().is_empty() {
            return Err(GenerationFailure::Malformed("model returned an empty response".to_string()));
        }
        if reply.to_uppercase().contains(REFUSAL_MARKER) {
            info!("Model judged the question not answerable from the schema");
            return Err(GenerationFailure::Refused(
                "the question is not relevant to the available tables".to_string(),
            ));
        }

        let sql = extract_sql(&reply).ok_or_else(|| {
            GenerationFailure::Malformed(format!("no SQL statement found in: {}", truncate(&reply, 200)))
        })?;

        Ok(CandidateSql {
            sql,
            attempt,
            rationale: extract_rationale(&reply).unwrap_or_default(),
            feedback,
        })
    }

    pub fn build_prompt(
        &self,
        question: &Question,
        context: &RetrievalContext,
        history: &ConversationHistory,
        feedback: Option<&Feedback>,
    ) -> Prompt {
        let mut system = String::from(SYSTEM_RULES);

        let notes: Vec<&str> = context.exemplars.iter().filter_map(|e| e.context.as_deref()).collect();
        if !notes.is_empty() {
            system.push_str("\n\nBusiness Context:\n");
            for note in notes {
                system.push_str(&format!("- {}\n", note));
            }
        }

        if !context.exemplars.is_empty() {
            system.push_str("\n\nSimilar Query Examples:\n");
            for exemplar in &context.exemplars {
                system.push_str(&format!("\nQuestion: {}\n```sql\n{}\n```\n", exemplar.question, exemplar.sql));
            }
        }

        let mut user = context.schema.render_for_prompt();

        if let Some(section) = history.render_for_prompt(self.history_window) {
            user.push('\n');
            user.push_str(&section);
        }

        if let Some(replaced) = question.replaces {
            user.push_str(&format!(
                "\nThis rephrases question Q{}, which could not be answered.\n",
                replaced
            ));
        }

        user.push_str(&format!("\nQuestion: {}\n", question.text));

        if let Some(feedback) = feedback {
            user.push_str("\n# PREVIOUS ATTEMPT FAILED\n\n");
            if let Some(sql) = &feedback.failed_sql {
                user.push_str(&format!("Failing SQL:\n```sql\n{}\n```\n", sql));
            }
            user.push_str(&format!("Error: {}\n", feedback.message));
            user.push_str("Write a corrected query that avoids this error.\n");
        }

        user.push_str("\nGenerate SQL query:");
        Prompt::new(system, user)
    }
}

/// Pulls the statement out of a model reply: a ```sql block, a bare ``` block, or
/// the first line starting with SELECT or WITH up to the terminating semicolon.
pub fn extract_sql(content: &str) -> Option<String> {
    // Try to extract SQL from between ```sql and ``` markers, whatever the tag's case.
    // ASCII lowercasing keeps byte offsets valid for `content`.
    if let Some(start) = content.to_ascii_lowercase().find("```sql") {
        let after = &content[start + 6..];
        if let Some(end) = after.find("```") {
            return non_empty(&after[..end]);
        }
    }

    // Try alternate syntax without a language specifier
    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            return non_empty(&after[..end]);
        }
    }

    // Look for a line starting with SELECT or WITH and collect until the statement ends
    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim().to_uppercase();
        if !(trimmed.starts_with("SELECT") || trimmed.starts_with("WITH")) {
            continue;
        }

        let mut sql = line.trim().to_string();
        if !sql.ends_with(';') {
            for next_line in &lines[i + 1..] {
                let next_line = next_line.trim();
                if next_line.is_empty() || next_line.starts_with("```") || next_line.starts_with("Rationale:") {
                    break;
                }
                sql.push(' ');
                sql.push_str(next_line);
                if next_line.ends_with(';') {
                    break;
                }
            }
        }
        return Some(sql);
    }

    None
}

fn extract_rationale(content: &str) -> Option<String> {
    // Models sometimes bold the label: **Rationale:** ...
    let re = Regex::new(r"(?im)^\s*\**rationale\**\s*:\**\s*(\S.*)$").ok()?;
    re.captures(content).map(|caps| caps[1].trim().to_string())
}

fn non_empty(sql: &str) -> Option<String> {
    let sql = sql.trim();
    if sql.is_empty() { None } else { Some(sql.to_string()) }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
