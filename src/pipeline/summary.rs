//! One-line natural-language answer over the returned rows.

use crate::llm::{CompletionModel, Prompt};
use crate::pipeline::executor::TabularResult;
use serde_json::{Map, Value as Json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const NO_DATA_ANSWER: &str = "The query executed successfully but returned no matching data. \
This could mean no records match the specified criteria in the database.";

const SYSTEM_RULES: &str = "You format database query results into a human-readable response to the user's question. \
Be concise and state the numbers that answer the question. \
Do not give the answer in markdown format. Only give the answer in one line.";

pub struct AnswerSummarizer {
    model: Arc<dyn CompletionModel>,
    timeout: Duration,
    /// Rows shown to the model
    max_rows: usize,
}

impl AnswerSummarizer {
    pub fn new(model: Arc<dyn CompletionModel>, timeout: Duration, max_rows: usize) -> Self {
        Self {
            model,
            timeout,
            max_rows: max_rows.max(1),
        }
    }

    /// Never fails: a model error falls back to a row count.
    pub async fn summarize(&self, question: &str, table: &TabularResult) -> String {
        if table.rows.is_empty() {
            return NO_DATA_ANSWER.to_string();
        }

        let prompt = Prompt::new(
            SYSTEM_RULES,
            format!(
                "User question: {}\n\nQuery results: {}\n\nFormatted response:",
                question,
                self.render_rows(table)
            ),
        );

        let reply = match tokio::time::timeout(self.timeout, self.model.complete(&prompt)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Answer summary failed: {}", e);
                return fallback(table);
            }
            Err(_) => {
                warn!("Answer summary timed out after {:?}", self.timeout);
                return fallback(table);
            }
        };

        match reply.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(line) => {
                debug!("Answer summary: {}", line);
                line.to_string()
            }
            None => fallback(table),
        }
    }

    fn render_rows(&self, table: &TabularResult) -> String {
        let rows: Vec<Json> = table
            .rows
            .iter()
            .take(self.max_rows)
            .map(|row| {
                let object: Map<String, Json> = table
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| (column.name.clone(), serde_json::to_value(value).unwrap_or(Json::Null)))
                    .collect();
                Json::Object(object)
            })
            .collect();
        let mut rendered = Json::Array(rows).to_string();
        if table.rows.len() > self.max_rows {
            rendered.push_str(&format!(" ({} more rows not shown)", table.rows.len() - self.max_rows));
        }
        rendered
    }
}

fn fallback(table: &TabularResult) -> String {
    format!("Query returned {} result(s).", table.row_count())
}
