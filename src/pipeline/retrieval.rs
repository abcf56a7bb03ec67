use crate::pipeline::history::ConversationHistory;
use crate::schema::{Exemplar, ExemplarCatalog, SchemaSnapshot};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "give", "how", "i", "in",
    "is", "it", "list", "me", "many", "much", "of", "on", "or", "our", "please", "show", "tell", "that", "the",
    "their", "there", "this", "to", "us", "was", "we", "were", "what", "when", "where", "which", "who", "with",
    "you",
];

/// Scores how relevant an exemplar is to a question. Zero means unrelated.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, question: &str, exemplar: &Exemplar) -> f64;
}

/// Jaccard overlap of the normalized keyword sets.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordOverlapScorer;

pub fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

impl SimilarityScorer for KeywordOverlapScorer {
    fn score(&self, question: &str, exemplar: &Exemplar) -> f64 {
        let a = keywords(question);
        let b = keywords(&exemplar.question);
        let union = a.union(&b).count();
        if union == 0 {
            return 0.0;
        }
        a.intersection(&b).count() as f64 / union as f64
    }
}

/// Grounding material for one generation: the closest exemplars and the tables they need.
#[derive(Debug, Clone)]
pub struct RetrievalContext {
    pub exemplars: Vec<Exemplar>,
    pub schema: SchemaSnapshot,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalLimits {
    pub top_k: usize,
    pub max_schema_tables: usize,
}

pub struct Retriever {
    scorer: Box<dyn SimilarityScorer>,
    catalog: Arc<ExemplarCatalog>,
    limits: RetrievalLimits,
}

impl Retriever {
    pub fn new(scorer: Box<dyn SimilarityScorer>, catalog: Arc<ExemplarCatalog>, limits: RetrievalLimits) -> Self {
        Self { scorer, catalog, limits }
    }

    pub fn keyword(catalog: Arc<ExemplarCatalog>, limits: RetrievalLimits) -> Self {
        Self::new(Box::new(KeywordOverlapScorer), catalog, limits)
    }

    pub fn retrieve(&self, question: &str, history: &ConversationHistory, schema: &SchemaSnapshot) -> RetrievalContext {
        let exemplars = self.top_exemplars(question);

        // Tables named in the question come first, then those the exemplars use.
        let mut wanted: Vec<String> = Vec::new();
        let mut add = |name: &str| {
            let lower = name.to_lowercase();
            if !wanted.contains(&lower) {
                wanted.push(lower);
            }
        };

        let named = tables_named_in_question(question, schema);
        for name in &named {
            add(name);
        }
        // A follow-up that names no table keeps working on the previous answer's tables
        if named.is_empty() {
            if let Some(turn) = history.turns().last() {
                for name in tables_in_sql(&turn.sql, schema) {
                    add(&name);
                }
            }
        }
        for exemplar in &exemplars {
            for name in tables_in_sql(&exemplar.sql, schema) {
                add(&name);
            }
        }

        if wanted.is_empty() {
            wanted = schema
                .tables()
                .iter()
                .take(self.limits.max_schema_tables)
                .map(|t| t.name.to_lowercase())
                .collect();
        }
        wanted.truncate(self.limits.max_schema_tables);

        let fragment = schema.subset(&wanted.into_iter().collect());
        debug!(
            "Retrieved {} exemplar(s) and {} table(s) for question",
            exemplars.len(),
            fragment.tables().len()
        );

        RetrievalContext {
            exemplars,
            schema: fragment,
        }
    }

    fn top_exemplars(&self, question: &str) -> Vec<Exemplar> {
        let mut scored: Vec<(f64, usize)> = self
            .catalog
            .exemplars()
            .iter()
            .enumerate()
            .map(|(index, exemplar)| (self.scorer.score(question, exemplar), index))
            .filter(|(score, _)| *score > 0.0)
            .collect();

        // Highest score first; the later-registered exemplar wins a tie
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));

        scored
            .into_iter()
            .take(self.limits.top_k)
            .map(|(_, index)| self.catalog.exemplars()[index].clone())
            .collect()
    }
}

fn tables_named_in_question(question: &str, schema: &SchemaSnapshot) -> Vec<String> {
    let mut found = Vec::new();
    for word in question.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if word.is_empty() {
            continue;
        }
        let singular = word.strip_suffix(['s', 'S']).unwrap_or(word);
        for table in schema.tables() {
            if (table.answers_to(word) || table.answers_to(singular)) && !found.contains(&table.name) {
                found.push(table.name.clone());
            }
        }
    }
    found
}

fn tables_in_sql(sql: &str, schema: &SchemaSnapshot) -> Vec<String> {
    let words: Vec<&str> = sql
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();
    let mut found = Vec::new();
    for (i, word) in words.iter().enumerate() {
        // ORDER BY / GROUP BY are not table references
        if words.get(i + 1).is_some_and(|next| next.eq_ignore_ascii_case("by")) {
            continue;
        }
        if let Some(table) = schema.table(word) {
            if !found.contains(&table.name) {
                found.push(table.name.clone());
            }
        }
    }
    found
}
