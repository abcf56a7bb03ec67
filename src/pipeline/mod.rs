pub mod cache;
pub mod chart;
pub mod correction;
pub mod error;
pub mod executor;
pub mod generator;
pub mod history;
pub mod metrics;
pub mod retrieval;
pub mod summary;
pub mod validator;

#[cfg(test)]
pub mod testing;

use crate::config::AppConfig;
use crate::llm::CompletionModel;
use crate::schema::{ExemplarCatalog, SchemaSnapshot};
use cache::{CacheEntry, CacheStats, Fingerprint, QueryCache};
use chart::{ChartSelector, ChartSpec, KeywordLists};
use chrono::Utc;
use correction::{CorrectionLoop, LoopState};
use error::{Attempt, PipelineFailure};
use executor::{QueryBackend, QueryExecutor, TabularResult};
use generator::SqlGenerator;
use history::{ConversationHistory, Question, SessionStore};
use metrics::{MetricsSummary, MetricsTracker, RunRecord, RunTimings, StageTimings, millis};
use retrieval::{RetrievalLimits, Retriever};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use summary::AnswerSummarizer;
use tokio::time::Instant;
use tracing::{debug, info};
use validator::{ComplexityLimits, SqlValidator};

/// Everything a caller needs to show an answer.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub sql: String,
    pub rationale: String,
    pub result: TabularResult,
    pub chart: ChartSpec,
    /// One-line summary of the rows, when enabled
    pub answer: Option<String>,
    /// Empty on a cache hit
    pub attempts: Vec<Attempt>,
    pub trace: Vec<LoopState>,
    pub cache_hit: bool,
    pub timings: RunTimings,
}

type Gate = tokio::sync::Mutex<()>;

pub struct QueryPipeline {
    correction: CorrectionLoop,
    charts: ChartSelector,
    cache: QueryCache,
    summarizer: Option<AnswerSummarizer>,
    metrics: MetricsTracker,
    in_flight: Mutex<HashMap<Fingerprint, Weak<Gate>>>,
}

impl QueryPipeline {
    pub fn new(correction: CorrectionLoop, charts: ChartSelector, cache: QueryCache, metrics: MetricsTracker) -> Self {
        Self {
            correction,
            charts,
            cache,
            summarizer: None,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: AnswerSummarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn from_config(
        config: &AppConfig,
        model: Arc<dyn CompletionModel>,
        backend: Arc<dyn QueryBackend>,
        catalog: Arc<ExemplarCatalog>,
    ) -> Self {
        let settings = &config.pipeline;
        let retriever = Retriever::keyword(
            catalog,
            RetrievalLimits {
                top_k: settings.top_k_exemplars,
                max_schema_tables: settings.max_schema_tables,
            },
        );
        let model_timeout = Duration::from_millis(config.llm.timeout_ms);
        let generator = SqlGenerator::new(model.clone(), model_timeout, settings.history_window);
        let validator = SqlValidator::new(ComplexityLimits {
            max_joins: settings.max_joins,
            max_nesting_depth: settings.max_nesting_depth,
        });
        let executor = QueryExecutor::new(backend, settings.execution_timeout(), settings.row_cap);

        let pipeline = Self::new(
            CorrectionLoop::new(retriever, generator, validator, executor, settings.max_attempts),
            ChartSelector::new(Box::new(KeywordLists::from_config(settings)), settings.bar_max_rows),
            QueryCache::new(config.cache.capacity, config.cache.scope),
            MetricsTracker::new(settings.metrics_history, settings.slow_query_threshold()),
        );
        if settings.summarize_answers {
            pipeline.with_summarizer(AnswerSummarizer::new(model, model_timeout, settings.summary_max_rows))
        } else {
            pipeline
        }
    }

    /// Answers a question outside any conversation.
    pub async fn run_query(
        &self,
        question: &str,
        history: &ConversationHistory,
        schema: &SchemaSnapshot,
    ) -> Result<PipelineResult, PipelineFailure> {
        self.answer(&Question::standalone(question), None, history, schema).await
    }

    /// Like `run_query`, but gives up as soon as `cancel` resolves. Dropping the returned
    /// future has the same effect. Neither leaves anything in the cache.
    pub async fn run_query_cancellable<C>(
        &self,
        question: &str,
        history: &ConversationHistory,
        schema: &SchemaSnapshot,
        cancel: C,
    ) -> Result<PipelineResult, PipelineFailure>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                info!("Query cancelled by caller");
                Err(PipelineFailure::cancelled())
            }
            result = self.run_query(question, history, schema) => result,
        }
    }

    /// Answers the next question of a conversation. Holding the session for the whole
    /// run keeps one conversation's questions in submission order.
    pub async fn run_in_session(
        &self,
        sessions: &SessionStore,
        session_id: &str,
        text: &str,
        replaces: Option<u64>,
        schema: &SchemaSnapshot,
    ) -> Result<PipelineResult, PipelineFailure> {
        let session = sessions.session(session_id);
        let mut session = session.lock().await;
        let question = session.next_question(text, replaces);
        debug!("Session {} question #{}", session_id, question.sequence);

        let outcome = self.answer(&question, Some(session_id), session.history(), schema).await;
        if let Ok(answer) = &outcome {
            session.record_success(question, &answer.sql, &answer.result);
        }
        outcome
    }

    async fn answer(
        &self,
        question: &Question,
        conversation: Option<&str>,
        history: &ConversationHistory,
        schema: &SchemaSnapshot,
    ) -> Result<PipelineResult, PipelineFailure> {
        let started = Instant::now();
        let version = schema.version();
        self.cache.observe_schema(version, schema.generation());
        let fingerprint = self.cache.fingerprint(&question.text, version, conversation);

        // Runs for one fingerprint take turns; a waiter finds the winner's entry below.
        let gate = self.gate(fingerprint);
        let _turn = gate.lock().await;

        if let Some(entry) = self.cache.lookup(&fingerprint) {
            info!("Cache hit for question: {}", question.text);
            let answer = PipelineResult {
                sql: entry.candidate.sql,
                rationale: entry.candidate.rationale,
                result: entry.result,
                chart: entry.chart,
                answer: entry.answer,
                attempts: Vec::new(),
                trace: Vec::new(),
                cache_hit: true,
                timings: RunTimings {
                    total_ms: millis(started.elapsed()),
                    ..RunTimings::default()
                },
            };
            self.record_success(question, &answer);
            return Ok(answer);
        }

        let success = match self.correction.run(question, history, schema).await {
            Ok(success) => success,
            Err(failure) => {
                self.record_failure(question, &failure, millis(started.elapsed()));
                return Err(failure);
            }
        };

        let charted = Instant::now();
        let chart = self.charts.select(&success.result, &question.text);
        let chart_ms = millis(charted.elapsed());

        let summarized = Instant::now();
        let answer = match &self.summarizer {
            Some(summarizer) => Some(summarizer.summarize(&question.text, &success.result).await),
            None => None,
        };
        let summary_ms = millis(summarized.elapsed());

        self.cache.put(
            fingerprint,
            CacheEntry {
                candidate: success.candidate.clone(),
                result: success.result.clone(),
                chart: chart.clone(),
                answer: answer.clone(),
                schema_version: version,
                created_at: Utc::now(),
            },
        );

        let answer = PipelineResult {
            sql: success.candidate.sql,
            rationale: success.candidate.rationale,
            result: success.result,
            chart,
            answer,
            attempts: success.attempts,
            trace: success.trace,
            cache_hit: false,
            timings: RunTimings {
                total_ms: millis(started.elapsed()),
                chart_ms,
                summary_ms,
            },
        };
        self.record_success(question, &answer);
        Ok(answer)
    }

    fn record_success(&self, question: &Question, answer: &PipelineResult) {
        self.metrics.record(RunRecord {
            question: question.text.clone(),
            timestamp: Utc::now(),
            success: true,
            cache_hit: answer.cache_hit,
            attempts: answer.attempts.len(),
            stages: StageTimings::sum(answer.attempts.iter().map(|a| &a.timings)),
            run: answer.timings,
            row_count: answer.result.row_count(),
            chart: Some(answer.chart.kind),
        });
    }

    fn record_failure(&self, question: &Question, failure: &PipelineFailure, total_ms: u64) {
        self.metrics.record(RunRecord {
            question: question.text.clone(),
            timestamp: Utc::now(),
            success: false,
            cache_hit: false,
            attempts: failure.attempts.len(),
            stages: StageTimings::sum(failure.attempts.iter().map(|a| &a.timings)),
            run: RunTimings {
                total_ms,
                ..RunTimings::default()
            },
            row_count: 0,
            chart: None,
        });
    }

    fn gate(&self, fingerprint: Fingerprint) -> Arc<Gate> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.retain(|_, gate| gate.strong_count() > 0);
        if let Some(gate) = in_flight.get(&fingerprint).and_then(Weak::upgrade) {
            return gate;
        }
        let gate = Arc::new(Gate::new(()));
        in_flight.insert(fingerprint, Arc::downgrade(&gate));
        gate
    }

    /// Drops every cached answer; called when the schema is reloaded.
    pub fn invalidate_schema(&self, new_snapshot: &SchemaSnapshot) {
        self.cache.invalidate(new_snapshot.version(), new_snapshot.generation());
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::cache::CacheScope;
    use crate::pipeline::chart::ChartKind;
    use crate::pipeline::error::FailureKind;
    use crate::pipeline::executor::{ColumnKind, ResultColumn, Value};
    use crate::pipeline::testing::{FakeBackend, ScriptedModel, fenced};
    use crate::schema::snapshot::sample_snapshot;
    use crate::schema::{ColumnSchema, TableSchema};

    const REVENUE_SQL: &str =
        "SELECT p.ProductName, SUM(o.TotalAmount) AS revenue FROM \"Order\" o JOIN Product p ON o.ProductID = p.ProductID GROUP BY p.ProductName ORDER BY revenue DESC LIMIT 10";

    fn pipeline_with(model: Arc<ScriptedModel>, backend: Arc<FakeBackend>, config: AppConfig) -> QueryPipeline {
        QueryPipeline::from_config(&config, model, backend, Arc::new(ExemplarCatalog::default()))
    }

    fn pipeline(model: Arc<ScriptedModel>, backend: Arc<FakeBackend>) -> QueryPipeline {
        pipeline_with(model, backend, AppConfig::default())
    }

    fn changed_snapshot() -> SchemaSnapshot {
        let mut tables: Vec<TableSchema> = sample_snapshot().tables().to_vec();
        tables[0].columns.push(ColumnSchema::new("Color", "VARCHAR", true));
        SchemaSnapshot::new(tables)
    }

    #[tokio::test]
    async fn second_identical_question_is_a_cache_hit() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model.clone(), backend.clone());
        let schema = sample_snapshot();
        let history = ConversationHistory::new();

        let first = pipeline
            .run_query("What are the top 10 products by total revenue?", &history, &schema)
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.chart.kind, ChartKind::Bar);

        let second = pipeline
            .run_query("  what are the TOP 10 products by total revenue? ", &history, &schema)
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.sql, first.sql);
        assert_eq!(second.result, first.result);
        assert_eq!(second.chart, first.chart);
        assert_eq!(model.calls(), 1);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn schema_change_forces_a_fresh_run() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model.clone(), backend);
        let history = ConversationHistory::new();

        pipeline.run_query("revenue by product", &history, &sample_snapshot()).await.unwrap();

        let changed = changed_snapshot();
        pipeline.invalidate_schema(&changed);
        assert_eq!(pipeline.cache_stats().size, 0);

        let again = pipeline.run_query("revenue by product", &history, &changed).await.unwrap();
        assert!(!again.cache_hit);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn a_newer_schema_argument_invalidates_on_its_own() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model.clone(), backend);
        let history = ConversationHistory::new();

        pipeline.run_query("revenue by product", &history, &sample_snapshot()).await.unwrap();
        pipeline.run_query("revenue by product", &history, &changed_snapshot()).await.unwrap();

        let stats = pipeline.cache_stats();
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn a_stale_snapshot_leaves_newer_answers_cached() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model.clone(), backend);
        let history = ConversationHistory::new();
        let old = sample_snapshot().with_generation(1);
        let new = changed_snapshot().with_generation(2);

        pipeline.run_query("revenue by product", &history, &old).await.unwrap();
        pipeline.invalidate_schema(&new);
        pipeline.run_query("revenue by product", &history, &new).await.unwrap();

        // An in-flight request that read the schema before the refresh
        let stale = pipeline.run_query("revenue by product", &history, &old).await.unwrap();
        assert!(!stale.cache_hit);

        let fresh = pipeline.run_query("revenue by product", &history, &new).await.unwrap();
        assert!(fresh.cache_hit);
        assert_eq!(pipeline.cache_stats().invalidations, 1);
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn failures_are_never_cached() {
        let model = Arc::new(ScriptedModel::always(&fenced("DELETE FROM Product")));
        let pipeline = pipeline(model.clone(), Arc::new(FakeBackend::with_rows(1)));
        let history = ConversationHistory::new();
        let schema = sample_snapshot();

        for _ in 0..2 {
            let failure = pipeline
                .run_query("What are the top 10 products by total revenue?", &history, &schema)
                .await
                .unwrap_err();
            assert_eq!(failure.kind, FailureKind::ValidationExhausted);
        }
        assert_eq!(model.calls(), 6);
        assert_eq!(pipeline.cache_stats().size, 0);
    }

    #[tokio::test]
    async fn monthly_revenue_becomes_a_line_chart() {
        let table = TabularResult {
            columns: vec![
                ResultColumn::new("month", ColumnKind::Temporal),
                ResultColumn::new("revenue", ColumnKind::Numeric),
            ],
            rows: vec![
                vec![Value::Text("2024-01-01".into()), Value::Float(100.0)],
                vec![Value::Text("2024-02-01".into()), Value::Float(140.0)],
            ],
            truncated: false,
            row_cap: 0,
        };
        let sql = "SELECT date_trunc('month', OrderDate) AS month, SUM(TotalAmount) AS revenue FROM \"Order\" GROUP BY month ORDER BY month";
        let model = Arc::new(ScriptedModel::always(&fenced(sql)));
        let pipeline = pipeline(model, Arc::new(FakeBackend::returning(table)));

        let answer = pipeline
            .run_query("Plot a line chart of total monthly revenue", &ConversationHistory::new(), &sample_snapshot())
            .await
            .unwrap();
        assert_eq!(answer.chart.kind, ChartKind::Line);
        assert_eq!(answer.chart.x.as_deref(), Some("month"));
        assert_eq!(answer.chart.y.as_deref(), Some("revenue"));
    }

    #[tokio::test]
    async fn oversized_results_are_truncated_to_the_cap() {
        let mut config = AppConfig::default();
        config.pipeline.row_cap = 10;
        let model = Arc::new(ScriptedModel::always(&fenced("SELECT OrderID FROM \"Order\"")));
        let pipeline = pipeline_with(model, Arc::new(FakeBackend::with_rows(25)), config);

        let answer = pipeline
            .run_query("all order ids", &ConversationHistory::new(), &sample_snapshot())
            .await
            .unwrap();
        assert!(answer.result.truncated);
        assert_eq!(answer.result.row_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_questions_share_one_run() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)).delayed(Duration::from_millis(200)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model.clone(), backend);
        let history = ConversationHistory::new();
        let schema = sample_snapshot();

        let (a, b) = tokio::join!(
            pipeline.run_query("revenue by product", &history, &schema),
            pipeline.run_query("Revenue by product", &history, &schema),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.cache_hit, b.cache_hit);
        assert_eq!(a.sql, b.sql);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_leaves_the_cache_untouched() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)).delayed(Duration::from_secs(20)));
        let pipeline = pipeline(model.clone(), Arc::new(FakeBackend::with_rows(1)));

        let failure = pipeline
            .run_query_cancellable(
                "revenue by product",
                &ConversationHistory::new(),
                &sample_snapshot(),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(pipeline.cache_stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_run_leaves_the_cache_untouched() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::with_rows(1).delayed(Duration::from_secs(5)));
        let pipeline = pipeline(model, backend);
        let history = ConversationHistory::new();
        let schema = sample_snapshot();

        let run = pipeline.run_query("revenue by product", &history, &schema);
        assert!(tokio::time::timeout(Duration::from_secs(1), run).await.is_err());
        assert_eq!(pipeline.cache_stats().size, 0);

        // the gate was released with the dropped run
        let answer = pipeline.run_query("revenue by product", &history, &schema).await.unwrap();
        assert!(!answer.cache_hit);
    }

    #[tokio::test]
    async fn summaries_are_added_and_cached_when_enabled() {
        let mut config = AppConfig::default();
        config.pipeline.summarize_answers = true;
        let model = Arc::new(ScriptedModel::new(&[
            fenced(REVENUE_SQL),
            "Laptop brought in the most revenue at 1200.".to_string(),
        ]));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline_with(model.clone(), backend, config);
        let history = ConversationHistory::new();
        let schema = sample_snapshot();

        let first = pipeline.run_query("top products by revenue", &history, &schema).await.unwrap();
        assert_eq!(first.answer.as_deref(), Some("Laptop brought in the most revenue at 1200."));
        assert!(model.prompts()[1].user.starts_with("User question: top products by revenue"));

        let second = pipeline.run_query("top products by revenue", &history, &schema).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.answer, first.answer);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn summaries_are_off_by_default() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model.clone(), backend);

        let answer = pipeline
            .run_query("revenue by product", &ConversationHistory::new(), &sample_snapshot())
            .await
            .unwrap();
        assert!(answer.answer.is_none());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn metrics_count_answers_hits_and_failures() {
        let model = Arc::new(ScriptedModel::new(&[
            fenced("DELETE FROM Product"),
            fenced("DELETE FROM Product"),
            fenced("DELETE FROM Product"),
            fenced(REVENUE_SQL),
        ]));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model, backend);
        let history = ConversationHistory::new();
        let schema = sample_snapshot();

        assert!(pipeline.run_query("drop everything", &history, &schema).await.is_err());
        pipeline.run_query("revenue by product", &history, &schema).await.unwrap();
        pipeline.run_query("revenue by product", &history, &schema).await.unwrap();

        let metrics = pipeline.metrics();
        assert_eq!(metrics.total_runs, 3);
        assert_eq!(metrics.success_rate, 66.7);
        assert_eq!(metrics.chart_distribution.get("bar"), Some(&2));
        assert_eq!(metrics.chart_distribution.get("none"), Some(&1));

        let latest = &metrics.recent[0];
        assert!(latest.cache_hit);
        assert_eq!(latest.attempts, 0);
        let failed = &metrics.recent[2];
        assert!(!failed.success);
        assert_eq!(failed.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_timings_cover_the_stages() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)).delayed(Duration::from_millis(400)));
        let backend = Arc::new(
            FakeBackend::returning(crate::pipeline::testing::revenue_by_product()).delayed(Duration::from_millis(900)),
        );
        let pipeline = pipeline(model, backend);

        let answer = pipeline
            .run_query("revenue by product", &ConversationHistory::new(), &sample_snapshot())
            .await
            .unwrap();
        assert!(answer.timings.total_ms >= 1_300);
        assert!(answer.attempts[0].timings.execution_ms >= 900);

        let metrics = pipeline.metrics();
        assert!(metrics.avg_generation_ms >= 400);
        assert!(metrics.avg_execution_ms >= 900);
        assert!(metrics.slow_queries.is_empty());
    }

    #[tokio::test]
    async fn sessions_feed_history_into_later_prompts() {
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline(model.clone(), backend);
        let sessions = SessionStore::new();
        let schema = sample_snapshot();

        pipeline
            .run_in_session(&sessions, "s1", "top products by revenue", None, &schema)
            .await
            .unwrap();
        pipeline
            .run_in_session(&sessions, "s1", "and the worst ones?", None, &schema)
            .await
            .unwrap();

        let prompts = model.prompts();
        assert!(prompts[1].user.contains("Q1: top products by revenue"));
        let history = sessions.history("s1").await.unwrap();
        assert_eq!(history.turns().len(), 2);
        assert_eq!(history.turns()[1].question.sequence, 2);
    }

    #[tokio::test]
    async fn conversation_scope_keeps_sessions_apart() {
        let mut config = AppConfig::default();
        config.cache.scope = CacheScope::Conversation;
        let model = Arc::new(ScriptedModel::always(&fenced(REVENUE_SQL)));
        let backend = Arc::new(FakeBackend::returning(crate::pipeline::testing::revenue_by_product()));
        let pipeline = pipeline_with(model.clone(), backend, config);
        let sessions = SessionStore::new();
        let schema = sample_snapshot();

        let a = pipeline.run_in_session(&sessions, "a", "revenue by product", None, &schema).await.unwrap();
        let b = pipeline.run_in_session(&sessions, "b", "revenue by product", None, &schema).await.unwrap();
        let a_again = pipeline.run_in_session(&sessions, "a", "revenue by product", None, &schema).await.unwrap();

        assert!(!a.cache_hit);
        assert!(!b.cache_hit);
        assert!(a_again.cache_hit);
        assert_eq!(model.calls(), 2);
    }
}
