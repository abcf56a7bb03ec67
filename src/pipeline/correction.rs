//! Generate → validate → execute, retried with error feedback up to a fixed budget.

use crate::pipeline::error::{
    Attempt, AttemptOutcome, ExecutionErrorKind, FailureKind, GenerationFailure, PipelineFailure,
};
use crate::pipeline::executor::{QueryExecutor, TabularResult};
use crate::pipeline::generator::{CandidateSql, Feedback, SqlGenerator};
use crate::pipeline::history::{ConversationHistory, Question};
use crate::pipeline::metrics::{StageTimings, millis};
use crate::pipeline::retrieval::{RetrievalContext, Retriever};
use crate::pipeline::validator::SqlValidator;
use crate::schema::SchemaSnapshot;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observable states of the loop, recorded in order for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Start,
    Retrieving,
    Generating,
    Validating,
    Executing,
    Success,
    ExhaustedRetries,
}

enum Step {
    Start,
    Retrieving,
    Generating(Option<Feedback>),
    Validating(CandidateSql),
    Executing(CandidateSql),
    Success(CandidateSql, TabularResult),
    Exhausted(FailureKind),
}

impl Step {
    fn state(&self) -> LoopState {
        match self {
            Step::Start => LoopState::Start,
            Step::Retrieving => LoopState::Retrieving,
            Step::Generating(_) => LoopState::Generating,
            Step::Validating(_) => LoopState::Validating,
            Step::Executing(_) => LoopState::Executing,
            Step::Success(..) => LoopState::Success,
            Step::Exhausted(_) => LoopState::ExhaustedRetries,
        }
    }
}

/// A run that produced rows.
#[derive(Debug, Clone)]
pub struct LoopSuccess {
    pub candidate: CandidateSql,
    pub result: TabularResult,
    pub attempts: Vec<Attempt>,
    pub trace: Vec<LoopState>,
}

pub struct CorrectionLoop {
    retriever: Retriever,
    generator: SqlGenerator,
    validator: SqlValidator,
    executor: QueryExecutor,
    max_attempts: u32,
}

impl CorrectionLoop {
    pub fn new(
        retriever: Retriever,
        generator: SqlGenerator,
        validator: SqlValidator,
        executor: QueryExecutor,
        max_attempts: u32,
    ) -> Self {
        Self {
            retriever,
            generator,
            validator,
            executor,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn run(
        &self,
        question: &Question,
        history: &ConversationHistory,
        schema: &SchemaSnapshot,
    ) -> Result<LoopSuccess, PipelineFailure> {
        let mut step = Step::Start;
        let mut trace = vec![LoopState::Start];
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut context: Option<RetrievalContext> = None;
        let mut attempt: u32 = 0;
        let mut timings = StageTimings::default();

        loop {
            step = match step {
                Step::Start => Step::Retrieving,

                Step::Retrieving => {
                    context = Some(self.retriever.retrieve(&question.text, history, schema));
                    Step::Generating(None)
                }

                Step::Generating(feedback) => match context.as_ref() {
                    None => Step::Retrieving,
                    Some(ctx) => {
                        attempt += 1;
                        timings = StageTimings::default();
                        let started = Instant::now();
                        let generated = self.generator.generate(question, ctx, history, attempt, feedback).await;
                        timings.generation_ms = millis(started.elapsed());
                        match generated {
                            Ok(candidate) => Step::Validating(candidate),
                            Err(error) => {
                                let message = error.to_string();
                                attempts.push(generation_failed(attempt, error, timings));
                                self.next_after_failure(attempt, FailureKind::GenerationExhausted, None, message)
                            }
                        }
                    }
                },

                Step::Validating(candidate) => {
                    let started = Instant::now();
                    let verdict = self.validator.validate(&candidate.sql, schema);
                    timings.validation_ms = millis(started.elapsed());
                    match verdict {
                        Ok(()) => Step::Executing(candidate),
                        Err(failure) => {
                            info!("Attempt {} rejected: {}", attempt, failure);
                            let message = failure.to_string();
                            attempts.push(Attempt {
                                index: attempt,
                                sql: Some(candidate.sql.clone()),
                                rationale: Some(candidate.rationale.clone()),
                                outcome: AttemptOutcome::Rejected { failure },
                                timings,
                            });
                            self.next_after_failure(
                                attempt,
                                FailureKind::ValidationExhausted,
                                Some(candidate.sql),
                                message,
                            )
                        }
                    }
                }

                Step::Executing(candidate) => {
                    let started = Instant::now();
                    let mut result = self.executor.execute(&candidate.sql).await;
                    if matches!(&result, Err(e) if e.kind == ExecutionErrorKind::ConnectionLost) {
                        warn!("Connection lost on attempt {}; re-executing once", attempt);
                        result = self.executor.execute(&candidate.sql).await;
                    }
                    timings.execution_ms = millis(started.elapsed());

                    match result {
                        Ok(table) => {
                            attempts.push(Attempt {
                                index: attempt,
                                sql: Some(candidate.sql.clone()),
                                rationale: Some(candidate.rationale.clone()),
                                outcome: AttemptOutcome::Succeeded {
                                    row_count: table.row_count(),
                                    truncated: table.truncated,
                                },
                                timings,
                            });
                            Step::Success(candidate, table)
                        }
                        Err(error) => {
                            let message = error.to_string();
                            attempts.push(Attempt {
                                index: attempt,
                                sql: Some(candidate.sql.clone()),
                                rationale: Some(candidate.rationale.clone()),
                                outcome: AttemptOutcome::ExecutionFailed { error },
                                timings,
                            });
                            self.next_after_failure(
                                attempt,
                                FailureKind::ExecutionExhausted,
                                Some(candidate.sql),
                                message,
                            )
                        }
                    }
                }

                Step::Success(candidate, result) => {
                    info!("Question answered on attempt {} of {}", attempt, self.max_attempts);
                    return Ok(LoopSuccess {
                        candidate,
                        result,
                        attempts,
                        trace,
                    });
                }

                Step::Exhausted(kind) => {
                    let last_error = attempts
                        .last()
                        .and_then(|a| a.outcome.error_message())
                        .unwrap_or_else(|| "no attempt was made".to_string());
                    warn!("Giving up after {} attempt(s): {}", attempts.len(), last_error);
                    return Err(PipelineFailure {
                        kind,
                        attempts,
                        last_error,
                        trace,
                    });
                }
            };
            debug!("Correction loop entering {:?}", step.state());
            trace.push(step.state());
        }
    }

    fn next_after_failure(
        &self,
        attempt: u32,
        exhausted: FailureKind,
        failed_sql: Option<String>,
        message: String,
    ) -> Step {
        if attempt >= self.max_attempts {
            Step::Exhausted(exhausted)
        } else {
            Step::Generating(Some(Feedback { failed_sql, message }))
        }
    }
}

fn generation_failed(index: u32, error: GenerationFailure, timings: StageTimings) -> Attempt {
    Attempt {
        index,
        sql: None,
        rationale: None,
        outcome: AttemptOutcome::GenerationFailed { error },
        timings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::{ExecutionError, ViolationKind};
    use crate::pipeline::retrieval::RetrievalLimits;
    use crate::pipeline::testing::{FakeBackend, ScriptedModel, fenced};
    use crate::pipeline::validator::ComplexityLimits;
    use crate::schema::ExemplarCatalog;
    use crate::schema::snapshot::sample_snapshot;
    use std::sync::Arc;
    use std::time::Duration;

    const GOOD_SQL: &str = "SELECT ProductName, Price FROM Product";

    fn build(model: Arc<ScriptedModel>, backend: Arc<FakeBackend>, max_attempts: u32) -> CorrectionLoop {
        let retriever = Retriever::keyword(
            Arc::new(ExemplarCatalog::default()),
            RetrievalLimits {
                top_k: 3,
                max_schema_tables: 8,
            },
        );
        CorrectionLoop::new(
            retriever,
            SqlGenerator::new(model, Duration::from_secs(5), 5),
            SqlValidator::new(ComplexityLimits::default()),
            QueryExecutor::new(backend, Duration::from_secs(5), 100),
            max_attempts,
        )
    }

    async fn run(lp: &CorrectionLoop, text: &str) -> Result<LoopSuccess, PipelineFailure> {
        lp.run(&Question::standalone(text), &ConversationHistory::new(), &sample_snapshot())
            .await
    }

    #[tokio::test]
    async fn first_attempt_success_walks_every_state_once() {
        let model = Arc::new(ScriptedModel::always(&fenced(GOOD_SQL)));
        let backend = Arc::new(FakeBackend::with_rows(3));
        let lp = build(model.clone(), backend.clone(), 3);

        let success = run(&lp, "product prices").await.unwrap();
        assert_eq!(success.candidate.sql, GOOD_SQL);
        assert_eq!(success.attempts.len(), 1);
        assert_eq!(
            success.trace,
            vec![
                LoopState::Start,
                LoopState::Retrieving,
                LoopState::Generating,
                LoopState::Validating,
                LoopState::Executing,
                LoopState::Success,
            ]
        );
        assert_eq!(model.calls(), 1);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn injected_delete_exhausts_validation() {
        let model = Arc::new(ScriptedModel::always(&fenced("DELETE FROM Product")));
        let backend = Arc::new(FakeBackend::with_rows(3));
        let lp = build(model.clone(), backend.clone(), 3);

        let failure = run(&lp, "What are the top 10 products by total revenue?").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ValidationExhausted);
        assert_eq!(failure.attempts.len(), 3);
        assert!(failure.attempts.iter().all(|a| matches!(
            &a.outcome,
            AttemptOutcome::Rejected { failure } if failure.kind == ViolationKind::Unsafe
        )));
        assert_eq!(model.calls(), 3);
        assert_eq!(backend.calls(), 0);
        assert_eq!(failure.trace.last(), Some(&LoopState::ExhaustedRetries));

        // the retry prompt carries the rejected statement and the reason
        let prompts = model.prompts();
        assert!(prompts[1].user.contains("DELETE FROM Product"));
        assert!(prompts[1].user.contains("Unsafe"));
    }

    #[tokio::test]
    async fn execution_errors_are_bounded() {
        let model = Arc::new(ScriptedModel::always(&fenced(GOOD_SQL)));
        let backend = Arc::new(FakeBackend::failing(ExecutionErrorKind::Unknown, "Binder Error: boom"));
        let lp = build(model.clone(), backend.clone(), 3);

        let failure = run(&lp, "prices").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ExecutionExhausted);
        assert_eq!(model.calls(), 3);
        assert_eq!(backend.calls(), 3);
        assert!(failure.last_error.contains("Binder Error: boom"));
        assert_eq!(failure.attempts[2].to_string(), format!("attempt 3: {}", failure.last_error));
    }

    #[tokio::test]
    async fn connection_loss_is_retried_without_an_attempt() {
        let model = Arc::new(ScriptedModel::always(&fenced(GOOD_SQL)));
        let backend = Arc::new(FakeBackend::with_rows(2).then(Err(ExecutionError::new(
            ExecutionErrorKind::ConnectionLost,
            "connection reset",
        ))));
        let lp = build(model.clone(), backend.clone(), 3);

        let success = run(&lp, "prices").await.unwrap();
        assert_eq!(success.attempts.len(), 1);
        assert_eq!(model.calls(), 1);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn repeated_connection_loss_consumes_the_attempt() {
        let lost = || Err(ExecutionError::new(ExecutionErrorKind::ConnectionLost, "connection reset"));
        let model = Arc::new(ScriptedModel::always(&fenced(GOOD_SQL)));
        let backend = Arc::new(FakeBackend::with_rows(2).then(lost()).then(lost()));
        let lp = build(model.clone(), backend.clone(), 3);

        let success = run(&lp, "prices").await.unwrap();
        assert_eq!(success.attempts.len(), 2);
        assert!(matches!(success.attempts[0].outcome, AttemptOutcome::ExecutionFailed { .. }));
        assert_eq!(model.calls(), 2);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn recovers_from_an_unknown_column() {
        let model = Arc::new(ScriptedModel::new(&[fenced("SELECT Colour FROM Product"), fenced(GOOD_SQL)]));
        let backend = Arc::new(FakeBackend::with_rows(2));
        let lp = build(model.clone(), backend.clone(), 3);

        let success = run(&lp, "product colours").await.unwrap();
        assert_eq!(success.candidate.attempt, 2);
        assert_eq!(
            success.candidate.feedback.as_ref().and_then(|f| f.failed_sql.as_deref()),
            Some("SELECT Colour FROM Product")
        );
        assert!(matches!(
            &success.attempts[0].outcome,
            AttemptOutcome::Rejected { failure } if failure.kind == ViolationKind::UnknownIdentifier
        ));
        assert!(model.prompts()[1].user.contains("Colour"));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn generation_failures_loop_back_to_generating() {
        let model = Arc::new(ScriptedModel::always(&fenced(GOOD_SQL)).failing_first("model overloaded"));
        let backend = Arc::new(FakeBackend::with_rows(1));
        let lp = build(model.clone(), backend, 3);

        let success = run(&lp, "prices").await.unwrap();
        assert_eq!(success.attempts.len(), 2);
        assert!(success.attempts[0].sql.is_none());
        assert_eq!(
            &success.trace[..4],
            &[LoopState::Start, LoopState::Retrieving, LoopState::Generating, LoopState::Generating]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_carry_stage_timings() {
        let model = Arc::new(
            ScriptedModel::new(&[fenced("SELECT Colour FROM Product"), fenced(GOOD_SQL)])
                .delayed(Duration::from_millis(300)),
        );
        let backend = Arc::new(FakeBackend::with_rows(2).delayed(Duration::from_millis(700)));
        let lp = build(model, backend, 3);

        let success = run(&lp, "product colours").await.unwrap();
        let rejected = success.attempts[0].timings;
        assert!(rejected.generation_ms >= 300);
        assert_eq!(rejected.execution_ms, 0);

        let answered = success.attempts[1].timings;
        assert!(answered.generation_ms >= 300);
        assert!(answered.execution_ms >= 700);
        assert!(answered.generation_ms < 700);
    }

    #[tokio::test]
    async fn single_attempt_budget_stops_immediately() {
        let model = Arc::new(ScriptedModel::always("NOT_RELEVANT"));
        let lp = build(model.clone(), Arc::new(FakeBackend::with_rows(1)), 1);

        let failure = run(&lp, "what's the weather").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::GenerationExhausted);
        assert_eq!(model.calls(), 1);
    }
}
