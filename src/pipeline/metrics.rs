//! Per-stage timings and a rolling window of recent runs for `/api/status`.

use crate::pipeline::chart::ChartKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

const RECENT_SHOWN: usize = 10;
const SLOW_KEPT: usize = 20;

/// Time spent in each stage of one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub generation_ms: u64,
    pub validation_ms: u64,
    pub execution_ms: u64,
}

impl StageTimings {
    /// Stage totals across attempts.
    pub fn sum<'a>(timings: impl IntoIterator<Item = &'a StageTimings>) -> StageTimings {
        timings.into_iter().fold(StageTimings::default(), |acc, t| StageTimings {
            generation_ms: acc.generation_ms + t.generation_ms,
            validation_ms: acc.validation_ms + t.validation_ms,
            execution_ms: acc.execution_ms + t.execution_ms,
        })
    }
}

/// Timings of a whole run, on top of the per-attempt ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTimings {
    pub total_ms: u64,
    pub chart_ms: u64,
    pub summary_ms: u64,
}

pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One finished run, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub question: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub cache_hit: bool,
    pub attempts: usize,
    pub stages: StageTimings,
    pub run: RunTimings,
    pub row_count: usize,
    pub chart: Option<ChartKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub question: String,
    pub timestamp: DateTime<Utc>,
    pub total_ms: u64,
    pub generation_ms: u64,
    pub execution_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentRun {
    pub question: String,
    pub total_ms: u64,
    pub success: bool,
    pub cache_hit: bool,
    pub attempts: usize,
    pub row_count: usize,
    pub chart: Option<ChartKind>,
}

/// Aggregates over the kept runs
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_runs: usize,
    pub success_rate: f64,
    pub avg_total_ms: u64,
    pub avg_generation_ms: u64,
    pub avg_validation_ms: u64,
    pub avg_execution_ms: u64,
    pub avg_chart_ms: u64,
    pub avg_summary_ms: u64,
    /// Share of runs that finished under the slow threshold, in percent
    pub under_threshold_rate: f64,
    pub chart_distribution: BTreeMap<String, usize>,
    pub recent: Vec<RecentRun>,
    pub slow_queries: Vec<SlowQuery>,
}

#[derive(Default)]
struct Inner {
    runs: VecDeque<RunRecord>,
    slow: VecDeque<SlowQuery>,
}

pub struct MetricsTracker {
    inner: Mutex<Inner>,
    history: usize,
    slow_threshold: Duration,
}

impl MetricsTracker {
    pub fn new(history: usize, slow_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            history: history.max(1),
            slow_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, record: RunRecord) {
        let mut inner = self.lock();

        if record.run.total_ms > millis(self.slow_threshold) {
            warn!(
                "Slow question ({}ms, generation {}ms, execution {}ms): {}",
                record.run.total_ms, record.stages.generation_ms, record.stages.execution_ms, record.question
            );
            inner.slow.push_back(SlowQuery {
                question: record.question.clone(),
                timestamp: record.timestamp,
                total_ms: record.run.total_ms,
                generation_ms: record.stages.generation_ms,
                execution_ms: record.stages.execution_ms,
            });
            if inner.slow.len() > SLOW_KEPT {
                inner.slow.pop_front();
            }
        }

        inner.runs.push_back(record);
        if inner.runs.len() > self.history {
            inner.runs.pop_front();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = self.lock();
        let runs = &inner.runs;
        let total = runs.len();

        let average = |value: fn(&RunRecord) -> u64| -> u64 {
            if total == 0 { 0 } else { runs.iter().map(value).sum::<u64>() / total as u64 }
        };
        let percent = |count: usize| -> f64 {
            if total == 0 { 0.0 } else { (count as f64 / total as f64 * 1000.0).round() / 10.0 }
        };

        let threshold = millis(self.slow_threshold);
        let mut chart_distribution = BTreeMap::new();
        for run in runs.iter() {
            let label = match run.chart {
                Some(kind) => format!("{:?}", kind).to_lowercase(),
                None => "none".to_string(),
            };
            *chart_distribution.entry(label).or_insert(0) += 1;
        }

        MetricsSummary {
            total_runs: total,
            success_rate: percent(runs.iter().filter(|r| r.success).count()),
            avg_total_ms: average(|r| r.run.total_ms),
            avg_generation_ms: average(|r| r.stages.generation_ms),
            avg_validation_ms: average(|r| r.stages.validation_ms),
            avg_execution_ms: average(|r| r.stages.execution_ms),
            avg_chart_ms: average(|r| r.run.chart_ms),
            avg_summary_ms: average(|r| r.run.summary_ms),
            under_threshold_rate: percent(runs.iter().filter(|r| r.run.total_ms <= threshold).count()),
            chart_distribution,
            recent: runs
                .iter()
                .rev()
                .take(RECENT_SHOWN)
                .map(|r| RecentRun {
                    question: r.question.clone(),
                    total_ms: r.run.total_ms,
                    success: r.success,
                    cache_hit: r.cache_hit,
                    attempts: r.attempts,
                    row_count: r.row_count,
                    chart: r.chart,
                })
                .collect(),
            slow_queries: inner.slow.iter().rev().take(RECENT_SHOWN).cloned().collect(),
        }
    }
}
