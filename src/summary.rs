//! Run-level result aggregation
//!
//! [`ResultAggregator`] folds task results in whatever order they complete into
//! a [`RunSummary`] that does not depend on that order.

use crate::{
    config::EngineKind,
    error::{ErrorDescriptor, Result},
    types::{SkipReason, TaskResult, TaskStatus},
    utils::ProviderChoice,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::time::Duration;

/// Exit code for a run without failures
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when at least one task failed
pub const EXIT_FAILURES: i32 = 1;
/// Exit code for a cancelled run
pub const EXIT_CANCELLED: i32 = 130;

/// Skipped tasks broken down by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub unsupported_extension: usize,
    pub output_exists: usize,
    pub cancelled: usize,
}

impl SkipCounts {
    fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::UnsupportedExtension => self.unsupported_extension += 1,
            SkipReason::OutputExists => self.output_exists += 1,
            SkipReason::Cancelled => self.cancelled += 1,
        }
    }
}

/// A failed task as reported in the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Source path relative to the input root
    pub relative: PathBuf,
    pub error: ErrorDescriptor,
}

/// Failure ordered by path, then message and kind
#[derive(Debug, Clone, PartialEq, Eq)]
struct RankedFailure(FailureRecord);

impl Ord for RankedFailure {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .relative
            .cmp(&other.0.relative)
            .then_with(|| self.0.error.message.cmp(&other.0.error.message))
            .then_with(|| self.0.error.kind.cmp(&other.0.error.kind))
    }
}

impl PartialOrd for RankedFailure {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Final report of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Results recorded (every enumerated entry that was dispatched)
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub skip_reasons: SkipCounts,
    /// Failures sorted by relative path, capped at `max_reported_errors`
    pub failures: Vec<FailureRecord>,
    /// Failures beyond the cap
    pub omitted_failures: usize,
    /// Wall time of the run
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub engine: Option<EngineKind>,
    pub provider: Option<ProviderChoice>,
    pub workers: usize,
    pub cancelled: bool,
}

impl RunSummary {
    /// No failures and not cancelled
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Process exit code: 0 on success, 1 on failures, 130 on cancellation
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.failed > 0 {
            EXIT_FAILURES
        } else {
            EXIT_SUCCESS
        }
    }

    /// Serialize as pretty-printed JSON
    ///
    /// # Errors
    /// - `Internal` if serialization fails
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::BatchError::internal(format!("Failed to serialize run summary: {e}"))
        })
    }

    /// Mean wall time per task that was not skipped
    #[must_use]
    pub fn mean_task_time(&self) -> Option<Duration> {
        let processed = self.succeeded + self.failed;
        u32::try_from(processed)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.elapsed / n)
    }
}

/// Accumulates task results into a [`RunSummary`]
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    started_at: DateTime<Utc>,
    engine: Option<EngineKind>,
    provider: Option<ProviderChoice>,
    workers: usize,
    max_reported_errors: usize,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    skip_reasons: SkipCounts,
    /// The `max_reported_errors` lowest-ranked failures seen so far; the top is the
    /// first to be evicted
    failures: BinaryHeap<RankedFailure>,
    failure_records: usize,
}

impl ResultAggregator {
    #[must_use]
    pub fn new(max_reported_errors: usize) -> Self {
        Self {
            started_at: Utc::now(),
            engine: None,
            provider: None,
            workers: 0,
            max_reported_errors,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            skip_reasons: SkipCounts::default(),
            failures: BinaryHeap::new(),
            failure_records: 0,
        }
    }

    /// Record the engine and provider the run used
    #[must_use]
    pub fn with_engine(mut self, engine: EngineKind, provider: ProviderChoice) -> Self {
        self.engine = Some(engine);
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Add one task result
    pub fn record(&mut self, result: &TaskResult) {
        match result.status() {
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => {
                self.failed += 1;
                if let Some(error) = result.error() {
                    self.keep_failure(RankedFailure(FailureRecord {
                        relative: result.relative.clone(),
                        error: error.clone(),
                    }));
                }
            },
            TaskStatus::Skipped => {
                self.skipped += 1;
                if let Some(reason) = result.skip_reason() {
                    self.skip_reasons.record(reason);
                }
            },
        }
    }

    fn keep_failure(&mut self, failure: RankedFailure) {
        self.failure_records += 1;
        if self.failures.len() < self.max_reported_errors {
            self.failures.push(failure);
        } else if self.failures.peek().is_some_and(|worst| failure < *worst) {
            self.failures.pop();
            self.failures.push(failure);
        }
    }

    /// Results recorded so far
    #[must_use]
    pub fn recorded(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    /// Produce the summary
    #[must_use]
    pub fn finish(self, elapsed: Duration, cancelled: bool) -> RunSummary {
        let total = self.recorded();
        let failures: Vec<FailureRecord> = self
            .failures
            .into_sorted_vec()
            .into_iter()
            .map(|ranked| ranked.0)
            .collect();
        let omitted_failures = self.failure_records - failures.len();

        RunSummary {
            total,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            skip_reasons: self.skip_reasons,
            failures,
            omitted_failures,
            elapsed,
            started_at: self.started_at,
            engine: self.engine,
            provider: self.provider,
            workers: self.workers,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BatchError, ErrorKind};
    use crate::types::{ImageTask, ProcessingTimings};

    fn task(name: &str) -> ImageTask {
        ImageTask {
            source: PathBuf::from("/in").join(name),
            relative: PathBuf::from(name),
            output: PathBuf::from("/out").join(name).with_extension("tiff"),
        }
    }

    fn results() -> Vec<TaskResult> {
        vec![
            TaskResult::succeeded(&task("a.png"), Duration::from_millis(5), ProcessingTimings::default()),
            TaskResult::failed(&task("z.png"), Duration::ZERO, &BatchError::inference("bad")),
            TaskResult::skipped(&task("c.txt"), SkipReason::UnsupportedExtension),
            TaskResult::failed(
                &task("b.png"),
                Duration::ZERO,
                &BatchError::unsupported_format("corrupt"),
            ),
            TaskResult::skipped(&task("d.png"), SkipReason::Cancelled),
        ]
    }

    #[test]
    fn test_counts() {
        let mut aggregator = ResultAggregator::new(20);
        for result in &results() {
            aggregator.record(result);
        }
        assert_eq!(aggregator.recorded(), 5);
        let summary = aggregator.finish(Duration::from_secs(1), false);

        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.skip_reasons.unsupported_extension, 1);
        assert_eq!(summary.skip_reasons.cancelled, 1);
        assert!(!summary.is_success());
        assert_eq!(summary.exit_code(), EXIT_FAILURES);
    }

    #[test]
    fn test_order_independent() {
        let forward = results();
        let mut backward = results();
        backward.reverse();

        let mut a = ResultAggregator::new(20);
        forward.iter().for_each(|r| a.record(r));
        let mut b = ResultAggregator::new(20);
        backward.iter().for_each(|r| b.record(r));

        let a = a.finish(Duration::ZERO, false);
        let b = b.finish(Duration::ZERO, false);
        assert_eq!(a.failures, b.failures);
        assert_eq!(
            (a.succeeded, a.failed, a.skipped),
            (b.succeeded, b.failed, b.skipped)
        );
        assert_eq!(a.failures[0].relative, PathBuf::from("b.png"));
        assert_eq!(a.failures[0].error.kind, ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_failures_are_capped() {
        let mut aggregator = ResultAggregator::new(1);
        for result in &results() {
            aggregator.record(result);
        }
        let summary = aggregator.finish(Duration::ZERO, false);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.omitted_failures, 1);
        assert_eq!(summary.failed, 2);
    }

    #[test]
    fn test_failure_cap_bounds_memory_and_keeps_lowest_paths() {
        let names: Vec<String> = (0..50).map(|i| format!("f{:02}.png", (i * 37) % 50)).collect();
        let mut aggregator = ResultAggregator::new(3);
        for name in &names {
            aggregator.record(&TaskResult::failed(
                &task(name),
                Duration::ZERO,
                &BatchError::inference("bad"),
            ));
            assert!(aggregator.failures.len() <= 3);
        }

        let summary = aggregator.finish(Duration::ZERO, false);
        let kept: Vec<PathBuf> = summary.failures.iter().map(|f| f.relative.clone()).collect();
        assert_eq!(
            kept,
            vec![
                PathBuf::from("f00.png"),
                PathBuf::from("f01.png"),
                PathBuf::from("f02.png")
            ]
        );
        assert_eq!(summary.failed, 50);
        assert_eq!(summary.omitted_failures, 47);
    }

    #[test]
    fn test_zero_failure_cap_keeps_counts() {
        let mut aggregator = ResultAggregator::new(0);
        for result in &results() {
            aggregator.record(result);
        }
        let summary = aggregator.finish(Duration::ZERO, false);
        assert!(summary.failures.is_empty());
        assert_eq!(summary.omitted_failures, 2);
        assert_eq!(summary.exit_code(), EXIT_FAILURES);
    }

    #[test]
    fn test_exit_codes() {
        let empty = ResultAggregator::new(20).finish(Duration::ZERO, false);
        assert!(empty.is_success());
        assert_eq!(empty.exit_code(), EXIT_SUCCESS);
        assert_eq!(empty.mean_task_time(), None);

        let cancelled = ResultAggregator::new(20).finish(Duration::ZERO, true);
        assert!(!cancelled.is_success());
        assert_eq!(cancelled.exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_summary_json() {
        let mut aggregator = ResultAggregator::new(20)
            .with_engine(
                EngineKind::Mock,
                ProviderChoice::cpu_only(crate::config::ExecutionProvider::Auto, "mock"),
            )
            .with_workers(2);
        for result in &results() {
            aggregator.record(result);
        }
        let json = aggregator.finish(Duration::from_millis(1500), false).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["succeeded"], 1);
        assert_eq!(value["engine"], "mock");
        assert_eq!(value["provider"]["used"], "mock");
        assert_eq!(value["workers"], 2);
        assert_eq!(value["failures"][0]["error"]["kind"], "unsupported_format");
        assert_eq!(value["cancelled"], false);
    }
}
