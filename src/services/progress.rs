//! Progress reporting service
//!
//! Batch runs publish one [`TaskResult`] per enumerated file. Reporters observe
//! that stream so different frontends can render progress their own way.

use crate::summary::RunSummary;
use crate::types::{TaskResult, TaskStatus};
use instant::Instant;
use std::sync::Mutex;

/// Stages a single task passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingStage {
    Decode,
    Inference,
    Compose,
    Encode,
}

impl ProcessingStage {
    /// Get a human-readable description of the processing stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Decode => "Decoding source image",
            Self::Inference => "Running segmentation",
            Self::Compose => "Applying mask",
            Self::Encode => "Writing TIFF",
        }
    }

    /// Name used in tracing fields
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Inference => "inference",
            Self::Compose => "compose",
            Self::Encode => "encode",
        }
    }
}

/// Running counts after each reported result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProgressUpdate {
    pub completed: usize,
    /// Total tasks, when the frontend counted them up front
    pub total: Option<usize>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
}

impl BatchProgressUpdate {
    /// Completion percentage, if the total is known
    #[must_use]
    pub fn percentage(&self) -> Option<u8> {
        self.total.filter(|t| *t > 0).map(|total| {
            let pct = self.completed.min(total) * 100 / total;
            u8::try_from(pct).unwrap_or(100)
        })
    }
}

/// Trait for observing a batch run
pub trait ProgressReporter: Send + Sync {
    /// Called once before the first result
    ///
    /// # Arguments
    /// * `total` - Number of tasks if known
    fn report_started(&self, total: Option<usize>) {
        drop(total);
    }

    /// Called for every task result, in completion order
    fn report_result(&self, result: &TaskResult, update: BatchProgressUpdate);

    /// Called once with the final summary
    fn report_finished(&self, summary: &RunSummary);
}

/// No-op progress reporter that discards all progress updates
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_result(&self, _result: &TaskResult, _update: BatchProgressUpdate) {}

    fn report_finished(&self, _summary: &RunSummary) {}
}

/// Console progress reporter that writes through the `log` facade
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    /// Create a new console progress reporter
    ///
    /// # Arguments
    /// * `verbose` - Also log successes and skips, not only failures
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_started(&self, total: Option<usize>) {
        match total {
            Some(total) => log::info!("Processing {total} files"),
            None => log::info!("Processing files"),
        }
    }

    fn report_result(&self, result: &TaskResult, update: BatchProgressUpdate) {
        let prefix = match update.percentage() {
            Some(pct) => format!("[{pct}%]"),
            None => format!("[{}]", update.completed),
        };
        match result.status() {
            TaskStatus::Failed => {
                if let Some(error) = result.error() {
                    log::error!("{prefix} ❌ {}: {}", result.relative.display(), error.message);
                }
            },
            TaskStatus::Succeeded if self.verbose => {
                log::info!(
                    "{prefix} ✅ {} ({}ms)",
                    result.relative.display(),
                    result.elapsed.as_millis()
                );
            },
            TaskStatus::Skipped if self.verbose => {
                if let Some(reason) = result.skip_reason() {
                    log::info!("{prefix} ⏭️  {} ({reason})", result.relative.display());
                }
            },
            _ => {},
        }
    }

    fn report_finished(&self, summary: &RunSummary) {
        log::info!(
            "Finished: {} succeeded, {} failed, {} skipped in {:.2}s",
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.elapsed.as_secs_f64()
        );
        if summary.cancelled {
            log::warn!("Run was cancelled before all files were processed");
        }
    }
}

/// Counts results and forwards them to a reporter
pub struct ProgressTracker {
    reporter: Box<dyn ProgressReporter>,
    start_time: Instant,
    update: Mutex<BatchProgressUpdate>,
}

impl ProgressTracker {
    /// Create a new progress tracker with the specified reporter
    #[must_use]
    pub fn new(reporter: Box<dyn ProgressReporter>, total: Option<usize>) -> Self {
        Self {
            reporter,
            start_time: Instant::now(),
            update: Mutex::new(BatchProgressUpdate {
                total,
                ..BatchProgressUpdate::default()
            }),
        }
    }

    /// Create a progress tracker with no-op reporter (for testing/disabled progress)
    #[must_use]
    pub fn no_op() -> Self {
        Self::new(Box::new(NoOpProgressReporter), None)
    }

    /// Create a progress tracker with console reporter
    #[must_use]
    pub fn console(verbose: bool, total: Option<usize>) -> Self {
        Self::new(Box::new(ConsoleProgressReporter::new(verbose)), total)
    }

    pub fn start(&self) {
        let total = self.snapshot().total;
        self.reporter.report_started(total);
    }

    /// Record a result and forward it with the updated counts
    pub fn record(&self, result: &TaskResult) {
        let update = {
            let mut update = match self.update.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            update.completed += 1;
            match result.status() {
                TaskStatus::Succeeded => update.succeeded += 1,
                TaskStatus::Failed => update.failed += 1,
                TaskStatus::Skipped => update.skipped += 1,
            }
            update.elapsed_ms = self.elapsed_ms();
            *update
        };
        self.reporter.report_result(result, update);
    }

    pub fn finish(&self, summary: &RunSummary) {
        self.reporter.report_finished(summary);
    }

    /// Current counts
    #[must_use]
    pub fn snapshot(&self) -> BatchProgressUpdate {
        match self.update.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Get the elapsed time since tracking started
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
