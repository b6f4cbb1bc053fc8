//! Worker pool
//!
//! A producer walks the [`Enumerator`] on a blocking thread and feeds a bounded
//! queue. A fixed number of async workers take items from the queue and run the
//! decode, infer, compose and encode stages on Tokio's blocking pool. Every item
//! leads to exactly one [`TaskResult`] on the result stream, whether it
//! succeeded, failed or was skipped. A failing task never stops the pool.

use crate::{
    compositor::Compositor,
    config::{BatchConfig, ExistingOutputPolicy, TiffCompression},
    engine::{BackendFactory, DefaultBackendFactory, EngineHandle, EngineSet},
    enumerator::{Discovered, Enumerator},
    error::{BatchError, Result},
    services::{ImageCodec, ProcessingStage, ProgressTracker},
    summary::{ResultAggregator, RunSummary},
    tracing_config::spans,
    types::{ImageTask, ProcessingTimings, SkipReason, TaskResult},
};
use instant::Instant;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Per-task settings shared by all workers
#[derive(Debug, Clone, Copy)]
struct TaskSettings {
    max_decode_bytes: u64,
    compression: TiffCompression,
    existing_output: ExistingOutputPolicy,
    compositor: Compositor,
}

/// Fixed-size pool of workers bound to prepared engines
#[derive(Debug)]
pub struct WorkerPool {
    workers: usize,
    queue_capacity: usize,
    engines: EngineSet,
    settings: TaskSettings,
    max_reported_errors: usize,
}

impl WorkerPool {
    /// Create a pool sized from the configuration
    ///
    /// When the engines are per-worker, the pool never runs more workers than
    /// there are engines.
    #[must_use]
    pub fn new(config: &BatchConfig, engines: EngineSet) -> Self {
        let mut workers = config.effective_workers();
        if let Some(limit) = engines.max_workers() {
            workers = workers.min(limit.max(1));
        }
        Self {
            workers,
            queue_capacity: config.effective_queue_capacity().max(1),
            engines,
            settings: TaskSettings {
                max_decode_bytes: config.max_decode_bytes,
                compression: config.compression,
                existing_output: config.existing_output,
                compositor: Compositor::new(config.combine_source_alpha),
            },
            max_reported_errors: config.max_reported_errors,
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start processing every item the enumerator yields
    ///
    /// Must be called from within a Tokio runtime. Results arrive on the returned
    /// handle in completion order.
    #[must_use]
    pub fn submit(self, enumerator: Enumerator) -> RunHandle {
        let token = CancellationToken::new();
        let started = Instant::now();
        let run_span = spans::run(enumerator.root(), enumerator.output_root(), self.workers);

        let first_engine = self.engines.for_worker(0);
        let aggregator = ResultAggregator::new(self.max_reported_errors)
            .with_engine(first_engine.kind(), first_engine.provider_choice())
            .with_workers(self.workers);

        let (task_tx, task_rx) = mpsc::channel::<Discovered>(self.queue_capacity);
        let (result_tx, result_rx) = mpsc::unbounded_channel::<TaskResult>();

        run_span.in_scope(|| {
            info!(
                workers = self.workers,
                queue_capacity = self.queue_capacity,
                "Starting batch"
            );
        });

        let producer = {
            let token = token.clone();
            let span = run_span.clone();
            tokio::task::spawn_blocking(move || span.in_scope(|| produce(&enumerator, &task_tx, &token)))
        };

        let task_rx = Arc::new(Mutex::new(task_rx));
        let workers = (0..self.workers)
            .map(|index| {
                let worker = Worker {
                    engine: self.engines.for_worker(index),
                    settings: self.settings,
                    queue: Arc::clone(&task_rx),
                    results: result_tx.clone(),
                    token: token.clone(),
                };
                let span = run_span.in_scope(|| spans::worker(index));
                tokio::spawn(worker.run().instrument(span))
            })
            .collect();
        drop(result_tx);

        RunHandle {
            results: result_rx,
            aggregator,
            token,
            producer: Some(producer),
            workers,
            started,
            span: run_span,
        }
    }
}

/// Feed the queue until the walk ends, the run is cancelled or all workers are gone
fn produce(enumerator: &Enumerator, queue: &mpsc::Sender<Discovered>, token: &CancellationToken) -> usize {
    let mut sent = 0;
    for item in enumerator.iter() {
        if token.is_cancelled() {
            debug!(sent, "Cancelled; no further entries are enumerated");
            break;
        }
        if queue.blocking_send(item).is_err() {
            warn!(sent, "Task queue closed before enumeration finished");
            break;
        }
        sent += 1;
    }
    debug!(sent, "Enumeration finished");
    sent
}

struct Worker {
    engine: Arc<EngineHandle>,
    settings: TaskSettings,
    queue: Arc<Mutex<mpsc::Receiver<Discovered>>>,
    results: mpsc::UnboundedSender<TaskResult>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let item = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(item) = item else { break };

            let result = self.handle(item).await;
            if self.results.send(result).is_err() {
                debug!("Result receiver dropped; worker stopping");
                break;
            }
        }
    }

    async fn handle(&self, item: Discovered) -> TaskResult {
        match item {
            Discovered::Unsupported(task) => {
                debug!(path = %task.relative.display(), "Skipping unsupported extension");
                TaskResult::skipped(&task, SkipReason::UnsupportedExtension)
            },
            Discovered::Unreadable { task, message } => {
                let error = BatchError::Io(std::io::Error::other(message));
                TaskResult::failed(&task, std::time::Duration::ZERO, &error)
            },
            Discovered::Image(task) => {
                if self.token.is_cancelled() {
                    return TaskResult::skipped(&task, SkipReason::Cancelled);
                }

                let engine = Arc::clone(&self.engine);
                let settings = self.settings;
                let token = self.token.clone();
                let span = Span::current();
                let job_task = task.clone();
                let started = Instant::now();

                match tokio::task::spawn_blocking(move || {
                    span.in_scope(|| process_task(&job_task, &engine, settings, &token))
                })
                .await
                {
                    Ok(result) => result,
                    Err(join_error) => {
                        error!(path = %task.relative.display(), %join_error, "Task panicked");
                        TaskResult::failed(
                            &task,
                            started.elapsed(),
                            &BatchError::internal(format!("worker task failed: {join_error}")),
                        )
                    },
                }
            },
        }
    }
}

enum Stages {
    Completed(ProcessingTimings),
    Cancelled,
}

/// Run one image through all stages and report its result
fn process_task(
    task: &ImageTask,
    engine: &EngineHandle,
    settings: TaskSettings,
    token: &CancellationToken,
) -> TaskResult {
    let _span = spans::task(&task.relative).entered();
    let started = Instant::now();

    if settings.existing_output == ExistingOutputPolicy::Skip && task.output.exists() {
        debug!(output = %task.output.display(), "Output exists; skipping");
        return TaskResult::skipped(task, SkipReason::OutputExists);
    }

    match run_stages(task, engine, settings, token) {
        Ok(Stages::Completed(timings)) => {
            debug!(
                decode_ms = timings.decode_ms,
                inference_ms = timings.inference_ms,
                compose_ms = timings.compose_ms,
                encode_ms = timings.encode_ms,
                "Task finished"
            );
            TaskResult::succeeded(task, started.elapsed(), timings)
        },
        Ok(Stages::Cancelled) => {
            debug!("Task cancelled between stages");
            TaskResult::skipped(task, SkipReason::Cancelled)
        },
        Err(e) => {
            warn!(kind = %e.kind(), error = %e, "Task failed");
            TaskResult::failed(task, started.elapsed(), &e)
        },
    }
}

fn run_stages(
    task: &ImageTask,
    engine: &EngineHandle,
    settings: TaskSettings,
    token: &CancellationToken,
) -> Result<Stages> {
    let mut timings = ProcessingTimings::default();

    let (image, ms) = timed(ProcessingStage::Decode, || {
        ImageCodec::decode_with_limit(&task.source, settings.max_decode_bytes)
    })?;
    timings.decode_ms = ms;
    if token.is_cancelled() {
        return Ok(Stages::Cancelled);
    }

    let (mask, ms) = timed(ProcessingStage::Inference, || engine.infer(&image))?;
    timings.inference_ms = ms;
    if token.is_cancelled() {
        return Ok(Stages::Cancelled);
    }

    let (rgba, ms) = timed(ProcessingStage::Compose, || {
        settings.compositor.compose(&image, &mask)
    })?;
    timings.compose_ms = ms;
    drop(mask);
    if token.is_cancelled() {
        return Ok(Stages::Cancelled);
    }

    let ((), ms) = timed(ProcessingStage::Encode, || {
        ImageCodec::encode(
            &rgba,
            image.color_profile(),
            image.resolution(),
            settings.compression,
            &task.output,
        )
    })?;
    timings.encode_ms = ms;

    Ok(Stages::Completed(timings))
}

fn timed<T>(stage: ProcessingStage, f: impl FnOnce() -> Result<T>) -> Result<(T, u64)> {
    let _span = spans::stage(stage.name()).entered();
    let start = Instant::now();
    let value = f()?;
    let ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::trace!(ms, "{}", stage.description());
    Ok((value, ms))
}

/// Handle to a running batch
pub struct RunHandle {
    results: mpsc::UnboundedReceiver<TaskResult>,
    aggregator: ResultAggregator,
    token: CancellationToken,
    producer: Option<JoinHandle<usize>>,
    workers: Vec<JoinHandle<()>>,
    started: Instant,
    span: Span,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("recorded", &self.aggregator.recorded())
            .field("workers", &self.workers.len())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    /// Next result in completion order, or `None` once every item is reported
    pub async fn next_result(&mut self) -> Option<TaskResult> {
        let result = self.results.recv().await?;
        self.aggregator.record(&result);
        Some(result)
    }

    /// Stop dispatching; queued and in-flight images finish as cancelled
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            self.span.in_scope(|| info!("Cancellation requested"));
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drain all remaining results and produce the summary
    pub async fn wait(mut self) -> RunSummary {
        while self.next_result().await.is_some() {}
        self.finish().await
    }

    /// Like [`wait`](Self::wait), forwarding each result to a progress tracker
    pub async fn wait_with_progress(mut self, progress: &ProgressTracker) -> RunSummary {
        progress.start();
        while let Some(result) = self.next_result().await {
            progress.record(&result);
        }
        let summary = self.finish().await;
        progress.finish(&summary);
        summary
    }

    async fn finish(mut self) -> RunSummary {
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.await {
                self.span.in_scope(|| error!(%e, "Producer task failed"));
            }
        }
        for joined in futures::future::join_all(self.workers.drain(..)).await {
            if let Err(e) = joined {
                self.span.in_scope(|| error!(%e, "Worker task failed"));
            }
        }

        let cancelled = self.token.is_cancelled();
        let summary = self.aggregator.finish(self.started.elapsed(), cancelled);
        self.span.in_scope(|| {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
                cancelled,
                "Batch finished"
            );
        });
        summary
    }
}

/// Validate the configuration, prepare engines, process every input and summarize
///
/// # Errors
/// - `InvalidConfig` for an invalid configuration or an output root that cannot be created
/// - `Enumeration` when the input root cannot be read
/// - `EngineInit` when the engine cannot be prepared
pub async fn run_batch(config: &BatchConfig) -> Result<RunSummary> {
    run_batch_with_factory(config, Arc::new(DefaultBackendFactory)).await
}

/// [`run_batch`] with a caller-supplied backend factory
///
/// # Errors
/// - See [`run_batch`]
pub async fn run_batch_with_factory(
    config: &BatchConfig,
    factory: Arc<dyn BackendFactory>,
) -> Result<RunSummary> {
    let handle = start_batch(config, factory).await?;
    Ok(handle.wait().await)
}

/// Prepare everything and start the pool, returning the running handle
///
/// All fatal errors surface here; once this returns, failures are per task.
///
/// # Errors
/// - See [`run_batch`]
pub async fn start_batch(
    config: &BatchConfig,
    factory: Arc<dyn BackendFactory>,
) -> Result<RunHandle> {
    config.validate()?;
    let enumerator = Enumerator::from_config(config)?;
    std::fs::create_dir_all(&config.output).map_err(|e| {
        BatchError::invalid_config(format!(
            "Cannot create output directory '{}': {e}",
            config.output.display()
        ))
    })?;

    let engine_config = config.engine_config();
    let workers = config.effective_workers();
    let engines = tokio::task::spawn_blocking(move || {
        EngineSet::prepare(&engine_config, workers, factory.as_ref())
    })
    .await
    .map_err(|e| BatchError::internal(format!("Engine preparation task failed: {e}")))??;

    Ok(WorkerPool::new(config, engines).submit(enumerator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MockBackend, MockFailure};
    use crate::config::EngineKind;
    use crate::error::ErrorKind;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    fn write_png(path: &Path, width: u32, height: u32) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 200]))
            .save(path)
            .unwrap();
    }

    fn config(input: &Path, output: &Path, workers: usize) -> BatchConfig {
        BatchConfig::builder()
            .input(input)
            .output(output)
            .engine(EngineKind::Mock)
            .workers(workers)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mixed_inputs() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&input.path().join("a.png"), 16, 12);
        write_png(&input.path().join("sub/b.png"), 10, 20);
        std::fs::write(input.path().join("notes.txt"), "hello").unwrap();

        let summary = run_batch(&config(input.path(), output.path(), 2))
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.skip_reasons.unsupported_extension, 1);
        assert_eq!(summary.exit_code(), 0);
        assert!(output.path().join("a.tiff").exists());
        assert!(output.path().join("sub/b.tiff").exists());
        assert!(!output.path().join("notes.tiff").exists());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&input.path().join("good.png"), 8, 8);
        std::fs::write(input.path().join("broken.png"), b"not an image").unwrap();

        let summary = run_batch(&config(input.path(), output.path(), 2))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].relative, Path::new("broken.png"));
        assert_eq!(summary.failures[0].error.kind, ErrorKind::UnsupportedFormat);
        assert_eq!(summary.exit_code(), 1);
        assert!(output.path().join("good.tiff").exists());
        assert!(!output.path().join("broken.tiff").exists());
    }

    #[tokio::test]
    async fn test_inference_failures_do_not_stop_the_pool() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write_png(&input.path().join(format!("{i}.png")), 8, 8);
        }
        let factory = MockBackend::new().with_failure(MockFailure::Inference);

        let summary = run_batch_with_factory(
            &config(input.path(), output.path(), 2),
            Arc::new(factory.clone()),
        )
        .await
        .unwrap();

        assert_eq!(summary.failed, 4);
        assert_eq!(factory.inference_calls(), 4);
        assert!(summary
            .failures
            .iter()
            .all(|f| f.error.kind == ErrorKind::Inference));
    }

    #[tokio::test]
    async fn test_engine_init_failure_is_fatal() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&input.path().join("a.png"), 8, 8);

        let err = run_batch_with_factory(
            &config(input.path(), output.path(), 1),
            Arc::new(MockBackend::new().with_failure(MockFailure::Initialize)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineInit);
        assert!(!output.path().join("a.tiff").exists());
    }

    #[tokio::test]
    async fn test_missing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_batch(&config(&dir.path().join("absent"), &dir.path().join("out"), 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Enumeration);
    }

    #[tokio::test]
    async fn test_per_worker_engines() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for i in 0..6 {
            write_png(&input.path().join(format!("{i}.png")), 8, 8);
        }
        let factory = MockBackend::new().with_concurrency(false);

        let summary = run_batch_with_factory(
            &config(input.path(), output.path(), 3),
            Arc::new(factory.clone()),
        )
        .await
        .unwrap();

        assert_eq!(summary.succeeded, 6);
        assert_eq!(summary.workers, 3);
        assert_eq!(factory.initialized_instances(), 3);
    }

    #[tokio::test]
    async fn test_skip_existing_outputs() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&input.path().join("a.png"), 8, 8);
        write_png(&input.path().join("b.png"), 8, 8);
        std::fs::write(output.path().join("a.tiff"), b"keep me").unwrap();

        let mut config = config(input.path(), output.path(), 1);
        config.existing_output = ExistingOutputPolicy::Skip;
        let summary = run_batch(&config).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skip_reasons.output_exists, 1);
        assert_eq!(std::fs::read(output.path().join("a.tiff")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_streaming_results_match_summary() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_png(&input.path().join(format!("{i}.png")), 6, 6);
        }
        let mut config = config(input.path(), output.path(), 2);
        config.queue_capacity = 1;

        let mut handle = start_batch(&config, Arc::new(MockBackend::new()))
            .await
            .unwrap();
        let mut streamed = Vec::new();
        while let Some(result) = handle.next_result().await {
            streamed.push(result.relative);
        }
        let summary = handle.wait().await;

        streamed.sort();
        assert_eq!(streamed.len(), 5);
        assert_eq!(streamed[0], Path::new("0.png"));
        assert_eq!(summary.succeeded, 5);
    }

    #[tokio::test]
    async fn test_cancel_before_processing() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for i in 0..8 {
            write_png(&input.path().join(format!("{i}.png")), 8, 8);
        }
        let config = config(input.path(), output.path(), 2);

        let handle = start_batch(&config, Arc::new(MockBackend::new()))
            .await
            .unwrap();
        handle.cancel();
        assert!(handle.cancellation_token().is_cancelled());
        let summary = handle.wait().await;

        assert!(summary.cancelled);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.skipped, summary.skip_reasons.cancelled);
        assert_eq!(summary.exit_code(), 130);
        let written = std::fs::read_dir(output.path()).unwrap().count();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_progress_tracker_sees_every_result() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&input.path().join("a.png"), 8, 8);
        std::fs::write(input.path().join("b.txt"), "x").unwrap();

        let tracker = ProgressTracker::no_op();
        let handle = start_batch(&config(input.path(), output.path(), 1), Arc::new(MockBackend::new()))
            .await
            .unwrap();
        let summary = handle.wait_with_progress(&tracker).await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.succeeded, summary.succeeded);
        assert_eq!(snapshot.skipped, summary.skipped);
    }
}
