#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # removebg-batch
//!
//! Batch background removal for large photo collections. Every input image is
//! turned into an RGBA TIFF whose alpha channel is a computed foreground cutout,
//! keeping the source's bit depth, embedded ICC profile and resolution.
//!
//! ## Features
//!
//! - **Deterministic enumeration**: lazy, restartable walks in path order that mirror
//!   the input tree into the output root
//! - **Pluggable engines**: ONNX Runtime (CPU, CUDA, `CoreML`), pure-Rust Tract, and a
//!   deterministic mock for tests and dry runs
//! - **Fidelity**: 8 and 16-bit sources stay 8 and 16-bit; ICC profiles are copied byte for byte
//! - **Worker pool**: bounded queue with backpressure, cooperative cancellation and
//!   per-file failure isolation
//! - **Run summary**: counts, failure descriptors and the provider actually used, as JSON
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use removebg_batch::{run_batch, BatchConfig, EngineKind};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BatchConfig::builder()
//!     .input("photos")
//!     .output("cutouts")
//!     .engine(EngineKind::LocalModel)
//!     .model("u2netp")
//!     .workers(4)
//!     .build()?;
//!
//! let summary = run_batch(&config).await?;
//! println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//! std::process::exit(summary.exit_code());
//! # }
//! ```
//!
//! ## Streaming results
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use removebg_batch::{start_batch, BatchConfig, DefaultBackendFactory};
//!
//! # async fn example(config: BatchConfig) -> anyhow::Result<()> {
//! let mut handle = start_batch(&config, Arc::new(DefaultBackendFactory)).await?;
//! while let Some(result) = handle.next_result().await {
//!     println!("{}: {:?}", result.relative.display(), result.status());
//! }
//! let summary = handle.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend with GPU acceleration support
//! - `tract` (default): Pure Rust backend
//! - `cli` (default): the `removebg-batch` binary, progress bar and tracing subscriber
//! - `webp-support` (default): WebP input decoding
//! - `tracing-json`, `tracing-files`: extra log output formats for the binary

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod color_profile;
pub mod compositor;
pub mod config;
pub mod engine;
pub mod enumerator;
pub mod error;
pub mod inference;
pub mod models;
pub mod pool;
pub mod services;
pub mod summary;
pub mod tracing_config;
pub mod types;
pub mod utils;

// Public API exports
pub use backends::{MockBackend, MockFailure};
#[cfg(feature = "onnx")]
pub use backends::OnnxBackend;
#[cfg(feature = "tract")]
pub use backends::TractBackend;
pub use color_profile::ProfileExtractor;
pub use compositor::Compositor;
pub use config::{
    BatchConfig, BatchConfigBuilder, EngineConfig, EngineKind, ExecutionProvider,
    ExistingOutputPolicy, MaskRefinement, TiffCompression,
};
pub use engine::{BackendFactory, DefaultBackendFactory, EngineHandle, EngineSet};
pub use enumerator::{Discovered, Enumerator};
pub use error::{BatchError, ErrorDescriptor, ErrorKind, Result};
pub use inference::InferenceBackend;
pub use models::{ModelManager, ModelSource};
pub use pool::{run_batch, run_batch_with_factory, start_batch, RunHandle, WorkerPool};
pub use services::{
    ConsoleProgressReporter, ExtensionFilter, ImageCodec, NoOpProgressReporter, ProcessingStage,
    ProgressReporter, ProgressTracker,
};
pub use summary::{ResultAggregator, RunSummary};
pub use types::{
    BitDepth, ColorProfile, DecodedImage, ImageTask, Mask, Resolution, ResolutionUnit,
    RgbaBuffer, SkipReason, TaskResult, TaskStatus,
};
pub use utils::{ExecutionProviderManager, ProviderChoice, ProviderInfo};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat, TracingOutput};
