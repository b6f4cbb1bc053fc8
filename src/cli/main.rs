//! Batch background removal CLI
//!
//! Walks an input tree, writes one RGBA TIFF cutout per image into the output tree
//! and prints a run summary. The process exit code reflects the outcome.

use super::config::CliConfigBuilder;
use crate::{
    enumerator::Enumerator,
    models::{self, known_model_names, ModelSource},
    pool::start_batch,
    services::{BatchProgressUpdate, ProgressReporter, ProgressTracker},
    summary::RunSummary,
    tracing_config::init_cli_tracing,
    types::{TaskResult, TaskStatus},
    utils::ExecutionProviderManager,
    DefaultBackendFactory,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Remove backgrounds from every image in a directory tree
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "removebg-batch")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input directory
    #[arg(short, long, value_name = "DIR", required_unless_present_any = &["show_providers", "list_models"])]
    pub input: Option<PathBuf>,

    /// Output directory (mirrors the input tree)
    #[arg(short, long, value_name = "DIR", required_unless_present_any = &["show_providers", "list_models"])]
    pub output: Option<PathBuf>,

    /// Only process files directly inside the input directory
    #[arg(long)]
    pub no_recursive: bool,

    /// Segmentation engine
    #[arg(short, long, value_enum, default_value_t = CliEngine::LocalModel)]
    pub engine: CliEngine,

    /// Model name or path to an .onnx file
    #[arg(short, long, default_value = crate::config::DEFAULT_MODEL)]
    pub model: String,

    /// Execution provider for the local-model engine
    #[arg(short, long, value_enum, default_value_t = CliProvider::Auto)]
    pub provider: CliProvider,

    /// Number of workers (0 = half the logical CPUs)
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Longest side of the image handed to the engine
    #[arg(long, default_value_t = crate::config::DEFAULT_MASK_MAX_SIZE)]
    pub mask_max_size: u32,

    /// Clean the mask into a smooth binary matte (opening, blur, threshold)
    #[arg(long)]
    pub post_process_mask: bool,

    /// Re-solve the uncertain band around the mask edge against the image
    #[arg(long)]
    pub alpha_matting: bool,

    /// Alpha matting: mask values above this are certain foreground
    #[arg(long, default_value_t = 240, value_name = "0-255")]
    pub am_fg_thresh: u8,

    /// Alpha matting: mask values below this are certain background
    #[arg(long, default_value_t = 10, value_name = "0-255")]
    pub am_bg_thresh: u8,

    /// Alpha matting: erosion size for the certain regions
    #[arg(long, default_value_t = 10)]
    pub am_erode_size: u32,

    /// Refuse images that need more than this many MiB to decode
    #[arg(long, value_name = "MIB", default_value_t = crate::config::DEFAULT_MAX_DECODE_BYTES / (1024 * 1024))]
    pub max_decode_mib: u64,

    /// TIFF compression
    #[arg(long, value_enum, default_value_t = CliCompression::Deflate)]
    pub compression: CliCompression,

    /// Comma-separated list of extensions to process [default: tif,tiff,png,jpg,jpeg,bmp,webp]
    #[arg(long, value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Leave existing outputs untouched instead of overwriting them
    #[arg(long)]
    pub skip_existing: bool,

    /// Do not multiply the mask with the source's own alpha channel
    #[arg(long)]
    pub ignore_source_alpha: bool,

    /// Intra-op threads per engine (0 = derive from worker count)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Bounded queue capacity between enumeration and workers (0 = 2x workers)
    #[arg(long, default_value_t = 0)]
    pub queue_capacity: usize,

    /// Maximum number of failures listed in the summary
    #[arg(long, default_value_t = crate::config::DEFAULT_MAX_REPORTED_ERRORS)]
    pub max_errors: usize,

    /// Write the run summary as JSON to this path ("-" for stdout)
    #[arg(long, value_name = "PATH")]
    pub summary_json: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Show engine and execution provider diagnostics and exit
    #[arg(long)]
    pub show_providers: bool,

    /// List known models and whether they are installed, then exit
    #[arg(long)]
    pub list_models: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliEngine {
    /// ONNX Runtime
    LocalModel,
    /// Pure Rust Tract
    ExternalLibrary,
    /// Deterministic synthetic masks
    Mock,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliProvider {
    Auto,
    Cpu,
    Cuda,
    Coreml,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliCompression {
    None,
    Deflate,
    Lzw,
}

pub async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let _tracing = init_cli_tracing(cli.verbose, cli.log_json)
        .context("Failed to initialize tracing")?;

    if cli.show_providers {
        show_provider_diagnostics();
        return Ok(ExitCode::SUCCESS);
    }

    if cli.list_models {
        list_models();
        return Ok(ExitCode::SUCCESS);
    }

    let config = CliConfigBuilder::from_cli(&cli)?;

    info!("Input: {}", config.input.display());
    info!("Output: {}", config.output.display());
    info!(
        "Engine: {}, model: {}, provider: {}",
        config.engine,
        ModelSource::parse(&config.model).display_name(),
        config.provider
    );

    // Counting is a second walk; skip it when nothing would display the total
    let total = if cli.no_progress {
        None
    } else {
        let count_config = config.clone();
        tokio::task::spawn_blocking(move || {
            Enumerator::from_config(&count_config).map(|e| e.count())
        })
        .await
        .ok()
        .and_then(std::result::Result::ok)
    };

    let handle = start_batch(&config, Arc::new(DefaultBackendFactory))
        .await
        .context("Failed to start batch")?;

    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight files");
            token.cancel();
        }
    });

    let reporter: Box<dyn ProgressReporter> = if cli.no_progress {
        Box::new(crate::services::ConsoleProgressReporter::new(cli.verbose > 0))
    } else {
        Box::new(BarProgressReporter::new(total, cli.verbose > 0))
    };
    let tracker = ProgressTracker::new(reporter, total);
    let summary = handle.wait_with_progress(&tracker).await;

    print_summary(&summary);
    if let Some(path) = &cli.summary_json {
        write_summary_json(&summary, path)?;
    }

    Ok(exit_code(&summary))
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    u8::try_from(summary.exit_code()).map_or(ExitCode::FAILURE, ExitCode::from)
}

/// Progress bar frontend for a batch run
struct BarProgressReporter {
    bar: ProgressBar,
    verbose: bool,
}

impl BarProgressReporter {
    fn new(total: Option<usize>, verbose: bool) -> Self {
        let bar = match total {
            Some(total) => ProgressBar::new(total as u64),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar, verbose }
    }
}

impl ProgressReporter for BarProgressReporter {
    fn report_result(&self, result: &TaskResult, update: BatchProgressUpdate) {
        self.bar.inc(1);
        self.bar.set_message(format!(
            "{} ok, {} failed, {} skipped",
            update.succeeded, update.failed, update.skipped
        ));

        match result.status() {
            TaskStatus::Failed => {
                if let Some(error) = result.error() {
                    self.bar.println(format!(
                        "❌ {}: {}",
                        result.relative.display(),
                        error.message
                    ));
                }
            },
            TaskStatus::Skipped if self.verbose => {
                if let Some(reason) = result.skip_reason() {
                    self.bar
                        .println(format!("⏭️  {} ({reason})", result.relative.display()));
                }
            },
            _ => {},
        }
    }

    fn report_finished(&self, summary: &RunSummary) {
        if summary.cancelled {
            self.bar.abandon_with_message("cancelled");
        } else {
            self.bar.finish_with_message("done");
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("📊 Run Summary");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Failed:    {}", summary.failed);
    println!(
        "  Skipped:   {} (unsupported: {}, existing: {}, cancelled: {})",
        summary.skipped,
        summary.skip_reasons.unsupported_extension,
        summary.skip_reasons.output_exists,
        summary.skip_reasons.cancelled
    );
    if let (Some(engine), Some(provider)) = (&summary.engine, &summary.provider) {
        println!("  Engine:    {engine} on {provider} ({} workers)", summary.workers);
    }
    println!("  Elapsed:   {:.2}s", summary.elapsed.as_secs_f64());
    if let Some(mean) = summary.mean_task_time() {
        println!("  Per file:  {:.0}ms", mean.as_secs_f64() * 1000.0);
    }

    if !summary.failures.is_empty() {
        println!("\n❌ Failures:");
        for failure in &summary.failures {
            println!(
                "  • {} [{}]: {}",
                failure.relative.display(),
                failure.error.kind,
                failure.error.message
            );
        }
        if summary.omitted_failures > 0 {
            println!("  … and {} more", summary.omitted_failures);
        }
    }

    if summary.cancelled {
        println!("\n⚠️  Run was cancelled; unprocessed files have no output");
    }
}

fn write_summary_json(summary: &RunSummary, path: &Path) -> Result<()> {
    let json = summary.to_json()?;
    if path == Path::new("-") {
        println!("{json}");
        return Ok(());
    }
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))
}

/// Display engine and execution provider diagnostics
fn show_provider_diagnostics() {
    println!("🔍 Engine and Execution Provider Diagnostics");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    println!("💻 System: {cpu_count} CPU cores detected");
    println!(
        "   Default worker count: {}",
        crate::config::default_workers()
    );

    println!("\n🚀 Engines and Providers:");
    for provider_info in ExecutionProviderManager::list_all_providers() {
        let status = if provider_info.available {
            "✅ Available"
        } else {
            "❌ Not Available"
        };
        println!(
            "  • {}: {} - {}",
            provider_info.name, status, provider_info.description
        );
    }

    println!("\n💡 Usage Examples:");
    println!("  --engine local-model --provider auto   # Best available accelerator (default)");
    println!("  --engine local-model --provider cuda   # NVIDIA CUDA, CPU if unavailable");
    println!("  --engine external-library              # Pure Rust, CPU only");
    println!("  --engine mock                          # Synthetic masks, no model needed");
}

/// List known models and where they are looked up
fn list_models() {
    let dir = models::model_dir();
    println!("📦 Models");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Model directory: {}", dir.display());
    println!("  (override with {})", models::MODEL_DIR_ENV);

    for name in known_model_names() {
        let path = dir.join(format!("{name}.onnx"));
        let status = if path.is_file() { "✅ Installed" } else { "❌ Missing" };
        println!("  • {name}: {status}");
    }

    println!("\n💡 Any .onnx file can be used directly: --model /path/to/model.onnx");
}
