//! Conversion of command-line arguments into a batch configuration

use crate::cli::main_impl::{Cli, CliCompression, CliEngine, CliProvider};
use crate::config::{
    BatchConfig, EngineKind, ExecutionProvider, ExistingOutputPolicy, MaskRefinement,
    TiffCompression,
};
use anyhow::{Context, Result};

/// Convert CLI arguments to a validated [`BatchConfig`]
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the batch configuration from CLI arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<BatchConfig> {
        let input = cli.input.clone().context("--input is required")?;
        let output = cli.output.clone().context("--output is required")?;

        let mut builder = BatchConfig::builder()
            .input(input)
            .output(output)
            .recursive(!cli.no_recursive)
            .engine(cli.engine.into())
            .model(cli.model.clone())
            .provider(cli.provider.into())
            .workers(cli.workers)
            .mask_max_size(cli.mask_max_size)
            .refinement(MaskRefinement {
                post_process: cli.post_process_mask,
                alpha_matting: cli.alpha_matting,
                foreground_threshold: cli.am_fg_thresh,
                background_threshold: cli.am_bg_thresh,
                erode_size: cli.am_erode_size,
            })
            .max_decode_bytes(cli.max_decode_mib.saturating_mul(1024 * 1024))
            .compression(cli.compression.into())
            .existing_output(if cli.skip_existing {
                ExistingOutputPolicy::Skip
            } else {
                ExistingOutputPolicy::Overwrite
            })
            .combine_source_alpha(!cli.ignore_source_alpha)
            .intra_threads(cli.threads)
            .queue_capacity(cli.queue_capacity)
            .max_reported_errors(cli.max_errors);

        if !cli.extensions.is_empty() {
            builder = builder.extensions(cli.extensions.iter().cloned());
        }

        builder.build().context("Invalid configuration")
    }
}

impl From<CliEngine> for EngineKind {
    fn from(engine: CliEngine) -> Self {
        match engine {
            CliEngine::LocalModel => Self::LocalModel,
            CliEngine::ExternalLibrary => Self::ExternalLibrary,
            CliEngine::Mock => Self::Mock,
        }
    }
}

impl From<CliProvider> for ExecutionProvider {
    fn from(provider: CliProvider) -> Self {
        match provider {
            CliProvider::Auto => Self::Auto,
            CliProvider::Cpu => Self::Cpu,
            CliProvider::Cuda => Self::Cuda,
            CliProvider::Coreml => Self::CoreMl,
        }
    }
}

impl From<CliCompression> for TiffCompression {
    fn from(compression: CliCompression) -> Self {
        match compression {
            CliCompression::None => Self::None,
            CliCompression::Deflate => Self::Deflate,
            CliCompression::Lzw => Self::Lzw,
        }
    }
}
