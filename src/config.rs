//! Configuration types for batch background removal

use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Extensions processed when no allow-list is configured
pub const DEFAULT_EXTENSIONS: &[&str] = &["tif", "tiff", "jpg", "jpeg", "png", "webp", "bmp"];

/// Default longest edge of the working image fed to segmentation
pub const DEFAULT_MASK_MAX_SIZE: u32 = 1024;

/// Default model name
pub const DEFAULT_MODEL: &str = "u2netp";

/// Failure descriptors kept in a run summary by default
pub const DEFAULT_MAX_REPORTED_ERRORS: usize = 20;

/// Decoder allocation ceiling per image, enough for a 16-bit RGBA scan of about 30k x 16k
pub const DEFAULT_MAX_DECODE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration through `CoreML`
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl std::str::FromStr for ExecutionProvider {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            other => Err(BatchError::invalid_config(format!(
                "Unknown execution provider: {other}. Supported: auto, cpu, cuda, coreml"
            ))),
        }
    }
}

/// Segmentation engine variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Local ONNX model run through ONNX Runtime
    #[default]
    LocalModel,
    /// Pure-Rust inference library (tract) running the same model files
    ExternalLibrary,
    /// Deterministic luminance-based mask, no model file needed
    Mock,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalModel => write!(f, "local-model"),
            Self::ExternalLibrary => write!(f, "external-library"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Lossless compression for TIFF output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiffCompression {
    None,
    #[default]
    Deflate,
    Lzw,
}

impl std::fmt::Display for TiffCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Deflate => write!(f, "deflate"),
            Self::Lzw => write!(f, "lzw"),
        }
    }
}

/// What to do when an output file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingOutputPolicy {
    /// Replace the existing file
    #[default]
    Overwrite,
    /// Leave it and report the task as skipped
    Skip,
}

/// Optional refinement of the predicted mask before it reaches the compositor
///
/// Both steps run at the working resolution, after the model output has been
/// normalized and before it is scaled to the source size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskRefinement {
    /// Open, blur and re-threshold the mask into a clean binary matte
    pub post_process: bool,
    /// Re-solve the uncertain band between foreground and background against the image
    pub alpha_matting: bool,
    /// Mask values above this (0-255) are certain foreground
    pub foreground_threshold: u8,
    /// Mask values below this (0-255) are certain background
    pub background_threshold: u8,
    /// Side of the square used to erode the certain regions
    pub erode_size: u32,
}

impl Default for MaskRefinement {
    fn default() -> Self {
        Self {
            post_process: false,
            alpha_matting: false,
            foreground_threshold: 240,
            background_threshold: 10,
            erode_size: 10,
        }
    }
}

impl MaskRefinement {
    /// Whether any refinement step is switched on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.post_process || self.alpha_matting
    }
}

/// Settings needed to build a segmentation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub model: String,
    pub provider: ExecutionProvider,
    /// Intra-op threads per engine (0 = derive from workers)
    pub intra_threads: usize,
    /// Longest edge of the working image (0 = no downscale)
    pub mask_max_size: u32,
    pub refinement: MaskRefinement,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            model: DEFAULT_MODEL.to_string(),
            provider: ExecutionProvider::default(),
            intra_threads: 0,
            mask_max_size: DEFAULT_MASK_MAX_SIZE,
            refinement: MaskRefinement::default(),
        }
    }
}

/// Configuration for a batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Input root directory
    pub input: PathBuf,

    /// Output root directory
    pub output: PathBuf,

    /// Descend into subdirectories
    pub recursive: bool,

    /// Segmentation engine variant
    pub engine: EngineKind,

    /// Model name (`u2netp`, `u2net`, ...) or path to an `.onnx` file
    pub model: String,

    /// Execution provider for ONNX Runtime
    pub provider: ExecutionProvider,

    /// Worker count (0 = half the logical CPUs, at least 1)
    pub workers: usize,

    /// Longest edge of the working image used for segmentation (0 = full resolution)
    pub mask_max_size: u32,

    /// Mask post-processing and alpha matting
    pub refinement: MaskRefinement,

    /// Decoder allocation ceiling per image in bytes
    pub max_decode_bytes: u64,

    /// TIFF compression for outputs
    pub compression: TiffCompression,

    /// Extension allow-list, lowercase without dots
    pub extensions: Vec<String>,

    /// Handling of outputs that already exist
    pub existing_output: ExistingOutputPolicy,

    /// Multiply the cutout with an existing source alpha channel
    pub combine_source_alpha: bool,

    /// Intra-op threads per inference session (0 = auto)
    pub intra_threads: usize,

    /// Task queue capacity (0 = twice the worker count)
    pub queue_capacity: usize,

    /// Failure descriptors kept in the summary
    pub max_reported_errors: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            recursive: true,
            engine: EngineKind::default(),
            model: DEFAULT_MODEL.to_string(),
            provider: ExecutionProvider::default(),
            workers: 0,
            mask_max_size: DEFAULT_MASK_MAX_SIZE,
            refinement: MaskRefinement::default(),
            max_decode_bytes: DEFAULT_MAX_DECODE_BYTES,
            compression: TiffCompression::default(),
            extensions: DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect(),
            existing_output: ExistingOutputPolicy::default(),
            combine_source_alpha: true,
            intra_threads: 0,
            queue_capacity: 0,
            max_reported_errors: DEFAULT_MAX_REPORTED_ERRORS,
        }
    }
}

/// Half the logical CPUs, at least one
#[must_use]
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2);
    (cpus / 2).max(1)
}

impl BatchConfig {
    /// Create a new configuration builder
    ///
    /// # Examples
    /// ```rust
    /// use removebg_batch::{BatchConfig, EngineKind};
    ///
    /// let config = BatchConfig::builder()
    ///     .input("photos")
    ///     .output("cutouts")
    ///     .engine(EngineKind::Mock)
    ///     .workers(2)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.effective_workers(), 2);
    /// ```
    #[must_use]
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Missing input or output root
    /// - Input and output roots are the same directory
    /// - Output root nested inside a recursively scanned input root
    /// - Empty model name or extension list
    /// - Zero decode limit
    /// - Alpha matting thresholds that leave no room for an uncertain band
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(BatchError::invalid_config("Input directory is required"));
        }
        if self.output.as_os_str().is_empty() {
            return Err(BatchError::invalid_config("Output directory is required"));
        }

        let input = normalize(&self.input);
        let output = normalize(&self.output);
        if input == output {
            return Err(BatchError::invalid_config(format!(
                "Input and output must differ: {}",
                self.input.display()
            )));
        }
        if self.recursive && output.starts_with(&input) {
            return Err(BatchError::invalid_config(format!(
                "Output {} lies inside the recursively scanned input {}",
                self.output.display(),
                self.input.display()
            )));
        }

        if self.model.trim().is_empty() {
            return Err(BatchError::invalid_config("Model must not be empty"));
        }

        if self.extensions.iter().all(|ext| ext.trim().is_empty()) {
            return Err(BatchError::invalid_config(
                "Extension allow-list must not be empty",
            ));
        }

        if self.max_decode_bytes == 0 {
            return Err(BatchError::config_value_error(
                "max decode bytes",
                self.max_decode_bytes,
                "> 0",
                Some(DEFAULT_MAX_DECODE_BYTES),
            ));
        }

        let refinement = self.refinement;
        if refinement.alpha_matting
            && refinement.background_threshold >= refinement.foreground_threshold
        {
            return Err(BatchError::invalid_config(format!(
                "Alpha matting background threshold {} must be below the foreground threshold {}",
                refinement.background_threshold, refinement.foreground_threshold
            )));
        }

        Ok(())
    }

    /// Worker count with `0` resolved to the CPU-based default
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            default_workers()
        } else {
            self.workers
        }
    }

    /// Queue capacity with `0` resolved to twice the worker count
    #[must_use]
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            self.effective_workers() * 2
        } else {
            self.queue_capacity
        }
    }

    /// Allow-list normalized to lowercase without leading dots
    #[must_use]
    pub fn normalized_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        extensions.sort();
        extensions.dedup();
        extensions
    }

    /// Engine settings derived from this configuration
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let intra_threads = if self.intra_threads > 0 {
            self.intra_threads
        } else {
            let cpus = std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1);
            (cpus / self.effective_workers()).max(1)
        };

        EngineConfig {
            kind: self.engine,
            model: self.model.clone(),
            provider: self.provider,
            intra_threads,
            mask_max_size: self.mask_max_size,
            refinement: self.refinement,
        }
    }
}

/// Absolute form of `path` with symlinks resolved as far as the path exists
///
/// The deepest existing ancestor is canonicalized and the missing tail appended,
/// so a path compares the same before and after it is created.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            },
            _ => return absolute.components().collect(),
        }
    }
}

/// Builder for `BatchConfig`
#[derive(Debug, Default)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    /// Set the input root
    #[must_use]
    pub fn input<P: Into<PathBuf>>(mut self, input: P) -> Self {
        self.config.input = input.into();
        self
    }

    /// Set the output root
    #[must_use]
    pub fn output<P: Into<PathBuf>>(mut self, output: P) -> Self {
        self.config.output = output.into();
        self
    }

    #[must_use]
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.config.recursive = recursive;
        self
    }

    #[must_use]
    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.config.engine = engine;
        self
    }

    /// Set the model name or `.onnx` path
    #[must_use]
    pub fn model<S: Into<String>>(mut self, model: S) -> Self {
        self.config.model = model.into();
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.provider = provider;
        self
    }

    /// Set the worker count (0 = auto)
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the working-resolution cap (0 = no downscale)
    #[must_use]
    pub fn mask_max_size(mut self, size: u32) -> Self {
        self.config.mask_max_size = size;
        self
    }

    /// Set mask post-processing and alpha matting
    #[must_use]
    pub fn refinement(mut self, refinement: MaskRefinement) -> Self {
        self.config.refinement = refinement;
        self
    }

    /// Set the per-image decoder allocation ceiling in bytes
    #[must_use]
    pub fn max_decode_bytes(mut self, bytes: u64) -> Self {
        self.config.max_decode_bytes = bytes;
        self
    }

    #[must_use]
    pub fn compression(mut self, compression: TiffCompression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Replace the extension allow-list
    #[must_use]
    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn existing_output(mut self, policy: ExistingOutputPolicy) -> Self {
        self.config.existing_output = policy;
        self
    }

    #[must_use]
    pub fn combine_source_alpha(mut self, combine: bool) -> Self {
        self.config.combine_source_alpha = combine;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn max_reported_errors(mut self, max: usize) -> Self {
        self.config.max_reported_errors = max;
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// - Any rule checked by [`BatchConfig::validate`]
    pub fn build(self) -> Result<BatchConfig> {
        let config = self.config;
        config.validate()?;
        Ok(config)
    }
}
