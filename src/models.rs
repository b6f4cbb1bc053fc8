//! Model lookup and preprocessing metadata
//!
//! Models are plain `.onnx` files. A model is named either by a path to the file
//! or by one of the known names below, which are looked up as `<name>.onnx` in the
//! model directory. Nothing is downloaded.

use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the model directory
pub const MODEL_DIR_ENV: &str = "REMOVEBG_BATCH_MODEL_DIR";

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessing settings a model expects
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Square model input size as `[width, height]`
    pub target_size: [u32; 2],
    /// Per-channel mean applied after scaling to `[0, 1]`
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation
    pub normalization_std: [f32; 3],
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            target_size: [320, 320],
            normalization_mean: IMAGENET_MEAN,
            normalization_std: IMAGENET_STD,
        }
    }
}

/// Model information and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: u64,
    pub input_shape: (usize, usize, usize, usize), // NCHW format
    pub output_shape: (usize, usize, usize, usize),
}

struct KnownModel {
    name: &'static str,
    input_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

const KNOWN_MODELS: &[KnownModel] = &[
    KnownModel {
        name: "u2netp",
        input_size: 320,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    },
    KnownModel {
        name: "u2net",
        input_size: 320,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    },
    KnownModel {
        name: "silueta",
        input_size: 320,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    },
    KnownModel {
        name: "isnet-general-use",
        input_size: 1024,
        mean: [0.5, 0.5, 0.5],
        std: [1.0, 1.0, 1.0],
    },
];

/// Names accepted without a path
#[must_use]
pub fn known_model_names() -> Vec<&'static str> {
    KNOWN_MODELS.iter().map(|m| m.name).collect()
}

/// Where a model comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    /// One of the known model names, resolved inside the model directory
    Named(String),
    /// Explicit path to an `.onnx` file
    External(PathBuf),
}

impl ModelSource {
    /// Interpret a configured model string
    ///
    /// Anything ending in `.onnx` or containing a path separator is a path;
    /// everything else is a name.
    #[must_use]
    pub fn parse(model: &str) -> Self {
        let trimmed = model.trim();
        let looks_like_path = Path::new(trimmed)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
            || trimmed.contains(std::path::MAIN_SEPARATOR)
            || trimmed.contains('/');
        if looks_like_path {
            Self::External(PathBuf::from(trimmed))
        } else {
            Self::Named(trimmed.to_ascii_lowercase())
        }
    }

    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::External(path) => format!(
                "external:{}",
                path.file_name().unwrap_or_default().to_string_lossy()
            ),
            Self::Named(name) => name.clone(),
        }
    }
}

/// Directory searched for named models
///
/// `REMOVEBG_BATCH_MODEL_DIR` wins; otherwise `<cache>/removebg-batch/models`.
#[must_use]
pub fn model_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(MODEL_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("removebg-batch")
        .join("models")
}

/// A resolved model file plus its preprocessing metadata
#[derive(Debug, Clone)]
pub struct ModelManager {
    source: ModelSource,
    path: PathBuf,
    preprocessing: PreprocessingConfig,
}

impl ModelManager {
    /// Resolve a model string against the default model directory
    ///
    /// # Errors
    /// - `EngineInit` when the file does not exist
    pub fn resolve(model: &str) -> Result<Self> {
        Self::resolve_in(model, &model_dir())
    }

    /// Resolve a model string against an explicit model directory
    ///
    /// # Errors
    /// - `EngineInit` when the model name is unknown and not a file, or the file is missing
    pub fn resolve_in(model: &str, dir: &Path) -> Result<Self> {
        let source = ModelSource::parse(model);
        let (path, preprocessing) = match &source {
            ModelSource::External(path) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                (path.clone(), preprocessing_for(&stem))
            },
            ModelSource::Named(name) => {
                if !KNOWN_MODELS.iter().any(|m| m.name == name) {
                    return Err(BatchError::engine_init(format!(
                        "Unknown model '{name}'. Known models: {}; or pass a path to an .onnx file",
                        known_model_names().join(", ")
                    )));
                }
                (dir.join(format!("{name}.onnx")), preprocessing_for(name))
            },
        };

        if !path.is_file() {
            return Err(BatchError::model_error_with_context(
                "locate",
                &path,
                "file not found",
                &[
                    "place the .onnx file in the model directory",
                    "set REMOVEBG_BATCH_MODEL_DIR",
                    "pass --model with a path to the file",
                ],
            ));
        }

        Ok(Self {
            source,
            path,
            preprocessing,
        })
    }

    /// Load model data
    ///
    /// # Errors
    /// - `EngineInit` when the file cannot be read
    pub fn load_model(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| {
            BatchError::model_error_with_context("read", &self.path, &e.to_string(), &[])
        })
    }

    /// Get model information
    #[must_use]
    pub fn get_info(&self) -> ModelInfo {
        let size = self.preprocessing.target_size[0] as usize;
        ModelInfo {
            name: self.source.display_name(),
            size_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            input_shape: (1, 3, size, size),
            output_shape: (1, 1, size, size),
        }
    }

    #[must_use]
    pub fn get_preprocessing_config(&self) -> PreprocessingConfig {
        self.preprocessing
    }

    #[must_use]
    pub fn get_model_path(&self) -> &Path {
        &self.path
    }
}

fn preprocessing_for(name: &str) -> PreprocessingConfig {
    KNOWN_MODELS
        .iter()
        .find(|m| m.name == name)
        .map_or_else(PreprocessingConfig::default, |m| PreprocessingConfig {
            target_size: [m.input_size, m.input_size],
            normalization_mean: m.mean,
            normalization_std: m.std,
        })
}
