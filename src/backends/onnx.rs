//! ONNX Runtime backend
//!
//! Runs local `.onnx` segmentation models with CPU, CUDA or `CoreML` execution
//! providers. A session is not shared between workers: `Session::run` needs
//! exclusive access, so each worker gets its own backend instance.

use crate::config::{EngineConfig, ExecutionProvider};
use crate::error::{BatchError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelManager, PreprocessingConfig};
use crate::utils::{ExecutionProviderManager, ProviderChoice};
use log;
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::{self, value::Value};
use std::sync::Mutex;

/// ONNX Runtime backend for running segmentation models
#[derive(Debug)]
pub struct OnnxBackend {
    session: Option<Mutex<Session>>,
    model_manager: Option<ModelManager>,
    provider_choice: Option<ProviderChoice>,
    initialized: bool,
}

impl OnnxBackend {
    /// List all ONNX Runtime execution providers with availability status and descriptions
    ///
    /// Returns `(name, available, description)` tuples.
    ///
    /// # Examples
    /// ```rust
    /// use removebg_batch::backends::OnnxBackend;
    ///
    /// let providers = OnnxBackend::list_providers();
    /// for (name, available, description) in providers {
    ///     println!("{}: {} - {}", name, if available { "✅" } else { "❌" }, description);
    /// }
    /// ```
    pub fn list_providers() -> Vec<(String, bool, String)> {
        log::debug!(
            "Platform {os}/{arch}, {cores} logical CPUs",
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            cores = std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        );

        let available = Self::available_accelerators();
        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                available.contains(&ExecutionProvider::Cuda),
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                available.contains(&ExecutionProvider::CoreMl),
                "Apple Silicon GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    /// Accelerated providers the linked ONNX Runtime can use
    fn available_accelerators() -> Vec<ExecutionProvider> {
        let mut available = Vec::new();
        if OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false) {
            available.push(ExecutionProvider::Cuda);
        } else {
            log::debug!("CUDA execution provider is not available");
        }
        if OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false)
        {
            available.push(ExecutionProvider::CoreMl);
        } else {
            log::debug!("CoreML execution provider is not available");
        }
        available
    }

    /// Create a new ONNX backend with specific model manager
    #[must_use]
    pub fn with_model_manager(model_manager: ModelManager) -> Self {
        Self {
            session: None,
            model_manager: Some(model_manager),
            provider_choice: None,
            initialized: false,
        }
    }

    /// Create a new ONNX backend; the model is resolved from the engine config
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: None,
            model_manager: None,
            provider_choice: None,
            initialized: false,
        }
    }

    /// Load and initialize the ONNX model
    fn load_model(&mut self, config: &EngineConfig) -> Result<std::time::Duration> {
        let model_load_start = std::time::Instant::now();

        if self.model_manager.is_none() {
            self.model_manager = Some(ModelManager::resolve(&config.model)?);
        }
        let model_manager = self
            .model_manager
            .as_ref()
            .ok_or_else(|| BatchError::internal("Model manager missing after resolution"))?;
        let model_data = model_manager.load_model()?;

        let session_builder = Session::builder()
            .map_err(|e| BatchError::engine_init(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                BatchError::engine_init(format!("Failed to set optimization level: {e}"))
            })?;

        let choice =
            ExecutionProviderManager::select(config.provider, &Self::available_accelerators());
        let used: ExecutionProvider = choice.used.parse().unwrap_or(ExecutionProvider::Cpu);

        let session_builder = match used {
            ExecutionProvider::Cuda => {
                log::info!("🚀 Using CUDA execution provider");
                session_builder
                    .with_execution_providers([CUDAExecutionProvider::default().build()])
                    .map_err(|e| {
                        BatchError::engine_init(format!("Failed to set CUDA execution provider: {e}"))
                    })?
            },
            ExecutionProvider::CoreMl => {
                log::info!("🍎 Using CoreML execution provider");
                session_builder
                    .with_execution_providers([CoreMLExecutionProvider::default()
                        .with_subgraphs(true)
                        .build()])
                    .map_err(|e| {
                        BatchError::engine_init(format!(
                            "Failed to set CoreML execution provider: {e}"
                        ))
                    })?
            },
            ExecutionProvider::Cpu | ExecutionProvider::Auto => {
                log::debug!("Using CPU execution provider");
                session_builder
            },
        };

        let intra_threads = config.intra_threads.max(1);
        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| BatchError::engine_init(format!("Failed to set intra threads: {e}")))?
            .with_inter_threads(1)
            .map_err(|e| BatchError::engine_init(format!("Failed to set inter threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                BatchError::model_error_with_context(
                    "create session for",
                    model_manager.get_model_path(),
                    &e.to_string(),
                    &["check that the file is a valid ONNX model"],
                )
            })?;

        let model_info = model_manager.get_info();
        log::debug!("ONNX Runtime session created");
        log::debug!("  - Provider: {choice}");
        log::debug!("  - Threading: {intra_threads} intra-op threads");
        #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for logging display
        let size_mb = model_info.size_bytes as f64 / (1024.0 * 1024.0);
        log::debug!("  - Model: {} ({size_mb:.2} MB)", model_info.name);

        self.session = Some(Mutex::new(session));
        self.provider_choice = Some(choice);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::debug!(
            "📊 Model loading complete: {:.0}ms",
            model_load_time.as_secs_f64() * 1000.0
        );

        Ok(model_load_time)
    }
}

impl Default for OnnxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, config: &EngineConfig) -> Result<Option<std::time::Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        use std::time::Instant;

        let session = self
            .session
            .as_ref()
            .filter(|_| self.initialized)
            .ok_or_else(|| BatchError::internal("ONNX backend not initialized"))?;
        let mut session = session
            .lock()
            .map_err(|_| BatchError::internal("ONNX session lock poisoned"))?;

        let inference_start = Instant::now();
        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BatchError::inference_stage_error("tensor conversion", &e.to_string(), None)
        })?;

        // Positional inputs avoid depending on the model's tensor names
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BatchError::inference_stage_error("run", &e.to_string(), None))?;

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| BatchError::inference("Model produced no output tensors"))?;
        let output_tensor = outputs
            .get(first_key)
            .ok_or_else(|| BatchError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| {
                BatchError::inference_stage_error("output extraction", &e.to_string(), None)
            })?;

        let output_shape = output_tensor.shape().to_vec();
        let result = match output_shape.as_slice() {
            &[n, c, h, w] => Array4::from_shape_vec(
                (n, c, h, w),
                output_tensor.iter().copied().collect(),
            )
            .map_err(|e| BatchError::inference_stage_error("reshape", &e.to_string(), None))?,
            // Some exports drop the channel axis
            &[n, h, w] => Array4::from_shape_vec((n, 1, h, w), output_tensor.iter().copied().collect())
                .map_err(|e| BatchError::inference_stage_error("reshape", &e.to_string(), None))?,
            other => {
                return Err(BatchError::inference(format!(
                    "Expected 4D output tensor, got shape {other:?}"
                )))
            },
        };

        log::trace!(
            "ONNX inference: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(result)
    }

    fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.model_manager
            .as_ref()
            .map_or((1, 3, 320, 320), |manager| manager.get_info().input_shape)
    }

    fn get_preprocessing_config(&self) -> PreprocessingConfig {
        self.model_manager
            .as_ref()
            .map(ModelManager::get_preprocessing_config)
            .unwrap_or_default()
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        self.model_manager
            .as_ref()
            .map(ModelManager::get_info)
            .ok_or_else(|| BatchError::internal("Model manager not initialized"))
    }

    fn supports_concurrent_inference(&self) -> bool {
        false
    }

    fn provider_choice(&self) -> ProviderChoice {
        self.provider_choice
            .clone()
            .unwrap_or_else(|| ProviderChoice::cpu_only(ExecutionProvider::Cpu, "cpu"))
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_providers_cpu_always_available() {
        let providers = OnnxBackend::list_providers();
        assert!(providers
            .iter()
            .any(|(name, available, _)| name == "CPU" && *available));
    }

    #[test]
    fn test_uninitialized_backend() {
        let backend = OnnxBackend::new();
        assert!(!backend.is_initialized());
        assert!(!backend.supports_concurrent_inference());
        assert!(backend.get_model_info().is_err());
        assert!(backend.infer(&Array4::zeros((1, 3, 8, 8))).is_err());
    }

    #[test]
    fn test_missing_model_fails_engine_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            model: dir.path().join("absent.onnx").display().to_string(),
            ..EngineConfig::default()
        };
        let mut backend = OnnxBackend::new();
        let err = backend.initialize(&config).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_model_fails_engine_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.onnx");
        std::fs::write(&path, b"not a protobuf").unwrap();
        let mut backend = OnnxBackend::with_model_manager(
            ModelManager::resolve_in(path.to_str().unwrap(), dir.path()).unwrap(),
        );
        let err = backend.initialize(&EngineConfig::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::EngineInit);
    }
}
