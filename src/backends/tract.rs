//! Tract backend
//!
//! Runs the same `.onnx` model files through Tract, a pure Rust inference
//! library. The optimized plan is immutable after loading, so a single instance
//! serves all workers at once.

use crate::config::EngineConfig;
use crate::error::{BatchError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelManager, PreprocessingConfig};
use crate::utils::ProviderChoice;
use instant::{Duration, Instant};
use ndarray::Array4;
use tract_onnx::prelude::*;

/// Optimized, runnable Tract plan
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Provider name reported for Tract
const TRACT_PROVIDER: &str = "tract-cpu";

/// Tract backend for running segmentation models using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model: Option<TractModel>,
    model_manager: Option<ModelManager>,
    provider_choice: Option<ProviderChoice>,
    initialized: bool,
}

impl TractBackend {
    /// List all Tract execution providers with availability status and descriptions
    ///
    /// # Examples
    /// ```rust
    /// use removebg_batch::backends::TractBackend;
    ///
    /// let providers = TractBackend::list_providers();
    /// assert_eq!(providers.len(), 1);
    /// ```
    pub fn list_providers() -> Vec<(String, bool, String)> {
        vec![(
            "CPU".to_string(),
            true,
            "Pure Rust CPU inference with no external dependencies".to_string(),
        )]
    }

    /// Create a new uninitialized Tract backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: None,
            model_manager: None,
            provider_choice: None,
            initialized: false,
        }
    }

    /// Create a Tract backend with a pre-configured model manager
    #[must_use]
    pub fn with_model_manager(model_manager: ModelManager) -> Self {
        Self {
            model: None,
            model_manager: Some(model_manager),
            provider_choice: None,
            initialized: false,
        }
    }

    /// Load and initialize the model using Tract
    fn load_model(&mut self, config: &EngineConfig) -> Result<Duration> {
        let model_load_start = Instant::now();

        if self.model_manager.is_none() {
            self.model_manager = Some(ModelManager::resolve(&config.model)?);
        }
        let model_manager = self
            .model_manager
            .as_ref()
            .ok_or_else(|| BatchError::internal("Model manager missing after resolution"))?;

        let model_data = model_manager.load_model()?;
        let model_info = model_manager.get_info();
        let [width, height] = model_manager.get_preprocessing_config().target_size;

        #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for logging display
        let size_mb = model_info.size_bytes as f64 / (1024.0 * 1024.0);
        log::info!(
            "🧠 Loading {} into Tract ({size_mb:.2} MB, input {width}x{height})",
            model_info.name
        );

        let model_error = |stage: &str, e: &dyn std::fmt::Display| {
            BatchError::model_error_with_context(
                stage,
                model_manager.get_model_path(),
                &e.to_string(),
                &[],
            )
        };

        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(model_data))
            .map_err(|e| model_error("parse", &e))?
            .with_input_fact(0, f32::fact([1, 3, height as usize, width as usize]).into())
            .map_err(|e| model_error("set input shape of", &e))?
            .into_optimized()
            .map_err(|e| model_error("optimize", &e))?
            .into_runnable()
            .map_err(|e| model_error("prepare", &e))?;

        if config.provider != crate::config::ExecutionProvider::Cpu
            && config.provider != crate::config::ExecutionProvider::Auto
        {
            log::warn!(
                "Tract runs on the CPU only; ignoring requested {} provider",
                config.provider
            );
        }

        self.model = Some(model);
        self.provider_choice = Some(ProviderChoice::cpu_only(config.provider, TRACT_PROVIDER));
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::debug!(
            "✅ Tract backend initialized in {}ms",
            model_load_time.as_millis()
        );

        Ok(model_load_time)
    }
}

impl Default for TractBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self, config: &EngineConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| BatchError::internal("Tract model not initialized"))?;

        let inference_start = Instant::now();

        let input_tensor = Tensor::from(input.clone());
        let outputs = model
            .run(tvec![input_tensor.into()])
            .map_err(|e| BatchError::inference_stage_error("run", &e.to_string(), None))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| BatchError::inference("Model produced no output tensors"))?
            .into_arc_tensor();

        let output_data = output_tensor.to_array_view::<f32>().map_err(|e| {
            BatchError::inference_stage_error("output extraction", &e.to_string(), None)
        })?;

        let output_shape = output_data.shape().to_vec();
        let values: Vec<f32> = output_data.iter().copied().collect();
        let output_array = match output_shape.as_slice() {
            &[n, c, h, w] => Array4::from_shape_vec((n, c, h, w), values),
            &[n, h, w] => Array4::from_shape_vec((n, 1, h, w), values),
            other => {
                return Err(BatchError::inference(format!(
                    "Expected 4D output tensor, got shape {other:?}"
                )))
            },
        }
        .map_err(|e| BatchError::inference_stage_error("reshape", &e.to_string(), None))?;

        log::trace!(
            "Tract inference: {}ms",
            inference_start.elapsed().as_millis()
        );

        Ok(output_array)
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
        true
    }

    fn provider_choice(&self) -> ProviderChoice {
        self.provider_choice
            .clone()
            .unwrap_or_else(|| ProviderChoice::cpu_only(crate::config::ExecutionProvider::Cpu, TRACT_PROVIDER))
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
