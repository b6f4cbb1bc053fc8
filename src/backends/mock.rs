//! Deterministic mock backend
//!
//! Produces a mask from the luminance of the model input, so bright regions come
//! out opaque and dark regions transparent. It needs no model file and is used by
//! the `mock` engine and throughout the test suite.

use crate::{
    config::{EngineConfig, ExecutionProvider},
    error::{BatchError, Result},
    inference::InferenceBackend,
    models::{ModelInfo, PreprocessingConfig},
    utils::ProviderChoice,
};
use instant::Duration;
use ndarray::{Array4, Axis};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Mock model input edge length
pub const MOCK_INPUT_SIZE: u32 = 64;

/// Provider name reported by the mock backend
const MOCK_PROVIDER: &str = "mock";

/// Where the mock backend should fail, if anywhere
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockFailure {
    #[default]
    Never,
    /// `initialize` returns an engine error
    Initialize,
    /// Every `infer` call returns an inference error
    Inference,
}

/// Mock backend for tests and dry runs
#[derive(Debug, Clone)]
pub struct MockBackend {
    initialized: bool,
    preprocessing_config: PreprocessingConfig,
    failure: MockFailure,
    concurrent: bool,
    requested_provider: ExecutionProvider,
    inference_calls: Arc<AtomicUsize>,
    instances: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Create a new mock backend with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: false,
            preprocessing_config: PreprocessingConfig {
                target_size: [MOCK_INPUT_SIZE, MOCK_INPUT_SIZE],
                normalization_mean: [0.0, 0.0, 0.0],
                normalization_std: [1.0, 1.0, 1.0],
            },
            failure: MockFailure::Never,
            concurrent: true,
            requested_provider: ExecutionProvider::Cpu,
            inference_calls: Arc::new(AtomicUsize::new(0)),
            instances: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail at the given point
    #[must_use]
    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Report whether one instance may be shared between workers
    #[must_use]
    pub fn with_concurrency(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Use a different square model input size
    #[must_use]
    pub fn with_input_size(mut self, size: u32) -> Self {
        self.preprocessing_config.target_size = [size, size];
        self
    }

    /// Inference calls made by this backend and every clone of it
    #[must_use]
    pub fn inference_calls(&self) -> usize {
        self.inference_calls.load(Ordering::SeqCst)
    }

    /// Successful initializations across this backend and its clones
    #[must_use]
    pub fn initialized_instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn initialize(&mut self, config: &EngineConfig) -> Result<Option<Duration>> {
        if self.failure == MockFailure::Initialize {
            return Err(BatchError::engine_init("Mock backend initialization failed"));
        }
        if self.initialized {
            return Ok(None);
        }
        self.requested_provider = config.provider;
        self.initialized = true;
        self.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Duration::from_millis(0)))
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(BatchError::internal("Mock backend not initialized"));
        }
        self.inference_calls.fetch_add(1, Ordering::SeqCst);
        if self.failure == MockFailure::Inference {
            return Err(BatchError::inference("Mock inference failure"));
        }

        let shape = input.shape();
        if shape.len() != 4 || shape[1] != 3 {
            return Err(BatchError::inference(format!(
                "Mock backend expects NCHW input with 3 channels, got {shape:?}"
            )));
        }

        let luminance = input
            .mean_axis(Axis(1))
            .ok_or_else(|| BatchError::inference("Empty channel axis"))?
            .insert_axis(Axis(1));
        luminance
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| BatchError::inference(format!("Mock output has wrong rank: {e}")))
    }

    fn input_shape(&self) -> (usize, usize, usize, usize) {
        let [w, h] = self.preprocessing_config.target_size;
        (1, 3, h as usize, w as usize)
    }

    fn get_preprocessing_config(&self) -> PreprocessingConfig {
        self.preprocessing_config
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        let (n, c, h, w) = self.input_shape();
        Ok(ModelInfo {
            name: "mock".to_string(),
            size_bytes: 0,
            input_shape: (n, c, h, w),
            output_shape: (n, 1, h, w),
        })
    }

    fn supports_concurrent_inference(&self) -> bool {
        self.concurrent
    }

    fn provider_choice(&self) -> ProviderChoice {
        ProviderChoice::cpu_only(self.requested_provider, MOCK_PROVIDER)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
