//! Inference backend abstraction

use crate::{
    config::EngineConfig,
    error::Result,
    models::{ModelInfo, PreprocessingConfig},
    utils::ProviderChoice,
};
use instant::Duration;
use ndarray::Array4;

/// Trait for inference backends
///
/// `infer` takes `&self`: backends that cannot run several inferences at once
/// serialize internally and report `false` from
/// [`supports_concurrent_inference`](Self::supports_concurrent_inference), in
/// which case the pool gives every worker its own instance.
pub trait InferenceBackend: Send + Sync {
    /// Initialize the backend with the given configuration
    ///
    /// Returns the model load time when a model was loaded.
    ///
    /// # Errors
    /// - Model file missing or unreadable
    /// - Backend initialization failures
    fn initialize(&mut self, config: &EngineConfig) -> Result<Option<Duration>>;

    /// Run inference on an NCHW input tensor
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Model inference failures
    /// - Output tensor of unexpected rank
    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Get the expected input shape for this backend
    fn input_shape(&self) -> (usize, usize, usize, usize);

    /// Get preprocessing configuration for this backend
    fn get_preprocessing_config(&self) -> PreprocessingConfig;

    /// Get model information for this backend
    ///
    /// # Errors
    /// - Backend not initialized
    fn get_model_info(&self) -> Result<ModelInfo>;

    /// Whether one instance may serve several workers at once
    fn supports_concurrent_inference(&self) -> bool;

    /// Provider the backend ended up running on
    fn provider_choice(&self) -> ProviderChoice;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;
}
