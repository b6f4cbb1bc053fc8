//! Segmentation engines
//!
//! An [`EngineHandle`] wraps an initialized [`InferenceBackend`] together with the
//! preprocessing it needs, and turns a decoded image into a mask at the image's
//! own resolution. [`EngineSet`] decides how many handles a run needs: one
//! shared handle for backends that allow concurrent inference, one per worker
//! otherwise.

use crate::{
    backends::MockBackend,
    config::{EngineConfig, EngineKind, MaskRefinement},
    error::{BatchError, Result},
    inference::InferenceBackend,
    models::{ModelInfo, PreprocessingConfig},
    types::{DecodedImage, Mask},
    utils::{mask_from_output, refine_mask, ImagePreprocessor, ProviderChoice},
};
use instant::Duration;
use std::sync::Arc;
use tracing::{debug, info, span, Level};

/// Factory trait for creating inference backends
pub trait BackendFactory: Send + Sync {
    /// Create an uninitialized backend for the configured engine kind
    ///
    /// # Errors
    /// - `EngineInit` when the engine is unavailable or its model cannot be resolved
    fn create_backend(&self, config: &EngineConfig) -> Result<Box<dyn InferenceBackend>>;

    /// Get list of available engine kinds
    fn available_backends(&self) -> Vec<EngineKind>;
}

/// Backend factory covering every engine compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(&self, config: &EngineConfig) -> Result<Box<dyn InferenceBackend>> {
        match config.kind {
            #[cfg(feature = "onnx")]
            EngineKind::LocalModel => {
                let manager = crate::models::ModelManager::resolve(&config.model)?;
                Ok(Box::new(crate::backends::OnnxBackend::with_model_manager(
                    manager,
                )))
            },
            #[cfg(feature = "tract")]
            EngineKind::ExternalLibrary => {
                let manager = crate::models::ModelManager::resolve(&config.model)?;
                Ok(Box::new(crate::backends::TractBackend::with_model_manager(
                    manager,
                )))
            },
            EngineKind::Mock => Ok(Box::new(MockBackend::new())),
            #[allow(unreachable_patterns)]
            other => Err(BatchError::engine_init(format!(
                "Engine '{other}' is not compiled into this build"
            ))),
        }
    }

    fn available_backends(&self) -> Vec<EngineKind> {
        let mut kinds = Vec::new();
        if cfg!(feature = "onnx") {
            kinds.push(EngineKind::LocalModel);
        }
        if cfg!(feature = "tract") {
            kinds.push(EngineKind::ExternalLibrary);
        }
        kinds.push(EngineKind::Mock);
        kinds
    }
}

/// A mock backend is its own factory: every engine is a clone sharing its counters
impl BackendFactory for MockBackend {
    fn create_backend(&self, _config: &EngineConfig) -> Result<Box<dyn InferenceBackend>> {
        Ok(Box::new(self.clone()))
    }

    fn available_backends(&self) -> Vec<EngineKind> {
        vec![EngineKind::Mock]
    }
}

/// An initialized segmentation engine
pub struct EngineHandle {
    backend: Box<dyn InferenceBackend>,
    preprocessing: PreprocessingConfig,
    mask_max_size: u32,
    refinement: MaskRefinement,
    kind: EngineKind,
    load_time: Option<Duration>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("kind", &self.kind)
            .field("preprocessing", &self.preprocessing)
            .field("mask_max_size", &self.mask_max_size)
            .field("refinement", &self.refinement)
            .field("provider", &self.backend.provider_choice().used)
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Create and initialize an engine
    ///
    /// # Errors
    /// - `EngineInit` when the model cannot be resolved or loaded, or the backend fails to start
    pub fn prepare(config: &EngineConfig, factory: &dyn BackendFactory) -> Result<Self> {
        let _span = span!(Level::DEBUG, "engine_prepare", kind = %config.kind, model = %config.model)
            .entered();

        let mut backend = factory.create_backend(config)?;
        let load_time = backend.initialize(config).map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                BatchError::engine_init(e.to_string())
            }
        })?;

        let preprocessing = backend.get_preprocessing_config();
        let choice = backend.provider_choice();
        info!(
            kind = %config.kind,
            provider = %choice,
            input = ?preprocessing.target_size,
            load_ms = ?load_time.map(|t| t.as_millis()),
            "Engine ready"
        );

        Ok(Self {
            backend,
            preprocessing,
            mask_max_size: config.mask_max_size,
            refinement: config.refinement,
            kind: config.kind,
            load_time,
        })
    }

    /// Compute a foreground mask at the image's own resolution
    ///
    /// When refinement is enabled it runs on the working-resolution image the
    /// model saw, before the mask is scaled to the source.
    ///
    /// # Errors
    /// - `Inference` when the backend fails or returns an unusable tensor
    pub fn infer(&self, image: &DecodedImage) -> Result<Mask> {
        let (width, height) = image.dimensions();

        let (working, tensor) = {
            let _span = span!(Level::TRACE, "preprocess").entered();
            let working = ImagePreprocessor::working_rgb(image.pixels(), self.mask_max_size);
            let tensor = ImagePreprocessor::tensor_from_rgb(&working, &self.preprocessing)?;
            (working, tensor)
        };

        let output = {
            let _span = span!(Level::TRACE, "model").entered();
            self.backend.infer(&tensor)?
        };

        let _span = span!(Level::TRACE, "postprocess").entered();
        let mut mask = mask_from_output(&output)?;
        if self.refinement.is_enabled() {
            mask = refine_mask(&mask, &working, self.refinement)?;
        }
        drop(working);
        debug!(
            model_mask = ?mask.dimensions(),
            target = ?(width, height),
            "Upsampling mask"
        );
        mask.resample(width, height)
    }

    #[must_use]
    pub fn supports_concurrent_inference(&self) -> bool {
        self.backend.supports_concurrent_inference()
    }

    #[must_use]
    pub fn provider_choice(&self) -> ProviderChoice {
        self.backend.provider_choice()
    }

    #[must_use]
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Model load time, if a model was loaded
    #[must_use]
    pub fn load_time(&self) -> Option<Duration> {
        self.load_time
    }

    /// # Errors
    /// - Backend reports no model
    pub fn model_info(&self) -> Result<ModelInfo> {
        self.backend.get_model_info()
    }
}

/// Engines prepared for a run
#[derive(Debug, Clone)]
pub enum EngineSet {
    /// One engine serving every worker
    Shared(Arc<EngineHandle>),
    /// One engine per worker
    PerWorker(Vec<Arc<EngineHandle>>),
}

impl EngineSet {
    /// Prepare engines for `workers` workers
    ///
    /// A single engine is created first; if its backend does not allow
    /// concurrent inference, one more is created for each additional worker.
    ///
    /// # Errors
    /// - `EngineInit` from any engine
    pub fn prepare(
        config: &EngineConfig,
        workers: usize,
        factory: &dyn BackendFactory,
    ) -> Result<Self> {
        let first = EngineHandle::prepare(config, factory)?;
        if first.supports_concurrent_inference() || workers <= 1 {
            return Ok(Self::Shared(Arc::new(first)));
        }

        info!(workers, "Engine is not shareable; preparing one instance per worker");
        let mut engines = Vec::with_capacity(workers);
        engines.push(Arc::new(first));
        for _ in 1..workers {
            engines.push(Arc::new(EngineHandle::prepare(config, factory)?));
        }
        Ok(Self::PerWorker(engines))
    }

    /// Wrap a single engine
    #[must_use]
    pub fn shared(engine: EngineHandle) -> Self {
        Self::Shared(Arc::new(engine))
    }

    /// Engine for the given worker index
    #[must_use]
    pub fn for_worker(&self, worker: usize) -> Arc<EngineHandle> {
        match self {
            Self::Shared(engine) => Arc::clone(engine),
            Self::PerWorker(engines) => Arc::clone(&engines[worker % engines.len()]),
        }
    }

    /// Upper bound on useful workers, if the set limits it
    #[must_use]
    pub fn max_workers(&self) -> Option<usize> {
        match self {
            Self::Shared(_) => None,
            Self::PerWorker(engines) => Some(engines.len()),
        }
    }

    /// Provider used by the engines
    #[must_use]
    pub fn provider_choice(&self) -> ProviderChoice {
        self.for_worker(0).provider_choice()
    }
}
