//! Backend implementations for different inference engines
//!
//! - ONNX Runtime backend (local model, CPU/CUDA/CoreML)
//! - Tract backend (pure Rust, shared between workers)
//! - Mock backend (deterministic, no model file)

pub mod mock;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

pub use self::mock::{MockBackend, MockFailure};

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackend;

#[cfg(feature = "tract")]
pub use self::tract::TractBackend;
