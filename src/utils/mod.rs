//! Shared helpers for preprocessing, mask refinement and provider selection

pub mod preprocessing;
pub mod providers;
pub mod refinement;

pub use preprocessing::{mask_from_output, working_dimensions, ImagePreprocessor};
pub use providers::{ExecutionProviderManager, ProviderChoice, ProviderInfo};
pub use refinement::refine_mask;
