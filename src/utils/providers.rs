//! Execution provider selection
//!
//! Engines ask for a provider; what they get depends on what the runtime reports
//! as available. Unavailable accelerators fall back to CPU with a warning, and the
//! decision is recorded in the run summary.

use crate::config::{EngineKind, ExecutionProvider};
use serde::{Deserialize, Serialize};

/// Providers tried for `auto`, in order of preference
const AUTO_PREFERENCE: [ExecutionProvider; 2] = [ExecutionProvider::Cuda, ExecutionProvider::CoreMl];

/// Information about an execution provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub engine: EngineKind,
    pub available: bool,
    pub description: String,
}

/// The provider an engine actually runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderChoice {
    /// What the configuration asked for
    pub requested: ExecutionProvider,
    /// Provider in use (`cpu`, `cuda`, `coreml`, or the engine's own name)
    pub used: String,
    /// Providers reported as available when the engine started
    pub available: Vec<String>,
    /// An explicitly requested accelerator was unavailable
    pub fell_back: bool,
}

impl ProviderChoice {
    /// Choice for engines that only ever run on the CPU
    #[must_use]
    pub fn cpu_only(requested: ExecutionProvider, used: &str) -> Self {
        Self {
            requested,
            used: used.to_string(),
            available: vec![used.to_string()],
            fell_back: matches!(requested, ExecutionProvider::Cuda | ExecutionProvider::CoreMl),
        }
    }
}

impl std::fmt::Display for ProviderChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fell_back {
            write!(f, "{} (requested {}, unavailable)", self.used, self.requested)
        } else {
            write!(f, "{}", self.used)
        }
    }
}

/// Utility for selecting and listing execution providers
pub struct ExecutionProviderManager;

impl ExecutionProviderManager {
    /// Pick the provider to use given what is available
    ///
    /// `available` holds accelerators only; CPU is always assumed present.
    #[must_use]
    pub fn select(requested: ExecutionProvider, available: &[ExecutionProvider]) -> ProviderChoice {
        let (used, fell_back) = match requested {
            ExecutionProvider::Auto => (
                AUTO_PREFERENCE
                    .into_iter()
                    .find(|p| available.contains(p))
                    .unwrap_or(ExecutionProvider::Cpu),
                false,
            ),
            ExecutionProvider::Cpu => (ExecutionProvider::Cpu, false),
            accelerator => {
                if available.contains(&accelerator) {
                    (accelerator, false)
                } else {
                    log::warn!("{accelerator} execution provider is not available, falling back to CPU");
                    (ExecutionProvider::Cpu, true)
                }
            },
        };

        let mut names: Vec<String> = available
            .iter()
            .filter(|p| **p != ExecutionProvider::Cpu)
            .map(ToString::to_string)
            .collect();
        names.push(ExecutionProvider::Cpu.to_string());

        ProviderChoice {
            requested,
            used: used.to_string(),
            available: names,
            fell_back,
        }
    }

    /// Get a list of all engine/provider combinations with availability status
    #[must_use]
    pub fn list_all_providers() -> Vec<ProviderInfo> {
        let mut providers = Vec::new();

        #[cfg(feature = "onnx")]
        {
            use crate::backends::OnnxBackend;
            for (name, available, description) in OnnxBackend::list_providers() {
                providers.push(ProviderInfo {
                    name: format!("{}:{}", EngineKind::LocalModel, name.to_lowercase()),
                    engine: EngineKind::LocalModel,
                    available,
                    description,
                });
            }
        }

        #[cfg(not(feature = "onnx"))]
        providers.push(ProviderInfo {
            name: format!("{}:cpu", EngineKind::LocalModel),
            engine: EngineKind::LocalModel,
            available: false,
            description: "ONNX Runtime (feature disabled)".to_string(),
        });

        providers.push(ProviderInfo {
            name: format!("{}:cpu", EngineKind::ExternalLibrary),
            engine: EngineKind::ExternalLibrary,
            available: cfg!(feature = "tract"),
            description: if cfg!(feature = "tract") {
                "Pure Rust CPU inference via Tract".to_string()
            } else {
                "Pure Rust CPU inference via Tract (feature disabled)".to_string()
            },
        });

        providers.push(ProviderInfo {
            name: format!("{}:cpu", EngineKind::Mock),
            engine: EngineKind::Mock,
            available: true,
            description: "Deterministic luminance mask for testing".to_string(),
        });

        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_prefers_cuda_then_coreml() {
        let choice = ExecutionProviderManager::select(
            ExecutionProvider::Auto,
            &[ExecutionProvider::CoreMl, ExecutionProvider::Cuda],
        );
        assert_eq!(choice.used, "cuda");
        assert!(!choice.fell_back);

        let choice =
            ExecutionProviderManager::select(ExecutionProvider::Auto, &[ExecutionProvider::CoreMl]);
        assert_eq!(choice.used, "coreml");

        let choice = ExecutionProviderManager::select(ExecutionProvider::Auto, &[]);
        assert_eq!(choice.used, "cpu");
        assert!(!choice.fell_back);
    }

    #[test]
    fn test_unavailable_accelerator_falls_back() {
        let choice = ExecutionProviderManager::select(ExecutionProvider::Cuda, &[]);
        assert_eq!(choice.used, "cpu");
        assert!(choice.fell_back);
        assert_eq!(choice.available, vec!["cpu".to_string()]);
        assert!(choice.to_string().contains("requested cuda"));
    }

    #[test]
    fn test_available_accelerator_used() {
        let choice =
            ExecutionProviderManager::select(ExecutionProvider::CoreMl, &[ExecutionProvider::CoreMl]);
        assert_eq!(choice.used, "coreml");
        assert_eq!(choice.available, vec!["coreml".to_string(), "cpu".to_string()]);
    }

    #[test]
    fn test_cpu_only_choice() {
        let choice = ProviderChoice::cpu_only(ExecutionProvider::Auto, "tract-cpu");
        assert!(!choice.fell_back);
        assert_eq!(choice.to_string(), "tract-cpu");

        let choice = ProviderChoice::cpu_only(ExecutionProvider::Cuda, "tract-cpu");
        assert!(choice.fell_back);
    }

    #[test]
    fn test_list_all_providers_includes_mock() {
        let providers = ExecutionProviderManager::list_all_providers();
        assert!(providers
            .iter()
            .any(|p| p.engine == EngineKind::Mock && p.available));
    }
}
