//! Error types for batch background removal
//!
//! Errors fall into two groups. Run-level errors (`Enumeration`, `EngineInit`,
//! `InvalidConfig`) abort a batch before any task is dispatched. Task-level errors
//! (`UnsupportedFormat`, `Inference`, `Io`) are caught by the worker that hit them
//! and recorded in that task's result.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Result type alias for batch operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Error types for batch background removal
#[derive(Error, Debug)]
pub enum BatchError {
    /// Input root missing or not traversable
    #[error("Enumeration error: {0}")]
    Enumeration(String),

    /// Model could not be resolved or the backend failed to start
    #[error("Engine initialization error: {0}")]
    EngineInit(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input content is not a decodable 8/16-bit image
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Input/output errors (file not found, permission denied, disk full, ...)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable classification of a [`BatchError`], recorded in task results
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Enumeration,
    EngineInit,
    InvalidConfig,
    UnsupportedFormat,
    Inference,
    Io,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Enumeration => "enumeration",
            Self::EngineInit => "engine_init",
            Self::InvalidConfig => "invalid_config",
            Self::UnsupportedFormat => "unsupported_format",
            Self::Inference => "inference",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Serializable error record attached to a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDescriptor {
    #[must_use]
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&BatchError> for ErrorDescriptor {
    fn from(error: &BatchError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

impl BatchError {
    /// Classification used in task results and the run summary
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Enumeration(_) => ErrorKind::Enumeration,
            Self::EngineInit(_) => ErrorKind::EngineInit,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::Inference(_) => ErrorKind::Inference,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error aborts the whole run rather than a single task
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Enumeration(_) | Self::EngineInit(_) | Self::InvalidConfig(_)
        )
    }

    /// Create a new enumeration error
    pub fn enumeration<S: Into<String>>(msg: S) -> Self {
        Self::Enumeration(msg.into())
    }

    /// Create a new engine initialization error
    pub fn engine_init<S: Into<String>>(msg: S) -> Self {
        Self::EngineInit(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new unsupported format error
    pub fn unsupported_format<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<Path>>(operation: &str, path: P, error: &std::io::Error) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {rec}"),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range}).{recommendation}"
        ))
    }

    /// Create engine error with model context and troubleshooting hints
    pub fn model_error_with_context<P: AsRef<Path>>(
        operation: &str,
        model_path: P,
        error: &str,
        suggestions: &[&str],
    ) -> Self {
        let path_display = model_path.as_ref().display();
        let suggestion_text = if suggestions.is_empty() {
            String::new()
        } else {
            format!(" Suggestions: {}", suggestions.join(", "))
        };

        Self::EngineInit(format!(
            "Failed to {operation} model '{path_display}': {error}.{suggestion_text}"
        ))
    }

    /// Create inference error with stage context
    pub fn inference_stage_error(stage: &str, details: &str, input_info: Option<&str>) -> Self {
        let input_context = match input_info {
            Some(info) => format!(" (input: {info})"),
            None => String::new(),
        };

        Self::Inference(format!(
            "Inference failed at stage '{stage}'{input_context}: {details}"
        ))
    }
}

impl From<image::ImageError> for BatchError {
    fn from(error: image::ImageError) -> Self {
        match error {
            image::ImageError::IoError(io) => Self::Io(io),
            other => Self::UnsupportedFormat(other.to_string()),
        }
    }
}

impl From<tiff::TiffError> for BatchError {
    fn from(error: tiff::TiffError) -> Self {
        match error {
            tiff::TiffError::IoError(io) => Self::Io(io),
            tiff::TiffError::FormatError(e) => Self::UnsupportedFormat(e.to_string()),
            tiff::TiffError::UnsupportedError(e) => Self::UnsupportedFormat(e.to_string()),
            other => Self::Internal(format!("TIFF codec error: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BatchError::invalid_config("test config error");
        assert!(matches!(err, BatchError::InvalidConfig(_)));

        let err = BatchError::unsupported_format("float samples");
        assert!(matches!(err, BatchError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_error_display() {
        let err = BatchError::invalid_config("output directory missing");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: output directory missing"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BatchError::enumeration("missing root").is_fatal());
        assert!(BatchError::engine_init("no model").is_fatal());
        assert!(BatchError::invalid_config("bad").is_fatal());

        assert!(!BatchError::unsupported_format("x").is_fatal());
        assert!(!BatchError::inference("x").is_fatal());
        assert!(!BatchError::Io(std::io::Error::other("x")).is_fatal());
    }

    #[test]
    fn test_descriptor_from_error() {
        let err = BatchError::inference("model output was empty");
        let descriptor = ErrorDescriptor::from(&err);
        assert_eq!(descriptor.kind, ErrorKind::Inference);
        assert!(descriptor.message.contains("model output was empty"));
    }

    #[test]
    fn test_image_error_mapping() {
        let io = image::ImageError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        assert_eq!(BatchError::from(io).kind(), ErrorKind::Io);

        let unsupported = image::ImageError::Unsupported(
            image::error::UnsupportedError::from_format_and_kind(
                image::error::ImageFormatHint::Unknown,
                image::error::UnsupportedErrorKind::Format(image::error::ImageFormatHint::Unknown),
            ),
        );
        assert_eq!(
            BatchError::from(unsupported).kind(),
            ErrorKind::UnsupportedFormat
        );
    }

    #[test]
    fn test_enhanced_error_context() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = BatchError::file_io_error("write output", Path::new("/out/a.tiff"), &io_error);
        let error_string = err.to_string();
        assert!(error_string.contains("write output"));
        assert!(error_string.contains("/out/a.tiff"));
        assert_eq!(err.kind(), ErrorKind::Io);

        let err = BatchError::config_value_error("workers", 0, ">= 1", Some(4));
        let error_string = err.to_string();
        assert!(error_string.contains("workers"));
        assert!(error_string.contains("Recommended: 4"));

        let err = BatchError::model_error_with_context(
            "load",
            Path::new("/models/u2netp.onnx"),
            "file not found",
            &["set REMOVEBG_BATCH_MODEL_DIR"],
        );
        assert_eq!(err.kind(), ErrorKind::EngineInit);
        assert!(err.to_string().contains("Suggestions"));

        let err = BatchError::inference_stage_error("postprocess", "empty output", Some("64x64"));
        assert!(err.to_string().contains("postprocess"));
        assert!(err.to_string().contains("64x64"));
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::UnsupportedFormat).unwrap();
        assert_eq!(json, "\"unsupported_format\"");
        assert_eq!(ErrorKind::Io.to_string(), "io");
    }
}
