//! File-facing services: image codec, extension filtering and progress reporting

pub mod format;
pub mod io;
pub mod progress;
pub mod tiff;

pub use format::{output_path_for, ExtensionFilter, OUTPUT_EXTENSION};
pub use io::ImageCodec;
pub use progress::{
    BatchProgressUpdate, ConsoleProgressReporter, NoOpProgressReporter, ProcessingStage,
    ProgressReporter, ProgressTracker,
};
