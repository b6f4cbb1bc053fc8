//! removebg-batch CLI tool
//!
//! Writes an RGBA TIFF cutout for every image below an input directory using
//! the ONNX Runtime, Tract or mock segmentation engine.

#[cfg(feature = "cli")]
use removebg_batch::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<std::process::ExitCode> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
