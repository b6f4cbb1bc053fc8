//! CLI integration tests for batch runs
//!
//! Runs the built binary with the mock engine and checks exit codes, the output
//! tree and the JSON summary.

#![cfg(feature = "cli")]

use image::{Rgb, RgbImage};
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_removebg-batch"))
}

fn write_gradient_png(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_fn(24, 16, |x, _| {
        let v = (x * 10) as u8;
        Rgb([v, v, v])
    })
    .save(path)
    .expect("Failed to write PNG file");
}

#[test]
fn test_cli_batch_success_writes_summary() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let input = temp_dir.path().join("in");
    let output = temp_dir.path().join("out");
    let summary_path = temp_dir.path().join("summary.json");

    write_gradient_png(&input.join("b.png"));
    write_gradient_png(&input.join("nested/a.png"));
    fs::write(input.join("readme.txt"), "not an image").unwrap();

    let status = binary()
        .args(["--engine", "mock", "--workers", "2", "--no-progress"])
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .arg("--summary-json")
        .arg(&summary_path)
        .output()
        .expect("Failed to execute CLI");

    assert!(
        status.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&status.stderr)
    );
    assert!(output.join("b.tiff").is_file());
    assert!(output.join("nested/a.tiff").is_file());

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(summary["succeeded"], 2);
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["skip_reasons"]["unsupported_extension"], 1);
    assert_eq!(summary["engine"], "mock");
}

#[test]
fn test_cli_exit_code_reports_failures() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let input = temp_dir.path().join("in");
    let output = temp_dir.path().join("out");

    write_gradient_png(&input.join("good.png"));
    fs::write(input.join("bad.jpg"), [0xFF, 0xD8, 0xFF, 0xE0, 0x00]).unwrap();

    let result = binary()
        .args(["--engine", "mock", "--no-progress", "--summary-json", "-"])
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .output()
        .expect("Failed to execute CLI");

    assert_eq!(result.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("bad.jpg"));
    assert!(output.join("good.tiff").is_file());
    assert!(!output.join("bad.tiff").exists());
}

#[test]
fn test_cli_missing_input_is_fatal() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");

    let result = binary()
        .args(["--engine", "mock", "--no-progress"])
        .arg("--input")
        .arg(temp_dir.path().join("missing"))
        .arg("--output")
        .arg(temp_dir.path().join("out"))
        .output()
        .expect("Failed to execute CLI");

    assert!(!result.status.success());
    assert_ne!(result.status.code(), Some(130));
}

#[test]
fn test_cli_show_providers() {
    let result = binary()
        .arg("--show-providers")
        .output()
        .expect("Failed to execute CLI");

    assert!(result.status.success());
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("mock:cpu"));
}
