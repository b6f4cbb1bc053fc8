//! Core types shared across the batch pipeline

use crate::error::{BatchError, ErrorDescriptor, Result};
use image::{imageops::FilterType, DynamicImage, ImageBuffer, ImageFormat, Luma, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One unit of work: a source image and the place its cutout will be written
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageTask {
    /// Absolute (or root-joined) path of the source file
    pub source: PathBuf,
    /// Path of the source relative to the input root
    pub relative: PathBuf,
    /// Output location under the output root, always with a `.tiff` extension
    pub output: PathBuf,
}

/// Sample precision of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    /// Largest sample value at this depth
    #[must_use]
    pub fn max_value(self) -> u32 {
        match self {
            Self::Eight => u32::from(u8::MAX),
            Self::Sixteen => u32::from(u16::MAX),
        }
    }

    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }
}

impl std::fmt::Display for BitDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Embedded ICC color profile, carried through byte-for-byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorProfile {
    icc_data: Vec<u8>,
}

impl ColorProfile {
    #[must_use]
    pub fn from_icc_data(icc_data: Vec<u8>) -> Self {
        Self { icc_data }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.icc_data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.icc_data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.icc_data.is_empty()
    }

    /// Profile description from the ICC header's color space field, for logging
    #[must_use]
    pub fn color_space(&self) -> Option<&str> {
        self.icc_data
            .get(16..20)
            .and_then(|sig| std::str::from_utf8(sig).ok())
            .map(str::trim_end)
    }
}

/// Unit for [`Resolution`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionUnit {
    None,
    Inch,
    Centimeter,
}

/// TIFF pixel density, kept as exact rationals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Horizontal density as numerator/denominator
    pub x: (u32, u32),
    /// Vertical density as numerator/denominator
    pub y: (u32, u32),
    pub unit: ResolutionUnit,
}

/// A decoded source image
///
/// Pixels are always one of `Rgb8`, `Rgba8`, `Rgb16` or `Rgba16`; grayscale input
/// is widened to RGB at the same depth on construction.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: DynamicImage,
    bit_depth: BitDepth,
    has_alpha: bool,
    profile: Option<ColorProfile>,
    resolution: Option<Resolution>,
    format: Option<ImageFormat>,
}

impl DecodedImage {
    /// Normalize a decoded image into the pipeline's pixel layouts
    ///
    /// # Errors
    /// - `UnsupportedFormat` for floating-point or otherwise unknown sample types
    pub fn new(
        pixels: DynamicImage,
        profile: Option<ColorProfile>,
        resolution: Option<Resolution>,
        format: Option<ImageFormat>,
    ) -> Result<Self> {
        let (pixels, bit_depth, has_alpha) = match pixels {
            DynamicImage::ImageRgb8(_) => (pixels, BitDepth::Eight, false),
            DynamicImage::ImageRgba8(_) => (pixels, BitDepth::Eight, true),
            DynamicImage::ImageRgb16(_) => (pixels, BitDepth::Sixteen, false),
            DynamicImage::ImageRgba16(_) => (pixels, BitDepth::Sixteen, true),
            DynamicImage::ImageLuma8(_) => (
                DynamicImage::ImageRgb8(pixels.to_rgb8()),
                BitDepth::Eight,
                false,
            ),
            DynamicImage::ImageLumaA8(_) => (
                DynamicImage::ImageRgba8(pixels.to_rgba8()),
                BitDepth::Eight,
                true,
            ),
            DynamicImage::ImageLuma16(_) => (
                DynamicImage::ImageRgb16(pixels.to_rgb16()),
                BitDepth::Sixteen,
                false,
            ),
            DynamicImage::ImageLumaA16(_) => (
                DynamicImage::ImageRgba16(pixels.to_rgba16()),
                BitDepth::Sixteen,
                true,
            ),
            other => {
                return Err(BatchError::unsupported_format(format!(
                    "sample type {:?} is not 8 or 16-bit unsigned",
                    other.color()
                )))
            },
        };

        Ok(Self {
            pixels,
            bit_depth,
            has_alpha,
            profile,
            resolution,
            format,
        })
    }

    #[must_use]
    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.pixels.width(), self.pixels.height())
    }

    #[must_use]
    pub fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    #[must_use]
    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    #[must_use]
    pub fn color_profile(&self) -> Option<&ColorProfile> {
        self.profile.as_ref()
    }

    #[must_use]
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    #[must_use]
    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }
}

/// Single-channel foreground probabilities in `[0, 1]`
///
/// `data.len() == width * height` always holds; values are clamped on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl Mask {
    /// # Errors
    /// - `Inference` when the buffer does not match the dimensions
    pub fn new(width: u32, height: u32, mut data: Vec<f32>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(BatchError::inference(format!(
                "mask dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(BatchError::inference(format!(
                "mask buffer has {} values, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        for value in &mut data {
            *value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a mask by evaluating `f(x, y)` for every pixel
    ///
    /// # Errors
    /// - `Inference` for zero dimensions
    pub fn from_fn<F: FnMut(u32, u32) -> f32>(width: u32, height: u32, mut f: F) -> Result<Self> {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self::new(width, height, data)
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Probability at `(x, y)`, or 0 outside the mask
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        if x >= self.width || y >= self.height {
            return 0.0;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Resample to `width` x `height` with a triangle filter
    ///
    /// # Errors
    /// - `Inference` for zero target dimensions
    pub fn resample(&self, width: u32, height: u32) -> Result<Self> {
        if (width, height) == (self.width, self.height) {
            return Ok(self.clone());
        }
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(self.width, self.height, self.data.clone())
                .ok_or_else(|| BatchError::internal("mask buffer does not match its dimensions"))?;
        let resized = image::imageops::resize(&buffer, width, height, FilterType::Triangle);
        Self::new(width, height, resized.into_raw())
    }
}

/// 16-bit RGBA image buffer
pub type Rgba16Image = ImageBuffer<Rgba<u16>, Vec<u16>>;

/// Composited output at the source's bit depth
#[derive(Debug, Clone, PartialEq)]
pub enum RgbaBuffer {
    Rgba8(RgbaImage),
    Rgba16(Rgba16Image),
}

impl RgbaBuffer {
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Rgba8(img) => img.dimensions(),
            Self::Rgba16(img) => img.dimensions(),
        }
    }

    #[must_use]
    pub fn bit_depth(&self) -> BitDepth {
        match self {
            Self::Rgba8(_) => BitDepth::Eight,
            Self::Rgba16(_) => BitDepth::Sixteen,
        }
    }

    /// Alpha sample at `(x, y)` widened to `u16`
    #[must_use]
    pub fn alpha_at(&self, x: u32, y: u32) -> Option<u16> {
        match self {
            Self::Rgba8(img) => img.get_pixel_checked(x, y).map(|p| u16::from(p[3])),
            Self::Rgba16(img) => img.get_pixel_checked(x, y).map(|p| p[3]),
        }
    }

    #[must_use]
    pub fn into_dynamic(self) -> DynamicImage {
        match self {
            Self::Rgba8(img) => DynamicImage::ImageRgba8(img),
            Self::Rgba16(img) => DynamicImage::ImageRgba16(img),
        }
    }
}

/// Why a task was skipped instead of processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Extension is not in the allow-list
    UnsupportedExtension,
    /// Output exists and the run is configured to keep it
    OutputExists,
    /// The run was cancelled before or during this task
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedExtension => write!(f, "unsupported extension"),
            Self::OutputExists => write!(f, "output exists"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Coarse task status used for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Terminal outcome of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed { error: ErrorDescriptor },
    Skipped { reason: SkipReason },
}

impl TaskOutcome {
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Succeeded => TaskStatus::Succeeded,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::Skipped { .. } => TaskStatus::Skipped,
        }
    }
}

/// Per-stage timings of a processed task, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    pub decode_ms: u64,
    pub inference_ms: u64,
    pub compose_ms: u64,
    pub encode_ms: u64,
}

impl ProcessingTimings {
    #[must_use]
    pub fn total_ms(&self) -> u64 {
        self.decode_ms + self.inference_ms + self.compose_ms + self.encode_ms
    }
}

/// Result of one task, reported exactly once per enumerated entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Source path
    pub source: PathBuf,
    /// Path relative to the input root
    pub relative: PathBuf,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
    /// Wall time spent on the task
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timings: Option<ProcessingTimings>,
}

impl TaskResult {
    #[must_use]
    pub fn succeeded(task: &ImageTask, elapsed: Duration, timings: ProcessingTimings) -> Self {
        Self {
            source: task.source.clone(),
            relative: task.relative.clone(),
            outcome: TaskOutcome::Succeeded,
            elapsed,
            timings: Some(timings),
        }
    }

    #[must_use]
    pub fn failed(task: &ImageTask, elapsed: Duration, error: &BatchError) -> Self {
        Self {
            source: task.source.clone(),
            relative: task.relative.clone(),
            outcome: TaskOutcome::Failed {
                error: ErrorDescriptor::from(error),
            },
            elapsed,
            timings: None,
        }
    }

    #[must_use]
    pub fn skipped(task: &ImageTask, reason: SkipReason) -> Self {
        Self {
            source: task.source.clone(),
            relative: task.relative.clone(),
            outcome: TaskOutcome::Skipped { reason },
            elapsed: Duration::ZERO,
            timings: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.outcome.status()
    }

    #[must_use]
    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match &self.outcome {
            TaskOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    #[must_use]
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.outcome {
            TaskOutcome::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{GrayImage, Luma as LumaPixel, Rgb32FImage};

    fn task() -> ImageTask {
        ImageTask {
            source: PathBuf::from("/in/a/b.png"),
            relative: PathBuf::from("a/b.png"),
            output: PathBuf::from("/out/a/b.tiff"),
        }
    }

    #[test]
    fn test_decoded_image_widens_grayscale() {
        let gray = GrayImage::from_pixel(4, 3, LumaPixel([77]));
        let decoded = DecodedImage::new(DynamicImage::ImageLuma8(gray), None, None, None).unwrap();

        assert_eq!(decoded.bit_depth(), BitDepth::Eight);
        assert!(!decoded.has_alpha());
        assert_eq!(decoded.dimensions(), (4, 3));
        let rgb = decoded.pixels().as_rgb8().unwrap();
        assert_eq!(rgb.get_pixel(1, 1).0, [77, 77, 77]);
    }

    #[test]
    fn test_decoded_image_keeps_sixteen_bit() {
        let img = DynamicImage::new_rgba16(2, 2);
        let decoded = DecodedImage::new(img, None, None, Some(ImageFormat::Tiff)).unwrap();
        assert_eq!(decoded.bit_depth(), BitDepth::Sixteen);
        assert!(decoded.has_alpha());
        assert_eq!(decoded.format(), Some(ImageFormat::Tiff));
    }

    #[test]
    fn test_decoded_image_rejects_float() {
        let img = DynamicImage::ImageRgb32F(Rgb32FImage::new(2, 2));
        let err = DecodedImage::new(img, None, None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_mask_rejects_mismatched_buffer() {
        assert!(Mask::new(4, 4, vec![0.5; 15]).is_err());
        assert!(Mask::new(0, 4, Vec::new()).is_err());
        assert!(Mask::new(4, 4, vec![0.5; 16]).is_ok());
    }

    #[test]
    fn test_mask_clamps_values() {
        let mask = Mask::new(2, 2, vec![-1.0, 0.25, 2.0, f32::NAN]).unwrap();
        assert_eq!(mask.data(), &[0.0, 0.25, 1.0, 0.0]);
    }

    #[test]
    fn test_mask_resample_dimensions_and_range() {
        let mask = Mask::from_fn(8, 4, |x, _| if x < 4 { 0.0 } else { 1.0 }).unwrap();
        let up = mask.resample(33, 17).unwrap();
        assert_eq!(up.dimensions(), (33, 17));
        assert!(up.data().iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(up.get(0, 0) < 0.01);
        assert!(up.get(32, 16) > 0.99);
        assert_eq!(up.get(100, 100), 0.0);
    }

    #[test]
    fn test_color_profile_accessors() {
        let mut icc = vec![0u8; 128];
        icc[16..20].copy_from_slice(b"RGB ");
        let profile = ColorProfile::from_icc_data(icc.clone());
        assert_eq!(profile.len(), 128);
        assert_eq!(profile.as_bytes(), icc.as_slice());
        assert_eq!(profile.color_space(), Some("RGB"));
    }

    #[test]
    fn test_task_result_constructors() {
        let ok = TaskResult::succeeded(&task(), Duration::from_millis(5), ProcessingTimings::default());
        assert_eq!(ok.status(), TaskStatus::Succeeded);
        assert!(ok.error().is_none());

        let failed = TaskResult::failed(&task(), Duration::ZERO, &BatchError::inference("boom"));
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert_eq!(failed.error().unwrap().kind, ErrorKind::Inference);

        let skipped = TaskResult::skipped(&task(), SkipReason::UnsupportedExtension);
        assert_eq!(skipped.skip_reason(), Some(SkipReason::UnsupportedExtension));
    }

    #[test]
    fn test_task_result_serializes_flat_status() {
        let skipped = TaskResult::skipped(&task(), SkipReason::Cancelled);
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "cancelled");
    }
}
