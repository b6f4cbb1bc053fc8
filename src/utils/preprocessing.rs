//! Image preprocessing and mask postprocessing shared by all engines
//!
//! Every engine sees the same tensor for the same source: the source is reduced
//! to 8-bit RGB, downscaled to the working size, resized to the model's square
//! input and normalized into NCHW layout.

use crate::{
    error::{BatchError, Result},
    models::PreprocessingConfig,
    types::Mask,
};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use ndarray::Array4;

/// Working dimensions for a source of `width` x `height` capped at `max_size`
///
/// The longest edge is scaled down to `max_size` keeping the aspect ratio; sources
/// already within the cap (or `max_size == 0`) keep their size. Each edge is at
/// least one pixel.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn working_dimensions(width: u32, height: u32, max_size: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_size == 0 || longest <= max_size {
        return (width, height);
    }
    let scale = f64::from(max_size) / f64::from(longest);
    let scaled = |dim: u32| ((f64::from(dim) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

/// Reduce a 16-bit sample to 8 bits with rounding
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn sample_to_u8(value: u16) -> u8 {
    ((u32::from(value) * 255 + 32767) / 65535) as u8
}

/// 8-bit RGB view of a decoded image, dropping any alpha channel
#[must_use]
pub fn to_rgb8(image: &DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(img) => img.clone(),
        DynamicImage::ImageRgb16(img) => RgbImage::from_fn(img.width(), img.height(), |x, y| {
            let p = img.get_pixel(x, y);
            Rgb([sample_to_u8(p[0]), sample_to_u8(p[1]), sample_to_u8(p[2])])
        }),
        DynamicImage::ImageRgba16(img) => RgbImage::from_fn(img.width(), img.height(), |x, y| {
            let p = img.get_pixel(x, y);
            Rgb([sample_to_u8(p[0]), sample_to_u8(p[1]), sample_to_u8(p[2])])
        }),
        other => other.to_rgb8(),
    }
}

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Build the model input tensor for an image
    ///
    /// # Arguments
    /// * `image` - Decoded pixels (8 or 16-bit, with or without alpha)
    /// * `preprocessing_config` - Model input size and normalization
    /// * `mask_max_size` - Cap on the working resolution (0 = none)
    ///
    /// # Errors
    /// - `Inference` for a zero-sized model input
    pub fn preprocess_for_inference(
        image: &DynamicImage,
        preprocessing_config: &PreprocessingConfig,
        mask_max_size: u32,
    ) -> Result<Array4<f32>> {
        let working = Self::working_rgb(image, mask_max_size);
        Self::tensor_from_rgb(&working, preprocessing_config)
    }

    /// 8-bit RGB copy of `image` scaled down to the working resolution
    #[must_use]
    pub fn working_rgb(image: &DynamicImage, mask_max_size: u32) -> RgbImage {
        let rgb = to_rgb8(image);
        let (width, height) = rgb.dimensions();
        let (work_w, work_h) = working_dimensions(width, height, mask_max_size);
        if (work_w, work_h) == (width, height) {
            rgb
        } else {
            image::imageops::resize(&rgb, work_w, work_h, FilterType::Lanczos3)
        }
    }

    /// Resize an RGB image to the model input and normalize it into NCHW
    ///
    /// # Errors
    /// - `Inference` for a zero-sized model input
    pub fn tensor_from_rgb(
        rgb: &RgbImage,
        preprocessing_config: &PreprocessingConfig,
    ) -> Result<Array4<f32>> {
        let [target_w, target_h] = preprocessing_config.target_size;
        if target_w == 0 || target_h == 0 {
            return Err(BatchError::inference_stage_error(
                "preprocess",
                "model input size is zero",
                None,
            ));
        }

        let resized = if rgb.dimensions() == (target_w, target_h) {
            rgb.clone()
        } else {
            image::imageops::resize(rgb, target_w, target_h, FilterType::Lanczos3)
        };

        let mean = preprocessing_config.normalization_mean;
        let std = preprocessing_config.normalization_std;
        let mut tensor = Array4::<f32>::zeros((1, 3, target_h as usize, target_w as usize));

        #[allow(clippy::indexing_slicing)]
        // Tensor dimensions match the resized image
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] =
                    (f32::from(pixel[channel]) / 255.0 - mean[channel]) / std[channel];
            }
        }

        Ok(tensor)
    }
}

/// Turn a raw model output into a probability mask at model resolution
///
/// The first channel of the first batch item is min-max normalized; a flat output
/// (range below `1e-8`) becomes an all-zero mask.
///
/// # Errors
/// - `Inference` when the output has no spatial extent
#[allow(clippy::cast_possible_truncation)]
pub fn mask_from_output(output: &Array4<f32>) -> Result<Mask> {
    let shape = output.shape();
    let (batch, channels, height, width) = (shape[0], shape[1], shape[2], shape[3]);
    if batch == 0 || channels == 0 || height == 0 || width == 0 {
        return Err(BatchError::inference_stage_error(
            "postprocess",
            &format!("model output has empty shape {shape:?}"),
            None,
        ));
    }

    let plane = output.slice(ndarray::s![0, 0, .., ..]);
    let (min, max) = plane
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;

    let data: Vec<f32> = if !range.is_finite() || range < 1e-8 {
        vec![0.0; width * height]
    } else {
        plane.iter().map(|&v| (v - min) / range).collect()
    };

    Mask::new(width as u32, height as u32, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn create_test_preprocessing_config() -> PreprocessingConfig {
        PreprocessingConfig {
            target_size: [64, 64],
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [0.229, 0.224, 0.225],
        }
    }

    #[test]
    fn test_working_dimensions() {
        assert_eq!(working_dimensions(4000, 3000, 1024), (1024, 768));
        assert_eq!(working_dimensions(3000, 4000, 1024), (768, 1024));
        assert_eq!(working_dimensions(800, 600, 1024), (800, 600));
        assert_eq!(working_dimensions(4000, 3000, 0), (4000, 3000));
        assert_eq!(working_dimensions(10000, 1, 100), (100, 1));
    }

    #[test]
    fn test_sample_to_u8() {
        assert_eq!(sample_to_u8(0), 0);
        assert_eq!(sample_to_u8(65535), 255);
        assert_eq!(sample_to_u8(257), 1);
        assert_eq!(sample_to_u8(32896), 128);
    }

    #[test]
    fn test_to_rgb8_from_sixteen_bit() {
        let img: ImageBuffer<Rgba<u16>, Vec<u16>> =
            ImageBuffer::from_pixel(2, 2, Rgba([65535, 0, 32896, 1000]));
        let rgb = to_rgb8(&DynamicImage::ImageRgba16(img));
        assert_eq!(rgb.get_pixel(1, 1).0, [255, 0, 128]);
    }

    #[test]
    fn test_preprocess_for_inference_shape_and_values() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 50, Rgb([255, 0, 0])));
        let config = create_test_preprocessing_config();

        let tensor = ImagePreprocessor::preprocess_for_inference(&image, &config, 32).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);

        let red = (1.0 - 0.485) / 0.229;
        let green = (0.0 - 0.456) / 0.224;
        assert!((tensor[[0, 0, 10, 10]] - red).abs() < 1e-3);
        assert!((tensor[[0, 1, 10, 10]] - green).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_rejects_zero_target() {
        let config = PreprocessingConfig {
            target_size: [0, 0],
            ..create_test_preprocessing_config()
        };
        let rgb = RgbImage::new(4, 4);
        assert!(ImagePreprocessor::tensor_from_rgb(&rgb, &config).is_err());
    }

    #[test]
    fn test_mask_from_output_normalizes() {
        let mut output = Array4::<f32>::zeros((1, 1, 2, 2));
        output[[0, 0, 0, 0]] = -2.0;
        output[[0, 0, 0, 1]] = 0.0;
        output[[0, 0, 1, 0]] = 2.0;
        output[[0, 0, 1, 1]] = 1.0;

        let mask = mask_from_output(&output).unwrap();
        assert_eq!(mask.dimensions(), (2, 2));
        assert_eq!(mask.data(), &[0.0, 0.5, 1.0, 0.75]);
    }

    #[test]
    fn test_mask_from_flat_output_is_zero() {
        let output = Array4::<f32>::from_elem((1, 1, 3, 3), 0.7);
        let mask = mask_from_output(&output).unwrap();
        assert!(mask.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_mask_from_empty_output_fails() {
        let output = Array4::<f32>::zeros((1, 0, 3, 3));
        assert!(mask_from_output(&output).is_err());
    }
}
