//! Alpha compositing of source pixels and foreground masks

use crate::{
    error::{BatchError, Result},
    types::{DecodedImage, Mask, Rgba16Image, RgbaBuffer},
};
use image::{DynamicImage, Rgba, RgbaImage};
use log::debug;

/// Map a probability in `[0, 1]` onto `0..=max`
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn probability_to_alpha(probability: f32, max: u32) -> u32 {
    let p = if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    };
    (f64::from(p) * f64::from(max)).round() as u32
}

/// `round(mask_alpha * source_alpha / max)` in integer arithmetic
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn combine_alpha(mask_alpha: u32, source_alpha: u32, max: u32) -> u32 {
    let max = u64::from(max.max(1));
    ((u64::from(mask_alpha) * u64::from(source_alpha) + max / 2) / max) as u32
}

/// Merges source pixels with a mask into an RGBA buffer at the source bit depth
#[derive(Debug, Clone, Copy)]
pub struct Compositor {
    combine_source_alpha: bool,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Compositor {
    /// Create a compositor
    ///
    /// With `combine_source_alpha`, pixels that were already transparent in the
    /// source stay transparent in the cutout.
    #[must_use]
    pub fn new(combine_source_alpha: bool) -> Self {
        Self {
            combine_source_alpha,
        }
    }

    /// Build the RGBA cutout
    ///
    /// RGB samples are copied unchanged; alpha is the mask probability scaled to
    /// the full range of the source bit depth.
    ///
    /// # Errors
    /// - `Internal` if the image is not in one of the normalized pixel layouts
    pub fn compose(&self, image: &DecodedImage, mask: &Mask) -> Result<RgbaBuffer> {
        let (width, height) = image.dimensions();
        let resampled;
        let mask = if mask.dimensions() == (width, height) {
            mask
        } else {
            debug!(
                "Resampling mask {:?} to source {width}x{height}",
                mask.dimensions()
            );
            resampled = mask.resample(width, height)?;
            &resampled
        };
        let combine = self.combine_source_alpha;

        match image.pixels() {
            DynamicImage::ImageRgb8(img) => Ok(RgbaBuffer::Rgba8(RgbaImage::from_fn(
                width,
                height,
                |x, y| {
                    let p = img.get_pixel(x, y);
                    Rgba([p[0], p[1], p[2], alpha_u8(mask.get(x, y), None)])
                },
            ))),
            DynamicImage::ImageRgba8(img) => Ok(RgbaBuffer::Rgba8(RgbaImage::from_fn(
                width,
                height,
                |x, y| {
                    let p = img.get_pixel(x, y);
                    let source_alpha = combine.then_some(p[3]);
                    Rgba([p[0], p[1], p[2], alpha_u8(mask.get(x, y), source_alpha)])
                },
            ))),
            DynamicImage::ImageRgb16(img) => Ok(RgbaBuffer::Rgba16(Rgba16Image::from_fn(
                width,
                height,
                |x, y| {
                    let p = img.get_pixel(x, y);
                    Rgba([p[0], p[1], p[2], alpha_u16(mask.get(x, y), None)])
                },
            ))),
            DynamicImage::ImageRgba16(img) => Ok(RgbaBuffer::Rgba16(Rgba16Image::from_fn(
                width,
                height,
                |x, y| {
                    let p = img.get_pixel(x, y);
                    let source_alpha = combine.then_some(p[3]);
                    Rgba([p[0], p[1], p[2], alpha_u16(mask.get(x, y), source_alpha)])
                },
            ))),
            other => Err(BatchError::internal(format!(
                "compositor received unnormalized pixels ({:?})",
                other.color()
            ))),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn alpha_u8(probability: f32, source_alpha: Option<u8>) -> u8 {
    let max = u32::from(u8::MAX);
    let alpha = probability_to_alpha(probability, max);
    match source_alpha {
        Some(src) => combine_alpha(alpha, u32::from(src), max) as u8,
        None => alpha as u8,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn alpha_u16(probability: f32, source_alpha: Option<u16>) -> u16 {
    let max = u32::from(u16::MAX);
    let alpha = probability_to_alpha(probability, max);
    match source_alpha {
        Some(src) => combine_alpha(alpha, u32::from(src), max) as u16,
        None => alpha as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BitDepth;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn decoded(pixels: DynamicImage) -> DecodedImage {
        DecodedImage::new(pixels, None, None, None).unwrap()
    }

    #[test]
    fn test_probability_to_alpha() {
        assert_eq!(probability_to_alpha(0.0, 255), 0);
        assert_eq!(probability_to_alpha(1.0, 255), 255);
        assert_eq!(probability_to_alpha(0.5, 255), 128);
        assert_eq!(probability_to_alpha(1.0, 65535), 65535);
        assert_eq!(probability_to_alpha(2.0, 255), 255);
        assert_eq!(probability_to_alpha(-1.0, 255), 0);
        assert_eq!(probability_to_alpha(f32::NAN, 255), 0);
    }

    #[test]
    fn test_combine_alpha() {
        assert_eq!(combine_alpha(255, 255, 255), 255);
        assert_eq!(combine_alpha(255, 0, 255), 0);
        assert_eq!(combine_alpha(128, 128, 255), 64);
        assert_eq!(combine_alpha(65535, 32768, 65535), 32768);
    }

    #[test]
    fn test_compose_rgb8_copies_color() {
        let img = RgbImage::from_fn(4, 2, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]));
        let mask = Mask::from_fn(4, 2, |x, _| if x < 2 { 0.0 } else { 1.0 }).unwrap();

        let out = Compositor::default().compose(&decoded(DynamicImage::ImageRgb8(img.clone())), &mask).unwrap();
        assert_eq!(out.bit_depth(), BitDepth::Eight);
        let RgbaBuffer::Rgba8(rgba) = out else {
            panic!("expected 8-bit output");
        };
        for (x, y, p) in rgba.enumerate_pixels() {
            let src = img.get_pixel(x, y);
            assert_eq!(&p.0[..3], &src.0[..]);
            assert_eq!(p[3], if x < 2 { 0 } else { 255 });
        }
    }

    #[test]
    fn test_compose_rgb16_full_range_alpha() {
        let img: ImageBuffer<Rgb<u16>, Vec<u16>> =
            ImageBuffer::from_fn(3, 3, |x, _| Rgb([x as u16 * 20000, 1, 65535]));
        let mask = Mask::from_fn(3, 3, |x, _| x as f32 / 2.0).unwrap();

        let out = Compositor::default()
            .compose(&decoded(DynamicImage::ImageRgb16(img)), &mask)
            .unwrap();
        assert_eq!(out.bit_depth(), BitDepth::Sixteen);
        assert_eq!(out.alpha_at(0, 0), Some(0));
        assert_eq!(out.alpha_at(1, 0), Some(32768));
        assert_eq!(out.alpha_at(2, 0), Some(65535));
        let RgbaBuffer::Rgba16(rgba) = out else {
            panic!("expected 16-bit output");
        };
        assert_eq!(rgba.get_pixel(1, 1).0, [20000, 1, 65535, 32768]);
    }

    #[test]
    fn test_source_alpha_is_combined() {
        let img = RgbaImage::from_fn(2, 1, |x, _| Rgba([9, 9, 9, if x == 0 { 0 } else { 128 }]));
        let mask = Mask::from_fn(2, 1, |_, _| 1.0).unwrap();
        let image = decoded(DynamicImage::ImageRgba8(img));

        let combined = Compositor::new(true).compose(&image, &mask).unwrap();
        assert_eq!(combined.alpha_at(0, 0), Some(0));
        assert_eq!(combined.alpha_at(1, 0), Some(128));

        let replaced = Compositor::new(false).compose(&image, &mask).unwrap();
        assert_eq!(replaced.alpha_at(0, 0), Some(255));
        assert_eq!(replaced.alpha_at(1, 0), Some(255));
    }

    #[test]
    fn test_mismatched_mask_is_resampled() {
        let img = RgbImage::from_pixel(40, 30, Rgb([1, 2, 3]));
        let mask = Mask::from_fn(4, 3, |_, _| 1.0).unwrap();

        let out = Compositor::default()
            .compose(&decoded(DynamicImage::ImageRgb8(img)), &mask)
            .unwrap();
        assert_eq!(out.dimensions(), (40, 30));
        assert_eq!(out.alpha_at(39, 29), Some(255));
    }

    #[test]
    fn test_grayscale_is_widened() {
        let gray = image::GrayImage::from_pixel(2, 2, image::Luma([77]));
        let mask = Mask::from_fn(2, 2, |_, _| 0.25).unwrap();
        let out = Compositor::default()
            .compose(&decoded(DynamicImage::ImageLuma8(gray)), &mask)
            .unwrap();
        let RgbaBuffer::Rgba8(rgba) = out else {
            panic!("expected 8-bit output");
        };
        assert_eq!(rgba.get_pixel(0, 0).0, [77, 77, 77, 64]);
    }
}
