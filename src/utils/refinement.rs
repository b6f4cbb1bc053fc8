//! Optional mask refinement
//!
//! Post-processing turns a soft prediction into a clean binary matte: a
//! morphological opening with a 3x3 cross drops specks, a Gaussian blur with
//! sigma 2 rounds the outline and a threshold at one half binarizes it again.
//!
//! Alpha matting keeps the confident parts of the prediction and re-solves the
//! uncertain band around the outline against the image itself. The mask is split
//! into a trimap (certain foreground, certain background, unknown) by the
//! configured thresholds, the certain regions are eroded, and the unknown band is
//! recomputed with a guided filter on the image luminance so the edge snaps to
//! the image's own edges.

use crate::{
    config::MaskRefinement,
    error::{BatchError, Result},
    types::Mask,
};
use image::{ImageBuffer, Luma, RgbImage};

/// Mask values at or above this are foreground after post-processing
const POST_PROCESS_THRESHOLD: f32 = 127.0 / 255.0;

/// Blur applied between the opening and the final threshold
const POST_PROCESS_SIGMA: f32 = 2.0;

/// Half-size of the guided filter window
const MATTING_RADIUS: usize = 4;

/// Guided filter regularization; larger values smooth more across weak edges
const MATTING_EPSILON: f64 = 1e-3;

/// Run the enabled refinement steps at the resolution of `guide`
///
/// `guide` is the working image the prediction was made from. The mask is
/// resampled to it first, post-processing runs before alpha matting.
///
/// # Errors
/// - `Inference` for a zero-sized guide
pub fn refine_mask(mask: &Mask, guide: &RgbImage, refinement: MaskRefinement) -> Result<Mask> {
    let (width, height) = guide.dimensions();
    let mut mask = mask.resample(width, height)?;
    if refinement.post_process {
        mask = post_process(&mask)?;
    }
    if refinement.alpha_matting {
        mask = alpha_matte(&mask, guide, refinement)?;
    }
    Ok(mask)
}

/// Opening, blur and re-threshold into a 0/1 mask
///
/// # Errors
/// - `Internal` if the mask buffer is inconsistent
pub fn post_process(mask: &Mask) -> Result<Mask> {
    let (width, height) = mask.dimensions();
    let eroded = cross_filter(mask.data(), width, height, f32::min);
    let opened = cross_filter(&eroded, width, height, f32::max);

    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(width, height, opened)
        .ok_or_else(|| BatchError::internal("mask buffer does not match its dimensions"))?;
    let blurred = image::imageops::blur(&buffer, POST_PROCESS_SIGMA);

    let data = blurred
        .into_raw()
        .into_iter()
        .map(|v| if v < POST_PROCESS_THRESHOLD { 0.0 } else { 1.0 })
        .collect();
    Mask::new(width, height, data)
}

/// Trimap from thresholds and erosion, unknown band solved by a guided filter
///
/// # Errors
/// - `Inference` when the guide and mask sizes differ
pub fn alpha_matte(mask: &Mask, guide: &RgbImage, refinement: MaskRefinement) -> Result<Mask> {
    let (width, height) = mask.dimensions();
    if guide.dimensions() != (width, height) {
        return Err(BatchError::inference(format!(
            "matting guide is {:?}, mask is {width}x{height}",
            guide.dimensions()
        )));
    }

    let foreground_threshold = f32::from(refinement.foreground_threshold) / 255.0;
    let background_threshold = f32::from(refinement.background_threshold) / 255.0;
    let size = refinement.erode_size as usize;

    let foreground: Vec<bool> = mask.data().iter().map(|&v| v > foreground_threshold).collect();
    let background: Vec<bool> = mask.data().iter().map(|&v| v < background_threshold).collect();
    // Outside the image counts as background, never as foreground
    let foreground = erode_square(&foreground, width, height, size, false);
    let background = erode_square(&background, width, height, size, true);

    let certain = |i: usize| match (foreground.get(i), background.get(i)) {
        (Some(true), _) => Some(1.0),
        (_, Some(true)) => Some(0.0),
        _ => None,
    };

    let initial: Vec<f32> = mask
        .data()
        .iter()
        .enumerate()
        .map(|(i, &v)| certain(i).unwrap_or(v))
        .collect();
    let luminance: Vec<f32> = guide
        .pixels()
        .map(|p| {
            (0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2])) / 255.0
        })
        .collect();

    let filtered = guided_filter(&luminance, &initial, width, height, MATTING_RADIUS, MATTING_EPSILON);
    let data = filtered
        .into_iter()
        .enumerate()
        .map(|(i, q)| certain(i).unwrap_or(q))
        .collect();
    Mask::new(width, height, data)
}

/// Per-pixel min or max over the pixel and its four in-bounds neighbors
#[allow(clippy::indexing_slicing)]
// Indices stay within width * height
fn cross_filter(data: &[f32], width: u32, height: u32, pick: fn(f32, f32) -> f32) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    let mut out = data.to_vec();
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let mut v = data[i];
            if x > 0 {
                v = pick(v, data[i - 1]);
            }
            if x + 1 < w {
                v = pick(v, data[i + 1]);
            }
            if y > 0 {
                v = pick(v, data[i - w]);
            }
            if y + 1 < h {
                v = pick(v, data[i + w]);
            }
            out[i] = v;
        }
    }
    out
}

/// Binary erosion with a `size` x `size` square
///
/// `border` is the value assumed outside the image. A size of zero leaves the
/// input unchanged.
fn erode_square(data: &[bool], width: u32, height: u32, size: usize, border: bool) -> Vec<bool> {
    if size == 0 {
        return data.to_vec();
    }
    let (w, h) = (width as usize, height as usize);
    let rows = erode_lines(data, w, h, size, border, |line, pos| line * w + pos);
    erode_lines(&rows, h, w, size, border, |line, pos| pos * w + line)
}

/// One-dimensional erosion along `lines` lines of `len` pixels each
///
/// A pixel stays set when every pixel of its window is set. Counting unset
/// pixels in a prefix sum makes each pass independent of the window size.
#[allow(clippy::indexing_slicing)]
// `index` maps (line, pos) inside the lines * len buffer
fn erode_lines<F: Fn(usize, usize) -> usize>(
    data: &[bool],
    len: usize,
    lines: usize,
    size: usize,
    border: bool,
    index: F,
) -> Vec<bool> {
    let before = size / 2;
    let mut out = vec![false; data.len()];
    let mut unset = vec![0usize; len + 1];
    for line in 0..lines {
        for pos in 0..len {
            unset[pos + 1] = unset[pos] + usize::from(!data[index(line, pos)]);
        }
        for pos in 0..len {
            let start = pos as isize - before as isize;
            let end = start + size as isize;
            let clipped = start < 0 || end > len as isize;
            if clipped && !border {
                continue;
            }
            let start = start.max(0) as usize;
            let end = (end as usize).min(len);
            out[index(line, pos)] = unset[end] == unset[start];
        }
    }
    out
}

/// Box mean over a `(2 * radius + 1)` square window clipped to the image
#[allow(clippy::indexing_slicing)]
// Table is (w + 1) x (h + 1); window bounds are clamped to it
fn box_mean(data: &[f64], w: usize, h: usize, radius: usize) -> Vec<f64> {
    let stride = w + 1;
    let mut table = vec![0.0f64; stride * (h + 1)];
    for y in 0..h {
        let mut row = 0.0;
        for x in 0..w {
            row += data[y * w + x];
            table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row;
        }
    }

    let mut out = Vec::with_capacity(w * h);
    for y in 0..h {
        let (y0, y1) = (y.saturating_sub(radius), (y + radius + 1).min(h));
        for x in 0..w {
            let (x0, x1) = (x.saturating_sub(radius), (x + radius + 1).min(w));
            let sum = table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
                + table[y0 * stride + x0];
            out.push(sum / ((y1 - y0) * (x1 - x0)) as f64);
        }
    }
    out
}

/// Gray-guide guided filter of `input`
fn guided_filter(
    guide: &[f32],
    input: &[f32],
    width: u32,
    height: u32,
    radius: usize,
    epsilon: f64,
) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    let guide: Vec<f64> = guide.iter().map(|&v| f64::from(v)).collect();
    let input: Vec<f64> = input.iter().map(|&v| f64::from(v)).collect();
    let product = |a: &[f64], b: &[f64]| -> Vec<f64> { a.iter().zip(b).map(|(x, y)| x * y).collect() };

    let mean_guide = box_mean(&guide, w, h, radius);
    let mean_input = box_mean(&input, w, h, radius);
    let corr_guide = box_mean(&product(&guide, &guide), w, h, radius);
    let corr_cross = box_mean(&product(&guide, &input), w, h, radius);

    let (scale, offset): (Vec<f64>, Vec<f64>) = mean_guide
        .iter()
        .zip(&mean_input)
        .zip(corr_guide.iter().zip(&corr_cross))
        .map(|((&mg, &mi), (&cg, &cc))| {
            let variance = cg - mg * mg;
            let covariance = cc - mg * mi;
            let a = covariance / (variance + epsilon);
            (a, mi - a * mg)
        })
        .unzip();

    let mean_scale = box_mean(&scale, w, h, radius);
    let mean_offset = box_mean(&offset, w, h, radius);
    guide
        .iter()
        .zip(mean_scale.iter().zip(&mean_offset))
        .map(|(&g, (&a, &b))| (a * g + b) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn square_with_speck() -> Mask {
        Mask::from_fn(32, 32, |x, y| {
            let in_square = (10..22).contains(&x) && (10..22).contains(&y);
            if in_square || (x, y) == (3, 3) {
                1.0
            } else {
                0.0
            }
        })
        .unwrap()
    }

    /// White left half, black right half
    fn split_guide(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    /// Certain foreground on the left, a linear ramp down to background across the middle
    fn ramp_mask(width: u32, height: u32) -> Mask {
        Mask::from_fn(width, height, |x, _| (1.0 - (x as f32 - 8.0) / 16.0).clamp(0.0, 1.0)).unwrap()
    }

    #[test]
    fn test_post_process_drops_specks_and_binarizes() {
        let refined = post_process(&square_with_speck()).unwrap();

        assert_eq!(refined.get(3, 3), 0.0);
        assert_eq!(refined.get(16, 16), 1.0);
        assert_eq!(refined.get(0, 31), 0.0);
        assert!(refined.data().iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn test_erode_square_border_handling() {
        let all = vec![true; 16];
        let inside = erode_square(&all, 4, 4, 3, false);
        assert_eq!(inside.iter().filter(|&&v| v).count(), 4);
        assert!(erode_square(&all, 4, 4, 3, true).iter().all(|&v| v));
        assert_eq!(erode_square(&all, 4, 4, 0, false), all);
    }

    #[test]
    fn test_box_mean_matches_direct_average() {
        let data: Vec<f64> = (0..20).map(f64::from).collect();
        let mean = box_mean(&data, 5, 4, 1);
        // Corner (0, 0) averages the 2x2 block 0, 1, 5, 6
        assert!((mean[0] - 3.0).abs() < 1e-9);
        // Interior (2, 1) averages rows 0..3, columns 1..4
        let expected = [1.0, 2.0, 3.0, 6.0, 7.0, 8.0, 11.0, 12.0, 13.0].iter().sum::<f64>() / 9.0;
        assert!((mean[7] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_matte_snaps_band_to_image_edge() {
        let mask = ramp_mask(32, 8);
        let guide = split_guide(32, 8);
        let refinement = MaskRefinement {
            alpha_matting: true,
            erode_size: 2,
            ..MaskRefinement::default()
        };
        let matte = alpha_matte(&mask, &guide, refinement).unwrap();

        // Certain regions are kept exactly
        assert_eq!(matte.get(2, 4), 1.0);
        assert_eq!(matte.get(30, 4), 0.0);
        // Inside the band the guide's edge sharpens the transition
        assert!(matte.get(14, 4) > mask.get(14, 4));
        assert!(matte.get(18, 4) < mask.get(18, 4));
        let step = matte.get(15, 4) - matte.get(16, 4);
        let original_step = mask.get(15, 4) - mask.get(16, 4);
        assert!(step > original_step + 0.2, "step {step} vs {original_step}");
        assert!(matte.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_alpha_matte_rejects_mismatched_guide() {
        let err = alpha_matte(&ramp_mask(32, 8), &split_guide(16, 8), MaskRefinement::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Inference);
    }

    #[test]
    fn test_refine_mask_resamples_to_guide() {
        let refinement = MaskRefinement {
            post_process: true,
            ..MaskRefinement::default()
        };
        let refined = refine_mask(&square_with_speck(), &split_guide(64, 64), refinement).unwrap();
        assert_eq!(refined.dimensions(), (64, 64));
        assert_eq!(refined.get(32, 32), 1.0);
        assert_eq!(refined.get(2, 60), 0.0);
    }
}
