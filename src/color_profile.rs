//! ICC color profile extraction

use crate::{
    error::{BatchError, Result},
    types::ColorProfile,
};
use image::{ImageDecoder, ImageReader};
use std::path::Path;

/// Pulls embedded ICC profiles out of decoders and files
pub struct ProfileExtractor;

impl ProfileExtractor {
    /// Take the ICC profile from an open decoder, if it carries one
    ///
    /// A decoder that fails to read its profile is treated as having none; the
    /// pixels are still usable.
    pub fn from_decoder<D: ImageDecoder>(decoder: &mut D, path: &Path) -> Option<ColorProfile> {
        match decoder.icc_profile() {
            Ok(Some(icc)) if !icc.is_empty() => {
                let profile = ColorProfile::from_icc_data(icc);
                log::debug!(
                    "ICC profile in {}: {} bytes, color space {}",
                    path.display(),
                    profile.len(),
                    profile.color_space().unwrap_or("unknown")
                );
                Some(profile)
            },
            Ok(_) => None,
            Err(e) => {
                log::warn!("Ignoring unreadable ICC profile in {}: {e}", path.display());
                None
            },
        }
    }

    /// Extract the ICC profile from an image file without decoding its pixels
    ///
    /// # Errors
    /// - `Io` when the file cannot be opened
    /// - `UnsupportedFormat` when the format is not recognized
    pub fn extract_from_image(path: &Path) -> Result<Option<ColorProfile>> {
        let reader = ImageReader::open(path)
            .map_err(|e| BatchError::file_io_error("open image", path, &e))?
            .with_guessed_format()
            .map_err(|e| BatchError::file_io_error("read image header", path, &e))?;
        let mut decoder = reader.into_decoder()?;
        Ok(Self::from_decoder(&mut decoder, path))
    }
}
