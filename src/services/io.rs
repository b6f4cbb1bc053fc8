//! Image decoding and TIFF output
//!
//! Decoding goes through the `image` crate with content-based format detection;
//! output is always a single-image RGBA TIFF written via [`super::tiff`].

use crate::{
    color_profile::ProfileExtractor,
    config::{TiffCompression, DEFAULT_MAX_DECODE_BYTES},
    error::{BatchError, Result},
    services::tiff::{self, SourceMetadata, TiffMetadata},
    types::{ColorProfile, DecodedImage, Resolution, RgbaBuffer},
};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, Limits};
use std::io::Write;
use std::path::Path;

/// Decode and encode images for the batch pipeline
pub struct ImageCodec;

impl ImageCodec {
    /// Decode an image file with its color profile and resolution
    ///
    /// The format is detected from the file content, not the extension. Grayscale
    /// sources are widened to RGB; 8 and 16-bit depth is kept. Decoder allocations
    /// are capped at [`DEFAULT_MAX_DECODE_BYTES`].
    ///
    /// # Arguments
    /// * `path` - Path to the image file
    ///
    /// # Errors
    /// - `Io` when the file cannot be read
    /// - `UnsupportedFormat` when the content is not a decodable 8 or 16-bit image
    ///
    /// # Examples
    /// ```rust,no_run
    /// use removebg_batch::services::ImageCodec;
    ///
    /// let image = ImageCodec::decode("input.tif")?;
    /// println!("{:?} at {}", image.dimensions(), image.bit_depth());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn decode<P: AsRef<Path>>(path: P) -> Result<DecodedImage> {
        Self::decode_with_limit(path, DEFAULT_MAX_DECODE_BYTES)
    }

    /// Decode an image file, refusing sources whose decoding needs more than
    /// `max_decode_bytes`
    ///
    /// The header is checked before any pixel buffer is allocated, so a file that
    /// claims absurd dimensions fails on its own instead of exhausting memory.
    ///
    /// # Errors
    /// - `Io` when the file cannot be read
    /// - `UnsupportedFormat` when the content is not decodable or exceeds the limit
    pub fn decode_with_limit<P: AsRef<Path>>(path: P, max_decode_bytes: u64) -> Result<DecodedImage> {
        let path = path.as_ref();

        let mut reader = ImageReader::open(path)
            .map_err(|e| BatchError::file_io_error("open image", path, &e))?
            .with_guessed_format()
            .map_err(|e| BatchError::file_io_error("read image header", path, &e))?;
        let mut limits = Limits::default();
        limits.max_alloc = Some(max_decode_bytes);
        reader.limits(limits);

        let format = reader.format().ok_or_else(|| {
            BatchError::unsupported_format(format!(
                "'{}': content is not a recognized image format",
                path.display()
            ))
        })?;

        let mut decoder = reader
            .into_decoder()
            .map_err(|e| with_path_context(path, e))?;
        let needed = decoder.total_bytes();
        if needed > max_decode_bytes {
            let (width, height) = decoder.dimensions();
            return Err(BatchError::unsupported_format(format!(
                "'{}': {width}x{height} image needs {needed} bytes to decode, limit is {max_decode_bytes}",
                path.display()
            )));
        }

        let decoder_profile = ProfileExtractor::from_decoder(&mut decoder, path);
        let pixels = DynamicImage::from_decoder(decoder).map_err(|e| with_path_context(path, e))?;

        let (profile, resolution) = if format == ImageFormat::Tiff {
            let metadata = Self::read_tiff_metadata(path);
            (metadata.color_profile.or(decoder_profile), metadata.resolution)
        } else {
            (decoder_profile, None)
        };

        DecodedImage::new(pixels, profile, resolution, Some(format)).map_err(|e| match e {
            BatchError::UnsupportedFormat(msg) => {
                BatchError::unsupported_format(format!("'{}': {msg}", path.display()))
            },
            other => other,
        })
    }

    fn read_tiff_metadata(path: &Path) -> SourceMetadata {
        match tiff::read_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::debug!("No usable TIFF metadata in {}: {e}", path.display());
                SourceMetadata::default()
            },
        }
    }

    /// Encode an RGBA buffer as TIFF bytes
    ///
    /// # Errors
    /// - `Internal` when the TIFF encoder fails
    pub fn encode_to_vec(
        rgba: &RgbaBuffer,
        profile: Option<&ColorProfile>,
        resolution: Option<Resolution>,
        compression: TiffCompression,
    ) -> Result<Vec<u8>> {
        tiff::encode_rgba(
            rgba,
            TiffMetadata {
                color_profile: profile,
                resolution,
            },
            compression,
        )
    }

    /// Write an RGBA buffer to `path` as TIFF
    ///
    /// Missing parent directories are created. The file is written under a
    /// temporary name in the target directory and renamed into place, so `path`
    /// never holds a partial image.
    ///
    /// # Errors
    /// - `Io` when the directory cannot be created or the file cannot be written
    pub fn encode<P: AsRef<Path>>(
        rgba: &RgbaBuffer,
        profile: Option<&ColorProfile>,
        resolution: Option<Resolution>,
        compression: TiffCompression,
        path: P,
    ) -> Result<()> {
        let path = path.as_ref();
        let bytes = Self::encode_to_vec(rgba, profile, resolution, compression)?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| BatchError::file_io_error("create output directory", parent, &e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(".removebg-")
            .suffix(".tiff.part")
            .tempfile_in(parent)
            .map_err(|e| BatchError::file_io_error("create temporary file in", parent, &e))?;
        temp.write_all(&bytes)
            .and_then(|()| temp.flush())
            .map_err(|e| BatchError::file_io_error("write", temp.path(), &e))?;
        temp.persist(path)
            .map_err(|e| BatchError::file_io_error("move output into place at", path, &e.error))?;

        log::debug!(
            "Wrote {} ({} bytes, {})",
            path.display(),
            bytes.len(),
            rgba.bit_depth()
        );
        Ok(())
    }
}

fn with_path_context(path: &Path, error: image::ImageError) -> BatchError {
    match error {
        image::ImageError::Limits(limit) => BatchError::unsupported_format(format!(
            "'{}': image exceeds decoding limits ({limit})",
            path.display()
        )),
        // Truncated or malformed streams surface as I/O errors from some decoders
        image::ImageError::IoError(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData
            ) =>
        {
            BatchError::unsupported_format(format!("'{}': {io}", path.display()))
        },
        image::ImageError::IoError(io) => BatchError::file_io_error("decode", path, &io),
        other => BatchError::unsupported_format(format!("'{}': {other}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{BitDepth, Rgba16Image, ResolutionUnit};
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn test_decode_png_rgb8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        RgbImage::from_pixel(6, 4, Rgb([10, 20, 30])).save(&path).unwrap();

        let decoded = ImageCodec::decode(&path).unwrap();
        assert_eq!(decoded.dimensions(), (6, 4));
        assert_eq!(decoded.bit_depth(), BitDepth::Eight);
        assert!(!decoded.has_alpha());
        assert_eq!(decoded.format(), Some(ImageFormat::Png));
        assert!(decoded.color_profile().is_none());
        assert!(decoded.resolution().is_none());
    }

    #[test]
    fn test_decode_detects_format_from_content() {
        let dir = tempfile::tempdir().unwrap();
        let png_path = dir.path().join("real.png");
        RgbImage::new(2, 2).save(&png_path).unwrap();
        let misnamed = dir.path().join("misnamed.jpg");
        std::fs::copy(&png_path, &misnamed).unwrap();

        let decoded = ImageCodec::decode(&misnamed).unwrap();
        assert_eq!(decoded.format(), Some(ImageFormat::Png));
    }

    #[test]
    fn test_decode_garbage_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"this is not an image").unwrap();

        let err = ImageCodec::decode(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
        assert!(err.to_string().contains("broken.png"));
    }

    fn crc32(bytes: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in bytes {
            crc ^= u32::from(byte);
            for _ in 0..8 {
                crc = if crc & 1 == 1 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            }
        }
        !crc
    }

    /// PNG whose header claims `width` x `height` RGBA16 but carries no pixel data
    fn png_header_only(width: u32, height: u32) -> Vec<u8> {
        let mut ihdr = b"IHDR".to_vec();
        ihdr.extend_from_slice(&width.to_be_bytes());
        ihdr.extend_from_slice(&height.to_be_bytes());
        ihdr.extend_from_slice(&[16, 6, 0, 0, 0]);

        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(&ihdr);
        png.extend_from_slice(&crc32(&ihdr).to_be_bytes());
        png.extend_from_slice(&0u32.to_be_bytes());
        png.extend_from_slice(b"IEND");
        png.extend_from_slice(&crc32(b"IEND").to_be_bytes());
        png
    }

    #[test]
    fn test_decode_refuses_oversized_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.png");
        std::fs::write(&path, png_header_only(65535, 65535)).unwrap();

        let err = ImageCodec::decode(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
        assert!(err.to_string().contains("huge.png"));
    }

    #[test]
    fn test_decode_with_limit_applies_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.png");
        RgbImage::new(32, 32).save(&path).unwrap();

        let err = ImageCodec::decode_with_limit(&path, 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
        assert!(ImageCodec::decode_with_limit(&path, 1 << 20).is_ok());
    }

    #[test]
    fn test_decode_tiff_keeps_realistic_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut icc: Vec<u8> = (0..3144u32).map(|i| (i % 253) as u8).collect();
        icc[..4].copy_from_slice(&3144u32.to_be_bytes());
        icc[16..20].copy_from_slice(b"RGB ");
        icc[36..40].copy_from_slice(b"acsp");
        let profile = ColorProfile::from_icc_data(icc);

        for size in [8u32, 16, 64, 128, 256] {
            let path = dir.path().join(format!("small_{size}.tif"));
            let img = RgbaImage::from_pixel(size, size, Rgba([200, 100, 50, 255]));
            ImageCodec::encode(
                &RgbaBuffer::Rgba8(img),
                Some(&profile),
                None,
                TiffCompression::None,
                &path,
            )
            .unwrap();

            let decoded = ImageCodec::decode(&path).unwrap();
            assert_eq!(
                decoded.color_profile(),
                Some(&profile),
                "profile lost on a {size}x{size} TIFF"
            );
        }
    }

    #[test]
    fn test_decode_missing_file_is_io() {
        let err = ImageCodec::decode("/no/such/file.png").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_encode_then_decode_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/out.tiff");
        let img = Rgba16Image::from_fn(8, 8, |x, y| Rgba([x as u16 * 8000, y as u16 * 8000, 0, 40000]));
        let profile = ColorProfile::from_icc_data(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let resolution = Resolution {
            x: (300, 1),
            y: (300, 1),
            unit: ResolutionUnit::Inch,
        };

        ImageCodec::encode(
            &RgbaBuffer::Rgba16(img.clone()),
            Some(&profile),
            Some(resolution),
            TiffCompression::Deflate,
            &path,
        )
        .unwrap();

        let decoded = ImageCodec::decode(&path).unwrap();
        assert_eq!(decoded.bit_depth(), BitDepth::Sixteen);
        assert!(decoded.has_alpha());
        assert_eq!(decoded.pixels().as_rgba16().unwrap(), &img);
        assert_eq!(decoded.color_profile(), Some(&profile));
        assert_eq!(decoded.resolution(), Some(resolution));
    }

    #[test]
    fn test_encode_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tiff");
        std::fs::write(&path, b"stale").unwrap();

        let img = RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 4]));
        let rgba = RgbaBuffer::Rgba8(img.clone());
        ImageCodec::encode(&rgba, None, None, TiffCompression::Lzw, &path).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let decoded = ImageCodec::decode(&path).unwrap();
        assert_eq!(decoded.pixels().to_rgba8(), img);
    }

    #[test]
    fn test_encode_to_vec_is_deterministic() {
        let rgba = RgbaBuffer::Rgba8(RgbaImage::from_fn(16, 16, |x, y| {
            Rgba([x as u8, y as u8, (x * y) as u8, 255])
        }));
        let first = ImageCodec::encode_to_vec(&rgba, None, None, TiffCompression::Deflate).unwrap();
        let second = ImageCodec::encode_to_vec(&rgba, None, None, TiffCompression::Deflate).unwrap();
        assert_eq!(first, second);
    }
}
