//! TIFF encoding with alpha, ICC profile and resolution tags
//!
//! The `image` crate's TIFF encoder cannot attach metadata, so output is written
//! through the `tiff` crate directly.

use crate::{
    config::TiffCompression,
    error::{BatchError, Result},
    types::{ColorProfile, Resolution, ResolutionUnit, RgbaBuffer},
};
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{ifd::Value, Decoder, Limits};
use tiff::encoder::{
    colortype::{self, ColorType},
    compression::{Compression, Deflate, Lzw, Uncompressed},
    Rational, TiffEncoder, TiffValue,
};
use tiff::tags::{ResolutionUnit as TiffResolutionUnit, Tag, Type};

/// `InterColorProfile` (34675), not named by the `tiff` crate
const TAG_ICC_PROFILE: Tag = Tag::Unknown(34675);

/// `ExtraSamples` value for straight (unassociated) alpha
const EXTRA_SAMPLES_UNASSOCIATED_ALPHA: u16 = 2;

/// Metadata carried from the source into the output file
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffMetadata<'a> {
    pub color_profile: Option<&'a ColorProfile>,
    pub resolution: Option<Resolution>,
}

/// Metadata read back from a source TIFF
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    pub color_profile: Option<ColorProfile>,
    pub resolution: Option<Resolution>,
}

/// Largest ICC profile accepted from a source file
const MAX_ICC_PROFILE_BYTES: usize = 64 * 1024 * 1024;

/// Raw bytes written with the TIFF `UNDEFINED` field type
struct UndefinedBytes<'a>(&'a [u8]);

impl TiffValue for UndefinedBytes<'_> {
    const BYTE_LEN: u8 = 1;
    const FIELD_TYPE: Type = Type::UNDEFINED;

    fn count(&self) -> usize {
        self.0.len()
    }

    fn data(&self) -> std::borrow::Cow<'_, [u8]> {
        std::borrow::Cow::Borrowed(self.0)
    }
}

/// Encode an RGBA buffer as a single-image TIFF into memory
///
/// # Errors
/// - `Internal` when the TIFF encoder rejects the image
pub fn encode_rgba(
    rgba: &RgbaBuffer,
    metadata: TiffMetadata<'_>,
    compression: TiffCompression,
) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    let (width, height) = rgba.dimensions();
    match rgba {
        RgbaBuffer::Rgba8(img) => write_with_compression::<_, colortype::RGBA8>(
            &mut cursor,
            width,
            height,
            img.as_raw(),
            metadata,
            compression,
        )?,
        RgbaBuffer::Rgba16(img) => write_with_compression::<_, colortype::RGBA16>(
            &mut cursor,
            width,
            height,
            img.as_raw(),
            metadata,
            compression,
        )?,
    }
    Ok(cursor.into_inner())
}

fn write_with_compression<W, C>(
    writer: W,
    width: u32,
    height: u32,
    data: &[C::Inner],
    metadata: TiffMetadata<'_>,
    compression: TiffCompression,
) -> Result<()>
where
    W: Write + Seek,
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let mut encoder = TiffEncoder::new(writer).map_err(encode_error)?;
    match compression {
        TiffCompression::None => {
            write_image::<W, C, _>(&mut encoder, width, height, data, metadata, Uncompressed)
        },
        TiffCompression::Deflate => write_image::<W, C, _>(
            &mut encoder,
            width,
            height,
            data,
            metadata,
            Deflate::default(),
        ),
        TiffCompression::Lzw => {
            write_image::<W, C, _>(&mut encoder, width, height, data, metadata, Lzw::default())
        },
    }
}

fn write_image<W, C, D>(
    encoder: &mut TiffEncoder<W>,
    width: u32,
    height: u32,
    data: &[C::Inner],
    metadata: TiffMetadata<'_>,
    compression: D,
) -> Result<()>
where
    W: Write + Seek,
    C: ColorType,
    D: Compression,
    [C::Inner]: TiffValue,
{
    let mut image = encoder
        .new_image_with_compression::<C, D>(width, height, compression)
        .map_err(encode_error)?;

    image
        .encoder()
        .write_tag(Tag::ExtraSamples, EXTRA_SAMPLES_UNASSOCIATED_ALPHA)
        .map_err(encode_error)?;

    if let Some(profile) = metadata.color_profile.filter(|p| !p.is_empty()) {
        image
            .encoder()
            .write_tag(TAG_ICC_PROFILE, UndefinedBytes(profile.as_bytes()))
            .map_err(encode_error)?;
    }

    if let Some(resolution) = metadata.resolution {
        image.resolution_unit(to_tiff_unit(resolution.unit));
        image.x_resolution(Rational {
            n: resolution.x.0,
            d: resolution.x.1,
        });
        image.y_resolution(Rational {
            n: resolution.y.0,
            d: resolution.y.1,
        });
    }

    image.write_data(data).map_err(encode_error)
}

fn encode_error(error: tiff::TiffError) -> BatchError {
    match error {
        tiff::TiffError::IoError(io) => BatchError::Io(io),
        other => BatchError::internal(format!("TIFF encoding failed: {other}")),
    }
}

fn to_tiff_unit(unit: ResolutionUnit) -> TiffResolutionUnit {
    match unit {
        ResolutionUnit::None => TiffResolutionUnit::None,
        ResolutionUnit::Inch => TiffResolutionUnit::Inch,
        ResolutionUnit::Centimeter => TiffResolutionUnit::Centimeter,
    }
}

fn from_tiff_unit(unit: TiffResolutionUnit) -> ResolutionUnit {
    match unit {
        TiffResolutionUnit::Inch => ResolutionUnit::Inch,
        TiffResolutionUnit::Centimeter => ResolutionUnit::Centimeter,
        _ => ResolutionUnit::None,
    }
}

/// Read the ICC profile and resolution of the first image in a TIFF file
///
/// Tags are read straight from the IFD, so the profile comes back byte for byte
/// whatever the image size. Resolution is `None` when either axis is missing or
/// has a zero denominator.
///
/// # Errors
/// - `Io` when the file cannot be opened
/// - `UnsupportedFormat` when it is not a readable TIFF
pub fn read_metadata(path: &Path) -> Result<SourceMetadata> {
    let file = std::fs::File::open(path)
        .map_err(|e| BatchError::file_io_error("open TIFF", path, &e))?;
    let mut limits = Limits::default();
    limits.ifd_value_size = MAX_ICC_PROFILE_BYTES;
    let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(limits);

    let color_profile = icc_from_decoder(&mut decoder)?;
    if let Some(profile) = &color_profile {
        log::debug!(
            "ICC profile in {}: {} bytes, color space {}",
            path.display(),
            profile.len(),
            profile.color_space().unwrap_or("unknown")
        );
    }
    Ok(SourceMetadata {
        color_profile,
        resolution: resolution_from_decoder(&mut decoder)?,
    })
}

fn icc_from_decoder<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<ColorProfile>> {
    let Some(value) = decoder.find_tag(TAG_ICC_PROFILE)? else {
        return Ok(None);
    };
    let icc = value.into_u8_vec()?;
    Ok((!icc.is_empty()).then(|| ColorProfile::from_icc_data(icc)))
}

fn resolution_from_decoder<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<Resolution>> {
    let x = rational_tag(decoder, Tag::XResolution)?;
    let y = rational_tag(decoder, Tag::YResolution)?;
    let unit = decoder
        .find_tag_unsigned::<u16>(Tag::ResolutionUnit)?
        .and_then(TiffResolutionUnit::from_u16)
        // TIFF default when the tag is absent
        .unwrap_or(TiffResolutionUnit::Inch);

    Ok(match (x, y) {
        (Some(x), Some(y)) => Some(Resolution {
            x,
            y,
            unit: from_tiff_unit(unit),
        }),
        _ => None,
    })
}

fn rational_tag<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<(u32, u32)>> {
    Ok(match decoder.find_tag(tag)? {
        Some(Value::Rational(n, d)) if d != 0 => Some((n, d)),
        _ => None,
    })
}
