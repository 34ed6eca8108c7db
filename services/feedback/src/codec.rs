//! Image decoding, thumbnailing and re-encoding.
//!
//! Everything here is a pure, CPU-bound transform. Callers on the async
//! runtime should run these functions inside `tokio::task::spawn_blocking`.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;

/// Errors that can occur while decoding or encoding images.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image encoding failed: {0}")]
    Encode(String),
}

/// Output format for [`encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeFormat {
    Jpeg { quality: u8 },
    Png,
}

impl EncodeFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            EncodeFormat::Jpeg { .. } => "image/jpeg",
            EncodeFormat::Png => "image/png",
        }
    }
}

/// A decoded raster image.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    image: DynamicImage,
    source_format: Option<ImageFormat>,
}

impl DecodedImage {
    /// Wrap an in-memory image.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self {
            image,
            source_format: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Format the bytes were decoded from, if known
    pub fn source_format(&self) -> Option<ImageFormat> {
        self.source_format
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.image
    }
}

/// Decode raw bytes into a raster image, upright per its EXIF orientation.
pub fn decode(raw: &[u8]) -> Result<DecodedImage, CodecError> {
    let source_format = image::guess_format(raw)
        .map_err(|e| CodecError::UnsupportedFormat(e.to_string()))?;

    let mut decoder = ImageReader::with_format(Cursor::new(raw), source_format)
        .into_decoder()
        .map_err(|e| CodecError::UnsupportedFormat(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);

    let mut image = DynamicImage::from_decoder(decoder)
        .map_err(|e| CodecError::UnsupportedFormat(e.to_string()))?;
    image.apply_orientation(orientation);

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CodecError::UnsupportedFormat(format!(
            "Degenerate image dimensions {}x{}",
            width, height
        )));
    }

    Ok(DecodedImage {
        image,
        source_format: Some(source_format),
    })
}

/// Scale `width`x`height` so the longer edge equals `target_long_edge`.
///
/// Dimensions already within the bound are returned unchanged.
pub fn fit_within(width: u32, height: u32, target_long_edge: u32) -> (u32, u32) {
    let long_edge = width.max(height);
    if long_edge <= target_long_edge {
        return (width, height);
    }

    let scale = |short: u32| -> u32 {
        let scaled = (short as u64 * target_long_edge as u64 + long_edge as u64 / 2)
            / long_edge as u64;
        (scaled as u32).max(1)
    };

    if width >= height {
        (target_long_edge, scale(height))
    } else {
        (scale(width), target_long_edge)
    }
}

/// Produce a proportionally scaled copy whose longer edge does not exceed
/// `target_long_edge`. The image is never cropped.
pub fn thumbnail(image: &DecodedImage, target_long_edge: u32) -> DecodedImage {
    let (width, height) = fit_within(image.width(), image.height(), target_long_edge);
    if (width, height) == (image.width(), image.height()) {
        return image.clone();
    }

    DecodedImage {
        image: image.image.resize_exact(width, height, FilterType::Lanczos3),
        source_format: image.source_format,
    }
}

/// Encode an image. Output is byte-identical for identical input.
pub fn encode(image: &DecodedImage, format: EncodeFormat) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();

    match format {
        EncodeFormat::Jpeg { quality } => {
            // JPEG has no alpha channel
            let rgb = image.image.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
            encoder
                .encode_image(&rgb)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        EncodeFormat::Png => {
            image
                .image
                .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }
    }

    Ok(buffer)
}
