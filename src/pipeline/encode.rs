//! Image validation and encoding: fetched bytes → `data:` URI.
//!
//! Relays are unreliable: they return HTML error pages with a 200, truncated
//! bodies, or the original server's SVG. A body is accepted only when its
//! magic bytes name a raster format and the `image` crate can read its
//! dimensions. The `Content-Type` header is not trusted.

use crate::error::ImageError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::debug;

/// Raster formats accepted from the network.
const ACCEPTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Ico,
];

/// A fetched body that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedImage {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Check that `bytes` fetched from `url` are a usable raster image.
pub fn validate(url: &str, bytes: &[u8], max_bytes: usize) -> Result<ValidatedImage, ImageError> {
    if bytes.len() > max_bytes {
        return Err(ImageError::TooLarge {
            url: url.to_string(),
            size: bytes.len(),
            limit: max_bytes,
        });
    }
    let not_an_image = || ImageError::NotAnImage {
        url: url.to_string(),
    };

    let format = image::guess_format(bytes).map_err(|_| not_an_image())?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(not_an_image());
    }
    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|_| not_an_image())?;
    if width == 0 || height == 0 {
        return Err(not_an_image());
    }

    Ok(ValidatedImage {
        format,
        width,
        height,
    })
}

/// Encode validated bytes as a `data:<mime>;base64,…` URI.
pub fn to_data_uri(bytes: &[u8], format: ImageFormat) -> String {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    format!("data:{};base64,{}", format.to_mime_type(), b64)
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    use image::{DynamicImage, Rgba, RgbaImage};
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 255])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode should succeed");
    buf
}
