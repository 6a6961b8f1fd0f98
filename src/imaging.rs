//! Screenshot decoding and normalization before inference
//!
//! Accepts PNG or JPEG, downscales anything over the configured dimension and
//! always hands PNG to the inference client.

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, codecs::png::PngEncoder};

use crate::error::StageError;
use crate::models::ImageMeta;

/// Side lengths tried, in order, when a re-encoded screenshot is over budget
const STEP_DOWN_SIDES: [u32; 3] = [400, 300, 200];

#[derive(Debug, Clone, Copy)]
pub struct ImageLimits {
    /// Limit on the submitted base64 payload
    pub max_encoded_bytes: usize,
    pub max_dimension: u32,
    /// Budget for the PNG handed to inference
    pub target_bytes: usize,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_encoded_bytes: 262_144,
            max_dimension: 500,
            target_bytes: 250_000,
        }
    }
}

/// Screenshot ready to be sent to inference
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub meta: ImageMeta,
    pub png_base64: String,
}

/// Decode base64 image data, tolerating a `data:image/...;base64,` prefix and line breaks
pub fn decode_base64(data: &str) -> Result<Vec<u8>, StageError> {
    let payload = match data.split_once(";base64,") {
        Some((header, rest)) if header.starts_with("data:") => rest,
        _ => data,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| StageError::invalid_input(format!("image_data is not valid base64: {e}")))
}

fn sniff_format(bytes: &[u8]) -> Result<ImageFormat, StageError> {
    let format = image::guess_format(bytes)
        .map_err(|_| StageError::invalid_input("image_data is not a recognized image"))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(StageError::invalid_input(format!(
            "unsupported image format {:?}; expected PNG or JPEG",
            format
        )));
    }
    Ok(format)
}

/// Admission check: base64 decodes and the header is PNG or JPEG. Pixels are not decoded.
pub fn validate_image(image_data: &str) -> Result<ImageFormat, StageError> {
    sniff_format(&decode_base64(image_data)?)
}

pub fn prepare(image_data: &str, limits: &ImageLimits) -> Result<PreparedImage, StageError> {
    if image_data.len() > limits.max_encoded_bytes {
        return Err(StageError::invalid_input(format!(
            "Image too large ({} bytes). Maximum allowed is {} bytes.",
            image_data.len(),
            limits.max_encoded_bytes
        )));
    }

    let bytes = decode_base64(image_data)?;
    let format = sniff_format(&bytes)?;
    let img = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| StageError::invalid_input(format!("image could not be decoded: {e}")))?;

    let oversized = img.width() > limits.max_dimension || img.height() > limits.max_dimension;
    if format == ImageFormat::Png && !oversized && bytes.len() <= limits.target_bytes {
        return Ok(PreparedImage {
            meta: ImageMeta {
                format: "png".to_string(),
                width: img.width(),
                height: img.height(),
                bytes: bytes.len(),
                resized: false,
            },
            png_base64: STANDARD.encode(&bytes),
        });
    }

    let (width, height) = (img.width(), img.height());
    let mut img = auto_crop(img);
    if img.width() > limits.max_dimension || img.height() > limits.max_dimension {
        img = img.thumbnail(limits.max_dimension, limits.max_dimension);
    }
    let mut png = encode_png(&img)?;

    if png.len() > limits.target_bytes {
        tracing::debug!(
            "Screenshot is {} bytes after re-encode, stepping down (budget {})",
            png.len(),
            limits.target_bytes
        );
        let (stepped, stepped_png) = step_down(&img, limits.target_bytes)?;
        img = stepped;
        png = stepped_png;
    }

    let resized = (img.width(), img.height()) != (width, height);
    if resized {
        tracing::debug!(
            "Screenshot {}x{} -> {}x{} ({} bytes)",
            width,
            height,
            img.width(),
            img.height(),
            png.len()
        );
    }

    Ok(PreparedImage {
        meta: ImageMeta {
            format: "png".to_string(),
            width: img.width(),
            height: img.height(),
            bytes: png.len(),
            resized,
        },
        png_base64: STANDARD.encode(&png),
    })
}

/// Shrink through `STEP_DOWN_SIDES`, then fall back to grayscale at the smallest side
fn step_down(img: &DynamicImage, budget: usize) -> Result<(DynamicImage, Vec<u8>), StageError> {
    let longest = img.width().max(img.height());
    let mut smallest = img.clone();
    for side in STEP_DOWN_SIDES.into_iter().filter(|side| *side < longest) {
        let candidate = img.thumbnail(side, side);
        let png = encode_png(&candidate)?;
        if png.len() <= budget {
            return Ok((candidate, png));
        }
        smallest = candidate;
    }

    let gray = DynamicImage::ImageLuma8(smallest.to_luma8());
    let png = encode_png(&gray)?;
    if png.len() > budget {
        return Err(StageError::invalid_input(format!(
            "Image could not be compressed below {budget} bytes"
        )));
    }
    Ok((gray, png))
}

/// Crop to the bounding box of pixels that are neither transparent nor pure black
fn auto_crop(img: DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        if a == 0 || (r | g | b) == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    match bounds {
        Some((x0, y0, x1, y1)) if (x1 - x0 + 1, y1 - y0 + 1) != (img.width(), img.height()) => {
            img.crop_imm(x0, y0, x1 - x0 + 1, y1 - y0 + 1)
        }
        _ => img,
    }
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, StageError> {
    let mut buffer = Vec::new();
    let encoder = PngEncoder::new(&mut buffer);
    let result = match img {
        DynamicImage::ImageLuma8(gray) => encoder.write_image(
            gray.as_raw(),
            gray.width(),
            gray.height(),
            ExtendedColorType::L8,
        ),
        other => {
            let rgba = other.to_rgba8();
            encoder.write_image(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                ExtendedColorType::Rgba8,
            )
        }
    };
    result.map_err(|e| StageError::analysis(format!("failed to re-encode screenshot: {e}")))?;
    Ok(buffer)
}
