//! Decode, downscale and re-encode image payloads.
//!
//! Everything here is synchronous and CPU-bound. Callers on the request path
//! go through [`crate::offload::OffloadPool`] instead of calling [`transcode`]
//! directly.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use crate::error::{RelayError, Result};

pub const OUTPUT_MEDIA_TYPE: &str = "image/jpeg";

/// Decodes `raw`, shrinks it to fit inside `max_dimension` on both axes and
/// re-encodes it as JPEG at `quality` (clamped to 1..=100).
///
/// Images already within the bound keep their size. Transparent and palette
/// images are flattened onto white first, since JPEG has no alpha channel.
pub fn transcode(raw: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(raw).map_err(|e| RelayError::Decode(e.to_string()))?;
    let (src_width, src_height) = decoded.dimensions();

    let resized = shrink_to_fit(decoded, max_dimension.max(1));
    let rgb = flatten_onto_white(resized);

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .map_err(|e| RelayError::Encode(e.to_string()))?;

    log::debug!(
        "transcoded {}x{} ({} bytes) -> {}x{} ({} bytes)",
        src_width,
        src_height,
        raw.len(),
        rgb.width(),
        rgb.height(),
        out.len()
    );
    Ok(out)
}

fn shrink_to_fit(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_dimension && height <= max_dimension {
        return image;
    }
    image.resize(max_dimension, max_dimension, FilterType::Triangle)
}

fn flatten_onto_white(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let [r, g, b, a] = px.0;
        let alpha = a as u16;
        let blend = |c: u8| ((c as u16 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}
