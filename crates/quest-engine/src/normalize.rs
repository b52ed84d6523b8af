use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

pub const MAX_DIMENSION: u32 = 1024;
pub const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub base64: String,
}

impl NormalizedImage {
    pub fn data_url(&self) -> String {
        jpeg_data_url(&self.base64)
    }
}

pub fn jpeg_data_url(base64_jpeg: &str) -> String {
    format!("data:image/jpeg;base64,{base64_jpeg}")
}

/// Decode, shrink to fit `MAX_DIMENSION` (never enlarge), re-encode as JPEG.
pub fn normalize(raw: &[u8]) -> Result<NormalizedImage> {
    let decoded = image::load_from_memory(raw).context("screenshot decode failed")?;
    let flattened = flatten_onto_white(&decoded);
    let fitted = if flattened.width() > MAX_DIMENSION || flattened.height() > MAX_DIMENSION {
        DynamicImage::ImageRgb8(flattened)
            .resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3)
            .to_rgb8()
    } else {
        flattened
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&fitted)
        .context("screenshot JPEG encode failed")?;
    let base64 = BASE64.encode(&jpeg);
    Ok(NormalizedImage {
        width: fitted.width(),
        height: fitted.height(),
        jpeg,
        base64,
    })
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}
