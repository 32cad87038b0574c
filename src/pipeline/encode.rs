//! Image normalisation: page bytes → base64 `ImageData` for the provider.
//!
//! Pages arrive from an external rasteriser or scanner in whatever format it
//! produced. Supported formats are passed through untouched when they already
//! fit within `max_image_pixels`; larger pages are downscaled and re-encoded
//! as PNG, which keeps printed question labels crisp.

use crate::error::ExtractError;
use crate::pipeline::input::PageImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Mime type for a supported page format.
fn mime_for(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

/// Validate, optionally downscale, and base64-encode one page.
pub fn encode_page(page: &PageImage, max_pixels: u32) -> Result<ImageData, ExtractError> {
    let format = image::guess_format(&page.bytes).map_err(|_| ExtractError::NotAnImage {
        source_name: page.source.clone(),
    })?;
    let mime = mime_for(format).ok_or_else(|| ExtractError::NotAnImage {
        source_name: page.source.clone(),
    })?;

    let img = image::load_from_memory_with_format(&page.bytes, format).map_err(|e| {
        ExtractError::ImageDecodeFailed {
            source_name: page.source.clone(),
            detail: e.to_string(),
        }
    })?;

    if img.width().max(img.height()) <= max_pixels {
        let b64 = STANDARD.encode(&page.bytes);
        debug!("{}: {}x{} {} passed through", page.source, img.width(), img.height(), mime);
        return Ok(ImageData::new(b64, mime).with_detail("high"));
    }

    let scaled = img.resize(max_pixels, max_pixels, FilterType::Lanczos3);
    debug!(
        "{}: downscaled {}x{} → {}x{}",
        page.source,
        img.width(),
        img.height(),
        scaled.width(),
        scaled.height()
    );
    let b64 = encode_png(&scaled).map_err(|e| ExtractError::ImageDecodeFailed {
        source_name: page.source.clone(),
        detail: e.to_string(),
    })?;
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

fn encode_png(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(STANDARD.encode(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn small_png_passes_through() {
        let bytes = png(10, 10);
        let data = encode_page(&PageImage::new("p.png", bytes.clone()), 2000).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&data.data).expect("valid base64"), bytes);
    }

    #[test]
    fn large_page_is_downscaled() {
        let data = encode_page(&PageImage::new("big.png", png(400, 200)), 100).unwrap();
        let decoded = STANDARD.decode(&data.data).unwrap();
        let img = image::load_from_memory(&decoded).unwrap();
        assert_eq!((img.width(), img.height()), (100, 50));
    }

    #[test]
    fn non_image_is_rejected() {
        let err = encode_page(&PageImage::new("notes.txt", b"hello world".to_vec()), 2000).unwrap_err();
        assert!(matches!(err, ExtractError::NotAnImage { .. }));
    }
}
