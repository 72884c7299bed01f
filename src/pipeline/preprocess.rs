//! Document preprocessing: PDF pages become normalised JPEG buffers,
//! camera images pass through (with EXIF orientation fixed).
//!
//! Rendering runs behind the [`PdfRasterizer`] seam. The production
//! implementation uses PDFium; pdfium handles CIDFonts, embedded fonts and
//! form fields that lighter parsers garble. The upstream `Pdfium` type is
//! `!Send`, so a fresh instance is loaded per operation; the OS caches
//! `dlopen`, making repeat loads near-free.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use pdfium_render::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::settings::RenderSettings;

use super::types::ProcessingContext;
use super::{PipelineError, PipelineStage};

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("PDF rasterisation failed: {0}")]
    Pdfium(String),

    #[error("image encoding failed: {0}")]
    Encode(String),

    #[error("image decoding failed: {0}")]
    Decode(String),

    #[error("document contains no renderable pages")]
    NoPages,

    #[error("render worker failed: {0}")]
    Worker(String),
}

/// External rasteriser seam.
///
/// Synchronous on purpose: rendering is CPU-bound and runs inside
/// `spawn_blocking` from the stage.
pub trait PdfRasterizer: Send + Sync {
    /// Render a PDF into ordered, normalised JPEG page buffers.
    fn render(&self, pdf: &[u8], params: &RenderSettings) -> Result<Vec<Vec<u8>>, RenderError>;
}

// ── PDFium implementation ─────────────────────────────────

pub struct PdfiumRasterizer;

impl PdfiumRasterizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the PDFium dynamic library.
///
/// Discovery order: `PDFIUM_DYNAMIC_LIB_PATH`, alongside the executable,
/// then the system search path.
fn load_pdfium() -> Result<Pdfium, RenderError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        let bindings = Pdfium::bind_to_library(&path)
            .map_err(|e| RenderError::Pdfium(format!("failed to load PDFium from {path}: {e}")))?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let lib_path =
                Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
            if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                return Ok(Pdfium::new(bindings));
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        RenderError::Pdfium(format!(
            "PDFium library not found; set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

impl PdfRasterizer for PdfiumRasterizer {
    fn render(&self, pdf: &[u8], params: &RenderSettings) -> Result<Vec<Vec<u8>>, RenderError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| RenderError::Pdfium(format!("failed to load PDF: {e}")))?;

        let pages = document.pages();
        let total = pages.len() as usize;
        if total == 0 {
            return Err(RenderError::NoPages);
        }

        let count = total.min(params.max_pages);
        if count < total {
            warn!(total, rendered = count, "page count clamped");
        }

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let page = pages
                .get(index as u16)
                .map_err(|e| RenderError::Pdfium(format!("page {index} unavailable: {e}")))?;

            let scale = params.dpi as f32 / POINTS_PER_INCH;
            let natural_w = (page.width().value * scale).max(1.0) as u32;
            let natural_h = (page.height().value * scale).max(1.0) as u32;
            let (target_w, target_h) = clamp_width(natural_w, natural_h, params.max_width);

            let config = PdfRenderConfig::new()
                .set_target_width(target_w as i32)
                .set_maximum_height(target_h as i32);
            let bitmap = page
                .render_with_config(&config)
                .map_err(|e| RenderError::Pdfium(format!("page {index} render failed: {e}")))?;

            let jpeg = finish_page(bitmap.as_image(), params)?;
            debug!(
                page = index,
                width = target_w,
                height = target_h,
                bytes = jpeg.len(),
                "page rendered"
            );
            buffers.push(jpeg);
        }

        Ok(buffers)
    }
}

/// Scale `(w, h)` down so width does not exceed `max_width`, preserving
/// aspect ratio. Never upscales.
pub fn clamp_width(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || width == 0 {
        return (width.max(1), height.max(1));
    }
    let ratio = max_width as f32 / width as f32;
    (
        max_width,
        ((height as f32 * ratio).round() as u32).max(1),
    )
}

/// Apply the post-render page treatment: optional grayscale, optional
/// contrast normalisation, JPEG encoding.
pub fn finish_page(image: DynamicImage, params: &RenderSettings) -> Result<Vec<u8>, RenderError> {
    let mut image = if params.grayscale {
        DynamicImage::ImageLuma8(image.to_luma8())
    } else {
        image
    };

    if params.normalize {
        image = normalize_contrast(image);
    }

    encode_jpeg(&image, params.jpeg_quality)
}

/// Linear contrast stretch over the 1st..99th luminance percentiles.
/// Scanned pages often sit in a compressed gray band; stretching them
/// restores the ink/paper separation the model reads best.
pub fn normalize_contrast(image: DynamicImage) -> DynamicImage {
    let gray = image.to_luma8();
    let mut histogram = [0u32; 256];
    for pixel in gray.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let total: u32 = histogram.iter().sum();
    if total == 0 {
        return image;
    }
    let cutoff = (total / 100).max(1);

    let mut low = 0usize;
    let mut seen = 0u32;
    for (value, &count) in histogram.iter().enumerate() {
        seen += count;
        if seen > cutoff {
            low = value;
            break;
        }
    }

    let mut high = 255usize;
    seen = 0;
    for (value, &count) in histogram.iter().enumerate().rev() {
        seen += count;
        if seen > cutoff {
            high = value;
            break;
        }
    }

    if high <= low + 1 {
        // Effectively flat page; stretching would only amplify noise.
        return image;
    }

    let range = (high - low) as f32;
    let map = |v: u8| -> u8 {
        let stretched = (v as f32 - low as f32) * 255.0 / range;
        stretched.clamp(0.0, 255.0) as u8
    };

    match image {
        DynamicImage::ImageLuma8(mut img) => {
            for pixel in img.pixels_mut() {
                pixel.0[0] = map(pixel.0[0]);
            }
            DynamicImage::ImageLuma8(img)
        }
        other => {
            let mut rgb = other.to_rgb8();
            for pixel in rgb.pixels_mut() {
                pixel.0 = [map(pixel.0[0]), map(pixel.0[1]), map(pixel.0[2])];
            }
            DynamicImage::ImageRgb8(rgb)
        }
    }
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, RenderError> {
    let mut cursor = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
    image
        .write_with_encoder(encoder)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(cursor.into_inner())
}

// ── EXIF orientation for camera uploads ───────────────────

/// Fix EXIF rotation on a directly-uploaded image. Bytes pass through
/// untouched when there is no orientation tag (the common case for
/// scanner output); rotated photos are re-encoded.
fn correct_orientation(bytes: &[u8], quality: u8) -> Vec<u8> {
    let orientation = read_exif_orientation(bytes);
    if orientation <= 1 {
        return bytes.to_vec();
    }

    let decoded = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(_) => return bytes.to_vec(),
    };

    let rotated = match orientation {
        2 => decoded.fliph(),
        3 => decoded.rotate180(),
        4 => decoded.flipv(),
        5 => decoded.rotate90().fliph(),
        6 => decoded.rotate90(),
        7 => decoded.rotate270().fliph(),
        8 => decoded.rotate270(),
        _ => decoded,
    };

    encode_jpeg(&rotated, quality).unwrap_or_else(|_| bytes.to_vec())
}

fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };
    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

// ── Stage ─────────────────────────────────────────────────

const IMAGE_MIMES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

pub struct PreprocessStage {
    rasterizer: Arc<dyn PdfRasterizer>,
    render: RenderSettings,
}

impl PreprocessStage {
    pub fn new(rasterizer: Arc<dyn PdfRasterizer>, render: RenderSettings) -> Self {
        Self { rasterizer, render }
    }
}

#[async_trait]
impl PipelineStage for PreprocessStage {
    fn name(&self) -> &'static str {
        "preprocess"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        let mime = ctx.request.mime_type.clone();

        if mime == "application/pdf" {
            let rasterizer = self.rasterizer.clone();
            let bytes = ctx.request.file.clone();
            let params = self.render.clone();
            let pages = tokio::task::spawn_blocking(move || rasterizer.render(&bytes, &params))
                .await
                .map_err(|e| RenderError::Worker(e.to_string()))??;

            if pages.is_empty() {
                return Err(RenderError::NoPages.into());
            }
            info!(pages = pages.len(), "PDF rasterised");
            ctx.images = pages;
            return Ok(());
        }

        if IMAGE_MIMES.contains(&mime.as_str()) {
            ctx.images = vec![correct_orientation(
                &ctx.request.file,
                self.render.jpeg_quality,
            )];
            return Ok(());
        }

        Err(PipelineError::UnsupportedMediaType(mime))
    }
}

// ── Mock rasteriser ───────────────────────────────────────

/// Deterministic rasteriser for tests: one light-gray JPEG page per
/// configured `(width, height)` pair, with a darker band so contrast
/// checks have something to bite on.
pub struct MockRasterizer {
    dims: Vec<(u32, u32)>,
}

impl MockRasterizer {
    pub fn new(dims: Vec<(u32, u32)>) -> Self {
        Self { dims }
    }

    /// Build one synthetic page without going through the trait.
    pub fn page(width: u32, height: u32) -> Vec<u8> {
        let mut img = image::RgbImage::from_pixel(width, height, image::Rgb([230, 230, 230]));
        let band_top = height / 3;
        let band_bottom = (height / 3) * 2;
        for y in band_top..band_bottom.min(height) {
            for x in 0..width {
                img.put_pixel(x, y, image::Rgb([40, 40, 40]));
            }
        }
        encode_jpeg(&DynamicImage::ImageRgb8(img), 85).expect("mock page encoding")
    }
}

impl PdfRasterizer for MockRasterizer {
    fn render(&self, _pdf: &[u8], params: &RenderSettings) -> Result<Vec<Vec<u8>>, RenderError> {
        if self.dims.is_empty() {
            return Err(RenderError::NoPages);
        }
        Ok(self
            .dims
            .iter()
            .take(params.max_pages)
            .map(|&(w, h)| Self::page(w, h))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ExtractionOptions, ExtractionRequest};
    use image::GenericImageView;
    use crate::schema::DocType;
    use serde_json::json;

    fn ctx_for(mime: &str, file: Vec<u8>) -> ProcessingContext {
        ProcessingContext::new(ExtractionRequest::new(
            file,
            mime,
            DocType::Invoice,
            json!({}),
            ExtractionOptions::default(),
        ))
    }

    #[test]
    fn clamp_width_preserves_aspect() {
        assert_eq!(clamp_width(3200, 1600, 1600), (1600, 800));
        assert_eq!(clamp_width(1000, 2000, 1600), (1000, 2000));
        assert_eq!(clamp_width(0, 0, 1600), (1, 1));
    }

    #[test]
    fn mock_pages_decode_with_requested_dims() {
        let page = MockRasterizer::page(400, 900);
        let decoded = image::load_from_memory(&page).unwrap();
        assert_eq!(decoded.dimensions(), (400, 900));
    }

    #[test]
    fn mock_rasterizer_caps_pages() {
        let rasterizer = MockRasterizer::new(vec![(100, 100); 5]);
        let params = RenderSettings {
            max_pages: 3,
            ..Default::default()
        };
        let pages = rasterizer.render(&[], &params).unwrap();
        assert_eq!(pages.len(), 3);
    }

    #[test]
    fn normalize_stretches_compressed_band() {
        // Page whose values sit in a narrow 100..150 band
        let mut img = image::GrayImage::new(64, 64);
        for (i, pixel) in img.pixels_mut().enumerate() {
            pixel.0[0] = 100 + (i % 50) as u8;
        }
        let normalized = normalize_contrast(DynamicImage::ImageLuma8(img)).to_luma8();

        let min = normalized.pixels().map(|p| p.0[0]).min().unwrap();
        let max = normalized.pixels().map(|p| p.0[0]).max().unwrap();
        assert!(min < 20, "low end should stretch toward 0, got {min}");
        assert!(max > 235, "high end should stretch toward 255, got {max}");
    }

    #[test]
    fn normalize_leaves_flat_page_alone() {
        let img = image::GrayImage::from_pixel(32, 32, image::Luma([180]));
        let normalized = normalize_contrast(DynamicImage::ImageLuma8(img)).to_luma8();
        assert!(normalized.pixels().all(|p| p.0[0] == 180));
    }

    #[test]
    fn finish_page_grayscale_jpeg_roundtrip() {
        let page = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            60,
            40,
            image::Rgb([120, 60, 200]),
        ));
        let params = RenderSettings::default();
        let jpeg = finish_page(page, &params).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (60, 40));
    }

    #[test]
    fn orientation_passthrough_without_exif() {
        let page = MockRasterizer::page(50, 50);
        let out = correct_orientation(&page, 85);
        assert_eq!(out, page);
    }

    #[tokio::test]
    async fn stage_rejects_unknown_mime() {
        let stage = PreprocessStage::new(
            Arc::new(MockRasterizer::new(vec![(10, 10)])),
            RenderSettings::default(),
        );
        let mut ctx = ctx_for("text/csv", vec![1, 2, 3]);
        let err = stage.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedMediaType(_)));
    }

    #[tokio::test]
    async fn stage_renders_pdf_pages_in_order() {
        let stage = PreprocessStage::new(
            Arc::new(MockRasterizer::new(vec![(100, 300), (100, 500)])),
            RenderSettings::default(),
        );
        let mut ctx = ctx_for("application/pdf", vec![0x25, 0x50, 0x44, 0x46]);
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.images.len(), 2);
        let first = image::load_from_memory(&ctx.images[0]).unwrap();
        let second = image::load_from_memory(&ctx.images[1]).unwrap();
        assert_eq!(first.height(), 300);
        assert_eq!(second.height(), 500);
    }

    #[tokio::test]
    async fn stage_passes_image_through() {
        let stage = PreprocessStage::new(
            Arc::new(MockRasterizer::new(vec![])),
            RenderSettings::default(),
        );
        let file = MockRasterizer::page(80, 80);
        let mut ctx = ctx_for("image/jpeg", file.clone());
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.images.len(), 1);
        assert_eq!(ctx.images[0], file);
    }
}
