//! Spatial tiling of tall pages.
//!
//! Models read dense tables far more reliably when each request covers a
//! bounded number of rows with explicit header context, so tall pages are
//! cut into overlapping horizontal slices and every slice travels together
//! with the page's header strip. Overlap prevents losing rows that
//! straddle a cut; re-sending the header defeats column-drift
//! hallucinations on later slices.

use std::sync::Arc;

use async_trait::async_trait;
use image::GenericImageView;
use tracing::{debug, info};

use crate::settings::Settings;

use super::preprocess::{encode_jpeg, RenderError};
use super::types::{ProcessingContext, Tile};
use super::{PipelineError, PipelineStage};

/// Header strip height in pixels.
pub const DEFAULT_HEADER_HEIGHT: u32 = 500;
/// Slice height in pixels.
pub const DEFAULT_SLICE_HEIGHT: u32 = 900;
/// Vertical overlap between consecutive slices.
pub const DEFAULT_OVERLAP: u32 = 100;

/// Slices are re-encoded at high quality; they are transient and read by
/// a model, not archived.
const TILE_JPEG_QUALITY: u8 = 95;

/// Tiling geometry for one run.
#[derive(Debug, Clone, Copy)]
pub struct TileGeometry {
    pub header_height: u32,
    pub slice_height: u32,
    pub overlap: u32,
}

impl Default for TileGeometry {
    fn default() -> Self {
        Self {
            header_height: DEFAULT_HEADER_HEIGHT,
            slice_height: DEFAULT_SLICE_HEIGHT,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl TileGeometry {
    /// Resolve geometry from request options, falling back to defaults.
    pub fn from_options(options: &super::types::ExtractionOptions) -> Self {
        let defaults = Self::default();
        let mut geometry = Self {
            header_height: options.header_height.unwrap_or(defaults.header_height),
            slice_height: options.slice_height.unwrap_or(defaults.slice_height),
            overlap: options.overlap.unwrap_or(defaults.overlap),
        };
        // A degenerate overlap would stall the slice walk.
        if geometry.overlap >= geometry.slice_height {
            geometry.overlap = geometry.slice_height.saturating_sub(1);
        }
        geometry
    }
}

/// A page is worth splitting once it exceeds 1.5 slice heights.
/// Exactly 1.5x stays whole.
pub fn should_tile(page_height: u32, slice_height: u32) -> bool {
    page_height as u64 * 2 > slice_height as u64 * 3
}

/// Compute the `(y, height)` spans of the slices below the header.
///
/// Starting at the bottom of the header strip, emit spans of
/// `slice_height` stepping by `slice_height - overlap`, stopping once the
/// remaining strip would be covered by overlap alone.
pub fn slice_spans(page_height: u32, geometry: &TileGeometry) -> Vec<(u32, u32)> {
    let mut spans = Vec::new();
    if geometry.slice_height <= geometry.overlap || geometry.header_height >= page_height {
        return spans;
    }

    let step = geometry.slice_height - geometry.overlap;
    let mut y = geometry.header_height;
    while page_height - y > geometry.overlap {
        let height = geometry.slice_height.min(page_height - y);
        spans.push((y, height));
        match y.checked_add(step) {
            Some(next) if next < page_height => y = next,
            _ => break,
        }
    }
    spans
}

pub struct TilingStage {
    settings: Arc<Settings>,
}

impl TilingStage {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    fn dump_tile(&self, page: usize, label: &str, bytes: &[u8]) {
        let Some(dir) = &self.settings.debug_dump_dir else {
            return;
        };
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let path = dir.join(format!("p{page}_{label}.jpg"));
        if let Err(e) = std::fs::write(&path, bytes) {
            debug!(path = %path.display(), error = %e, "tile dump failed");
        }
    }
}

#[async_trait]
impl PipelineStage for TilingStage {
    fn name(&self) -> &'static str {
        "tiling"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        let tiling_enabled = ctx.request.tiling_enabled();
        let geometry = TileGeometry::from_options(&ctx.request.options);

        let mut tiles = Vec::new();
        let mut global_index = 0usize;

        let images = std::mem::take(&mut ctx.images);
        for (page_index, page_bytes) in images.iter().enumerate() {
            let decoded = image::load_from_memory(page_bytes)
                .map_err(|e| RenderError::Decode(format!("page {page_index}: {e}")))?;
            let (width, height) = decoded.dimensions();

            if !tiling_enabled || !should_tile(height, geometry.slice_height) {
                tiles.push(Tile::whole_page(page_index, global_index, page_bytes.clone()));
                global_index += 1;
                continue;
            }

            let header_img = decoded.crop_imm(0, 0, width, geometry.header_height.min(height));
            let header = encode_jpeg(&header_img, TILE_JPEG_QUALITY)?;
            self.dump_tile(page_index, "h", &header);

            let spans = slice_spans(height, &geometry);
            debug!(
                page = page_index,
                height,
                slices = spans.len(),
                "page tiled"
            );

            for (slice_index, (y, slice_height)) in spans.into_iter().enumerate() {
                let slice_img = decoded.crop_imm(0, y, width, slice_height);
                let slice = encode_jpeg(&slice_img, TILE_JPEG_QUALITY)?;
                self.dump_tile(page_index, &format!("s{slice_index}"), &slice);

                tiles.push(Tile {
                    page_index,
                    slice_index,
                    global_index,
                    raw_header: Some(header.clone()),
                    raw_slice: slice,
                    is_tiled: true,
                });
                global_index += 1;
            }
        }

        info!(
            pages = images.len(),
            tiles = tiles.len(),
            tiled = tiles.iter().filter(|t| t.is_tiled).count(),
            "tiling complete"
        );

        ctx.metadata.tiles_total = tiles.len();
        ctx.tiles = tiles;

        // Page buffers are only needed past this point when a validator may
        // hand them to the repair pass.
        if ctx.doc_type().validators().is_empty() {
            ctx.release_page_buffers();
        } else {
            ctx.images = images;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::preprocess::MockRasterizer;
    use crate::pipeline::types::{ExtractionOptions, ExtractionRequest};
    use crate::schema::DocType;
    use serde_json::json;

    fn ctx_with(doc_type: DocType, pages: Vec<(u32, u32)>) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(ExtractionRequest::new(
            vec![1],
            "application/pdf",
            doc_type,
            json!({}),
            ExtractionOptions::default(),
        ));
        ctx.images = pages
            .into_iter()
            .map(|(w, h)| MockRasterizer::page(w, h))
            .collect();
        ctx
    }

    fn stage() -> TilingStage {
        TilingStage::new(Arc::new(Settings::default()))
    }

    #[test]
    fn tile_threshold_boundary() {
        // 1.5x exactly: stays whole. One pixel more: tiled.
        assert!(!should_tile(1350, 900));
        assert!(should_tile(1351, 900));
    }

    #[test]
    fn spans_for_canonical_tall_page() {
        let spans = slice_spans(3000, &TileGeometry::default());
        assert_eq!(spans, vec![(500, 900), (1300, 900), (2100, 900)]);
    }

    #[test]
    fn spans_stop_when_remainder_fits_in_overlap() {
        let geometry = TileGeometry {
            header_height: 100,
            slice_height: 400,
            overlap: 100,
        };
        // y walks 100, 400, 700; at y=1000 the remainder (100) <= overlap
        let spans = slice_spans(1100, &geometry);
        assert_eq!(spans, vec![(100, 400), (400, 400), (700, 400)]);
    }

    #[test]
    fn spans_empty_for_degenerate_geometry() {
        let geometry = TileGeometry {
            header_height: 500,
            slice_height: 100,
            overlap: 100,
        };
        assert!(slice_spans(3000, &geometry).is_empty());

        let geometry = TileGeometry {
            header_height: 5000,
            ..Default::default()
        };
        assert!(slice_spans(3000, &geometry).is_empty());
    }

    #[test]
    fn geometry_from_options_clamps_overlap() {
        let geometry = TileGeometry::from_options(&ExtractionOptions {
            slice_height: Some(200),
            overlap: Some(500),
            ..Default::default()
        });
        assert_eq!(geometry.slice_height, 200);
        assert_eq!(geometry.overlap, 199);
    }

    #[tokio::test]
    async fn two_tall_pages_yield_six_ordered_tiles() {
        let mut ctx = ctx_with(DocType::Drawdown, vec![(600, 3000), (600, 3000)]);
        stage().run(&mut ctx).await.unwrap();

        assert_eq!(ctx.tiles.len(), 6);
        assert_eq!(ctx.metadata.tiles_total, 6);

        // Ordered by (page, slice), global_index monotonic, pairs unique
        let mut seen = std::collections::HashSet::new();
        for (i, tile) in ctx.tiles.iter().enumerate() {
            assert_eq!(tile.global_index, i);
            assert!(tile.is_tiled);
            assert!(seen.insert((tile.page_index, tile.slice_index)));
            assert!(tile.raw_header.is_some());
        }
        assert_eq!(ctx.tiles[0].page_index, 0);
        assert_eq!(ctx.tiles[3].page_index, 1);
        assert_eq!(ctx.tiles[3].slice_index, 0);
    }

    #[tokio::test]
    async fn slices_decode_with_expected_heights() {
        let mut ctx = ctx_with(DocType::Drawdown, vec![(400, 3000)]);
        stage().run(&mut ctx).await.unwrap();

        let header = image::load_from_memory(ctx.tiles[0].raw_header.as_ref().unwrap()).unwrap();
        assert_eq!(header.dimensions(), (400, 500));

        for tile in &ctx.tiles {
            let slice = image::load_from_memory(&tile.raw_slice).unwrap();
            assert_eq!(slice.dimensions(), (400, 900));
        }
    }

    #[tokio::test]
    async fn short_page_passes_through_unchanged() {
        let mut ctx = ctx_with(DocType::Drawdown, vec![(600, 800)]);
        let original = ctx.images[0].clone();
        stage().run(&mut ctx).await.unwrap();

        assert_eq!(ctx.tiles.len(), 1);
        let tile = &ctx.tiles[0];
        assert!(!tile.is_tiled);
        assert!(tile.raw_header.is_none());
        assert_eq!(tile.raw_slice, original);
    }

    #[tokio::test]
    async fn non_tiling_doc_type_never_splits() {
        let mut ctx = ctx_with(DocType::Invoice, vec![(600, 3000)]);
        stage().run(&mut ctx).await.unwrap();
        assert_eq!(ctx.tiles.len(), 1);
        assert!(!ctx.tiles[0].is_tiled);
        // No validators configured for invoices, so pages are released
        assert!(ctx.images.is_empty());
    }

    #[tokio::test]
    async fn drawdown_keeps_pages_for_repair() {
        let mut ctx = ctx_with(DocType::Drawdown, vec![(600, 3000)]);
        stage().run(&mut ctx).await.unwrap();
        assert!(!ctx.images.is_empty());
    }

    #[tokio::test]
    async fn debug_dump_writes_header_and_slices() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            debug_dump_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let stage = TilingStage::new(Arc::new(settings));

        let mut ctx = ctx_with(DocType::Drawdown, vec![(400, 3000)]);
        stage.run(&mut ctx).await.unwrap();

        assert!(dir.path().join("p0_h.jpg").exists());
        assert!(dir.path().join("p0_s0.jpg").exists());
        assert!(dir.path().join("p0_s2.jpg").exists());
    }
}
