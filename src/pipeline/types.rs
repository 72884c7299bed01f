//! Core pipeline data model: the inbound request contract, the mutable
//! processing context threaded through the stages, and the tile records
//! produced by the splitter.
//!
//! The context is single-owner by construction: stages take `&mut` one at
//! a time and intra-stage fan-out joins before the stage returns, so no
//! locking is needed anywhere on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backends::{ContentPart, ProviderKind};
use crate::ocr::OcrPageText;
use crate::schema::DocType;

use super::PipelineError;

/// Which extraction branch handles the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PipelineMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "ocr-enhanced")]
    OcrEnhanced,
    #[serde(rename = "ocr-only")]
    OcrOnly,
    #[serde(rename = "ocr-verified")]
    OcrVerified,
}

impl PipelineMode {
    /// Modes that cannot work without OCR artifacts.
    pub fn requires_ocr(&self) -> bool {
        !matches!(self, Self::Default)
    }
}

/// Caller-controlled knobs, deserialised from the upload collaborator's
/// camelCase options object. Every field has a default so an empty object
/// is a valid options record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionOptions {
    pub model_provider: ProviderKind,
    pub enforce_json_schema: bool,
    pub custom_prompt: Option<String>,
    pub custom_schema: Option<Value>,
    /// `None` resolves per document type (drawdown → on).
    pub enable_tiling: Option<bool>,
    pub slice_height: Option<u32>,
    pub overlap: Option<u32>,
    pub header_height: Option<u32>,
    pub parallel_mode: bool,
    pub max_concurrency: Option<usize>,
    #[serde(rename = "useAzureOCR", alias = "useAzureOcr")]
    pub use_azure_ocr: bool,
    pub ocr_language: Option<String>,
    pub ocr_concurrency: Option<usize>,
    pub pipeline_mode: PipelineMode,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            model_provider: ProviderKind::default(),
            enforce_json_schema: true,
            custom_prompt: None,
            custom_schema: None,
            enable_tiling: None,
            slice_height: None,
            overlap: None,
            header_height: None,
            parallel_mode: true,
            max_concurrency: None,
            use_azure_ocr: false,
            ocr_language: None,
            ocr_concurrency: None,
            pipeline_mode: PipelineMode::default(),
        }
    }
}

impl ExtractionOptions {
    /// Whether the OCR pre-pass should run for this request.
    pub fn wants_ocr(&self) -> bool {
        self.use_azure_ocr || self.pipeline_mode.requires_ocr()
    }
}

/// The immutable per-document request.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub file: Vec<u8>,
    pub mime_type: String,
    pub doc_type: DocType,
    /// Registry schema resolved by the upload collaborator. `customSchema`
    /// in the options overrides it.
    pub schema: Value,
    pub options: ExtractionOptions,
}

impl ExtractionRequest {
    pub fn new(
        file: Vec<u8>,
        mime_type: impl Into<String>,
        doc_type: DocType,
        schema: Value,
        options: ExtractionOptions,
    ) -> Self {
        Self {
            file,
            mime_type: mime_type.into(),
            doc_type,
            schema,
            options,
        }
    }

    /// Schema actually used for this run.
    pub fn effective_schema(&self) -> &Value {
        self.options.custom_schema.as_ref().unwrap_or(&self.schema)
    }

    /// Tiling resolution: explicit option wins, otherwise the per-type
    /// default.
    pub fn tiling_enabled(&self) -> bool {
        self.options
            .enable_tiling
            .unwrap_or_else(|| self.doc_type.tiling_default())
    }
}

/// One model-call unit produced by the splitter: a header-plus-slice pair
/// for tiled pages, a single whole page otherwise.
#[derive(Debug, Clone)]
pub struct Tile {
    pub page_index: usize,
    pub slice_index: usize,
    /// Monotonic id across the whole document; rows are tagged with it so
    /// aggregation can restore tile order after parallel dispatch.
    pub global_index: usize,
    /// Header strip re-sent with every slice of a tiled page.
    pub raw_header: Option<Vec<u8>>,
    pub raw_slice: Vec<u8>,
    pub is_tiled: bool,
}

impl Tile {
    pub fn whole_page(page_index: usize, global_index: usize, page: Vec<u8>) -> Self {
        Self {
            page_index,
            slice_index: 0,
            global_index,
            raw_header: None,
            raw_slice: page,
            is_tiled: false,
        }
    }

    /// Ordered model payload: header first (anchoring column semantics),
    /// then the slice.
    pub fn payload(&self) -> Vec<ContentPart> {
        let mut parts = Vec::with_capacity(2);
        if let Some(header) = &self.raw_header {
            parts.push(ContentPart::jpeg(header.clone()));
        }
        parts.push(ContentPart::jpeg(self.raw_slice.clone()));
        parts
    }

    /// Free the image buffers once the tile has been dispatched.
    pub fn release_buffers(&mut self) {
        self.raw_header = None;
        self.raw_slice = Vec::new();
    }
}

/// One backend reply, tagged with its source tile.
#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub data: Value,
    pub response_id: Option<String>,
    pub tile_index: Option<usize>,
}

/// Timing record for one executed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Run-scoped bookkeeping: OCR artifacts, stage timings, counters.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub request_id: Uuid,
    pub stage_timings: Vec<StageTiming>,
    pub ocr_pages: Vec<OcrPageText>,
    /// Concatenated page texts with `\n\n---\n\n` separators.
    pub ocr_text: Option<String>,
    pub tiles_total: usize,
    pub tiles_extracted: usize,
    /// Set when the targeted model re-verification pass ran.
    pub reverified: bool,
    pub ocr_corrected_rows: usize,
}

impl RunMetadata {
    fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            stage_timings: Vec::new(),
            ocr_pages: Vec::new(),
            ocr_text: None,
            tiles_total: 0,
            tiles_extracted: 0,
            reverified: false,
            ocr_corrected_rows: 0,
        }
    }
}

/// The mutable state threaded through the stage sequence. Created per
/// request, discarded after the response is emitted.
pub struct ProcessingContext {
    pub request: ExtractionRequest,
    /// Ordered page JPEGs produced by preprocessing.
    pub images: Vec<Vec<u8>>,
    pub tiles: Vec<Tile>,
    pub extractions: Vec<ExtractionOutput>,
    /// Final aggregated/validated document.
    pub result: Option<Value>,
    pub metadata: RunMetadata,
    /// First fatal error; set once, short-circuits remaining stages.
    pub error: Option<PipelineError>,
    /// Every error string accumulated along the way.
    pub errors: Vec<String>,
    /// Non-fatal degradations (dropped tiles, skipped OCR, ...).
    pub warnings: Vec<String>,
}

impl ProcessingContext {
    pub fn new(request: ExtractionRequest) -> Self {
        Self {
            request,
            images: Vec::new(),
            tiles: Vec::new(),
            extractions: Vec::new(),
            result: None,
            metadata: RunMetadata::new(),
            error: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn doc_type(&self) -> DocType {
        self.request.doc_type
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(request_id = %self.metadata.request_id, "{message}");
        self.warnings.push(message);
    }

    /// Record a fatal error. The first one wins; later ones only join the
    /// error list.
    pub fn fail(&mut self, error: PipelineError) {
        tracing::error!(request_id = %self.metadata.request_id, error = %error, "pipeline stage failed");
        self.errors.push(error.to_string());
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Page buffers are not retained past the point where tiles exist.
    pub fn release_page_buffers(&mut self) {
        self.images = Vec::new();
    }

    /// Tile payloads are not retained past aggregation.
    pub fn release_tile_buffers(&mut self) {
        for tile in &mut self.tiles {
            tile.release_buffers();
        }
    }
}
