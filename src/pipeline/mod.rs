//! The staged extraction pipeline.
//!
//! A request flows `preprocess → [ocr] → [tiling] → extract → aggregate →
//! validate → cleanup`. Each stage either advances the context, skips
//! itself, or records a fatal error that short-circuits the remainder;
//! the runner then still emits a structured failure payload.
//!
//! Branch selection happens once, up front: the default image branch with
//! tiling, the native-file branch for providers that read whole PDFs, or
//! one of the OCR-coupled branches (`ocr-enhanced`, `ocr-only`,
//! `ocr-verified`).

pub mod aggregate;
pub mod cleanup;
pub mod extract;
pub mod native;
pub mod ocr_enhanced;
pub mod ocr_only;
pub mod ocr_stage;
pub mod ocr_verified;
pub mod preprocess;
pub mod tiling;
pub mod types;
pub mod validate;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::backends::{BackendError, BackendFactory};
use crate::ocr::{AzureReadOcr, OcrEngine, OcrError};
use crate::settings::Settings;

use self::aggregate::AggregateStage;
use self::cleanup::CleanupStage;
use self::extract::ExtractStage;
use self::native::NativePdfStage;
use self::ocr_enhanced::OcrEnhancedStage;
use self::ocr_only::OcrOnlyStage;
use self::ocr_stage::OcrStage;
use self::ocr_verified::OcrVerifiedStage;
use self::preprocess::{PdfRasterizer, PdfiumRasterizer, PreprocessStage, RenderError};
use self::tiling::TilingStage;
use self::types::{ExtractionRequest, PipelineMode, ProcessingContext, StageTiming};
use self::validate::ValidateStage;

/// Fatal pipeline failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// The selected branch depends on OCR, but the collaborator is absent.
    #[error("OCR is required for this mode but not configured: {0}")]
    OcrRequired(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Ocr(#[from] OcrError),
}

/// Caller-facing status split: invalid input vs pipeline fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// Maps to HTTP 400 at the upload collaborator.
    BadRequest,
    /// Maps to HTTP 500.
    Internal,
}

impl PipelineError {
    pub fn status_class(&self) -> StatusClass {
        match self {
            Self::BadRequest(_) | Self::UnsupportedMediaType(_) | Self::OcrRequired(_) => {
                StatusClass::BadRequest
            }
            _ => StatusClass::Internal,
        }
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stages may decline to run (and typically leave a warning on the
    /// context explaining why).
    fn should_run(&self, _ctx: &ProcessingContext) -> bool {
        true
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError>;
}

/// Long-lived collaborators shared across requests.
pub struct Services {
    pub settings: Arc<Settings>,
    pub backends: BackendFactory,
    pub rasterizer: Arc<dyn PdfRasterizer>,
    pub ocr: Arc<dyn OcrEngine>,
}

impl Services {
    /// Production wiring from the environment.
    pub fn from_env() -> Self {
        let settings = Arc::new(Settings::from_env());
        Self {
            backends: BackendFactory::new(settings.clone()),
            rasterizer: Arc::new(PdfiumRasterizer::new()),
            ocr: Arc::new(AzureReadOcr::new(&settings)),
            settings,
        }
    }

    /// Explicit wiring, used by tests and embedders.
    pub fn new(
        settings: Arc<Settings>,
        rasterizer: Arc<dyn PdfRasterizer>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        Self {
            backends: BackendFactory::new(settings.clone()),
            settings,
            rasterizer,
            ocr,
        }
    }

    /// Route every provider lookup to one shared backend instance.
    pub fn with_backend(self, backend: Arc<dyn crate::backends::ModelBackend>) -> Self {
        self.backends.set_custom_backend(backend);
        self
    }
}

/// An assembled stage sequence for one request shape.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    /// Pick the branch and assemble the stage list for a request.
    pub fn for_request(request: &ExtractionRequest, services: &Services) -> Self {
        let options = &request.options;
        let backend = services.backends.get(options.model_provider);
        let settings = services.settings.clone();

        let mut stages: Vec<Box<dyn PipelineStage>> = vec![Box::new(PreprocessStage::new(
            services.rasterizer.clone(),
            settings.render.clone(),
        ))];

        if options.wants_ocr() {
            stages.push(Box::new(OcrStage::new(services.ocr.clone())));
        }

        match options.pipeline_mode {
            PipelineMode::Default => {
                let native = backend.supports_native_files()
                    && request.mime_type == "application/pdf"
                    && !request.tiling_enabled();
                if native {
                    stages.push(Box::new(NativePdfStage::new(backend.clone())));
                } else {
                    stages.push(Box::new(TilingStage::new(settings.clone())));
                    stages.push(Box::new(ExtractStage::new(backend.clone())));
                }
            }
            PipelineMode::OcrEnhanced => {
                stages.push(Box::new(OcrEnhancedStage::new(backend.clone())));
            }
            PipelineMode::OcrOnly => {
                stages.push(Box::new(OcrOnlyStage::new(backend.clone())));
            }
            PipelineMode::OcrVerified => {
                stages.push(Box::new(OcrVerifiedStage::new(backend.clone())));
            }
        }

        stages.push(Box::new(AggregateStage));
        stages.push(Box::new(ValidateStage::new(
            backend,
            settings.enable_reverification,
        )));
        stages.push(Box::new(CleanupStage));

        Self { stages }
    }

    /// Drive the context through the stage sequence. Never panics out;
    /// fatal errors land on the context and stop the walk.
    pub async fn run(&self, request: ExtractionRequest) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(request);

        if let Err(e) = validate_request(&ctx.request) {
            ctx.fail(e);
            return ctx;
        }

        for stage in &self.stages {
            if ctx.error.is_some() {
                break;
            }
            if !stage.should_run(&ctx) {
                info!(
                    request_id = %ctx.metadata.request_id,
                    stage = stage.name(),
                    "stage skipped"
                );
                continue;
            }

            let started_at = Utc::now();
            let timer = Instant::now();
            info!(
                request_id = %ctx.metadata.request_id,
                stage = stage.name(),
                doc_type = %ctx.doc_type(),
                "stage started"
            );

            let outcome = stage.run(&mut ctx).await;
            let duration_ms = timer.elapsed().as_millis() as u64;
            ctx.metadata.stage_timings.push(StageTiming {
                stage: stage.name().to_string(),
                started_at,
                duration_ms,
            });

            match outcome {
                Ok(()) => info!(
                    request_id = %ctx.metadata.request_id,
                    stage = stage.name(),
                    duration_ms,
                    "stage finished"
                ),
                Err(e) => ctx.fail(e),
            }
        }

        ctx
    }
}

fn validate_request(request: &ExtractionRequest) -> Result<(), PipelineError> {
    if request.file.is_empty() {
        return Err(PipelineError::BadRequest("file is empty".to_string()));
    }
    if request.mime_type.trim().is_empty() {
        return Err(PipelineError::BadRequest("mimeType is missing".to_string()));
    }
    if !request.effective_schema().is_object() {
        return Err(PipelineError::BadRequest(
            "schema must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

// ── Public outcome types ──────────────────────────────────

/// Summary of a finished run, safe to expose to API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub request_id: uuid::Uuid,
    pub stages: Vec<StageTiming>,
    pub tiles_total: usize,
    pub tiles_extracted: usize,
    pub reverified: bool,
    pub duration_ms: u64,
}

/// Successful extraction: the schema-shaped document plus run info.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionSuccess {
    pub data: Value,
    pub warnings: Vec<String>,
    pub run: RunSummary,
}

/// Structured failure payload.
#[derive(Debug, Clone, Serialize, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: String,
    pub details: Vec<String>,
    pub status: StatusClass,
    /// Present only when verbose diagnostics are enabled.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Run one document through the pipeline.
///
/// This is the crate's primary entry point: assembles the branch for the
/// request, drives the stage sequence, and maps the final context onto
/// either the success payload or a structured failure.
pub async fn run_extraction(
    request: ExtractionRequest,
    services: &Services,
) -> Result<ExtractionSuccess, PipelineFailure> {
    let pipeline = Pipeline::for_request(&request, services);
    let ctx = pipeline.run(request).await;
    finish(ctx, services.settings.verbose)
}

fn finish(
    ctx: ProcessingContext,
    verbose: bool,
) -> Result<ExtractionSuccess, PipelineFailure> {
    let duration_ms = ctx
        .metadata
        .stage_timings
        .iter()
        .map(|t| t.duration_ms)
        .sum();

    if let Some(error) = &ctx.error {
        return Err(PipelineFailure {
            error: error.to_string(),
            details: ctx.errors.clone(),
            status: error.status_class(),
            warnings: if verbose { ctx.warnings.clone() } else { Vec::new() },
        });
    }

    let data = ctx.result.unwrap_or(Value::Null);
    Ok(ExtractionSuccess {
        data,
        warnings: ctx.warnings,
        run: RunSummary {
            request_id: ctx.metadata.request_id,
            stages: ctx.metadata.stage_timings,
            tiles_total: ctx.metadata.tiles_total,
            tiles_extracted: ctx.metadata.tiles_extracted,
            reverified: ctx.metadata.reverified,
            duration_ms,
        },
    })
}
