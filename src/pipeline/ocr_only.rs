//! OCR-only branch: a single text call carrying the full OCR text and no
//! images. The cheapest branch, useful when the upstream scan quality is
//! good and image tokens are the cost driver.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::backends::{CallOptions, ContentPart, ModelBackend};
use crate::prompts::{self, OCR_ONLY_LEAD_OUT};

use super::types::{ExtractionOutput, ProcessingContext};
use super::{PipelineError, PipelineStage};

pub struct OcrOnlyStage {
    backend: Arc<dyn ModelBackend>,
}

impl OcrOnlyStage {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PipelineStage for OcrOnlyStage {
    fn name(&self) -> &'static str {
        "extract-ocr-only"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        let Some(ocr_text) = ctx.metadata.ocr_text.clone() else {
            return Err(PipelineError::OcrRequired(
                "ocr-only mode needs OCR text, but the pre-pass produced none".to_string(),
            ));
        };

        let instructions = prompts::build_instructions(
            ctx.doc_type(),
            ctx.request.effective_schema(),
            ctx.request.options.custom_prompt.as_deref(),
            ctx.request.options.enforce_json_schema,
        );

        let enforce = ctx.request.options.enforce_json_schema
            && self.backend.supports_structured_output();

        let payload = format!("{ocr_text}\n\n{OCR_ONLY_LEAD_OUT}");
        let reply = self
            .backend
            .extract(
                &[ContentPart::Text(payload)],
                &instructions,
                ctx.doc_type(),
                Some(ctx.request.effective_schema()),
                enforce,
                &CallOptions {
                    use_tile_timeout: false,
                },
            )
            .await?;

        info!(
            doc_type = %ctx.doc_type(),
            ocr_chars = ocr_text.len(),
            "ocr-only extraction complete"
        );

        ctx.extractions = vec![ExtractionOutput {
            data: reply.data,
            response_id: reply.response_id,
            tile_index: None,
        }];
        Ok(())
    }
}
