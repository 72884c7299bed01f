//! OCR-enhanced branch: each page travels as its OCR text plus the page
//! image, with instructions to trust the text for character-exact fields
//! (IBANs, invoice numbers) and the image for layout and row grouping.
//!
//! Pages are processed one by one; a failing page lowers yield with a
//! warning rather than aborting the document. Rows are stamped with
//! `_pageIndex` only; there are no tiles on this path.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::backends::{BackendError, CallOptions, ContentPart, ModelBackend};
use crate::prompts::{self, ocr_enhanced_page_text, OCR_FUSION_RULES};

use super::types::{ExtractionOutput, ProcessingContext};
use super::{PipelineError, PipelineStage};

/// Stamp rows with their page of origin.
fn tag_rows_with_page(data: &mut Value, array_field: Option<&str>, page_index: usize) {
    let Some(field) = array_field else { return };
    let Some(rows) = data.get_mut(field).and_then(Value::as_array_mut) else {
        return;
    };
    for row in rows {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("_pageIndex".into(), page_index.into());
        }
    }
}

pub struct OcrEnhancedStage {
    backend: Arc<dyn ModelBackend>,
}

impl OcrEnhancedStage {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PipelineStage for OcrEnhancedStage {
    fn name(&self) -> &'static str {
        "extract-ocr-enhanced"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        if ctx.metadata.ocr_pages.is_empty() || ctx.metadata.ocr_text.is_none() {
            return Err(PipelineError::OcrRequired(
                "ocr-enhanced mode needs per-page OCR text, but the pre-pass produced none"
                    .to_string(),
            ));
        }

        let base = prompts::build_instructions(
            ctx.doc_type(),
            ctx.request.effective_schema(),
            ctx.request.options.custom_prompt.as_deref(),
            ctx.request.options.enforce_json_schema,
        );
        let instructions = format!("{OCR_FUSION_RULES}\n\n{base}");
        let enforce = ctx.request.options.enforce_json_schema
            && self.backend.supports_structured_output();

        let images = ctx.images.clone();
        let page_texts: Vec<String> = ctx
            .metadata
            .ocr_pages
            .iter()
            .map(|p| p.text.clone())
            .collect();

        let mut outputs = Vec::with_capacity(images.len());
        let mut dropped = Vec::new();
        let opts = CallOptions {
            use_tile_timeout: true,
        };

        for (page_index, image) in images.iter().enumerate() {
            let ocr_text = page_texts
                .get(page_index)
                .map(String::as_str)
                .unwrap_or_default();

            let parts = [
                ContentPart::Text(ocr_enhanced_page_text(page_index + 1, ocr_text)),
                ContentPart::jpeg(image.clone()),
            ];

            match self
                .backend
                .extract(
                    &parts,
                    &instructions,
                    ctx.doc_type(),
                    Some(ctx.request.effective_schema()),
                    enforce,
                    &opts,
                )
                .await
            {
                Ok(reply) => {
                    let mut data = reply.data;
                    tag_rows_with_page(&mut data, ctx.doc_type().array_field(), page_index);
                    outputs.push(ExtractionOutput {
                        data,
                        response_id: reply.response_id,
                        tile_index: Some(page_index),
                    });
                }
                Err(e) => dropped.push(format!("page {page_index} extraction failed: {e}")),
            }
        }

        for message in dropped {
            ctx.warn(message);
        }

        if outputs.is_empty() {
            return Err(BackendError::Transport {
                status: None,
                message: format!("all {} pages failed ocr-enhanced extraction", images.len()),
            }
            .into());
        }

        info!(
            pages = images.len(),
            extracted = outputs.len(),
            "ocr-enhanced extraction complete"
        );
        ctx.extractions = outputs;
        Ok(())
    }
}
