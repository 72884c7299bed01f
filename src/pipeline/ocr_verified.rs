//! OCR-verified branch: the drawdown specialisation with a built-in
//! repair loop.
//!
//! Pass one reads the whole document (full OCR text plus every page
//! image) under extended character-exactness rules. Every row's IBAN is
//! then checked with MOD-97; broken rows get two chances: a fuzzy match
//! against MOD-97-valid candidates mined from the OCR text, and a
//! targeted model pass that sees only the invalid rows and their
//! diagnostics. Rows that survive neither stay out of the merge and are
//! caught again by the validator stage for annotation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::backends::{CallOptions, ContentPart, ModelBackend};
use crate::prompts::{self, DRAWDOWN_VERIFIED_RULES};

use super::types::{ExtractionOutput, ProcessingContext};
use super::validate::iban::{
    closest_candidate, normalize_key, reverify_rows, scan_ocr_candidates, validate_iban,
};
use super::{PipelineError, PipelineStage};

pub struct OcrVerifiedStage {
    backend: Arc<dyn ModelBackend>,
}

impl OcrVerifiedStage {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PipelineStage for OcrVerifiedStage {
    fn name(&self) -> &'static str {
        "extract-ocr-verified"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        let Some(ocr_text) = ctx.metadata.ocr_text.clone() else {
            return Err(PipelineError::OcrRequired(
                "ocr-verified mode needs OCR text, but the pre-pass produced none".to_string(),
            ));
        };

        // ── Pass 1: whole document, text + images, strict character rules
        let base = prompts::build_instructions(
            ctx.doc_type(),
            ctx.request.effective_schema(),
            ctx.request.options.custom_prompt.as_deref(),
            ctx.request.options.enforce_json_schema,
        );
        let instructions = format!("{base}\n\n{DRAWDOWN_VERIFIED_RULES}");
        let enforce = ctx.request.options.enforce_json_schema
            && self.backend.supports_structured_output();

        let mut parts = Vec::with_capacity(ctx.images.len() + 1);
        parts.push(ContentPart::Text(format!(
            "Document OCR Text:\n{ocr_text}\n\nNow extract the structured data from the attached pages:"
        )));
        parts.extend(ctx.images.iter().map(|image| ContentPart::jpeg(image.clone())));

        let reply = self
            .backend
            .extract(
                &parts,
                &instructions,
                ctx.doc_type(),
                Some(ctx.request.effective_schema()),
                enforce,
                &CallOptions {
                    use_tile_timeout: false,
                },
            )
            .await?;
        let mut data = reply.data;
        let response_id = reply.response_id;

        let Some(field) = ctx.doc_type().array_field() else {
            ctx.extractions = vec![ExtractionOutput {
                data,
                response_id,
                tile_index: None,
            }];
            return Ok(());
        };
        let rows = data
            .get(field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // ── Pass 2: MOD-97 partition
        let (valid, invalid): (Vec<Value>, Vec<Value>) = rows
            .into_iter()
            .partition(|row| {
                row.get("iban")
                    .and_then(Value::as_str)
                    .map(|iban| validate_iban(iban).is_ok())
                    .unwrap_or(false)
            });

        info!(
            valid = valid.len(),
            invalid = invalid.len(),
            "initial pass partitioned by IBAN validity"
        );

        // ── Pass 3: OCR-based correction
        let candidates = scan_ocr_candidates(&ocr_text);
        let mut ocr_repaired = Vec::new();
        let mut still_invalid = Vec::new();
        for row in invalid {
            let iban = row.get("iban").and_then(Value::as_str).unwrap_or("");
            match closest_candidate(iban, &candidates) {
                Some(fixed) => {
                    let mut repaired = row;
                    if let Some(obj) = repaired.as_object_mut() {
                        obj.insert("iban".into(), json!(fixed));
                        obj.insert("_ocrCorrected".into(), json!(true));
                    }
                    ocr_repaired.push(repaired);
                }
                None => still_invalid.push(row),
            }
        }
        ctx.metadata.ocr_corrected_rows += ocr_repaired.len();

        // ── Pass 4: targeted model re-verification
        let mut model_repaired = Vec::new();
        if !still_invalid.is_empty() {
            ctx.metadata.reverified = true;
            let pass = reverify_rows(
                &self.backend,
                ctx.doc_type(),
                &valid,
                &still_invalid,
                &ctx.images,
            )
            .await;
            match pass {
                Ok(rows) => model_repaired = rows,
                Err(e) => ctx.warn(format!("re-verification pass failed: {e}")),
            }

            let recovered: HashSet<String> = model_repaired
                .iter()
                .filter_map(|r| r.get("invoiceNumber").and_then(Value::as_str))
                .map(normalize_key)
                .collect();
            for row in &still_invalid {
                let key = row
                    .get("invoiceNumber")
                    .and_then(Value::as_str)
                    .map(normalize_key);
                if key.map(|k| !recovered.contains(&k)).unwrap_or(true) {
                    ctx.warn(format!(
                        "row {} kept an unrepairable IBAN",
                        row.get("invoiceNumber")
                            .and_then(Value::as_str)
                            .unwrap_or("(unknown)")
                    ));
                }
            }
        }

        // ── Pass 5: merge, never shadowing an already-valid invoice number
        let valid_keys: HashSet<String> = valid
            .iter()
            .filter_map(|r| r.get("invoiceNumber").and_then(Value::as_str))
            .map(normalize_key)
            .collect();

        let mut merged = valid;
        for row in ocr_repaired.into_iter().chain(model_repaired) {
            let duplicate = row
                .get("invoiceNumber")
                .and_then(Value::as_str)
                .map(|k| valid_keys.contains(&normalize_key(k)))
                .unwrap_or(false);
            if !duplicate {
                merged.push(row);
            }
        }

        info!(rows = merged.len(), "verified extraction merged");
        if let Some(obj) = data.as_object_mut() {
            obj.insert(field.to_string(), Value::Array(merged));
        }

        ctx.extractions = vec![ExtractionOutput {
            data,
            response_id,
            tile_index: None,
        }];
        Ok(())
    }
}
