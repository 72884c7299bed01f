//! Field-level validation with a targeted repair loop.
//!
//! Validators plug in per document type through a small registry. The run
//! order for each configured validator is: find invalid rows, attempt
//! repair (OCR fuzzy match first, then a focused model pass) when
//! re-verification is enabled, apply the repairs by key field, re-scan,
//! and annotate whatever still fails so the API consumer sees exactly
//! which rows to distrust.

pub mod iban;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::backends::ModelBackend;
use crate::schema::DocType;

use super::types::ProcessingContext;
use super::{PipelineError, PipelineStage};

use iban::{closest_candidate, normalize_key, scan_ocr_candidates, validate_iban};

/// Everything a validator may need to fix a row.
pub struct RepairContext<'a> {
    pub ocr_text: Option<&'a str>,
    /// Original page images, for the model pass.
    pub images: &'a [Vec<u8>],
    /// Rows that already validate, given to the model as context.
    pub valid_rows: &'a [Value],
    pub backend: Option<&'a Arc<dyn ModelBackend>>,
    pub doc_type: DocType,
}

/// What a repair attempt produced.
#[derive(Debug, Default)]
pub struct RepairOutcome {
    /// Candidate replacement rows, matched back by the validator's key.
    pub rows: Vec<Value>,
    pub ocr_corrected: usize,
    pub model_pass_ran: bool,
    pub warnings: Vec<String>,
}

/// A pluggable per-field validator.
#[async_trait]
pub trait FieldValidator: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// The row field this validator judges.
    fn field(&self) -> &'static str;

    /// Row key used to match repaired rows back (normalised: trim +
    /// lower-case).
    fn key_field(&self) -> &'static str {
        "invoiceNumber"
    }

    fn is_valid(&self, row: &Value) -> bool;

    fn find_invalid(&self, rows: &[Value]) -> Vec<Value> {
        rows.iter()
            .filter(|row| !self.is_valid(row))
            .cloned()
            .collect()
    }

    async fn repair(&self, invalid: &[Value], ctx: &RepairContext<'_>) -> RepairOutcome;

    /// Mark a residual row with `_validationIssue` / `_validationDetails`.
    fn annotate(&self, row: &mut Value);
}

/// Resolve a validator by registry name.
pub fn validator_by_name(name: &str) -> Option<Arc<dyn FieldValidator>> {
    match name {
        "iban" => Some(Arc::new(IbanValidator)),
        _ => None,
    }
}

/// Merge repaired rows into the result's array field, matching on the
/// normalised key. Merging (rather than replacing) keeps the internal
/// tile markers on the original row intact.
pub fn apply_repairs(result: &mut Value, repaired: &[Value], array_field: &str, key_field: &str) {
    let Some(rows) = result.get_mut(array_field).and_then(Value::as_array_mut) else {
        return;
    };

    for fix in repaired {
        let Some(fix_key) = fix.get(key_field).and_then(Value::as_str).map(normalize_key)
        else {
            continue;
        };

        for row in rows.iter_mut() {
            let matches = row
                .get(key_field)
                .and_then(Value::as_str)
                .map(|k| normalize_key(k) == fix_key)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if let (Some(target), Some(source)) = (row.as_object_mut(), fix.as_object()) {
                for (k, v) in source {
                    target.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

// ── IBAN validator ────────────────────────────────────────

/// The drawdown IBAN validator: MOD-97 with diagnostics, repaired from
/// OCR candidates and, failing that, a targeted model pass.
pub struct IbanValidator;

#[async_trait]
impl FieldValidator for IbanValidator {
    fn name(&self) -> &'static str {
        "iban"
    }

    fn field(&self) -> &'static str {
        "iban"
    }

    fn is_valid(&self, row: &Value) -> bool {
        row.get("iban")
            .and_then(Value::as_str)
            .map(|iban| validate_iban(iban).is_ok())
            .unwrap_or(false)
    }

    async fn repair(&self, invalid: &[Value], ctx: &RepairContext<'_>) -> RepairOutcome {
        let mut outcome = RepairOutcome::default();

        // First try cheap OCR-based correction.
        let candidates = ctx
            .ocr_text
            .map(scan_ocr_candidates)
            .unwrap_or_default();

        let mut still_invalid = Vec::new();
        for row in invalid {
            let iban = row.get("iban").and_then(Value::as_str).unwrap_or("");
            match closest_candidate(iban, &candidates) {
                Some(fixed) => {
                    let mut repaired = row.clone();
                    if let Some(obj) = repaired.as_object_mut() {
                        obj.insert("iban".into(), json!(fixed));
                        obj.insert("_ocrCorrected".into(), json!(true));
                    }
                    outcome.ocr_corrected += 1;
                    outcome.rows.push(repaired);
                }
                None => still_invalid.push(row.clone()),
            }
        }

        // Then a focused model pass over the original pages.
        if !still_invalid.is_empty() {
            if let (Some(backend), false) = (ctx.backend, ctx.images.is_empty()) {
                outcome.model_pass_ran = true;
                match iban::reverify_rows(
                    backend,
                    ctx.doc_type,
                    ctx.valid_rows,
                    &still_invalid,
                    ctx.images,
                )
                .await
                {
                    Ok(rows) => outcome.rows.extend(rows),
                    Err(e) => outcome
                        .warnings
                        .push(format!("IBAN re-verification pass failed: {e}")),
                }
            }
        }

        outcome
    }

    fn annotate(&self, row: &mut Value) {
        let issue = match row.get("iban").and_then(Value::as_str) {
            Some(iban) => validate_iban(iban).err(),
            None => Some(iban::IbanIssue::Missing),
        };
        let Some(issue) = issue else { return };
        if let Some(obj) = row.as_object_mut() {
            obj.insert("_validationIssue".into(), json!(issue.code()));
            obj.insert("_validationDetails".into(), json!(issue.describe()));
        }
    }
}

// ── Stage ─────────────────────────────────────────────────

pub struct ValidateStage {
    backend: Arc<dyn ModelBackend>,
    reverify: bool,
}

impl ValidateStage {
    pub fn new(backend: Arc<dyn ModelBackend>, reverify: bool) -> Self {
        Self { backend, reverify }
    }
}

#[async_trait]
impl PipelineStage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn should_run(&self, ctx: &ProcessingContext) -> bool {
        !ctx.doc_type().validators().is_empty() && ctx.result.is_some()
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        let Some(mut result) = ctx.result.take() else {
            return Ok(());
        };
        let doc_type = ctx.doc_type();
        let Some(field) = doc_type.array_field() else {
            ctx.result = Some(result);
            return Ok(());
        };

        for name in doc_type.validators() {
            let Some(validator) = validator_by_name(name) else {
                ctx.warn(format!("unknown validator configured: {name}"));
                continue;
            };

            let rows = match result.get(field).and_then(Value::as_array) {
                Some(rows) => rows.clone(),
                None => continue,
            };
            let invalid = validator.find_invalid(&rows);
            if invalid.is_empty() {
                continue;
            }

            info!(
                validator = name,
                invalid = invalid.len(),
                total = rows.len(),
                "validation found failing rows"
            );

            if self.reverify {
                let valid_rows: Vec<Value> = rows
                    .iter()
                    .filter(|row| validator.is_valid(row))
                    .cloned()
                    .collect();

                let outcome = {
                    let repair_ctx = RepairContext {
                        ocr_text: ctx.metadata.ocr_text.as_deref(),
                        images: &ctx.images,
                        valid_rows: &valid_rows,
                        backend: Some(&self.backend),
                        doc_type,
                    };
                    validator.repair(&invalid, &repair_ctx).await
                };

                ctx.metadata.ocr_corrected_rows += outcome.ocr_corrected;
                if outcome.model_pass_ran {
                    ctx.metadata.reverified = true;
                }
                for warning in outcome.warnings {
                    ctx.warn(warning);
                }
                apply_repairs(&mut result, &outcome.rows, field, validator.key_field());
            }

            // Re-scan; annotate the residuals in place.
            let mut residual = 0usize;
            if let Some(rows) = result.get_mut(field).and_then(Value::as_array_mut) {
                for row in rows.iter_mut() {
                    if !validator.is_valid(row) {
                        validator.annotate(row);
                        residual += 1;
                    }
                }
            }
            if residual > 0 {
                ctx.warn(format!(
                    "{residual} rows still fail {name} validation after repair"
                ));
            }
        }

        ctx.result = Some(result);
        Ok(())
    }
}
