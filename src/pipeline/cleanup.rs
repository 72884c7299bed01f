//! Final cleanup: no key beginning with `_` may leave the pipeline.
//!
//! Tile back-references (`_tileIndex`, `_pageIndex`, `_sliceIndex`) and
//! repair markers (`_ocrCorrected`) are purely internal and disappear.
//! Validation diagnostics are the one exception with consumer value, so
//! they are re-published under underscore-free names before the sweep.

use async_trait::async_trait;
use serde_json::Value;

use super::types::ProcessingContext;
use super::{PipelineError, PipelineStage};

/// Recursively remove every object key starting with `_`.
pub fn strip_internal_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !key.starts_with('_'));
            for nested in map.values_mut() {
                strip_internal_keys(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_internal_keys(item);
            }
        }
        _ => {}
    }
}

/// Re-key `_validationIssue` / `_validationDetails` to their public
/// names so the diagnostics survive the underscore sweep.
fn publish_validation_markers(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(issue) = map.remove("_validationIssue") {
                map.insert("validationIssue".into(), issue);
            }
            if let Some(details) = map.remove("_validationDetails") {
                map.insert("validationDetails".into(), details);
            }
            for nested in map.values_mut() {
                publish_validation_markers(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                publish_validation_markers(item);
            }
        }
        _ => {}
    }
}

pub struct CleanupStage;

#[async_trait]
impl PipelineStage for CleanupStage {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        if let Some(result) = ctx.result.as_mut() {
            publish_validation_markers(result);
            strip_internal_keys(result);
        }
        Ok(())
    }
}
