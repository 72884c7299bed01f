//! Merging per-tile outputs into one document.
//!
//! Tile replies arrive in `global_index` order (restored here by a sort so
//! parallel dispatch cannot reorder them), array rows are concatenated and
//! deduplicated by the doc-type composite key, scalar fields merge
//! left-to-right, and drawdown totals are recomputed from the surviving
//! rows.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::schema::DocType;

use super::types::ProcessingContext;
use super::validate::iban::{account_body_similarity, validate_iban};
use super::{PipelineError, PipelineStage};

/// IBAN similarity above which two equal-key drawdown rows are treated as
/// the same row seen through different tiles.
const IBAN_PROMOTION_THRESHOLD: f64 = 0.8;

/// Composite dedup key: configured fields trimmed, lower-cased, joined
/// with `|`. Rows whose parts are all empty get no key and are kept as-is.
pub fn composite_key(row: &Value, fields: &[&str]) -> Option<String> {
    let parts: Vec<String> = fields
        .iter()
        .map(|field| {
            row.get(*field)
                .map(|v| match v {
                    Value::String(s) => s.trim().to_lowercase(),
                    Value::Null => String::new(),
                    other => other.to_string().trim().to_lowercase(),
                })
                .unwrap_or_default()
        })
        .collect();

    if parts.iter().all(String::is_empty) {
        None
    } else {
        Some(parts.join("|"))
    }
}

/// Stable first-seen dedup with the drawdown IBAN tiebreak: when a later
/// row shares the key and its IBAN reads as the same account (>0.8
/// positional similarity over the account body), the row whose IBAN
/// passes MOD-97 wins: a valid newcomer replaces an invalid holder.
pub fn dedupe_rows(rows: Vec<Value>, doc_type: DocType) -> Vec<Value> {
    let fields = doc_type.dedup_fields();
    let mut kept: Vec<Value> = Vec::with_capacity(rows.len());
    let mut index_by_key: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();

    for row in rows {
        let Some(key) = composite_key(&row, fields) else {
            kept.push(row);
            continue;
        };

        match index_by_key.get(&key) {
            None => {
                index_by_key.insert(key, kept.len());
                kept.push(row);
            }
            Some(&existing_index) if doc_type == DocType::Drawdown => {
                let existing = &kept[existing_index];
                let old_iban = existing.get("iban").and_then(Value::as_str);
                let new_iban = row.get("iban").and_then(Value::as_str);

                if let (Some(old_iban), Some(new_iban)) = (old_iban, new_iban) {
                    let similar = account_body_similarity(old_iban, new_iban)
                        > IBAN_PROMOTION_THRESHOLD;
                    let old_valid = validate_iban(old_iban).is_ok();
                    let new_valid = validate_iban(new_iban).is_ok();

                    if similar && new_valid && !old_valid {
                        debug!(key = %key, "duplicate key: promoting MOD-97-valid IBAN");
                        kept[existing_index] = row;
                    }
                }
                // Otherwise the first occurrence stands.
            }
            Some(_) => {}
        }
    }

    kept
}

/// Round to two decimals, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn amount_of(row: &Value) -> f64 {
    match row.get("amount") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().replace(',', ".").parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Recompute the drawdown total from its rows; missing or unparseable
/// amounts contribute zero.
pub fn recompute_total(result: &mut Value) {
    let total = result
        .get("drawdowns")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().map(amount_of).sum::<f64>())
        .unwrap_or(0.0);
    if let Some(obj) = result.as_object_mut() {
        obj.insert("totalSum".into(), json!(round2(total)));
    }
}

pub struct AggregateStage;

#[async_trait]
impl PipelineStage for AggregateStage {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        if ctx.extractions.is_empty() {
            return Err(PipelineError::BadRequest(
                "no extraction results to aggregate".to_string(),
            ));
        }

        let doc_type = ctx.doc_type();
        let mut extractions = std::mem::take(&mut ctx.extractions);
        // Restore tile order after parallel dispatch.
        extractions.sort_by_key(|e| e.tile_index.unwrap_or(0));

        let mut result = if extractions.len() == 1 {
            extractions.pop().map(|e| e.data).unwrap_or(Value::Null)
        } else {
            let array_field = doc_type.array_field();
            let mut merged = Map::new();
            let mut rows: Vec<Value> = Vec::new();

            for extraction in &extractions {
                let Some(obj) = extraction.data.as_object() else {
                    continue;
                };
                for (key, value) in obj {
                    if Some(key.as_str()) == array_field {
                        if let Some(chunk) = value.as_array() {
                            rows.extend(chunk.iter().cloned());
                        }
                    } else {
                        // Later tiles override earlier scalar fields.
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }

            if let Some(field) = array_field {
                let before = rows.len();
                let deduped = dedupe_rows(rows, doc_type);
                info!(
                    rows = before,
                    kept = deduped.len(),
                    "aggregated rows across tiles"
                );
                merged.insert(field.to_string(), Value::Array(deduped));
            }
            Value::Object(merged)
        };

        if doc_type == DocType::Drawdown {
            recompute_total(&mut result);
        }

        ctx.result = Some(result);
        ctx.extractions = extractions;
        ctx.release_tile_buffers();
        Ok(())
    }
}
