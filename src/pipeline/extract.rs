//! The image extraction branch: per-tile model calls with three dispatch
//! modes.
//!
//! - a lone tile goes out directly on the long deadline and a failure is
//!   fatal;
//! - sequential mode walks tiles one by one on the short deadline,
//!   dropping failures with a warning;
//! - parallel mode processes batches of `max_concurrency` tiles, retrying
//!   each tile with exponential backoff before giving it up, and pauses
//!   between batches to stay under upstream per-minute quotas.
//!
//! Rows are stamped with their source tile indices so aggregation can
//! restore order and deduplicate across the overlap.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::backends::{BackendError, CallOptions, ContentPart, ModelBackend};
use crate::prompts::{self, TILE_LEAD_IN};

use super::types::{ExtractionOutput, ProcessingContext, Tile};
use super::{PipelineError, PipelineStage};

pub(crate) const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub(crate) const DEFAULT_RETRY_ATTEMPTS: u32 = 2;
const INTER_BATCH_PAUSE_MS: u64 = 500;

/// Stamp every row of the doc-type array field with its source tile.
/// The markers are internal back-references into the tile arena and are
/// stripped again before the result leaves the pipeline.
pub fn tag_rows(data: &mut Value, array_field: Option<&str>, tile: &Tile) {
    let Some(field) = array_field else {
        return;
    };
    let Some(rows) = data.get_mut(field).and_then(Value::as_array_mut) else {
        return;
    };
    for row in rows {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("_tileIndex".into(), tile.global_index.into());
            obj.insert("_pageIndex".into(), tile.page_index.into());
            obj.insert("_sliceIndex".into(), tile.slice_index.into());
        }
    }
}

pub struct ExtractStage {
    backend: Arc<dyn ModelBackend>,
}

impl ExtractStage {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }

    async fn call_tile(
        &self,
        tile: &Tile,
        instructions: &str,
        ctx: &ProcessingContext,
        opts: &CallOptions,
    ) -> Result<ExtractionOutput, BackendError> {
        let mut parts = Vec::with_capacity(3);
        parts.push(ContentPart::Text(TILE_LEAD_IN.to_string()));
        parts.extend(tile.payload());

        let enforce = ctx.request.options.enforce_json_schema
            && self.backend.supports_structured_output();

        let reply = self
            .backend
            .extract(
                &parts,
                instructions,
                ctx.doc_type(),
                Some(ctx.request.effective_schema()),
                enforce,
                opts,
            )
            .await?;

        let mut data = reply.data;
        tag_rows(&mut data, ctx.doc_type().array_field(), tile);

        Ok(ExtractionOutput {
            data,
            response_id: reply.response_id,
            tile_index: Some(tile.global_index),
        })
    }

    /// One tile with retries; the k-th retry waits `2^k` seconds first.
    async fn call_tile_with_retries(
        &self,
        tile: &Tile,
        instructions: &str,
        ctx: &ProcessingContext,
        retry_attempts: u32,
    ) -> Result<ExtractionOutput, BackendError> {
        let opts = CallOptions {
            use_tile_timeout: true,
        };
        let mut last_err: Option<BackendError> = None;

        for attempt in 0..=retry_attempts {
            if attempt > 0 {
                let backoff_secs = 2u64.pow(attempt);
                warn!(
                    tile = tile.global_index,
                    attempt,
                    backoff_secs,
                    "retrying tile after backoff"
                );
                sleep(Duration::from_secs(backoff_secs)).await;
            }

            match self.call_tile(tile, instructions, ctx, &opts).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < retry_attempts => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(BackendError::Transport {
            status: None,
            message: "tile retries exhausted".to_string(),
        }))
    }
}

#[async_trait]
impl PipelineStage for ExtractStage {
    fn name(&self) -> &'static str {
        "extract"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        if ctx.tiles.is_empty() {
            return Err(PipelineError::BadRequest(
                "no tiles to extract from".to_string(),
            ));
        }

        let instructions = prompts::build_instructions(
            ctx.doc_type(),
            ctx.request.effective_schema(),
            ctx.request.options.custom_prompt.as_deref(),
            ctx.request.options.enforce_json_schema,
        );

        let tiles = std::mem::take(&mut ctx.tiles);
        let mut outputs = Vec::with_capacity(tiles.len());
        let mut dropped: Vec<String> = Vec::new();

        if tiles.len() == 1 {
            // Whole document in one call; a failure here is fatal.
            let opts = CallOptions {
                use_tile_timeout: false,
            };
            let output = self.call_tile(&tiles[0], &instructions, ctx, &opts).await?;
            outputs.push(output);
        } else if !ctx.request.options.parallel_mode {
            for tile in &tiles {
                let opts = CallOptions {
                    use_tile_timeout: true,
                };
                match self.call_tile(tile, &instructions, ctx, &opts).await {
                    Ok(output) => outputs.push(output),
                    Err(e) => dropped.push(format!("tile {} failed: {e}", tile.global_index)),
                }
            }
        } else {
            let batch_size = ctx
                .request
                .options
                .max_concurrency
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENCY);

            let batch_count = tiles.len().div_ceil(batch_size);
            for (batch_index, batch) in tiles.chunks(batch_size).enumerate() {
                let in_flight = batch.iter().map(|tile| {
                    self.call_tile_with_retries(tile, &instructions, ctx, DEFAULT_RETRY_ATTEMPTS)
                });
                // The batch settles as a unit before the next one starts.
                let results = futures::future::join_all(in_flight).await;

                for (tile, result) in batch.iter().zip(results) {
                    match result {
                        Ok(output) => outputs.push(output),
                        Err(e) => {
                            dropped.push(format!("tile {} failed: {e}", tile.global_index))
                        }
                    }
                }

                if batch_index + 1 < batch_count {
                    sleep(Duration::from_millis(INTER_BATCH_PAUSE_MS)).await;
                }
            }
        }

        for message in dropped {
            ctx.warn(message);
        }

        if outputs.is_empty() {
            return Err(BackendError::Transport {
                status: None,
                message: format!("all {} tiles failed extraction", tiles.len()),
            }
            .into());
        }

        info!(
            tiles = tiles.len(),
            extracted = outputs.len(),
            "extraction complete"
        );
        ctx.metadata.tiles_extracted = outputs.len();
        ctx.extractions = outputs;
        ctx.tiles = tiles;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockBackend;
    use crate::pipeline::types::{ExtractionOptions, ExtractionRequest};
    use crate::schema::DocType;
    use serde_json::json;

    fn tile(global: usize, page: usize, slice: usize) -> Tile {
        Tile {
            page_index: page,
            slice_index: slice,
            global_index: global,
            raw_header: Some(vec![0xAA]),
            raw_slice: vec![0xBB],
            is_tiled: true,
        }
    }

    fn ctx_with_tiles(tiles: Vec<Tile>, options: ExtractionOptions) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(ExtractionRequest::new(
            vec![1],
            "application/pdf",
            DocType::Drawdown,
            crate::schema::registry_schema(DocType::Drawdown),
            options,
        ));
        ctx.tiles = tiles;
        ctx
    }

    fn row(invoice: &str) -> Value {
        json!({"invoiceNumber": invoice, "variableSymbol": "1", "amount": 1.0, "iban": "SK00"})
    }

    #[test]
    fn tag_rows_stamps_markers() {
        let mut data = json!({"drawdowns": [row("A"), row("B")], "totalSum": 2.0});
        tag_rows(&mut data, Some("drawdowns"), &tile(7, 1, 2));

        for r in data["drawdowns"].as_array().unwrap() {
            assert_eq!(r["_tileIndex"], 7);
            assert_eq!(r["_pageIndex"], 1);
            assert_eq!(r["_sliceIndex"], 2);
        }
        // Non-array fields untouched
        assert_eq!(data["totalSum"], 2.0);
    }

    #[test]
    fn tag_rows_without_array_field_is_noop() {
        let mut data = json!({"contractNumber": "C-1"});
        tag_rows(&mut data, None, &tile(0, 0, 0));
        assert_eq!(data, json!({"contractNumber": "C-1"}));
    }

    #[tokio::test]
    async fn single_tile_uses_long_timeout_and_fails_fatally() {
        let backend = Arc::new(MockBackend::new());
        backend.push_ok(json!({"drawdowns": [row("A")]}));

        let stage = ExtractStage::new(backend.clone());
        let mut ctx = ctx_with_tiles(vec![tile(0, 0, 0)], ExtractionOptions::default());
        stage.run(&mut ctx).await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].used_tile_timeout);
        assert_eq!(ctx.extractions.len(), 1);

        // Same shape, but the only call fails → stage is fatal
        let backend = Arc::new(MockBackend::new());
        backend.push_err(BackendError::Parse("junk".into()));
        let stage = ExtractStage::new(backend);
        let mut ctx = ctx_with_tiles(vec![tile(0, 0, 0)], ExtractionOptions::default());
        assert!(stage.run(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn sequential_mode_drops_failed_tiles_with_warning() {
        let backend = Arc::new(MockBackend::new());
        backend.push_ok(json!({"drawdowns": [row("A")]}));
        backend.push_err(BackendError::Transport {
            status: Some(500),
            message: "boom".into(),
        });
        backend.push_ok(json!({"drawdowns": [row("C")]}));

        let stage = ExtractStage::new(backend.clone());
        let mut ctx = ctx_with_tiles(
            vec![tile(0, 0, 0), tile(1, 0, 1), tile(2, 0, 2)],
            ExtractionOptions {
                parallel_mode: false,
                ..Default::default()
            },
        );
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.extractions.len(), 2);
        assert_eq!(ctx.warnings.len(), 1);
        assert!(ctx.warnings[0].contains("tile 1"));
        assert!(backend.calls().iter().all(|c| c.used_tile_timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_retry_succeeds_on_second_attempt_after_backoff() {
        let backend = Arc::new(MockBackend::new());
        // Batch of one: first attempt 500s, retry succeeds
        backend.push_err(BackendError::Transport {
            status: Some(500),
            message: "server error".into(),
        });
        backend.push_ok(json!({"drawdowns": [row("A")]}));

        let stage = ExtractStage::new(backend.clone());
        let mut ctx = ctx_with_tiles(
            vec![tile(0, 0, 0), tile(1, 0, 1)],
            ExtractionOptions {
                max_concurrency: Some(1),
                ..Default::default()
            },
        );
        // Second tile succeeds immediately
        backend.push_ok(json!({"drawdowns": [row("B")]}));

        let started = tokio::time::Instant::now();
        stage.run(&mut ctx).await.unwrap();

        // 2s first-retry backoff must have elapsed (virtual time)
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(ctx.extractions.len(), 2);
        // Exactly one extra attempt: 3 calls for 2 tiles
        assert_eq!(backend.call_count(), 3);
        // Retried tile contributed exactly once
        let from_tile_0 = ctx
            .extractions
            .iter()
            .filter(|o| o.tile_index == Some(0))
            .count();
        assert_eq!(from_tile_0, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_exhausted_retries_drop_tile() {
        let backend = Arc::new(MockBackend::new());
        for _ in 0..=DEFAULT_RETRY_ATTEMPTS {
            backend.push_err(BackendError::Transport {
                status: Some(503),
                message: "overloaded".into(),
            });
        }
        backend.push_ok(json!({"drawdowns": [row("B")]}));

        let stage = ExtractStage::new(backend.clone());
        let mut ctx = ctx_with_tiles(
            vec![tile(0, 0, 0), tile(1, 0, 1)],
            ExtractionOptions {
                max_concurrency: Some(1),
                ..Default::default()
            },
        );
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.extractions.len(), 1);
        assert_eq!(ctx.extractions[0].tile_index, Some(1));
        assert_eq!(ctx.warnings.len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let backend = Arc::new(MockBackend::new());
        backend.push_err(BackendError::Parse("not json".into()));
        backend.push_ok(json!({"drawdowns": [row("B")]}));

        let stage = ExtractStage::new(backend.clone());
        let mut ctx = ctx_with_tiles(
            vec![tile(0, 0, 0), tile(1, 0, 1)],
            ExtractionOptions::default(),
        );
        stage.run(&mut ctx).await.unwrap();

        // Parse error consumed no retries: 2 calls total
        assert_eq!(backend.call_count(), 2);
        assert_eq!(ctx.extractions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_tiles_failing_is_fatal() {
        let backend = Arc::new(MockBackend::new());
        for _ in 0..((DEFAULT_RETRY_ATTEMPTS as usize + 1) * 2) {
            backend.push_err(BackendError::Transport {
                status: Some(500),
                message: "down".into(),
            });
        }

        let stage = ExtractStage::new(backend);
        let mut ctx = ctx_with_tiles(
            vec![tile(0, 0, 0), tile(1, 0, 1)],
            ExtractionOptions::default(),
        );
        let err = stage.run(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("all 2 tiles failed"));
    }

    #[tokio::test]
    async fn rows_carry_tile_markers_after_dispatch() {
        let backend = Arc::new(MockBackend::new());
        backend.push_ok(json!({"drawdowns": [row("A")]}));
        backend.push_ok(json!({"drawdowns": [row("B")]}));

        let stage = ExtractStage::new(backend);
        let mut ctx = ctx_with_tiles(
            vec![tile(0, 0, 0), tile(1, 0, 1)],
            ExtractionOptions {
                max_concurrency: Some(2),
                ..Default::default()
            },
        );
        stage.run(&mut ctx).await.unwrap();

        for output in &ctx.extractions {
            let rows = output.data["drawdowns"].as_array().unwrap();
            for r in rows {
                assert_eq!(r["_tileIndex"], output.tile_index.unwrap());
                assert_eq!(r["_pageIndex"], 0);
            }
        }
    }

    #[tokio::test]
    async fn instructions_and_payload_shape() {
        let backend = Arc::new(MockBackend::new());
        backend.push_ok(json!({"drawdowns": []}));

        let stage = ExtractStage::new(backend.clone());
        let mut ctx = ctx_with_tiles(vec![tile(0, 0, 0)], ExtractionOptions::default());
        stage.run(&mut ctx).await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls[0].text_parts, vec![TILE_LEAD_IN.to_string()]);
        // Header + slice
        assert_eq!(calls[0].image_count, 2);
        assert!(calls[0].enforce_schema);
        assert!(!calls[0].instructions.is_empty());
    }
}
