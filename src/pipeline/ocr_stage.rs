//! Optional OCR pre-pass: reads every page image through the external
//! collaborator with bounded concurrency and stores the artifacts on the
//! context for the OCR-coupled branches and the repair loop.
//!
//! Nothing here is fatal. A missing collaborator skips the stage with a
//! warning; a failing page degrades to an empty artifact so page indices
//! stay aligned.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::info;

use crate::ocr::{OcrEngine, OcrPageText};

use super::types::ProcessingContext;
use super::{PipelineError, PipelineStage};

/// Separator between page texts in the joined document text.
pub const PAGE_SEPARATOR: &str = "\n\n---\n\n";

const DEFAULT_OCR_CONCURRENCY: usize = 3;

pub struct OcrStage {
    engine: Arc<dyn OcrEngine>,
}

impl OcrStage {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PipelineStage for OcrStage {
    fn name(&self) -> &'static str {
        "ocr"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        if !self.engine.is_configured() {
            ctx.warn("OCR requested but the collaborator is not configured; skipping pre-pass");
            return Ok(());
        }

        let concurrency = ctx
            .request
            .options
            .ocr_concurrency
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_OCR_CONCURRENCY);
        let language = ctx.request.options.ocr_language.clone();

        let engine = self.engine.clone();
        let results: Vec<Result<OcrPageText, crate::ocr::OcrError>> =
            stream::iter(ctx.images.iter().cloned().enumerate().map(|(index, image)| {
                let engine = engine.clone();
                let language = language.clone();
                async move {
                    let result = engine.read_page(&image, language.as_deref()).await;
                    (index, result)
                }
            }))
            .buffered(concurrency)
            .map(|(_, result)| result)
            .collect()
            .await;

        let mut pages = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(page) => pages.push(page),
                Err(e) => {
                    ctx.warn(format!("OCR failed for page {index}: {e}"));
                    pages.push(OcrPageText::default());
                }
            }
        }

        let read_any = pages.iter().any(|p| !p.text.is_empty());
        if read_any {
            let joined = pages
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(PAGE_SEPARATOR);
            info!(
                pages = pages.len(),
                words = pages.iter().map(|p| p.word_count).sum::<usize>(),
                "OCR pre-pass complete"
            );
            ctx.metadata.ocr_text = Some(joined);
        } else {
            ctx.warn("OCR produced no text for any page");
        }
        ctx.metadata.ocr_pages = pages;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::MockOcr;
    use crate::pipeline::types::{ExtractionOptions, ExtractionRequest, PipelineMode};
    use crate::schema::DocType;
    use serde_json::json;

    fn ctx_with_pages(count: usize) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(ExtractionRequest::new(
            vec![1],
            "application/pdf",
            DocType::Drawdown,
            json!({}),
            ExtractionOptions {
                pipeline_mode: PipelineMode::OcrEnhanced,
                ..Default::default()
            },
        ));
        ctx.images = (0..count).map(|i| vec![i as u8]).collect();
        ctx
    }

    #[tokio::test]
    async fn reads_all_pages_in_order() {
        let stage = OcrStage::new(Arc::new(MockOcr::new(&["alpha", "beta", "gamma"])));
        let mut ctx = ctx_with_pages(3);
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.metadata.ocr_pages.len(), 3);
        assert_eq!(ctx.metadata.ocr_pages[0].text, "alpha");
        assert_eq!(ctx.metadata.ocr_pages[2].text, "gamma");
        assert_eq!(
            ctx.metadata.ocr_text.as_deref(),
            Some("alpha\n\n---\n\nbeta\n\n---\n\ngamma")
        );
        assert!(ctx.warnings.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_engine_skips_with_warning() {
        let stage = OcrStage::new(Arc::new(MockOcr::unconfigured()));
        let mut ctx = ctx_with_pages(2);
        stage.run(&mut ctx).await.unwrap();

        assert!(ctx.metadata.ocr_text.is_none());
        assert!(ctx.metadata.ocr_pages.is_empty());
        assert_eq!(ctx.warnings.len(), 1);
        assert!(ctx.warnings[0].contains("not configured"));
    }

    #[tokio::test]
    async fn failing_pages_degrade_to_warnings() {
        let stage = OcrStage::new(Arc::new(MockOcr::failing()));
        let mut ctx = ctx_with_pages(2);
        stage.run(&mut ctx).await.unwrap();

        // One warning per page plus the no-text summary
        assert_eq!(ctx.metadata.ocr_pages.len(), 2);
        assert!(ctx.metadata.ocr_text.is_none());
        assert!(ctx.warnings.len() >= 2);
        assert!(ctx.error.is_none());
    }
}
