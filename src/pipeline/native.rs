//! Native-file branch: providers that read whole PDFs skip tiling and
//! receive the original bytes, MIME type, and schema-in-prompt in a
//! single call. One call, one result, and a failure is fatal.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::backends::{CallOptions, ModelBackend};
use crate::prompts;

use super::types::{ExtractionOutput, ProcessingContext};
use super::{PipelineError, PipelineStage};

pub struct NativePdfStage {
    backend: Arc<dyn ModelBackend>,
}

impl NativePdfStage {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PipelineStage for NativePdfStage {
    fn name(&self) -> &'static str {
        "extract-native"
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<(), PipelineError> {
        // Schema always travels inside the prompt on this path.
        let instructions = prompts::build_instructions(
            ctx.doc_type(),
            ctx.request.effective_schema(),
            ctx.request.options.custom_prompt.as_deref(),
            false,
        );

        let reply = self
            .backend
            .extract_native(
                &ctx.request.file,
                &ctx.request.mime_type,
                &instructions,
                &CallOptions {
                    use_tile_timeout: false,
                },
            )
            .await?;

        info!(
            doc_type = %ctx.doc_type(),
            bytes = ctx.request.file.len(),
            "native-file extraction complete"
        );

        ctx.metadata.tiles_extracted = 1;
        ctx.extractions = vec![ExtractionOutput {
            data: reply.data,
            response_id: reply.response_id,
            tile_index: None,
        }];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendError, MockBackend};
    use crate::pipeline::types::{ExtractionOptions, ExtractionRequest};
    use crate::schema::DocType;
    use serde_json::json;

    fn ctx() -> ProcessingContext {
        ProcessingContext::new(ExtractionRequest::new(
            vec![0x25, 0x50, 0x44, 0x46],
            "application/pdf",
            DocType::LoanContract,
            crate::schema::registry_schema(DocType::LoanContract),
            ExtractionOptions::default(),
        ))
    }

    #[tokio::test]
    async fn single_call_with_schema_in_prompt() {
        let backend = Arc::new(MockBackend::new().with_native_files());
        backend.push_ok(json!({"contractNumber": "LC-77"}));

        let stage = NativePdfStage::new(backend.clone());
        let mut ctx = ctx();
        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.extractions.len(), 1);
        assert_eq!(ctx.extractions[0].data["contractNumber"], "LC-77");
        assert_eq!(ctx.extractions[0].tile_index, None);

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].instructions.contains("adhering to this schema"));
        assert!(!calls[0].used_tile_timeout);
    }

    #[tokio::test]
    async fn failure_is_fatal() {
        let backend = Arc::new(MockBackend::new().with_native_files());
        backend.push_err(BackendError::Timeout { secs: 300 });

        let stage = NativePdfStage::new(backend);
        let mut ctx = ctx();
        assert!(stage.run(&mut ctx).await.is_err());
        assert!(ctx.extractions.is_empty());
    }
}
