//! Azure OpenAI backend.
//!
//! Identical request body to the OpenAI adapter; only the transport
//! differs: the deployment-scoped URL with an `api-version` query, and an
//! `api-key` header instead of a bearer token. The model is fixed by the
//! deployment, so the body omits it.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::schema::DocType;
use crate::settings::{AzureOpenAiSettings, Settings};

use super::openai::{build_chat_request, reply_from_chat, ChatResponse};
use super::{
    client_pair, transport_error, BackendError, BackendReply, CallOptions, ContentPart,
    ModelBackend, ProviderKind,
};

pub struct AzureOpenAiBackend {
    config: Option<AzureOpenAiSettings>,
    client: reqwest::Client,
    client_tile: reqwest::Client,
    request_secs: u64,
    tile_secs: u64,
}

impl AzureOpenAiBackend {
    pub fn new(settings: &Settings) -> Self {
        let (client, client_tile) = client_pair(settings);
        Self {
            config: settings.azure_openai.clone(),
            client,
            client_tile,
            request_secs: settings.timeouts.request_secs,
            tile_secs: settings.timeouts.tile_secs,
        }
    }

    fn config(&self) -> Result<&AzureOpenAiSettings, BackendError> {
        self.config.as_ref().ok_or_else(|| {
            BackendError::Unconfigured(
                "azure-openai",
                "AZURE_OPENAI_ENDPOINT / AZURE_OPENAI_DEPLOYMENT / AZURE_OPENAI_API_KEY not set"
                    .to_string(),
            )
        })
    }

    fn url(config: &AzureOpenAiSettings) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            config.endpoint, config.deployment, config.api_version
        )
    }
}

#[async_trait]
impl ModelBackend for AzureOpenAiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureOpenAi
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    async fn extract(
        &self,
        parts: &[ContentPart],
        instructions: &str,
        doc_type: DocType,
        schema: Option<&Value>,
        enforce_schema: bool,
        opts: &CallOptions,
    ) -> Result<BackendReply, BackendError> {
        let config = self.config()?;

        // Deployment decides the model; body carries none.
        let request =
            build_chat_request(None, parts, instructions, doc_type, schema, enforce_schema);

        debug!(
            doc_type = %doc_type,
            deployment = %config.deployment,
            parts = parts.len(),
            "Azure OpenAI extraction call"
        );

        let (client, deadline) = if opts.use_tile_timeout {
            (&self.client_tile, self.tile_secs)
        } else {
            (&self.client, self.request_secs)
        };

        let response = client
            .post(Self::url(config))
            .header("api-key", &config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Transport {
                status: Some(status.as_u16()),
                message: body.chars().take(300).collect(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(format!("malformed chat envelope: {e}")))?;

        reply_from_chat(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_layout() {
        let config = AzureOpenAiSettings {
            endpoint: "https://acme.openai.azure.com".into(),
            deployment: "gpt4o-extract".into(),
            api_key: "k".into(),
            api_version: "2024-08-01-preview".into(),
        };
        assert_eq!(
            AzureOpenAiBackend::url(&config),
            "https://acme.openai.azure.com/openai/deployments/gpt4o-extract/chat/completions?api-version=2024-08-01-preview"
        );
    }

    #[tokio::test]
    async fn unconfigured_fails_before_network() {
        let b = AzureOpenAiBackend::new(&Settings::default());
        let err = b
            .extract(
                &[ContentPart::Text("x".into())],
                "do",
                DocType::Invoice,
                None,
                true,
                &CallOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unconfigured("azure-openai", _)));
    }

    #[test]
    fn no_native_file_support() {
        let b = AzureOpenAiBackend::new(&Settings::default());
        assert!(!b.supports_native_files());
        assert!(b.supports_structured_output());
    }
}
