//! Google Gemini backend.
//!
//! Talks to the `generativelanguage.googleapis.com` generateContent
//! endpoint with the API key in the query string. Gemini is the one
//! backend that accepts whole documents natively: PDF bytes travel as an
//! `inline_data` part, so tiling can be skipped entirely for that path.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::schema::{strict_schema, DocType};
use crate::settings::Settings;

use super::{
    client_pair, parse_model_json, transport_error, BackendError, BackendReply, CallOptions,
    ContentPart, ModelBackend, ProviderKind,
};

const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiBackend {
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
    client_tile: reqwest::Client,
    request_secs: u64,
    tile_secs: u64,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "responseId")]
    response_id: Option<String>,
    error: Option<GeminiApiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiApiError {
    message: String,
}

impl GeminiBackend {
    pub fn new(settings: &Settings) -> Self {
        let (client, client_tile) = client_pair(settings);
        Self {
            api_key: settings.gemini_api_key.clone(),
            model: DEFAULT_MODEL.to_string(),
            client,
            client_tile,
            request_secs: settings.timeouts.request_secs,
            tile_secs: settings.timeouts.tile_secs,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn api_key(&self) -> Result<&str, BackendError> {
        self.api_key.as_deref().ok_or_else(|| {
            BackendError::Unconfigured("gemini", "GEMINI_API_KEY not set".to_string())
        })
    }

    async fn send(
        &self,
        request: &GeminiRequest,
        opts: &CallOptions,
    ) -> Result<BackendReply, BackendError> {
        let api_key = self.api_key()?;
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, api_key
        );

        let (client, deadline) = if opts.use_tile_timeout {
            (&self.client_tile, self.tile_secs)
        } else {
            (&self.client, self.request_secs)
        };

        let response = client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Transport {
                status: Some(status.as_u16()),
                message: truncate(&body, 300),
            });
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(format!("malformed Gemini envelope: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(BackendError::Transport {
                status: None,
                message: error.message,
            });
        }

        let text = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| BackendError::Parse("Gemini returned no candidates".to_string()))?;

        let data = parse_model_json(&text)?;
        Ok(BackendReply {
            data,
            response_id: parsed.response_id,
        })
    }

    fn generation_config(&self, schema: Option<&Value>, enforce: bool) -> GeminiGenerationConfig {
        let (mime, response_schema) = if enforce {
            (
                Some("application/json".to_string()),
                schema.map(strict_schema),
            )
        } else {
            (None, None)
        };
        GeminiGenerationConfig {
            temperature: 0.1,
            max_output_tokens: 8192,
            response_mime_type: mime,
            response_schema,
        }
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn supports_native_files(&self) -> bool {
        true
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
        let wire_parts = parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => GeminiPart::Text { text: text.clone() },
                ContentPart::Image { mime, data } => GeminiPart::InlineData {
                    inline_data: GeminiInlineData {
                        mime_type: (*mime).to_string(),
                        data: base64::engine::general_purpose::STANDARD.encode(data),
                    },
                },
            })
            .collect();

        debug!(
            doc_type = %doc_type,
            parts = parts.len(),
            enforce = enforce_schema,
            "Gemini extraction call"
        );

        let request = GeminiRequest {
            contents: vec![GeminiContent { parts: wire_parts }],
            system_instruction: Some(GeminiContent {
                parts: vec![GeminiPart::Text {
                    text: instructions.to_string(),
                }],
            }),
            generation_config: self.generation_config(schema, enforce_schema),
        };

        self.send(&request, opts).await
    }

    async fn extract_native(
        &self,
        file: &[u8],
        mime_type: &str,
        instructions: &str,
        opts: &CallOptions,
    ) -> Result<BackendReply, BackendError> {
        debug!(mime = mime_type, bytes = file.len(), "Gemini native-file call");

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![
                    GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: mime_type.to_string(),
                            data: base64::engine::general_purpose::STANDARD.encode(file),
                        },
                    },
                    GeminiPart::Text {
                        text: instructions.to_string(),
                    },
                ],
            }],
            system_instruction: None,
            generation_config: self.generation_config(None, false),
        };

        self.send(&request, opts).await
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
