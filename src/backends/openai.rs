//! OpenAI backend (chat completions with vision input).
//!
//! Images travel as `image_url` data URLs; structured output uses the
//! `json_schema` response format with the strict schema derivation. The
//! Azure adapter reuses this module's wire types; the two differ only in
//! URL layout and auth header.

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

const DEFAULT_MODEL: &str = "gpt-4o";

pub struct OpenAiBackend {
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
    client_tile: reqwest::Client,
    request_secs: u64,
    tile_secs: u64,
}

// ── Wire types (shared with the Azure adapter) ────────────

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage {
    pub role: &'static str,
    pub content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum MessageContent {
    Text(String),
    Parts(Vec<UserPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum UserPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub(crate) struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum ResponseFormat {
    #[serde(rename = "json_object")]
    JsonObject,
    #[serde(rename = "json_schema")]
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSchemaFormat {
    pub name: String,
    pub strict: bool,
    pub schema: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    pub id: Option<String>,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponseMessage {
    pub content: Option<String>,
}

/// Build the chat-completions body shared by the OpenAI and Azure paths.
pub(crate) fn build_chat_request(
    model: Option<String>,
    parts: &[ContentPart],
    instructions: &str,
    doc_type: DocType,
    schema: Option<&Value>,
    enforce_schema: bool,
) -> ChatRequest {
    let user_parts = parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => UserPart::Text { text: text.clone() },
            ContentPart::Image { mime, data } => UserPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!(
                        "data:{mime};base64,{}",
                        base64::engine::general_purpose::STANDARD.encode(data)
                    ),
                },
            },
        })
        .collect();

    let response_format = match (enforce_schema, schema) {
        (true, Some(schema)) => Some(ResponseFormat::JsonSchema {
            json_schema: JsonSchemaFormat {
                name: format!("{}_extraction", doc_type.as_str()),
                strict: true,
                schema: strict_schema(schema),
            },
        }),
        (true, None) => Some(ResponseFormat::JsonObject),
        _ => None,
    };

    ChatRequest {
        model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: MessageContent::Text(instructions.to_string()),
            },
            ChatMessage {
                role: "user",
                content: MessageContent::Parts(user_parts),
            },
        ],
        temperature: 0.1,
        max_tokens: 8192,
        response_format,
    }
}

/// Turn a chat-completions reply into a parsed extraction result.
pub(crate) fn reply_from_chat(response: ChatResponse) -> Result<BackendReply, BackendError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BackendError::Parse("chat response had no choices".to_string()))?;

    let data = parse_model_json(&content)?;
    Ok(BackendReply {
        data,
        response_id: response.id,
    })
}

impl OpenAiBackend {
    pub fn new(settings: &Settings) -> Self {
        let (client, client_tile) = client_pair(settings);
        Self {
            api_key: settings.openai_api_key.clone(),
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
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            BackendError::Unconfigured("openai", "OPENAI_API_KEY not set".to_string())
        })?;

        let request = build_chat_request(
            Some(self.model.clone()),
            parts,
            instructions,
            doc_type,
            schema,
            enforce_schema,
        );

        debug!(
            doc_type = %doc_type,
            parts = parts.len(),
            enforce = enforce_schema,
            "OpenAI extraction call"
        );

        let (client, deadline) = if opts.use_tile_timeout {
            (&self.client_tile, self.tile_secs)
        } else {
            (&self.client, self.request_secs)
        };

        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
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
    use serde_json::json;

    #[test]
    fn chat_body_shape() {
        let parts = [
            ContentPart::Text("lead-in".into()),
            ContentPart::jpeg(vec![0xFF, 0xD8]),
        ];
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let req = build_chat_request(
            Some("gpt-4o".into()),
            &parts,
            "instructions",
            DocType::Drawdown,
            Some(&schema),
            true,
        );

        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "instructions");
        assert_eq!(body["messages"][1]["content"][0]["type"], "text");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
        let url = body["messages"][1]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));

        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(
            body["response_format"]["json_schema"]["name"],
            "drawdown_extraction"
        );
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn no_response_format_without_enforcement() {
        let req = build_chat_request(None, &[], "i", DocType::Invoice, None, false);
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("response_format").is_none());
        assert!(body.get("model").is_none());
    }

    #[test]
    fn reply_parsing() {
        let response = ChatResponse {
            id: Some("chatcmpl-123".into()),
            choices: vec![ChatChoice {
                message: ChatResponseMessage {
                    content: Some(r#"{"rows": [1, 2]}"#.into()),
                },
            }],
        };
        let reply = reply_from_chat(response).unwrap();
        assert_eq!(reply.response_id.as_deref(), Some("chatcmpl-123"));
        assert_eq!(reply.data["rows"], json!([1, 2]));
    }

    #[test]
    fn reply_without_choices_is_parse_error() {
        let response = ChatResponse {
            id: None,
            choices: vec![],
        };
        assert!(matches!(
            reply_from_chat(response),
            Err(BackendError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn unconfigured_key_fails_before_network() {
        let b = OpenAiBackend::new(&Settings::default());
        let err = b
            .extract(
                &[],
                "do",
                DocType::Invoice,
                None,
                true,
                &CallOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unconfigured("openai", _)));
    }
}
