//! Model backend adapters.
//!
//! The pipeline talks to every provider through [`ModelBackend`]: an ordered
//! list of typed content parts in, a parsed JSON object out. Adapters differ
//! only in transport (auth header shape, URL layout, wire body); the
//! pipeline never branches on provider identity except to choose the
//! image-vs-native payload path.

mod azure;
mod gemini;
mod openai;

pub use azure::AzureOpenAiBackend;
pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::schema::DocType;
use crate::settings::Settings;

/// Which provider an extraction call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure-openai")]
    AzureOpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::AzureOpenAi => "azure-openai",
        }
    }
}

/// One element of the ordered request payload.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    /// Raw image bytes plus their MIME type; adapters base64-encode as
    /// their wire format requires.
    Image { mime: &'static str, data: Vec<u8> },
}

impl ContentPart {
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self::Image {
            mime: "image/jpeg",
            data,
        }
    }
}

/// Successful adapter reply.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub data: Value,
    pub response_id: Option<String>,
}

/// Per-call knobs the dispatcher controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Use the short per-tile deadline instead of the whole-request one.
    pub use_tile_timeout: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} backend is not configured: {1}")]
    Unconfigured(&'static str, String),

    #[error("backend transport error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("backend response was not valid JSON: {0}")]
    Parse(String),

    #[error("backend call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Transport failures and timeouts are worth retrying inside the
    /// parallel tile dispatcher; parse and configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Adapter over one LLM provider.
///
/// Implementations must be cheap to share (`Arc`) and safe for concurrent
/// calls; the tile dispatcher fans out over a single instance.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Whether the provider accepts raw document bytes (PDF) directly.
    fn supports_native_files(&self) -> bool {
        false
    }

    /// Whether the provider offers server-side structured output.
    fn supports_structured_output(&self) -> bool {
        false
    }

    /// Run one extraction over an ordered text/image payload.
    async fn extract(
        &self,
        parts: &[ContentPart],
        instructions: &str,
        doc_type: DocType,
        schema: Option<&Value>,
        enforce_schema: bool,
        opts: &CallOptions,
    ) -> Result<BackendReply, BackendError>;

    /// Run one extraction over a raw file. Only meaningful for backends
    /// that report `supports_native_files()`.
    async fn extract_native(
        &self,
        _file: &[u8],
        _mime_type: &str,
        _instructions: &str,
        _opts: &CallOptions,
    ) -> Result<BackendReply, BackendError> {
        Err(BackendError::Unsupported(
            "native file input".to_string(),
        ))
    }
}

/// Parse a model text reply into JSON, tolerating the usual wrapping.
///
/// Tries, in order: the whole string, a ```json fenced block, and the
/// outermost brace-delimited span. Models occasionally narrate around the
/// payload even when told not to.
pub(crate) fn parse_model_json(text: &str) -> Result<Value, BackendError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let lower = trimmed.to_lowercase();
    if let Some(fence_start) = lower.find("```json") {
        let content_start = fence_start + 7;
        if let Some(fence_len) = trimmed[content_start..].find("```") {
            let inner = trimmed[content_start..content_start + fence_len].trim();
            if let Ok(value) = serde_json::from_str::<Value>(inner) {
                return Ok(value);
            }
        }
    }

    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[open..=close]) {
                return Ok(value);
            }
        }
    }

    Err(BackendError::Parse(format!(
        "no JSON object found in {} bytes of response text",
        text.len()
    )))
}

/// Build the two-tier HTTP client pair an adapter needs: one with the
/// whole-request deadline, one with the per-tile deadline.
pub(crate) fn client_pair(settings: &Settings) -> (reqwest::Client, reqwest::Client) {
    let request = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.timeouts.request_secs))
        .build()
        .expect("failed to build HTTP client");
    let tile = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.timeouts.tile_secs))
        .build()
        .expect("failed to build HTTP client");
    (request, tile)
}

/// Map a reqwest failure onto the backend error taxonomy.
pub(crate) fn transport_error(err: reqwest::Error, deadline_secs: u64) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            secs: deadline_secs,
        }
    } else {
        BackendError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// One shared adapter instance per provider kind.
///
/// Adapters are stateless with respect to a request; the contained
/// `reqwest::Client`s are safe for concurrent use, so a process-wide
/// singleton per kind is enough.
pub struct BackendFactory {
    settings: Arc<Settings>,
    gemini: OnceLock<Arc<GeminiBackend>>,
    openai: OnceLock<Arc<OpenAiBackend>>,
    azure: OnceLock<Arc<AzureOpenAiBackend>>,
    /// When set, every lookup resolves to this instance. The seam tests
    /// and embedders use to swap in scripted or instrumented backends.
    custom: std::sync::Mutex<Option<Arc<dyn ModelBackend>>>,
}

impl BackendFactory {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            gemini: OnceLock::new(),
            openai: OnceLock::new(),
            azure: OnceLock::new(),
            custom: std::sync::Mutex::new(None),
        }
    }

    /// Route every provider lookup to one shared instance.
    pub fn set_custom_backend(&self, backend: Arc<dyn ModelBackend>) {
        *self.custom.lock().unwrap() = Some(backend);
    }

    pub fn get(&self, kind: ProviderKind) -> Arc<dyn ModelBackend> {
        if let Some(custom) = self.custom.lock().unwrap().clone() {
            return custom;
        }
        match kind {
            ProviderKind::Gemini => self
                .gemini
                .get_or_init(|| Arc::new(GeminiBackend::new(&self.settings)))
                .clone(),
            ProviderKind::OpenAi => self
                .openai
                .get_or_init(|| Arc::new(OpenAiBackend::new(&self.settings)))
                .clone(),
            ProviderKind::AzureOpenAi => self
                .azure
                .get_or_init(|| Arc::new(AzureOpenAiBackend::new(&self.settings)))
                .clone(),
        }
    }
}

// ── Mock backend ──────────────────────────────────────────

/// Scripted backend for tests: pops one canned outcome per call and
/// records every payload it saw.
pub struct MockBackend {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<Value, BackendError>>>,
    calls: std::sync::Mutex<Vec<MockCall>>,
    native: bool,
    structured: bool,
}

/// What one `extract` invocation looked like, for assertions.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub text_parts: Vec<String>,
    pub image_count: usize,
    pub instructions: String,
    pub enforce_schema: bool,
    pub used_tile_timeout: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            replies: std::sync::Mutex::new(std::collections::VecDeque::new()),
            calls: std::sync::Mutex::new(Vec::new()),
            native: false,
            structured: true,
        }
    }

    pub fn with_native_files(mut self) -> Self {
        self.native = true;
        self
    }

    /// Queue a successful reply.
    pub fn push_ok(&self, data: Value) {
        self.replies.lock().unwrap().push_back(Ok(data));
    }

    /// Queue a failure.
    pub fn push_err(&self, err: BackendError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, parts: &[ContentPart], instructions: &str, enforce: bool, opts: &CallOptions) {
        let text_parts = parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        let image_count = parts
            .iter()
            .filter(|p| matches!(p, ContentPart::Image { .. }))
            .count();
        self.calls.lock().unwrap().push(MockCall {
            text_parts,
            image_count,
            instructions: instructions.to_string(),
            enforce_schema: enforce,
            used_tile_timeout: opts.use_tile_timeout,
        });
    }

    fn pop(&self) -> Result<BackendReply, BackendError> {
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(data)) => Ok(BackendReply {
                data,
                response_id: None,
            }),
            Some(Err(e)) => Err(e),
            None => Err(BackendError::Transport {
                status: None,
                message: "mock backend reply queue exhausted".to_string(),
            }),
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn supports_native_files(&self) -> bool {
        self.native
    }

    fn supports_structured_output(&self) -> bool {
        self.structured
    }

    async fn extract(
        &self,
        parts: &[ContentPart],
        instructions: &str,
        _doc_type: DocType,
        _schema: Option<&Value>,
        enforce_schema: bool,
        opts: &CallOptions,
    ) -> Result<BackendReply, BackendError> {
        self.record(parts, instructions, enforce_schema, opts);
        self.pop()
    }

    async fn extract_native(
        &self,
        file: &[u8],
        _mime_type: &str,
        instructions: &str,
        opts: &CallOptions,
    ) -> Result<BackendReply, BackendError> {
        let parts = [ContentPart::Image {
            mime: "application/pdf",
            data: file.to_vec(),
        }];
        self.record(&parts, instructions, false, opts);
        self.pop()
    }
}
