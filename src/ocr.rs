//! OCR collaborator interface and the Azure Read adapter.
//!
//! OCR is an optional pre-pass: its absence is never fatal to the pipeline
//! as a whole, so the engine reports configuration state up front and the
//! stage decides whether to run.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::settings::{AzureOcrSettings, Settings};

/// Text read from a single page image.
#[derive(Debug, Clone, Default)]
pub struct OcrPageText {
    pub text: String,
    /// Mean word confidence, 0..1.
    pub confidence: f32,
    pub word_count: usize,
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR collaborator is not configured: {0}")]
    Unconfigured(String),

    #[error("OCR transport error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("OCR response could not be parsed: {0}")]
    Parse(String),
}

/// External OCR collaborator.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Whether the collaborator can be called at all. An unconfigured
    /// engine makes OCR-dependent stages self-skip.
    fn is_configured(&self) -> bool;

    /// Read one page image; `language` is a hint, not a constraint.
    async fn read_page(
        &self,
        image: &[u8],
        language: Option<&str>,
    ) -> Result<OcrPageText, OcrError>;
}

// ── Azure Read ────────────────────────────────────────────

const API_VERSION: &str = "2023-10-01";

/// Azure AI Vision Read adapter.
pub struct AzureReadOcr {
    config: Option<AzureOcrSettings>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(rename = "readResult")]
    read_result: Option<ReadResult>,
}

#[derive(Debug, Deserialize)]
struct ReadResult {
    blocks: Vec<ReadBlock>,
}

#[derive(Debug, Deserialize)]
struct ReadBlock {
    lines: Vec<ReadLine>,
}

#[derive(Debug, Deserialize)]
struct ReadLine {
    text: String,
    #[serde(default)]
    words: Vec<ReadWord>,
}

#[derive(Debug, Deserialize)]
struct ReadWord {
    #[serde(default)]
    confidence: f32,
}

impl AzureReadOcr {
    pub fn new(settings: &Settings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            config: settings.azure_ocr.clone(),
            client,
        }
    }
}

#[async_trait]
impl OcrEngine for AzureReadOcr {
    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    async fn read_page(
        &self,
        image: &[u8],
        language: Option<&str>,
    ) -> Result<OcrPageText, OcrError> {
        let config = self.config.as_ref().ok_or_else(|| {
            OcrError::Unconfigured("AZURE_OCR_ENDPOINT / AZURE_OCR_KEY not set".to_string())
        })?;

        let mut url = format!(
            "{}/computervision/imageanalysis:analyze?api-version={}&features=read",
            config.endpoint, API_VERSION
        );
        if let Some(lang) = language {
            url.push_str("&language=");
            url.push_str(lang);
        }

        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &config.key)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| OcrError::Transport {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Transport {
                status: Some(status.as_u16()),
                message: body.chars().take(300).collect(),
            });
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| OcrError::Parse(e.to_string()))?;

        let page = collect_read_result(parsed);
        debug!(
            words = page.word_count,
            confidence = page.confidence,
            "OCR page read"
        );
        Ok(page)
    }
}

fn collect_read_result(response: AnalyzeResponse) -> OcrPageText {
    let mut lines = Vec::new();
    let mut confidence_sum = 0.0f64;
    let mut word_count = 0usize;

    if let Some(read) = response.read_result {
        for block in read.blocks {
            for line in block.lines {
                for word in &line.words {
                    confidence_sum += word.confidence as f64;
                    word_count += 1;
                }
                lines.push(line.text);
            }
        }
    }

    let confidence = if word_count > 0 {
        (confidence_sum / word_count as f64) as f32
    } else {
        0.0
    };

    OcrPageText {
        text: lines.join("\n"),
        confidence,
        word_count,
    }
}

// ── Mock ──────────────────────────────────────────────────

/// Scripted OCR engine for tests: returns one canned page per call, in
/// order, cycling when exhausted.
pub struct MockOcr {
    pages: Vec<OcrPageText>,
    cursor: std::sync::Mutex<usize>,
    configured: bool,
    fail: bool,
}

impl MockOcr {
    pub fn new(texts: &[&str]) -> Self {
        Self {
            pages: texts
                .iter()
                .map(|t| OcrPageText {
                    text: t.to_string(),
                    confidence: 0.9,
                    word_count: t.split_whitespace().count(),
                })
                .collect(),
            cursor: std::sync::Mutex::new(0),
            configured: true,
            fail: false,
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            pages: Vec::new(),
            cursor: std::sync::Mutex::new(0),
            configured: false,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            pages: Vec::new(),
            cursor: std::sync::Mutex::new(0),
            configured: true,
            fail: true,
        }
    }
}

#[async_trait]
impl OcrEngine for MockOcr {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn read_page(
        &self,
        _image: &[u8],
        _language: Option<&str>,
    ) -> Result<OcrPageText, OcrError> {
        if self.fail {
            return Err(OcrError::Transport {
                status: Some(500),
                message: "mock OCR failure".to_string(),
            });
        }
        if self.pages.is_empty() {
            return Ok(OcrPageText::default());
        }
        let mut cursor = self.cursor.lock().unwrap();
        let page = self.pages[*cursor % self.pages.len()].clone();
        *cursor += 1;
        Ok(page)
    }
}
