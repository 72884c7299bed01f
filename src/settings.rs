//! Process-level configuration read from the environment.
//!
//! Per-request knobs live in `ExtractionOptions`; everything that is fixed
//! for the lifetime of the process (provider credentials, render
//! parameters, timeout tiers, the debug dump directory) is collected here
//! once at startup and shared behind an `Arc`.

use std::path::PathBuf;

/// Credentials and endpoint for the Azure OpenAI deployment.
#[derive(Debug, Clone)]
pub struct AzureOpenAiSettings {
    pub endpoint: String,
    pub deployment: String,
    pub api_key: String,
    pub api_version: String,
}

/// Credentials for the Azure Read OCR collaborator.
#[derive(Debug, Clone)]
pub struct AzureOcrSettings {
    pub endpoint: String,
    pub key: String,
}

/// PDF rasterisation parameters.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Rendering density in DPI.
    pub dpi: u32,
    /// JPEG quality for encoded pages (1-100).
    pub jpeg_quality: u8,
    /// Hard cap on rendered pages per document.
    pub max_pages: usize,
    /// Pages wider than this are downscaled preserving aspect ratio.
    pub max_width: u32,
    pub grayscale: bool,
    /// Histogram contrast-stretch before encoding.
    pub normalize: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            dpi: 200,
            jpeg_quality: 85,
            max_pages: 20,
            max_width: 1600,
            grayscale: true,
            normalize: true,
        }
    }
}

/// Outbound call deadlines.
///
/// Whole-document calls get the long tier; per-tile calls the short one,
/// so a stuck tile cannot eat the whole request budget.
#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    pub request_secs: u64,
    pub tile_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            request_secs: 300,
            tile_secs: 90,
        }
    }
}

/// Everything the pipeline reads from the environment.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub azure_openai: Option<AzureOpenAiSettings>,
    pub azure_ocr: Option<AzureOcrSettings>,
    pub render: RenderSettings,
    pub timeouts: TimeoutSettings,
    /// When set, tile headers and slices are dumped here as JPEG files.
    pub debug_dump_dir: Option<PathBuf>,
    /// Surface accumulated warnings on failure payloads.
    pub verbose: bool,
    /// Globally gates the validator repair loop (OCR fuzzy match + model
    /// re-verification). Off means invalid rows are only annotated.
    pub enable_reverification: bool,
}

impl Settings {
    /// Hydrate settings from environment variables. Missing provider
    /// credentials are not an error here; the pipeline fails with an
    /// unconfigured-backend error only when that provider is selected.
    pub fn from_env() -> Self {
        let azure_openai = match (
            non_empty_var("AZURE_OPENAI_ENDPOINT"),
            non_empty_var("AZURE_OPENAI_DEPLOYMENT"),
            non_empty_var("AZURE_OPENAI_API_KEY"),
        ) {
            (Some(endpoint), Some(deployment), Some(api_key)) => Some(AzureOpenAiSettings {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                deployment,
                api_key,
                api_version: non_empty_var("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|| "2024-08-01-preview".to_string()),
            }),
            _ => None,
        };

        let azure_ocr = match (non_empty_var("AZURE_OCR_ENDPOINT"), non_empty_var("AZURE_OCR_KEY"))
        {
            (Some(endpoint), Some(key)) => Some(AzureOcrSettings {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                key,
            }),
            _ => None,
        };

        let defaults = RenderSettings::default();
        let render = RenderSettings {
            dpi: parsed_var("PDF_RENDER_DPI").unwrap_or(defaults.dpi),
            jpeg_quality: parsed_var("PDF_RENDER_QUALITY").unwrap_or(defaults.jpeg_quality),
            max_pages: parsed_var("PDF_MAX_PAGES").unwrap_or(defaults.max_pages),
            max_width: parsed_var("PDF_MAX_WIDTH").unwrap_or(defaults.max_width),
            grayscale: flag_var("PDF_RENDER_GRAYSCALE").unwrap_or(defaults.grayscale),
            normalize: flag_var("PDF_RENDER_NORMALIZE").unwrap_or(defaults.normalize),
        };

        let timeout_defaults = TimeoutSettings::default();
        let timeouts = TimeoutSettings {
            request_secs: parsed_var("EXTRACT_REQUEST_TIMEOUT_SECS")
                .unwrap_or(timeout_defaults.request_secs),
            tile_secs: parsed_var("EXTRACT_TILE_TIMEOUT_SECS")
                .unwrap_or(timeout_defaults.tile_secs),
        };

        Self {
            gemini_api_key: non_empty_var("GEMINI_API_KEY"),
            openai_api_key: non_empty_var("OPENAI_API_KEY"),
            azure_openai,
            azure_ocr,
            render,
            timeouts,
            debug_dump_dir: non_empty_var("EXTRACT_DEBUG_DIR").map(PathBuf::from),
            verbose: flag_var("EXTRACT_VERBOSE").unwrap_or(false),
            enable_reverification: flag_var("EXTRACT_REVERIFY").unwrap_or(true),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_var(name).and_then(|v| v.parse().ok())
}

fn flag_var(name: &str) -> Option<bool> {
    non_empty_var(name).map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_defaults_are_sane() {
        let r = RenderSettings::default();
        assert!(r.dpi >= 150);
        assert!(r.jpeg_quality >= 70 && r.jpeg_quality <= 100);
        assert!(r.max_pages > 0);
        assert!(r.max_width >= 800);
    }

    #[test]
    fn timeout_tiers_ordered() {
        let t = TimeoutSettings::default();
        assert!(t.tile_secs < t.request_secs);
    }

    #[test]
    fn default_settings_have_no_providers() {
        let s = Settings::default();
        assert!(s.gemini_api_key.is_none());
        assert!(s.openai_api_key.is_none());
        assert!(s.azure_openai.is_none());
        assert!(s.azure_ocr.is_none());
        assert!(!s.verbose);
    }

    #[test]
    fn flag_parsing() {
        std::env::set_var("DOCUPIPE_TEST_FLAG_A", "true");
        std::env::set_var("DOCUPIPE_TEST_FLAG_B", "0");
        std::env::set_var("DOCUPIPE_TEST_FLAG_C", "");
        assert_eq!(flag_var("DOCUPIPE_TEST_FLAG_A"), Some(true));
        assert_eq!(flag_var("DOCUPIPE_TEST_FLAG_B"), Some(false));
        assert_eq!(flag_var("DOCUPIPE_TEST_FLAG_C"), None);
        assert_eq!(flag_var("DOCUPIPE_TEST_FLAG_MISSING"), None);
    }
}
