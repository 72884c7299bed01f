//! # docupipe
//!
//! Structured data extraction from financial documents (invoices, bank
//! statements, loan contracts, drawdown schedules) by orchestrating
//! multimodal LLM backends.
//!
//! The model call is the easy part. This crate is the pipeline around it:
//!
//! ```text
//! bytes ──▶ preprocess ──▶ [ocr] ──▶ [tiling] ──▶ extract ──▶ aggregate ──▶ validate ──▶ cleanup
//!           (pdfium,        (Azure    (header +    (parallel    (dedup,       (MOD-97 +     (strip
//!            normalise)      Read)     slices)      + retry)     totals)       repair)       markers)
//! ```
//!
//! - PDF pages are rasterised, width-clamped, grayscaled and
//!   contrast-normalised before anything touches a model.
//! - Tall table pages are cut into overlapping slices, each sent together
//!   with the page header so the model never loses column semantics.
//! - Tiles go out in bounded-concurrency batches with per-tile deadlines
//!   and exponential-backoff retries; a failing tile lowers yield instead
//!   of failing the document.
//! - Rows are deduplicated across the slice overlap by per-type composite
//!   keys, with a MOD-97 tiebreak for drawdown IBANs.
//! - Invalid IBANs get a repair loop: fuzzy matching against candidates
//!   mined from OCR text, then a targeted second model pass that sees
//!   only the broken rows and their diagnostics.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use docupipe::{run_extraction, DocType, ExtractionOptions, ExtractionRequest, Services};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = Services::from_env();
//!     let request = ExtractionRequest::new(
//!         std::fs::read("drawdown.pdf")?,
//!         "application/pdf",
//!         DocType::Drawdown,
//!         docupipe::registry_schema(DocType::Drawdown),
//!         ExtractionOptions::default(),
//!     );
//!     let output = run_extraction(request, &services).await?;
//!     println!("{}", output.data);
//!     Ok(())
//! }
//! ```
//!
//! The HTTP surface that receives uploads, schema editing, and result
//! persistence live with the embedding service; this crate starts at
//! `ExtractionRequest` and ends at a schema-shaped JSON value.

pub mod backends;
pub mod ocr;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod settings;

pub use backends::ProviderKind;
pub use pipeline::types::{
    ExtractionOptions, ExtractionRequest, PipelineMode, ProcessingContext,
};
pub use pipeline::{
    run_extraction, ExtractionSuccess, Pipeline, PipelineError, PipelineFailure, RunSummary,
    Services, StatusClass,
};
pub use schema::{registry_schema, strict_schema, DocType};
pub use settings::Settings;
