//! # edgequake-exam2json
//!
//! Decompose scanned exam papers into booklets, per-question crop regions and
//! an answer key using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! A scanned paper is a stack of page images: a cover, one or more booklets
//! whose questions flow across pages, and usually a marking scheme at the
//! back. Layout heuristics break on every new exam board. Instead this crate
//! asks a VLM to read the pages the way a marker would, then checks what it
//! returned: question numbering must be contiguous and start where the
//! booklet says it starts, and every page must come back exactly once.
//!
//! ## Pipeline Overview
//!
//! ```text
//! page images
//!  │
//!  ├─ 1. Input      local files, directories (natural order) or URLs
//!  ├─ 2. Encode     sniff format, downscale, base64 ImageData
//!  ├─ 3. Structure  one call: page kinds, booklets, header   (fatal on failure)
//!  ├─ 4. Partition  booklet page ranges + first question numbers
//!  ├─ 5. Questions  one call per booklet, validated, bounded retry ─┐ concurrent
//!  ├─ 6. Answers    one call over all answer pages ─────────────────┘
//!  └─ 7. Merge      BatchResult + DiagnosticReport + stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_exam2json::{extract_from_paths, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = extract_from_paths(&["scans/"], &config).await?;
//!     println!("{}", serde_json::to_string_pretty(&output.result)?);
//!     if !output.report.is_clean() {
//!         eprintln!("{}", output.report.summary());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Plugging in another model
//!
//! Anything that implements [`Oracle`] can stand in for the LLM provider:
//! a different client, a cache, or a scripted fake in tests. Pass it with
//! [`ExtractionConfigBuilder::oracle`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exam2json` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod error;
pub mod extract;
pub mod oracle;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use config::{ExtractionConfig, ExtractionConfigBuilder, RetryPolicy, MAX_VALIDATION_RETRIES};
pub use error::{ExtractError, OracleError, Stage};
pub use extract::{
    extract, extract_encoded, extract_from_paths, extract_sync, extract_to_file, extract_with_cancel,
    reextract_answer, reextract_question, write_output,
};
pub use oracle::{LabeledImage, LlmOracle, Oracle, OracleRequest, OracleTask};
pub use output::{
    AnswerEntry, BatchResult, Booklet, BookletReport, DiagnosticReport, ExtractionOutput, ExtractionStats,
    IssueKind, Page, PageResult, PaperHeader, Question, StructureResult, ValidationIssue,
};
pub use pipeline::input::{load_pages, PageImage};
pub use pipeline::single::QuestionContext;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
