//! Error types for the edgequake-exam2json library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractError`] — **Fatal**: the document cannot be decomposed at all
//!   (no readable input, structure analysis failed, provider not configured).
//!   Returned as `Err(ExtractError)` from the top-level `extract*` functions.
//!
//! * [`OracleError`] — **Non-fatal**: a single oracle call failed (timeout,
//!   transient API error). Inside booklet and answer extraction it is turned
//!   into a [`crate::output::ValidationIssue`] so sibling booklets keep their
//!   results; only the structure stage escalates it to [`ExtractError::Oracle`].

use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an oracle call belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Structure,
    Questions,
    Answers,
    SingleQuestion,
    SingleAnswer,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Structure => "structure analysis",
            Stage::Questions => "question extraction",
            Stage::Answers => "answer extraction",
            Stage::SingleQuestion => "single-question re-extraction",
            Stage::SingleAnswer => "single-answer re-extraction",
        };
        f.write_str(s)
    }
}

/// All fatal errors returned by the edgequake-exam2json library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The caller supplied zero page images.
    #[error("No page images were supplied")]
    NoPages,

    /// Input file was not found at the given path.
    #[error("Page image not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is neither a readable path nor a valid HTTP/HTTPS URL.
    #[error("Invalid input '{input}': not a file, a directory, or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes are not a supported raster image format.
    #[error("'{source_name}' is not a supported page image (png, jpeg, webp)")]
    NotAnImage { source_name: String },

    /// The image format was recognised but decoding or re-encoding failed.
    #[error("Failed to process page image '{source_name}': {detail}")]
    ImageDecodeFailed { source_name: String, detail: String },

    // ── Structure analysis ────────────────────────────────────────────────
    /// The structure reply lacked one or more required arrays.
    #[error("Structure analysis response is missing required field(s): {}\nResponse excerpt: {excerpt}", fields.join(", "))]
    StructureFieldsMissing {
        fields: Vec<&'static str>,
        excerpt: String,
    },

    /// The structure reply could not be parsed at all.
    #[error("Structure analysis response could not be parsed: {detail}\nResponse excerpt: {excerpt}")]
    StructureUnparsable { detail: String, excerpt: String },

    /// The structure reply parsed but named no usable booklet.
    #[error("Structure analysis found no booklets\nResponse excerpt: {excerpt}")]
    NoBooklets { excerpt: String },

    /// A blocking oracle call failed.
    #[error("Oracle call for {stage} failed: {source}")]
    Oracle {
        stage: Stage,
        #[source]
        source: OracleError,
    },

    /// A single-question reply matched no accepted shape.
    #[error("{stage} response could not be read: {detail}\nResponse excerpt: {excerpt}")]
    ResponseUnreadable {
        stage: Stage,
        detail: String,
        excerpt: String,
    },

    /// The caller cancelled the run.
    #[error("Extraction was cancelled")]
    Cancelled,

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal failure of one oracle call.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum OracleError {
    /// The call exceeded the per-call timeout.
    #[error("oracle call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The caller's cancellation token fired while the call was in flight.
    #[error("oracle call was cancelled")]
    Cancelled,

    /// The provider returned an error (after any transport retries).
    #[error("provider error after {attempts} attempt(s): {message}")]
    Provider { attempts: u32, message: String },

    /// The provider answered with an empty body.
    #[error("oracle returned an empty response")]
    EmptyResponse,
}

impl From<OracleError> for ExtractError {
    fn from(e: OracleError) -> Self {
        match e {
            OracleError::Cancelled => ExtractError::Cancelled,
            other => ExtractError::Oracle {
                stage: Stage::Structure,
                source: other,
            },
        }
    }
}
