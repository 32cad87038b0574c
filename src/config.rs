//! Configuration types for exam-paper extraction.
//!
//! All pipeline behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`].

use crate::error::ExtractError;
use crate::oracle::Oracle;
use crate::pipeline::sanitize::DEFAULT_SEPARATOR;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Hard ceiling on validation retries per booklet.
pub const MAX_VALIDATION_RETRIES: u32 = 3;

/// Configuration for one extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_exam2json::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .concurrency(4)
///     .model("gpt-4.1")
///     .api_timeout_secs(120)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Number of booklet extraction tasks in flight at once. Default: 8.
    ///
    /// The answer-key task always runs alongside them and does not count
    /// against this limit.
    pub concurrency: usize,

    /// LLM model identifier, e.g. "gpt-4.1", "claude-sonnet-4-20250514".
    /// If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed oracle. Takes precedence over every provider setting.
    pub oracle: Option<Arc<dyn Oracle>>,

    /// Sampling temperature for every completion. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 16384.
    ///
    /// A booklet reply lists every question with two boundaries and two
    /// labels, so long booklets need far more room than a single page.
    pub max_tokens: usize,

    /// Retries on a transient provider failure inside one oracle call. Default: 3.
    pub transport_retries: u32,

    /// Initial transport retry delay in milliseconds (doubles each time). Default: 500.
    pub retry_backoff_ms: u64,

    /// Validation retries for booklets whose numbering is inconsistent.
    pub retry_policy: RetryPolicy,

    /// Per-oracle-call timeout in seconds. Default: 180.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Longest side of a page image after loading, in pixels. Default: 2000.
    pub max_image_pixels: u32,

    /// Replaces line breaks inside answer text and JSON strings. Default: " | ".
    pub answer_separator: String,

    /// Length of the raw-response excerpts kept in errors and reports. Default: 300.
    pub excerpt_chars: usize,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            model: None,
            provider_name: None,
            provider: None,
            oracle: None,
            temperature: 0.1,
            max_tokens: 16384,
            transport_retries: 3,
            retry_backoff_ms: 500,
            retry_policy: RetryPolicy::default(),
            api_timeout_secs: 180,
            download_timeout_secs: 120,
            max_image_pixels: 2000,
            answer_separator: DEFAULT_SEPARATOR.to_string(),
            excerpt_chars: 300,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("oracle", &self.oracle.as_ref().map(|o| o.name().to_string()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("transport_retries", &self.transport_retries)
            .field("retry_policy", &self.retry_policy)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_image_pixels", &self.max_image_pixels)
            .field("answer_separator", &self.answer_separator)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    pub(crate) fn excerpt(&self, raw: &str) -> String {
        excerpt(raw, self.excerpt_chars)
    }
}

/// First `max_chars` characters of `raw`, trimmed, with an ellipsis when cut.
pub fn excerpt(raw: &str, max_chars: usize) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.config.oracle = Some(oracle);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn transport_retries(mut self, n: u32) -> Self {
        self.config.transport_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Shorthand for setting only the validation retry count.
    pub fn validation_retries(mut self, n: u32) -> Self {
        self.config.retry_policy.max_retries = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn max_image_pixels(mut self, px: u32) -> Self {
        self.config.max_image_pixels = px.max(100);
        self
    }

    pub fn answer_separator(mut self, sep: impl Into<String>) -> Self {
        self.config.answer_separator = sep.into();
        self
    }

    pub fn excerpt_chars(mut self, n: usize) -> Self {
        self.config.excerpt_chars = n;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(ExtractError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.retry_policy.max_retries > MAX_VALIDATION_RETRIES {
            return Err(ExtractError::InvalidConfig(format!(
                "Validation retries must be 0–{}, got {}",
                MAX_VALIDATION_RETRIES, c.retry_policy.max_retries
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(ExtractError::InvalidConfig("API timeout must be ≥ 1s".into()));
        }
        if c.answer_separator.contains(['\n', '\r']) {
            return Err(ExtractError::InvalidConfig(
                "Answer separator must not contain line breaks".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────

/// Bounded retry policy for booklets that fail numbering validation.
///
/// Each retry resends the booklet with the previous reply and a list of the
/// problems found. The loop stops at the first clean result or after
/// `max_retries` extra calls, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Extra calls after the first attempt. Default: 1, at most 3.
    pub max_retries: u32,
    /// Pause before each retry, in milliseconds. Default: 0.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
        }
    }

    /// Retry count with the ceiling applied.
    pub fn effective_retries(&self) -> u32 {
        self.max_retries.min(MAX_VALIDATION_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.concurrency, 8);
        assert_eq!(c.max_tokens, 16384);
        assert_eq!(c.retry_policy.max_retries, 1);
        assert_eq!(c.api_timeout_secs, 180);
        assert_eq!(c.answer_separator, " | ");
    }

    #[test]
    fn builder_clamps_concurrency_and_temperature() {
        let c = ExtractionConfig::builder()
            .concurrency(0)
            .temperature(5.0)
            .build()
            .unwrap();
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn too_many_validation_retries_is_rejected() {
        let err = ExtractionConfig::builder().validation_retries(4).build().unwrap_err();
        assert!(matches!(err, ExtractError::InvalidConfig(_)));
        assert!(ExtractionConfig::builder().validation_retries(3).build().is_ok());
    }

    #[test]
    fn separator_with_newline_is_rejected() {
        let err = ExtractionConfig::builder().answer_separator("\n").build().unwrap_err();
        assert!(matches!(err, ExtractError::InvalidConfig(_)));
    }

    #[test]
    fn effective_retries_is_capped() {
        let p = RetryPolicy {
            max_retries: 10,
            backoff_ms: 0,
        };
        assert_eq!(p.effective_retries(), MAX_VALIDATION_RETRIES);
        assert_eq!(RetryPolicy::none().effective_retries(), 0);
    }

    #[test]
    fn excerpt_cuts_on_char_boundary() {
        assert_eq!(excerpt("  short  ", 10), "short");
        assert_eq!(excerpt("ééééé", 3), "ééé…");
    }

    #[test]
    fn debug_hides_provider() {
        let c = ExtractionConfig::default();
        let s = format!("{c:?}");
        assert!(s.contains("concurrency: 8"));
    }
}
