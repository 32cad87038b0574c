//! The oracle capability: an image-understanding model behind a trait.
//!
//! Every pipeline stage talks to the model through [`Oracle::infer`], which
//! takes labelled page images plus an instruction and returns raw text.
//! [`LlmOracle`] implements it on top of an `edgequake-llm` provider; tests
//! plug in stub oracles that route on [`OracleTask`].
//!
//! ## Retry strategy
//!
//! Two independent retry layers exist. Transport failures (HTTP 429 / 503,
//! dropped connections) are retried inside [`LlmOracle`] with exponential
//! backoff (`retry_backoff_ms * 2^attempt`). Content problems, such as a
//! booklet with a missing question, are retried one level up by the question
//! extractor, which sends the previous reply back with feedback.
//!
//! Every call is wrapped by [`call_oracle`], which enforces the per-call
//! timeout and the caller's [`CancelToken`].

use crate::cancel::CancelToken;
use crate::config::ExtractionConfig;
use crate::error::{ExtractError, OracleError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Fallback model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// One page image tagged with its index in the original document.
#[derive(Debug, Clone)]
pub struct LabeledImage {
    pub page_index: usize,
    pub image: ImageData,
}

/// What a request is for. Lets stub oracles answer each stage differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleTask {
    Structure,
    Questions { booklet: String },
    Answers,
    SingleQuestion { question_num: String },
    SingleAnswer { question_num: String },
}

impl fmt::Display for OracleTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleTask::Structure => f.write_str("structure"),
            OracleTask::Questions { booklet } => write!(f, "questions[{booklet}]"),
            OracleTask::Answers => f.write_str("answers"),
            OracleTask::SingleQuestion { question_num } => write!(f, "question[{question_num}]"),
            OracleTask::SingleAnswer { question_num } => write!(f, "answer[{question_num}]"),
        }
    }
}

/// A previous reply and the feedback that asks for a corrected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    pub prior_response: String,
    pub feedback: String,
}

/// A complete oracle request.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub task: OracleTask,
    pub images: Vec<LabeledImage>,
    pub instruction: String,
    /// Earlier exchanges in this conversation, oldest first. Empty on a first attempt.
    pub follow_ups: Vec<FollowUp>,
}

impl OracleRequest {
    pub fn new(task: OracleTask, images: Vec<LabeledImage>, instruction: impl Into<String>) -> Self {
        Self {
            task,
            images,
            instruction: instruction.into(),
            follow_ups: Vec::new(),
        }
    }

    /// Same request with one more exchange appended.
    pub fn with_follow_up(&self, prior_response: impl Into<String>, feedback: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.follow_ups.push(FollowUp {
            prior_response: prior_response.into(),
            feedback: feedback.into(),
        });
        next
    }

    /// Original page indices, in the order the images are attached.
    pub fn page_indices(&self) -> Vec<usize> {
        self.images.iter().map(|i| i.page_index).collect()
    }

    /// "Image N = original page P" lines sent alongside the images.
    pub fn label_text(&self) -> String {
        self.images
            .iter()
            .enumerate()
            .map(|(n, img)| format!("Image {} = original page {}", n + 1, img.page_index))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Best-effort image-understanding capability.
///
/// Replies are approximately JSON-shaped at best. Callers must never assume
/// a single canonical shape.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn infer(&self, req: &OracleRequest) -> Result<String, OracleError>;
}

/// Run one oracle call under a timeout, racing the caller's cancellation.
pub async fn call_oracle(
    oracle: &dyn Oracle,
    req: &OracleRequest,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String, OracleError> {
    if cancel.is_cancelled() {
        return Err(OracleError::Cancelled);
    }
    let start = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OracleError::Cancelled),
        r = tokio::time::timeout(timeout, oracle.infer(req)) => match r {
            Ok(inner) => inner,
            Err(_) => Err(OracleError::Timeout { secs: timeout.as_secs() }),
        },
    };
    match &result {
        Ok(text) => debug!(
            "{} via {}: {} image(s), {} chars in {:?}",
            req.task,
            oracle.name(),
            req.images.len(),
            text.len(),
            start.elapsed()
        ),
        Err(e) => warn!("{} via {} failed: {}", req.task, oracle.name(), e),
    }
    result
}

// ── LLM-backed oracle ────────────────────────────────────────────────────

/// [`Oracle`] backed by an `edgequake-llm` vision provider.
pub struct LlmOracle {
    name: String,
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    transport_retries: u32,
    retry_backoff_ms: u64,
}

impl LlmOracle {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            name: name.into(),
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            transport_retries: config.transport_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Render a request as a chat transcript.
///
/// Layout: the instruction as the system message, then a user message with
/// the page labels and every image attached, then one assistant/user pair
/// per follow-up.
pub fn build_messages(req: &OracleRequest) -> Vec<ChatMessage> {
    let images: Vec<ImageData> = req.images.iter().map(|i| i.image.clone()).collect();
    let mut messages = vec![
        ChatMessage::system(&req.instruction),
        ChatMessage::user_with_images(&req.label_text(), images),
    ];
    for fu in &req.follow_ups {
        messages.push(ChatMessage::assistant(&fu.prior_response));
        messages.push(ChatMessage::user(&fu.feedback));
    }
    messages
}

#[async_trait]
impl Oracle for LlmOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn infer(&self, req: &OracleRequest) -> Result<String, OracleError> {
        let messages = build_messages(req);
        let options = self.options();
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.transport_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{}: transport retry {}/{} after {}ms",
                    req.task, attempt, self.transport_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "{}: {} input tokens, {} output tokens",
                        req.task, response.prompt_tokens, response.completion_tokens
                    );
                    if response.content.trim().is_empty() {
                        return Err(OracleError::EmptyResponse);
                    }
                    return Ok(response.content);
                }
                Err(e) => {
                    let err_msg = format!("{}", e);
                    warn!("{}: attempt {} failed: {}", req.task, attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(OracleError::Provider {
            attempts: self.transport_retries + 1,
            message: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| ExtractError::ProviderNotConfigured {
        provider: provider_name.to_string(),
        hint: format!("{e}"),
    })
}

/// Resolve the oracle, from most-specific to least-specific:
///
/// 1. `config.oracle`, used as-is;
/// 2. `config.provider`, wrapped in an [`LlmOracle`];
/// 3. `config.provider_name` (+ `config.model`);
/// 4. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
/// 5. OpenAI when `OPENAI_API_KEY` is set;
/// 6. `ProviderFactory::from_env` auto-detection.
pub fn resolve_oracle(config: &ExtractionConfig) -> Result<Arc<dyn Oracle>, ExtractError> {
    if let Some(ref oracle) = config.oracle {
        return Ok(Arc::clone(oracle));
    }

    let (name, provider) = resolve_provider(config)?;
    Ok(Arc::new(LlmOracle::new(name, provider, config)))
}

fn resolve_provider(config: &ExtractionConfig) -> Result<(String, Arc<dyn LLMProvider>), ExtractError> {
    if let Some(ref provider) = config.provider {
        return Ok(("custom".to_string(), Arc::clone(provider)));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

    if let Some(ref name) = config.provider_name {
        return Ok((format!("{name}/{model}"), create_vision_provider(name, model)?));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return Ok((format!("{prov}/{env_model}"), create_vision_provider(&prov, &env_model)?));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return Ok((format!("openai/{model}"), create_vision_provider("openai", model)?));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(("auto".to_string(), llm_provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowOracle;

    #[async_trait]
    impl Oracle for SlowOracle {
        fn name(&self) -> &str {
            "slow"
        }
        async fn infer(&self, _req: &OracleRequest) -> Result<String, OracleError> {
            sleep(Duration::from_secs(30)).await;
            Ok("late".into())
        }
    }

    struct EchoOracle;

    #[async_trait]
    impl Oracle for EchoOracle {
        fn name(&self) -> &str {
            "echo"
        }
        async fn infer(&self, req: &OracleRequest) -> Result<String, OracleError> {
            Ok(req.task.to_string())
        }
    }

    fn image(page_index: usize) -> LabeledImage {
        LabeledImage {
            page_index,
            image: ImageData::new("AAAA".to_string(), "image/png"),
        }
    }

    fn request() -> OracleRequest {
        OracleRequest::new(
            OracleTask::Questions { booklet: "A".into() },
            vec![image(3), image(4)],
            "find questions",
        )
    }

    #[test]
    fn label_text_names_original_pages() {
        let req = request();
        assert_eq!(req.label_text(), "Image 1 = original page 3\nImage 2 = original page 4");
        assert_eq!(req.page_indices(), vec![3, 4]);
    }

    #[test]
    fn follow_ups_extend_the_transcript() {
        let req = request();
        assert_eq!(build_messages(&req).len(), 2);
        let retry = req.with_follow_up("[]", "missing questions: 2");
        assert_eq!(retry.follow_ups.len(), 1);
        assert_eq!(build_messages(&retry).len(), 4);
        assert!(req.follow_ups.is_empty());
    }

    #[tokio::test]
    async fn call_returns_reply() {
        let out = call_oracle(&EchoOracle, &request(), Duration::from_secs(1), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out, "questions[A]");
    }

    #[tokio::test]
    async fn call_times_out() {
        let err = call_oracle(&SlowOracle, &request(), Duration::from_millis(20), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Timeout { .. }));
    }

    #[tokio::test]
    async fn call_observes_cancellation() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = call_oracle(&SlowOracle, &request(), Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, OracleError::Cancelled);
    }

    #[test]
    fn configured_oracle_takes_precedence() {
        let config = ExtractionConfig::builder().oracle(Arc::new(EchoOracle)).build().unwrap();
        let oracle = resolve_oracle(&config).unwrap();
        assert_eq!(oracle.name(), "echo");
    }
}
