//! Provider-agnostic chat-completion façade: a closed set of adapters
//! behind one capability, uniform retry/backoff, and token/cost accounting.
//!
//! Mostly we'd prefer to let a single HTTP-compatible wire format cover every
//! provider, and in fact `openai`, `anthropic`, `google`, `deepseek` and
//! `openrouter` all expose OpenAI-compatible chat-completions endpoints, so
//! they share one driver implementation parameterized by provider identity.
//! `random_local` is kept separate: it performs no network I/O at all.

use std::{fmt, time::Duration};

use keen_retry::RetryResult;
use serde::Serialize;

use crate::prelude::*;

pub mod openai_compatible;
pub mod pricing;
pub mod random_local;

pub use pricing::ModelPrice;

/// The closed set of provider adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    Deepseek,
    Openrouter,
    RandomLocal,
}

impl Provider {
    /// Parse a `provider:model` identifier into a provider and bare model
    /// name. Defaults to `openai` if no `provider:` prefix is given, so
    /// existing `gpt-4o-mini`-style model identifiers keep working.
    pub fn parse_identifier(identifier: &str) -> (Provider, &str) {
        match identifier.split_once(':') {
            Some(("openai", model)) => (Provider::OpenAi, model),
            Some(("anthropic", model)) => (Provider::Anthropic, model),
            Some(("google", model)) => (Provider::Google, model),
            Some(("deepseek", model)) => (Provider::Deepseek, model),
            Some(("openrouter", model)) => (Provider::Openrouter, model),
            Some(("random_local", model)) => (Provider::RandomLocal, model),
            _ => (Provider::OpenAi, identifier),
        }
    }

    /// Environment variable carrying this provider's API key.
    pub fn api_key_env_var(self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Google => Some("GOOGLE_API_KEY"),
            Provider::Deepseek => Some("DEEPSEEK_API_KEY"),
            Provider::Openrouter => Some("OPENROUTER_API_KEY"),
            Provider::RandomLocal => None,
        }
    }

    /// Default OpenAI-compatible base URL for this provider.
    pub fn default_api_base(self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::Anthropic => Some("https://api.anthropic.com/v1"),
            Provider::Google => {
                Some("https://generativelanguage.googleapis.com/v1beta/openai")
            }
            Provider::Deepseek => Some("https://api.deepseek.com/v1"),
            Provider::Openrouter => Some("https://openrouter.ai/api/v1"),
            Provider::RandomLocal => None,
        }
    }

    /// Instantiate the driver for this provider.
    pub fn create_driver(self) -> Result<Box<dyn Driver>> {
        match self {
            Provider::RandomLocal => Ok(Box::new(random_local::RandomLocalDriver::new())),
            _ => Ok(Box::new(openai_compatible::OpenAiCompatibleDriver::new(
                self,
            )?)),
        }
    }
}

/// A single chat message, matching the minimal `{role, content}` contract.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user",
            content: content.into(),
        }
    }
}

/// A request to `complete`.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,

    /// Number of valid 1-based choice indices for the current quest step.
    /// Used only by [`random_local::RandomLocalDriver`] so it can sample a
    /// valid index without parsing the rendered prompt or a reply schema.
    /// Real network adapters ignore this field.
    pub choice_count: usize,
}

/// Token usage for a single `complete` call.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// How a completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    /// The provider returned no content at all -- a degenerate response we
    /// must not raise on, per the LLM Client Layer's contract.
    Empty,
}

/// The result of a `complete` call.
#[derive(Debug, Clone)]
pub struct ChatCompletionResult {
    pub content: String,
    pub usage: TokenUsage,
    pub cost_usd: Option<f64>,
    pub finish_reason: FinishReason,
}

/// A [`RetryResult`] specialized for LLM requests, so drivers can
/// distinguish transient transport/rate-limit failures from fatal
/// authentication/safety-filter failures. The error type is `anyhow::Error`
/// rather than [`LlmError`] so that `?`-like retry macros can convert any
/// of a driver's fallible calls (builder errors, `serde_json`, the
/// provider's own `OpenAIError`) via anyhow's blanket `From` impl, the same
/// way the rest of this codebase's drivers do.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Errors which can occur while calling an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM safety filter refused the request")]
    SafetyRefusal,

    #[error("LLM authentication error: {0}")]
    Authentication(String),

    #[error("LLM returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl crate::retry::IsKnownTransient for LlmError {
    fn is_known_transient(&self) -> bool {
        matches!(self, LlmError::Timeout | LlmError::Transport(_))
    }
}

/// Interface implemented once per provider adapter.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Run one chat-completion request, with provider-specific retry
    /// classification folded into the returned [`LlmRetryResult`]. Callers
    /// apply the actual backoff loop (see [`complete_with_retry`]).
    async fn complete_once(&self, request: &ChatRequest) -> LlmRetryResult<ChatCompletionResult>;
}

/// Call a driver with bounded exponential backoff and jitter, retrying only
/// on transient failures, bounded by `request.timeout` overall.
#[instrument(level = "debug", skip(driver, request), fields(model = %request.model))]
pub async fn complete_with_retry(
    driver: &dyn Driver,
    request: &ChatRequest,
    max_attempts: u32,
) -> Result<ChatCompletionResult> {
    use keen_retry::{ExponentialJitter, ResolvedResult};

    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 1..=30_000,
        re_attempts: max_attempts.saturating_sub(1),
        jitter_ratio: 0.2,
    };

    let resolved = tokio::time::timeout(request.timeout, async {
        driver
            .complete_once(request)
            .await
            .retry_with_async(|_| driver.complete_once(request))
            .with_exponential_jitter(|| jitter.clone())
            .await
    })
    .await;

    match resolved {
        Ok(ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. }) => {
            Ok(output)
        }
        Ok(ResolvedResult::Fatal { error, .. }) => {
            warn!("LLM call failed: {error}");
            Err(error)
        }
        Ok(ResolvedResult::GivenUp { fatal_error, .. })
        | Ok(ResolvedResult::Unrecoverable { fatal_error, .. }) => {
            warn!("LLM call failed after retries: {fatal_error}");
            Err(fatal_error)
        }
        Err(_) => Err(anyhow!(LlmError::Timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_identifier_with_explicit_provider() {
        assert_eq!(
            Provider::parse_identifier("anthropic:claude-3-5-sonnet"),
            (Provider::Anthropic, "claude-3-5-sonnet")
        );
        assert_eq!(
            Provider::parse_identifier("random_local:seeded"),
            (Provider::RandomLocal, "seeded")
        );
    }

    #[test]
    fn parse_identifier_defaults_to_openai() {
        assert_eq!(
            Provider::parse_identifier("gpt-4o-mini"),
            (Provider::OpenAi, "gpt-4o-mini")
        );
    }

    #[test]
    fn token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        };
        total += TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 1,
        };
        assert_eq!(total.total_tokens(), 19);
        assert!(!total.is_zero());
    }
}
