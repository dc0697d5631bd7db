//! Shared driver for every provider that speaks the OpenAI chat-completions
//! wire format: `openai` itself, plus `anthropic`, `google`, `deepseek` and
//! `openrouter`, all of which expose an OpenAI-compatible endpoint.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    },
};

use crate::{
    llm::{ChatCompletionResult, ChatRequest, Driver, FinishReason, LlmError, LlmRetryResult, Provider, TokenUsage},
    prelude::*,
    retry::{retry_result_fatal, retry_result_ok, try_fatal, try_potentially_transient},
};

/// Build the OpenAI-compatible client configuration for `provider`.
fn client_config_for(provider: Provider) -> Result<OpenAIConfig> {
    let mut config = OpenAIConfig::new();
    if let Some(env_var) = provider.api_key_env_var() {
        let api_key = std::env::var(env_var)
            .with_context(|| format!("missing API key in environment variable {env_var}"))?;
        config = config.with_api_key(api_key);
    }
    if let Some(base) = provider.default_api_base() {
        config = config.with_api_base(base);
    }
    Ok(config)
}

/// Driver for every network provider that is OpenAI-wire-compatible.
#[derive(Debug)]
pub struct OpenAiCompatibleDriver {
    provider: Provider,
    client: Client<OpenAIConfig>,
}

impl OpenAiCompatibleDriver {
    pub fn new(provider: Provider) -> Result<Self> {
        let config = client_config_for(provider)?;
        Ok(OpenAiCompatibleDriver {
            provider,
            client: Client::with_config(config),
        })
    }

    fn to_wire_messages(
        &self,
        request: &ChatRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>> {
        request
            .messages
            .iter()
            .map(|message| match message.role {
                "system" => Ok(ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(message.content.clone())
                        .build()?,
                )),
                "assistant" => Ok(ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(message.content.clone())
                        .build()?,
                )),
                _ => Ok(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(message.content.clone())
                        .build()?,
                )),
            })
            .collect()
    }
}

#[async_trait]
impl Driver for OpenAiCompatibleDriver {
    #[instrument(level = "debug", skip(self, request), fields(provider = ?self.provider, model = %request.model))]
    async fn complete_once(&self, request: &ChatRequest) -> LlmRetryResult<ChatCompletionResult> {
        let messages = try_fatal!(self.to_wire_messages(request));

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(request.model.clone()).messages(messages);
        if let Some(temperature) = request.temperature {
            builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder.max_completion_tokens(max_tokens);
        }
        let req = try_fatal!(builder.build().context("error building chat completion request"));
        trace!(?req, "outgoing request");

        let chat = self.client.chat();
        let raw: Value = try_potentially_transient!(chat.create_byot(req).await);
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(raw)
                .context("error parsing provider response")
        );

        let usage = response
            .usage
            .map(|usage| TokenUsage {
                prompt_tokens: u64::from(usage.prompt_tokens),
                completion_tokens: u64::from(usage.completion_tokens),
            })
            .unwrap_or_default();

        // A response with no choices at all is fatal: there is nothing
        // sensible to retry towards.
        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(
                LlmError::MalformedResponse("provider returned no choices".to_owned()).into(),
            );
        };

        if choice.finish_reason == Some(async_openai::types::FinishReason::ContentFilter) {
            return retry_result_fatal(LlmError::SafetyRefusal.into());
        }

        // Degenerate content (null/absent) is not an error: we surface it as
        // an empty completion and let the Decision Agent's reply parser
        // decide what to do with it.
        let content = choice.message.content.clone().unwrap_or_default();
        let finish_reason = if content.is_empty() {
            FinishReason::Empty
        } else {
            match choice.finish_reason {
                Some(async_openai::types::FinishReason::Length) => FinishReason::Length,
                _ => FinishReason::Stop,
            }
        };

        let cost_usd = crate::llm::pricing::estimate_cost(&request.model, &usage);

        retry_result_ok(ChatCompletionResult {
            content,
            usage,
            cost_usd,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_requires_api_key_when_provider_needs_one() {
        // SAFETY: tests run single-threaded within this module's scope, and
        // we restore the prior value before returning.
        let prior = std::env::var("OPENAI_API_KEY").ok();
        unsafe {
            std::env::remove_var("OPENAI_API_KEY");
        }
        let result = client_config_for(Provider::OpenAi);
        assert!(result.is_err());
        if let Some(prior) = prior {
            unsafe {
                std::env::set_var("OPENAI_API_KEY", prior);
            }
        }
    }
}
