//! Bridges rig's OpenAI-compatible completions client to `LlmProvider`.
//!
//! Each request builds a throwaway rig agent: the system messages become the
//! preamble and the last user message becomes the prompt.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

const PROVIDER: &str = "openai";

/// rig-backed provider for OpenAI-compatible chat completion endpoints.
pub struct RigAdapter {
    client: openai::CompletionsClient,
    model: String,
}

impl RigAdapter {
    pub fn new(client: openai::CompletionsClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for RigAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .last_user_text()
            .ok_or_else(|| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: "request has no user message".into(),
            })?
            .to_string();
        let preamble = request.system_text().unwrap_or_default();

        let mut builder = self.client.agent(&self.model).preamble(&preamble);
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        let agent = builder.build();

        let content: String = agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| classify_prompt_error(e.to_string()))?;

        tracing::debug!(model = %self.model, chars = content.len(), "Completion received");
        Ok(CompletionResponse { content })
    }
}

fn classify_prompt_error(reason: String) -> LlmError {
    let lower = reason.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid api key")
    {
        LlmError::AuthFailed {
            provider: PROVIDER.into(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") {
        LlmError::RateLimited {
            provider: PROVIDER.into(),
            retry_after: None,
        }
    } else {
        LlmError::RequestFailed {
            provider: PROVIDER.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_errors_are_categorized() {
        assert!(matches!(
            classify_prompt_error("HTTP 401 Unauthorized".into()),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            classify_prompt_error("429 Too Many Requests: rate limit".into()),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_prompt_error("connection reset".into()),
            LlmError::RequestFailed { .. }
        ));
    }
}
