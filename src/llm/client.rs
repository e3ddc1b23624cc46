use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{LlmConfig, ProviderKind};
use crate::error::{FinsightError, Result};
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::openai::OpenAiCompatibleProvider;
use crate::llm::types::{ChatMessage, ChatResponse, ToolSpec};

/// Uniform contract over the configured LLM backend.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatResponse>;
}

/// Provider selected once at startup; transient failures and rate limits
/// retry with backoff before surfacing as `LlmUnavailable`.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    max_retries: u32,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(FinsightError::Configuration(format!(
                "no API key configured for LLM provider '{}'",
                config.provider
            )));
        }

        let provider: Arc<dyn LlmProvider> = match config.provider {
            ProviderKind::OpenAi => Arc::new(OpenAiCompatibleProvider::openai(
                config.api_key.clone(),
                config.model.clone(),
                config.temperature,
                config.max_tokens,
                config.timeout_s,
            )?),
            ProviderKind::Groq => Arc::new(OpenAiCompatibleProvider::groq(
                config.api_key.clone(),
                config.model.clone(),
                config.temperature,
                config.max_tokens,
                config.timeout_s,
            )?),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                config.api_key.clone(),
                config.model.clone(),
                config.temperature,
                config.max_tokens,
                config.timeout_s,
            )?),
        };

        info!(
            provider = provider.name(),
            model = provider.model(),
            "initialized LLM client"
        );

        Ok(Self {
            provider,
            max_retries: config.max_retries,
        })
    }

    /// Wrap an existing provider implementation; used by tests to inject a
    /// scripted backend.
    pub fn from_provider(provider: Arc<dyn LlmProvider>, max_retries: u32) -> Self {
        Self {
            provider,
            max_retries,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse> {
        let attempts = self.max_retries.max(1);

        for attempt in 1..=attempts {
            match self.provider.chat(messages, tools).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient_llm() && attempt < attempts => {
                    let delay = match &err {
                        FinsightError::LlmRateLimited {
                            retry_after_s: Some(seconds),
                        } => Duration::from_secs(*seconds),
                        _ => Duration::from_millis(500 * 2u64.pow(attempt - 1)),
                    };
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient LLM failure, backing off"
                    );
                    sleep(delay).await;
                }
                Err(err) if err.is_transient_llm() => {
                    return Err(FinsightError::LlmUnavailable(format!(
                        "provider '{}' still failing after {attempts} attempts: {err}",
                        self.provider.name()
                    )));
                }
                Err(err) => return Err(err),
            }
        }

        Err(FinsightError::LlmUnavailable(format!(
            "provider '{}' exhausted {attempts} attempts",
            self.provider.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{StopReason, Usage};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn model(&self) -> &str {
            "test-model"
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(FinsightError::LlmTransient("boom".to_string()))
            } else {
                Ok(ChatResponse {
                    content: Some("ok".to_string()),
                    tool_calls: Vec::new(),
                    usage: Usage::default(),
                    stop_reason: StopReason::Stop,
                })
            }
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let client = LlmClient::from_provider(provider.clone(), 3);

        let response = client.chat(&[ChatMessage::user("hi")], &[]).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("ok"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_becomes_unavailable() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 10,
        });
        let client = LlmClient::from_provider(provider, 2);

        let err = client.chat(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, FinsightError::LlmUnavailable(_)));
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        struct Rejecting;

        #[async_trait::async_trait]
        impl LlmProvider for Rejecting {
            fn name(&self) -> &str {
                "rejecting"
            }
            fn model(&self) -> &str {
                "m"
            }
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _tools: &[ToolSpec],
            ) -> Result<ChatResponse> {
                Err(FinsightError::LlmProvider("bad request".to_string()))
            }
        }

        let client = LlmClient::from_provider(Arc::new(Rejecting), 3);
        let err = client.chat(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, FinsightError::LlmProvider(_)));
    }
}
