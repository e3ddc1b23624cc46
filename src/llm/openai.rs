use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{FinsightError, Result};
use crate::llm::client::LlmProvider;
use crate::llm::types::{
    ChatMessage, ChatResponse, Role, StopReason, ToolCallRequest, ToolSpec, Usage,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Provider speaking the OpenAI chat-completions dialect. Groq exposes the
/// same wire format, so both run through this client.
pub struct OpenAiCompatibleProvider {
    client: Client,
    name: &'static str,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatibleProvider {
    pub fn openai(api_key: String, model: String, temperature: f32, max_tokens: u32, timeout_s: u64) -> Result<Self> {
        Self::with_base("openai", OPENAI_BASE_URL, api_key, model, temperature, max_tokens, timeout_s)
    }

    pub fn groq(api_key: String, model: String, temperature: f32, max_tokens: u32, timeout_s: u64) -> Result<Self> {
        Self::with_base("groq", GROQ_BASE_URL, api_key, model, temperature, max_tokens, timeout_s)
    }

    fn with_base(
        name: &'static str,
        base_url: &str,
        api_key: String,
        model: String,
        temperature: f32,
        max_tokens: u32,
        timeout_s: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| FinsightError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            name,
            base_url: base_url.to_string(),
            api_key,
            model,
            temperature,
            max_tokens,
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireToolCallFunction,
}

#[derive(Serialize, Deserialize)]
struct WireToolCallFunction {
    name: String,
    /// JSON-encoded arguments, as the dialect requires.
    arguments: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

fn to_wire(message: &ChatMessage) -> WireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: WireToolCallFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
        )
    };

    WireMessage {
        role: role.to_string(),
        content: message.content.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
        name: message.tool_name.clone(),
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatResponse> {
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: messages.iter().map(to_wire).collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools
                .iter()
                .map(|tool| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: &tool.name,
                        description: &tool.description,
                        parameters: &tool.parameters,
                    },
                })
                .collect(),
        };

        debug!(provider = self.name, messages = messages.len(), "sending chat completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body, self.name));
        }

        let body: ChatCompletionResponse = response.json().await?;
        let choice = body.choices.into_iter().next().ok_or_else(|| {
            FinsightError::LlmProvider(format!("{} returned no choices", self.name))
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Null);
                ToolCallRequest {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect::<Vec<_>>();

        let stop_reason = match choice.finish_reason.as_deref() {
            Some("tool_calls") => StopReason::ToolCalls,
            Some("length") => StopReason::Length,
            _ if !tool_calls.is_empty() => StopReason::ToolCalls,
            _ => StopReason::Stop,
        };

        let usage = body
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            content: choice.message.content.filter(|c| !c.is_empty()),
            tool_calls,
            usage,
            stop_reason,
        })
    }
}

pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    retry_after_s: Option<u64>,
    body: &str,
    provider: &str,
) -> FinsightError {
    if status.as_u16() == 429 {
        FinsightError::LlmRateLimited { retry_after_s }
    } else if status.is_server_error() {
        FinsightError::LlmTransient(format!("{provider} returned {status}: {body}"))
    } else {
        FinsightError::LlmProvider(format!("{provider} returned {status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_for_tool_response() {
        let msg = ChatMessage::tool("call_9", "get_expense_categories", "{}");
        let wire = to_wire(&msg);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(wire.name.as_deref(), Some("get_expense_categories"));
    }

    #[test]
    fn test_wire_message_encodes_arguments_as_string() {
        let msg = ChatMessage::assistant(
            None,
            vec![ToolCallRequest {
                id: "c1".to_string(),
                name: "t".to_string(),
                arguments: serde_json::json!({"a": 1}),
            }],
        );
        let wire = to_wire(&msg);
        let calls = wire.tool_calls.unwrap();
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(7), "", "openai"),
            FinsightError::LlmRateLimited { retry_after_s: Some(7) }
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY, None, "", "openai"),
            FinsightError::LlmTransient(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_REQUEST, None, "", "openai"),
            FinsightError::LlmProvider(_)
        ));
    }
}
