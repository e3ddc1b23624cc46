use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{FinsightError, Result};
use crate::llm::client::LlmProvider;
use crate::llm::openai::classify_status;
use crate::llm::types::{
    ChatMessage, ChatResponse, Role, StopReason, ToolCallRequest, ToolSpec, Usage,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Provider for the Anthropic Messages API. The dialect differs from the
/// OpenAI shape in three ways handled here: the system prompt is a
/// top-level field, tool calls are `tool_use` content blocks, and tool
/// results travel inside a user message as `tool_result` blocks.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(
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
            api_key,
            model,
            temperature,
            max_tokens,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool<'a>>,
}

#[derive(Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Value,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Fold the uniform message list into the Anthropic shape. Consecutive tool
/// results are merged into a single user message.
fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts = Vec::new();
    let mut converted: Vec<AnthropicMessage> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    let flush_results = |pending: &mut Vec<Value>, out: &mut Vec<AnthropicMessage>| {
        if !pending.is_empty() {
            out.push(AnthropicMessage {
                role: "user",
                content: Value::Array(std::mem::take(pending)),
            });
        }
    };

    for message in messages {
        match message.role {
            Role::System => {
                if let Some(content) = &message.content {
                    system_parts.push(content.clone());
                }
            }
            Role::User => {
                flush_results(&mut pending_results, &mut converted);
                converted.push(AnthropicMessage {
                    role: "user",
                    content: Value::String(message.content.clone().unwrap_or_default()),
                });
            }
            Role::Assistant => {
                flush_results(&mut pending_results, &mut converted);
                let mut blocks = Vec::new();
                if let Some(content) = &message.content {
                    if !content.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": content}));
                    }
                }
                for call in &message.tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                if !blocks.is_empty() {
                    converted.push(AnthropicMessage {
                        role: "assistant",
                        content: Value::Array(blocks),
                    });
                }
            }
            Role::Tool => {
                pending_results.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content.clone().unwrap_or_default(),
                }));
            }
        }
    }
    flush_results(&mut pending_results, &mut converted);

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    (system, converted)
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ChatResponse> {
        let (system, converted) = convert_messages(messages);

        let payload = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system,
            messages: converted,
            tools: tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: &tool.name,
                    description: &tool.description,
                    input_schema: &tool.parameters,
                })
                .collect(),
        };

        debug!(messages = messages.len(), "sending Anthropic messages request");

        let response = self
            .client
            .post(format!("{ANTHROPIC_BASE_URL}/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            return Err(classify_status(status, retry_after, &body, "anthropic"));
        }

        let body: MessagesResponse = response.json().await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in body.content {
            match block {
                ContentBlock::Text { text } => content.push_str(&text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::Other => {}
            }
        }

        let stop_reason = match body.stop_reason.as_deref() {
            Some("tool_use") => StopReason::ToolCalls,
            Some("max_tokens") => StopReason::Length,
            _ if !tool_calls.is_empty() => StopReason::ToolCalls,
            _ => StopReason::Stop,
        };

        let usage = body
            .usage
            .map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            content: (!content.is_empty()).then_some(content),
            tool_calls,
            usage,
            stop_reason,
        })
    }
}
