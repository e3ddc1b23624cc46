use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::conversation::ConversationStore;
use crate::error::{FinsightError, Result};
use crate::llm::prompts::{FALLBACK_ANSWER, FORCED_SUMMARY_PROMPT, SYSTEM_PROMPT_ANALYST};
use crate::llm::types::{ChatMessage, StopReason};
use crate::llm::LlmClient;
use crate::tools::ToolRegistry;

/// How many past messages accompany each LLM request.
const CONTEXT_WINDOW_MESSAGES: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub answer: String,
    pub conversation_id: String,
    pub tool_calls_made: Vec<ToolCallRecord>,
    pub iterations: u32,
    pub stop_reason: StopReason,
}

/// Multi-turn controller: plans tool invocations against the store,
/// executes them, and terminates on a final natural-language answer within
/// a bounded number of LLM calls.
pub struct Agent {
    llm: LlmClient,
    registry: Arc<ToolRegistry>,
    conversations: Arc<ConversationStore>,
    tool_timeout: Duration,
}

impl Agent {
    pub fn new(
        llm: LlmClient,
        registry: Arc<ToolRegistry>,
        conversations: Arc<ConversationStore>,
        tool_timeout_s: u64,
    ) -> Self {
        Self {
            llm,
            registry,
            conversations,
            tool_timeout: Duration::from_secs(tool_timeout_s),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    /// Process one natural-language query.
    ///
    /// The loop makes at most `max_iterations + 1` LLM calls: each tool
    /// round costs one call, and the final answer (natural or forced) costs
    /// one more. `max_iterations = 0` summarizes immediately with no tools.
    pub async fn process_query(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        max_iterations: u32,
    ) -> Result<AgentReply> {
        let (conversation_id, conversation) =
            self.conversations.get_or_create(conversation_id).await;

        // Per-conversation mutex: queries within one conversation are
        // serialized; other conversations proceed in parallel.
        let mut conversation = conversation.lock().await;
        conversation.push(ChatMessage::user(query));

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT_ANALYST)];
        messages.extend(conversation.window(CONTEXT_WINDOW_MESSAGES));

        let mut tool_calls_made = Vec::new();
        let mut iterations = 0u32;

        let (answer, stop_reason) = loop {
            if iterations >= max_iterations {
                // Budget exhausted: one last call without tools.
                messages.push(ChatMessage::user(FORCED_SUMMARY_PROMPT));
                match self.llm.chat(&messages, &[]).await {
                    Ok(response) => {
                        break (
                            response
                                .content
                                .unwrap_or_else(|| FALLBACK_ANSWER.to_string()),
                            StopReason::Stop,
                        );
                    }
                    Err(err) => break self.degraded(err),
                }
            }

            let response = match self.llm.chat(&messages, self.registry.catalog()).await {
                Ok(response) => response,
                Err(err) => break self.degraded(err),
            };

            if !response.has_tool_calls() {
                break (
                    response
                        .content
                        .unwrap_or_else(|| FALLBACK_ANSWER.to_string()),
                    StopReason::Stop,
                );
            }

            let assistant =
                ChatMessage::assistant(response.content.clone(), response.tool_calls.clone());
            conversation.push(assistant.clone());
            messages.push(assistant);

            iterations += 1;

            for call in &response.tool_calls {
                let outcome = tokio::time::timeout(
                    self.tool_timeout,
                    self.registry.execute(&call.name, &call.arguments),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(FinsightError::Internal {
                        correlation_id: uuid::Uuid::new_v4().to_string(),
                        message: format!("tool '{}' timed out", call.name),
                    })
                });

                let content = match &outcome {
                    Ok(result) => {
                        tool_calls_made.push(ToolCallRecord {
                            tool: call.name.clone(),
                            arguments: call.arguments.clone(),
                            success: true,
                            error: None,
                        });
                        result.to_string()
                    }
                    Err(err) => {
                        // Failures go back to the model as structured tool
                        // results so it can pick another tool or conclude.
                        warn!(tool = %call.name, error = %err, "tool execution failed");
                        tool_calls_made.push(ToolCallRecord {
                            tool: call.name.clone(),
                            arguments: call.arguments.clone(),
                            success: false,
                            error: Some(err.to_string()),
                        });
                        serde_json::json!({
                            "error": {
                                "kind": err.kind(),
                                "message": err.to_string(),
                            }
                        })
                        .to_string()
                    }
                };

                let tool_message = ChatMessage::tool(&call.id, &call.name, content);
                conversation.push(tool_message.clone());
                messages.push(tool_message);
            }
        };

        conversation.push(ChatMessage::assistant(Some(answer.clone()), Vec::new()));

        info!(
            conversation_id = %conversation_id,
            iterations,
            tool_calls = tool_calls_made.len(),
            stop_reason = ?stop_reason,
            "processed query"
        );

        Ok(AgentReply {
            answer,
            conversation_id,
            tool_calls_made,
            iterations,
            stop_reason,
        })
    }

    /// Graceful degradation for non-retryable LLM failures: the user gets
    /// an apologetic answer instead of an error page.
    fn degraded(&self, err: FinsightError) -> (String, StopReason) {
        warn!(error = %err, "LLM unavailable, returning fallback answer");
        (FALLBACK_ANSWER.to_string(), StopReason::LlmError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ChatResponse, ToolCallRequest, ToolSpec, Usage};
    use crate::llm::LlmProvider;
    use crate::store::Store;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider: requests tools for `tool_rounds` calls, then
    /// answers. Counts every chat call.
    struct ScriptedProvider {
        calls: AtomicU32,
        tool_rounds: u32,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn model(&self) -> &str {
            "test"
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            tools: &[ToolSpec],
        ) -> crate::error::Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.tool_rounds && !tools.is_empty() {
                Ok(ChatResponse {
                    content: None,
                    tool_calls: vec![ToolCallRequest {
                        id: format!("call_{n}"),
                        name: "get_revenue_by_period".to_string(),
                        arguments: serde_json::json!({
                            "start_date": "2024-01-01",
                            "end_date": "2024-03-31"
                        }),
                    }],
                    usage: Usage::default(),
                    stop_reason: StopReason::ToolCalls,
                })
            } else {
                Ok(ChatResponse {
                    content: Some("Total revenue was 30000 for the quarter.".to_string()),
                    tool_calls: Vec::new(),
                    usage: Usage::default(),
                    stop_reason: StopReason::Stop,
                })
            }
        }
    }

    async fn agent_with(provider: Arc<ScriptedProvider>) -> Agent {
        let store = Arc::new(Store::in_memory().await.unwrap());
        Agent::new(
            LlmClient::from_provider(provider, 3),
            Arc::new(ToolRegistry::new(store)),
            Arc::new(ConversationStore::new(50, 3600)),
            10,
        )
    }

    #[tokio::test]
    async fn test_direct_answer_uses_one_call() {
        let provider = Arc::new(ScriptedProvider {
            calls: AtomicU32::new(0),
            tool_rounds: 0,
        });
        let agent = agent_with(provider.clone()).await;

        let reply = agent.process_query("revenue?", None, 5).await.unwrap();
        assert_eq!(reply.iterations, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(reply.answer.contains("30000"));
    }

    #[tokio::test]
    async fn test_iteration_cap_forces_summary() {
        // The provider would keep requesting tools forever; the cap of one
        // round allows exactly one tool call and one forced summary.
        let provider = Arc::new(ScriptedProvider {
            calls: AtomicU32::new(0),
            tool_rounds: 100,
        });
        let agent = agent_with(provider.clone()).await;

        let reply = agent.process_query("deep analysis", None, 1).await.unwrap();
        assert_eq!(reply.iterations, 1);
        assert_eq!(reply.tool_calls_made.len(), 1);
        assert!(provider.calls.load(Ordering::SeqCst) <= 2);
        assert!(!reply.answer.is_empty());
    }

    #[tokio::test]
    async fn test_zero_iterations_means_no_tools() {
        let provider = Arc::new(ScriptedProvider {
            calls: AtomicU32::new(0),
            tool_rounds: 100,
        });
        let agent = agent_with(provider.clone()).await;

        let reply = agent.process_query("summarize", None, 0).await.unwrap();
        assert_eq!(reply.iterations, 0);
        assert!(reply.tool_calls_made.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_gracefully() {
        struct FailingProvider;

        #[async_trait::async_trait]
        impl LlmProvider for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            fn model(&self) -> &str {
                "test"
            }
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _tools: &[ToolSpec],
            ) -> crate::error::Result<ChatResponse> {
                Err(FinsightError::LlmProvider("invalid key".to_string()))
            }
        }

        let store = Arc::new(Store::in_memory().await.unwrap());
        let agent = Agent::new(
            LlmClient::from_provider(Arc::new(FailingProvider), 2),
            Arc::new(ToolRegistry::new(store)),
            Arc::new(ConversationStore::new(50, 3600)),
            10,
        );

        let reply = agent.process_query("anything", None, 5).await.unwrap();
        assert_eq!(reply.stop_reason, StopReason::LlmError);
        assert!(!reply.answer.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_memory_accumulates() {
        let provider = Arc::new(ScriptedProvider {
            calls: AtomicU32::new(0),
            tool_rounds: 0,
        });
        let agent = agent_with(provider).await;

        let first = agent.process_query("q1", None, 5).await.unwrap();
        let second = agent
            .process_query("q2", Some(&first.conversation_id), 5)
            .await
            .unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);

        let conversation = agent
            .conversations()
            .get(&first.conversation_id)
            .await
            .unwrap();
        // Two user messages and two assistant answers.
        assert_eq!(conversation.lock().await.messages.len(), 4);
    }
}
