use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::llm::types::ChatMessage;

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub at: DateTime<Utc>,
}

/// One conversation: ordered messages plus bookkeeping for the TTL sweep.
#[derive(Debug)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<StoredMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    max_messages: usize,
}

impl Conversation {
    fn new(id: String, max_messages: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            last_active: now,
            max_messages,
        }
    }

    /// Append a message, dropping the oldest beyond the sliding cap.
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(StoredMessage {
            message,
            at: Utc::now(),
        });
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(0..excess);
        }
        self.last_active = Utc::now();
    }

    /// The most recent `limit` messages, ready for an LLM request.
    pub fn window(&self, limit: usize) -> Vec<ChatMessage> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages[skip..]
            .iter()
            .map(|m| m.message.clone())
            .collect()
    }

}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub active_conversations: usize,
    pub total_messages: usize,
}

/// Process-local conversation memory. The outer lock only guards the map;
/// each conversation carries its own mutex so one long-running query
/// serializes that conversation without blocking the rest.
pub struct ConversationStore {
    inner: Mutex<HashMap<String, Arc<Mutex<Conversation>>>>,
    max_messages: usize,
    ttl: ChronoDuration,
}

impl ConversationStore {
    pub fn new(max_messages: usize, ttl_s: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_messages,
            ttl: ChronoDuration::seconds(ttl_s as i64),
        }
    }

    /// Fetch a conversation by id, creating it (or a fresh one under a new
    /// uuid when no id is given).
    pub async fn get_or_create(&self, id: Option<&str>) -> (String, Arc<Mutex<Conversation>>) {
        let id = id
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut map = self.inner.lock().await;
        let entry = map.entry(id.clone()).or_insert_with(|| {
            debug!(conversation_id = %id, "creating conversation");
            Arc::new(Mutex::new(Conversation::new(id.clone(), self.max_messages)))
        });
        (id, Arc::clone(entry))
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<Conversation>>> {
        self.inner.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.lock().await.remove(id).is_some()
    }

    /// Drop conversations idle past the TTL. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let mut map = self.inner.lock().await;
        let mut expired = Vec::new();

        for (id, conversation) in map.iter() {
            // A conversation locked by an in-flight query is active by
            // definition; skip it rather than block the sweep.
            if let Ok(guard) = conversation.try_lock() {
                if guard.last_active < cutoff {
                    expired.push(id.clone());
                }
            }
        }

        for id in &expired {
            map.remove(id);
        }
        if !expired.is_empty() {
            info!(expired = expired.len(), "reclaimed idle conversations");
        }
        expired.len()
    }

    pub async fn stats(&self) -> ConversationStats {
        let map = self.inner.lock().await;
        let mut total_messages = 0;
        for conversation in map.values() {
            if let Ok(guard) = conversation.try_lock() {
                total_messages += guard.messages.len();
            }
        }
        ConversationStats {
            active_conversations: map.len(),
            total_messages,
        }
    }

    /// Background reaper; sweep interval defaults to one tenth of the TTL.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = Duration::from_secs((store.ttl.num_seconds() as u64 / 10).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_assigns_uuid() {
        let store = ConversationStore::new(50, 3600);
        let (id, conversation) = store.get_or_create(None).await;
        assert!(!id.is_empty());
        assert_eq!(conversation.lock().await.messages.len(), 0);

        let (same_id, _) = store.get_or_create(Some(&id)).await;
        assert_eq!(same_id, id);
        assert_eq!(store.stats().await.active_conversations, 1);
    }

    #[tokio::test]
    async fn test_sliding_window_cap() {
        let store = ConversationStore::new(3, 3600);
        let (_, conversation) = store.get_or_create(Some("c1")).await;
        let mut guard = conversation.lock().await;

        for i in 0..5 {
            guard.push(ChatMessage::user(format!("message {i}")));
        }
        assert_eq!(guard.messages.len(), 3);
        assert_eq!(
            guard.messages[0].message.content.as_deref(),
            Some("message 2")
        );

        let window = guard.window(2);
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].content.as_deref(), Some("message 4"));
    }

    #[tokio::test]
    async fn test_sweep_reclaims_idle_conversations() {
        let store = ConversationStore::new(50, 0);
        let (_, conversation) = store.get_or_create(Some("idle")).await;
        {
            let mut guard = conversation.lock().await;
            guard.last_active = Utc::now() - ChronoDuration::seconds(10);
        }

        let removed = store.sweep().await;
        assert_eq!(removed, 1);
        assert!(store.get("idle").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_conversations() {
        let store = ConversationStore::new(50, 0);
        let (_, conversation) = store.get_or_create(Some("busy")).await;
        {
            let mut guard = conversation.lock().await;
            guard.last_active = Utc::now() - ChronoDuration::seconds(10);
        }

        let _held = conversation.lock().await;
        let removed = store.sweep().await;
        assert_eq!(removed, 0);
        assert!(store.get("busy").await.is_some());
    }
}
