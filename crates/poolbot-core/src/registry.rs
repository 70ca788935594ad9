use crate::error::RouteError;
use crate::pool::{AccountPool, PoolEntry};
use chrono::{DateTime, Utc};
use poolbot_providers::Conversation;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A thread's sticky binding to one account and one open conversation.
pub struct ConversationEntry {
    thread_id: String,
    account: Arc<PoolEntry>,
    conversation: Arc<dyn Conversation>,
    created_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn account(&self) -> &Arc<PoolEntry> {
        &self.account
    }

    pub fn conversation(&self) -> &Arc<dyn Conversation> {
        &self.conversation
    }

    pub fn conversation_id(&self) -> &str {
        self.conversation.id()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

type Slot = Arc<Mutex<Option<Arc<ConversationEntry>>>>;

/// thread_id -> open conversation. Check-then-create runs under a per-thread
/// lock, so concurrent first messages on one thread open a single
/// conversation while other threads proceed independently.
pub struct ConversationRegistry {
    pool: Arc<AccountPool>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConversationRegistry {
    pub fn new(pool: Arc<AccountPool>) -> Self {
        Self {
            pool,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    async fn slot(&self, thread_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn existing_slot(&self, thread_id: &str) -> Option<Slot> {
        self.slots.lock().await.get(thread_id).cloned()
    }

    /// Returns the thread's entry, binding a random account and opening a new
    /// conversation on first use.
    pub async fn resolve(&self, thread_id: &str) -> Result<Arc<ConversationEntry>, RouteError> {
        let slot = self.slot(thread_id).await;
        let mut current = slot.lock().await;

        if let Some(entry) = current.as_ref() {
            return Ok(Arc::clone(entry));
        }

        let account = self.pool.pick()?;
        let conversation = account.client().open_conversation().await?;
        let entry = Arc::new(ConversationEntry {
            thread_id: thread_id.to_string(),
            account,
            conversation,
            created_at: Utc::now(),
        });

        info!(
            thread_id = %thread_id,
            account = %entry.account().identity(),
            conversation = %entry.conversation_id(),
            "Bound thread to new conversation"
        );
        *current = Some(Arc::clone(&entry));
        Ok(entry)
    }

    /// Current entry without creating one.
    pub async fn get(&self, thread_id: &str) -> Option<Arc<ConversationEntry>> {
        let slot = self.existing_slot(thread_id).await?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Removes the thread's binding. Evicting an unbound thread is a no-op.
    pub async fn evict(&self, thread_id: &str) -> bool {
        let Some(slot) = self.existing_slot(thread_id).await else {
            return false;
        };
        let removed = slot.lock().await.take();
        if let Some(entry) = &removed {
            debug!(
                thread_id = %thread_id,
                conversation = %entry.conversation_id(),
                "Evicted conversation"
            );
        }
        removed.is_some()
    }

    /// Evicts only if the thread is still bound to `conversation_id`; a
    /// binding created after the failure is left alone.
    pub async fn evict_if_current(&self, thread_id: &str, conversation_id: &str) -> bool {
        let Some(slot) = self.existing_slot(thread_id).await else {
            return false;
        };
        let mut current = slot.lock().await;
        let matches = current
            .as_ref()
            .is_some_and(|entry| entry.conversation_id() == conversation_id);
        if matches {
            current.take();
            debug!(
                thread_id = %thread_id,
                conversation = %conversation_id,
                "Evicted failed conversation"
            );
        }
        matches
    }

    /// Number of threads with a live binding.
    pub async fn active_count(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}
