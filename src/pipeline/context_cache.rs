//! Per-conversation rolling context window.
//!
//! Each conversation owns a fixed-capacity FIFO buffer behind its own mutex.
//! The outer map lock is held only long enough to find or insert a buffer, so
//! unrelated conversations never wait on each other's buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::DEFAULT_CONTEXT_WINDOW;
use crate::pipeline::types::Message;

/// Bounded ring buffer of the most recent messages in one conversation.
#[derive(Debug)]
struct ConversationContext {
    capacity: usize,
    entries: VecDeque<Message>,
}

impl ConversationContext {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, message: Message) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    /// Everything except the newest entry, oldest first.
    fn previous(&self) -> Vec<Message> {
        let keep = self.entries.len().saturating_sub(1);
        self.entries.iter().take(keep).cloned().collect()
    }
}

/// In-memory context cache keyed by conversation id. Empty after restart.
#[derive(Debug)]
pub struct ContextCache {
    capacity: usize,
    conversations: RwLock<HashMap<String, Arc<Mutex<ConversationContext>>>>,
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}

impl ContextCache {
    /// Create a cache holding up to `capacity` messages per conversation.
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of conversations seen so far.
    pub fn conversation_count(&self) -> usize {
        self.conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Append `message` to the conversation's buffer, evicting the oldest
    /// entry once the buffer is full.
    pub fn record(&self, conversation_id: &str, message: Message) {
        let buffer = self.buffer(conversation_id);
        let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(message);
    }

    /// Messages recorded before the most recent one, oldest first.
    pub fn context_for(&self, conversation_id: &str) -> Vec<Message> {
        let existing = self
            .conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .cloned();
        match existing {
            Some(buffer) => buffer.lock().unwrap_or_else(|e| e.into_inner()).previous(),
            None => Vec::new(),
        }
    }

    /// Record `message` and return the context that preceded it, as one
    /// step under the conversation's lock.
    pub fn record_and_snapshot(&self, conversation_id: &str, message: Message) -> Vec<Message> {
        let buffer = self.buffer(conversation_id);
        let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(message);
        buffer.previous()
    }

    fn buffer(&self, conversation_id: &str) -> Arc<Mutex<ConversationContext>> {
        if let Some(buffer) = self
            .conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
        {
            return Arc::clone(buffer);
        }

        let mut map = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ConversationContext::new(self.capacity)))),
        )
    }
}
