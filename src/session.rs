//! Conversation history persisted across runs.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::SessionError;
use crate::items::InputItem;

/// Append-only conversation store keyed by a session id.
#[async_trait]
pub trait Session: Send + Sync {
    fn session_id(&self) -> &str;

    /// Stored items in order; with `limit`, only the most recent `limit`.
    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<InputItem>, SessionError>;

    async fn add_items(&self, items: Vec<InputItem>) -> Result<(), SessionError>;

    /// Removes and returns the most recent item.
    async fn pop_item(&self) -> Result<Option<InputItem>, SessionError>;

    async fn clear_session(&self) -> Result<(), SessionError>;
}

/// In-process [`Session`].
#[derive(Debug, Default)]
pub struct MemorySession {
    session_id: String,
    items: Mutex<Vec<InputItem>>,
}

impl MemorySession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            items: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<InputItem>, SessionError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let start = limit.map_or(0, |limit| items.len().saturating_sub(limit));
        Ok(items[start..].to_vec())
    }

    async fn add_items(&self, items: Vec<InputItem>) -> Result<(), SessionError> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(items);
        Ok(())
    }

    async fn pop_item(&self) -> Result<Option<InputItem>, SessionError> {
        Ok(self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop())
    }

    async fn clear_session(&self) -> Result<(), SessionError> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
