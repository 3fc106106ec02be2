//! Per-chat turn serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the whole duration of a turn.
pub type ChatGuard = OwnedMutexGuard<()>;

/// One FIFO lock per chat id. Entries disappear once no turn holds or
/// waits on them.
#[derive(Clone, Default)]
pub struct ChatLocks {
    inner: Arc<Mutex<HashMap<String, Weak<AsyncMutex<()>>>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, chat_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = map.get(chat_id).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(AsyncMutex::new(()));
        map.insert(chat_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait for the chat's lock. Waiters are served in arrival order.
    pub async fn lock(&self, chat_id: &str) -> ChatGuard {
        self.entry(chat_id).lock_owned().await
    }

    /// Number of chats with a turn running or queued.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|w| w.strong_count() > 0).count()
    }
}
