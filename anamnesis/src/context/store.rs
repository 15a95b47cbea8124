//! The append-only conversation ledger.
//!
//! Committed messages live in an ordered map behind a `RwLock`; a commit
//! inserts the finished message under the write lock, so every reader sees a
//! message either fully committed or not at all. Uncommitted messages are
//! tracked in a registry that also hands out ids and feeds subscribers.

use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::message::{Message, MessageId, Role};
use super::message_store::{MessageState, MessageStore, SharedState, lock_state};
use crate::storage::content::MemoryContentSink;
use crate::storage::traits::ContentSink;
use crate::{AnamnesisError, Result};

#[derive(Debug)]
struct Registry {
    next_id: u64,
    pending: BTreeMap<MessageId, SharedState>,
    subscribers: Vec<mpsc::UnboundedSender<MessageStore>>,
    closed: bool,
}

/// State shared by the store and every handle it gives out
#[derive(Debug)]
pub(crate) struct ContextInner {
    pub(crate) sink: Arc<dyn ContentSink>,
    ledger: RwLock<BTreeMap<MessageId, Arc<Message>>>,
    registry: Mutex<Registry>,
}

impl ContextInner {
    fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| AnamnesisError::Other("context registry lock poisoned".to_string()))
    }

    /// Flip a message to committed and insert it into the ledger
    pub(crate) fn publish(&self, state: &SharedState, message: Message) -> Result<()> {
        let id = message.id;
        {
            let mut ledger = self
                .ledger
                .write()
                .map_err(|_| AnamnesisError::Other("ledger lock poisoned".to_string()))?;
            let mut state = lock_state(state)?;
            state.committed = true;
            state.committing = false;
            ledger.insert(id, Arc::new(message));
        }
        self.registry()?.pending.remove(&id);
        Ok(())
    }
}

/// Append-only message ledger
#[derive(Debug, Clone)]
pub struct ContextStore {
    inner: Arc<ContextInner>,
}

impl ContextStore {
    /// Empty ledger writing content to `sink`; ids start at 1
    pub fn new(sink: Arc<dyn ContentSink>) -> Self {
        Self::with_history(sink, Vec::new(), 1)
    }

    /// Ledger with no durable storage
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryContentSink::new()))
    }

    /// Open a ledger over `sink`, restoring every message it already committed.
    /// New ids continue after the highest id the sink holds anything for, so
    /// messages abandoned before a restart keep their ids.
    pub async fn open(sink: Arc<dyn ContentSink>) -> Result<Self> {
        let history = sink.load_committed().await?;
        let highest = history
            .iter()
            .map(|m| m.id)
            .max()
            .max(sink.highest_message_id().await?)
            .map_or(0, |id| id.value());
        info!(
            restored = history.len(),
            next_id = highest + 1,
            "Opened context store"
        );
        Ok(Self::with_history(sink, history, highest + 1))
    }

    fn with_history(sink: Arc<dyn ContentSink>, history: Vec<Message>, next_id: u64) -> Self {
        let ledger = history
            .into_iter()
            .map(|message| (message.id, Arc::new(message)))
            .collect();

        Self {
            inner: Arc::new(ContextInner {
                sink,
                ledger: RwLock::new(ledger),
                registry: Mutex::new(Registry {
                    next_id,
                    pending: BTreeMap::new(),
                    subscribers: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Committed messages as of now, oldest first
    pub fn list_messages(&self) -> Result<Vec<Message>> {
        let ledger = self
            .inner
            .ledger
            .read()
            .map_err(|_| AnamnesisError::Other("ledger lock poisoned".to_string()))?;
        Ok(ledger.values().map(|m| Message::clone(m)).collect())
    }

    /// A committed message by id
    pub fn message(&self, id: MessageId) -> Result<Message> {
        let ledger = self
            .inner
            .ledger
            .read()
            .map_err(|_| AnamnesisError::Other("ledger lock poisoned".to_string()))?;
        ledger
            .get(&id)
            .map(|m| Message::clone(m))
            .ok_or_else(|| AnamnesisError::NotFound(format!("message {}", id)))
    }

    /// Allocate a new, uncommitted message
    pub fn new_message(&self, role: Role) -> Result<MessageStore> {
        let mut registry = self.inner.registry()?;
        if registry.closed {
            return Err(AnamnesisError::State("context store is closed".to_string()));
        }

        let id = MessageId::new(registry.next_id);
        registry.next_id += 1;
        let state: SharedState = Arc::new(Mutex::new(MessageState::new(id, role)));
        registry.pending.insert(id, Arc::clone(&state));

        let store = MessageStore::new(state, Arc::clone(&self.inner));
        registry
            .subscribers
            .retain(|subscriber| subscriber.send(store.clone()).is_ok());

        debug!(message = %id, role = %role, "Created message");
        Ok(store)
    }

    /// Subscribe to messages created from now on, in creation order.
    ///
    /// Each call is an independent subscription. The stream ends when the
    /// store is closed (immediately, if it already is).
    pub fn message_stores(&self) -> Result<MessageStoreStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut registry = self.inner.registry()?;
        if !registry.closed {
            registry.subscribers.push(sender);
        }
        Ok(MessageStoreStream { receiver })
    }

    /// Handles of every uncommitted message, in id order
    pub fn pending_messages(&self) -> Result<Vec<MessageStore>> {
        let registry = self.inner.registry()?;
        Ok(registry
            .pending
            .values()
            .map(|state| MessageStore::new(Arc::clone(state), Arc::clone(&self.inner)))
            .collect())
    }

    /// Commit every uncommitted message, one at a time in id order.
    /// Messages already being committed elsewhere are skipped.
    /// Returns the messages this call committed.
    pub async fn commit_pending(&self) -> Result<Vec<Message>> {
        let mut committed = Vec::new();
        for store in self.pending_messages()? {
            match store.commit().await {
                Ok(message) => committed.push(message),
                Err(AnamnesisError::State(reason)) => {
                    debug!(reason = %reason, "Skipping message during store-wide commit");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(committed)
    }

    /// End every subscription and refuse new messages. Uncommitted messages
    /// can still be written and committed.
    pub fn close(&self) -> Result<()> {
        let mut registry = self.inner.registry()?;
        if !registry.closed {
            registry.closed = true;
            registry.subscribers.clear();
            info!("Closed context store");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.inner.registry()?.closed)
    }
}

/// Live sequence of [`MessageStore`] handles produced by
/// [`ContextStore::message_stores`]
#[derive(Debug)]
pub struct MessageStoreStream {
    receiver: mpsc::UnboundedReceiver<MessageStore>,
}

impl Stream for MessageStoreStream {
    type Item = MessageStore;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
