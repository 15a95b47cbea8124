//! Per-message write handle.
//!
//! A [`MessageStore`] accumulates the content of one uncommitted message.
//! Text and tool-use content is streamed through a [`ContentAppender`] bound
//! to one slot; binary and script-call content is written whole. Only slots
//! that were closed before `commit` are part of the committed message.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::appender::ContentAppender;
use super::message::{Binary, Content, Message, MessageId, Role, ScriptCall};
use super::store::ContextInner;
use crate::{AnamnesisError, Result};

/// Kind of content a streamed slot produces on close
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SlotKind {
    Text,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone)]
pub(crate) enum Slot {
    /// An appender currently owns the slot
    Open(SlotKind),
    /// The appender went away without closing; may be reopened
    Released(SlotKind),
    /// Whole-item content is being written to the sink
    Writing,
    /// Final content, flushed to the sink
    Closed(Content),
    /// A whole-item write failed; the slot never gets content
    Abandoned,
}

#[derive(Debug)]
pub(crate) struct MessageState {
    pub(crate) id: MessageId,
    pub(crate) role: Role,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) metadata: serde_json::Map<String, Value>,
    pub(crate) committing: bool,
    pub(crate) committed: bool,
}

impl MessageState {
    pub(crate) fn new(id: MessageId, role: Role) -> Self {
        Self {
            id,
            role,
            created_at: Utc::now(),
            slots: Vec::new(),
            metadata: serde_json::Map::new(),
            committing: false,
            committed: false,
        }
    }

    /// Fails unless the message still accepts writes
    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.committed {
            Err(AnamnesisError::State(format!(
                "message {} is already committed",
                self.id
            )))
        } else if self.committing {
            Err(AnamnesisError::State(format!(
                "message {} is being committed",
                self.id
            )))
        } else {
            Ok(())
        }
    }

    fn snapshot(&self, committed_at: DateTime<Utc>) -> Message {
        Message {
            id: self.id,
            role: self.role,
            created_at: self.created_at,
            committed_at: Some(committed_at),
            contents: self
                .slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Closed(content) => Some(content.clone()),
                    _ => None,
                })
                .collect(),
            metadata: self.metadata.clone(),
        }
    }
}

pub(crate) type SharedState = Arc<Mutex<MessageState>>;

pub(crate) fn lock_state(state: &SharedState) -> Result<MutexGuard<'_, MessageState>> {
    state
        .lock()
        .map_err(|_| AnamnesisError::Other("message state lock poisoned".to_string()))
}

/// Write handle for one message of a [`ContextStore`](super::ContextStore).
///
/// Cloning yields another handle to the same message.
#[derive(Clone)]
pub struct MessageStore {
    pub(crate) state: SharedState,
    pub(crate) context: Arc<ContextInner>,
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MessageStore");
        match self.state.try_lock() {
            Ok(state) => debug
                .field("id", &state.id)
                .field("role", &state.role)
                .field("slots", &state.slots.len())
                .field("committed", &state.committed),
            Err(_) => debug.field("state", &"<locked>"),
        };
        debug.finish()
    }
}

impl MessageStore {
    pub(crate) fn new(state: SharedState, context: Arc<ContextInner>) -> Self {
        Self { state, context }
    }

    pub fn id(&self) -> Result<MessageId> {
        Ok(lock_state(&self.state)?.id)
    }

    pub fn role(&self) -> Result<Role> {
        Ok(lock_state(&self.state)?.role)
    }

    pub fn is_committed(&self) -> Result<bool> {
        Ok(lock_state(&self.state)?.committed)
    }

    /// Number of slots allocated so far, in any state
    pub fn slot_count(&self) -> Result<usize> {
        Ok(lock_state(&self.state)?.slots.len())
    }

    /// Content of every closed slot, in slot order
    pub fn contents(&self) -> Result<Vec<Content>> {
        let state = lock_state(&self.state)?;
        Ok(state
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Closed(content) => Some(content.clone()),
                _ => None,
            })
            .collect())
    }

    /// Open an appender on a new text slot at the end of the message
    pub fn new_text_content(&self) -> Result<ContentAppender> {
        self.open_new_slot(SlotKind::Text)
    }

    /// Open an appender on a new tool-use slot. Appended fragments form the
    /// JSON input of the call and are parsed on close.
    pub fn new_tool_use_content(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<ContentAppender> {
        self.open_new_slot(SlotKind::ToolUse {
            id: id.into(),
            name: name.into(),
        })
    }

    /// Re-acquire a slot whose previous appender was released without closing
    pub fn open_content(&self, index: usize) -> Result<ContentAppender> {
        let mut state = lock_state(&self.state)?;
        state.ensure_writable()?;
        let id = state.id;
        let slot = state.slots.get_mut(index).ok_or_else(|| {
            AnamnesisError::NotFound(format!("content slot {} of message {}", index, id))
        })?;

        let kind = match slot {
            Slot::Released(kind) => kind.clone(),
            Slot::Open(_) | Slot::Writing => {
                return Err(AnamnesisError::State(format!(
                    "content slot {} of message {} is occupied",
                    index, id
                )));
            }
            Slot::Closed(_) => {
                return Err(AnamnesisError::State(format!(
                    "content slot {} of message {} is already closed",
                    index, id
                )));
            }
            Slot::Abandoned => {
                return Err(AnamnesisError::State(format!(
                    "content slot {} of message {} cannot be reopened",
                    index, id
                )));
            }
        };
        *slot = Slot::Open(kind.clone());
        debug!(message = %id, slot = index, "Reopened content slot");
        Ok(ContentAppender::new(self.clone(), id, index, kind))
    }

    /// Write a complete binary item
    pub async fn new_binary_content(
        &self,
        media_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<usize> {
        self.write_whole(Content::Binary(Binary {
            media_type: media_type.into(),
            data,
        }))
        .await
    }

    /// Write a complete script-call item
    pub async fn new_script_call_content(&self, call: ScriptCall) -> Result<usize> {
        self.write_whole(Content::ScriptCall(call)).await
    }

    /// Attach a metadata entry, committed together with the message
    pub fn store_message_metadata(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(AnamnesisError::Validation(
                "metadata key cannot be empty".to_string(),
            ));
        }
        let mut state = lock_state(&self.state)?;
        state.ensure_writable()?;
        state.metadata.insert(key, value);
        Ok(())
    }

    /// Drive a stream of text fragments into a new text slot.
    ///
    /// The slot is closed when the stream ends and discarded on the first
    /// stream error, which is returned.
    pub async fn write_text<S>(&self, fragments: S) -> Result<usize>
    where
        S: Stream<Item = Result<String>>,
    {
        let mut appender = self.new_text_content()?;
        let slot = appender.slot();
        let mut fragments = std::pin::pin!(fragments);
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(fragment) => appender.append(&fragment),
                Err(err) => {
                    appender.discard();
                    return Err(err);
                }
            }
        }
        appender.close().await?;
        Ok(slot)
    }

    /// Commit the message: write the commit marker, then make the message
    /// visible in the ledger in one step.
    ///
    /// Appenders still open at this point are not included; closing them
    /// afterwards fails with a state error. The marker write and the publish
    /// run on their own task: once a commit has started it finishes even if
    /// the caller stops waiting, so a durable marker always ends up in the
    /// ledger.
    pub async fn commit(&self) -> Result<Message> {
        let message = {
            let mut state = lock_state(&self.state)?;
            state.ensure_writable()?;
            state.committing = true;
            state.snapshot(Utc::now())
        };
        let guard = CommittingGuard {
            state: Arc::clone(&self.state),
            armed: true,
        };

        tokio::spawn(self.clone().finish_commit(message, guard))
            .await
            .map_err(|e| AnamnesisError::Other(format!("commit task failed: {}", e)))?
    }

    async fn finish_commit(self, message: Message, guard: CommittingGuard) -> Result<Message> {
        if let Err(err) = self.context.sink.commit_message(&message).await {
            warn!(message = %message.id, error = %err, "Commit marker write failed");
            return Err(err.into());
        }

        self.context.publish(&self.state, message.clone())?;
        guard.disarm();

        info!(
            message = %message.id,
            role = %message.role,
            contents = message.contents.len(),
            "Committed message"
        );
        Ok(message)
    }

    fn open_new_slot(&self, kind: SlotKind) -> Result<ContentAppender> {
        let mut state = lock_state(&self.state)?;
        state.ensure_writable()?;
        let index = state.slots.len();
        state.slots.push(Slot::Open(kind.clone()));
        debug!(message = %state.id, slot = index, "Opened content slot");
        Ok(ContentAppender::new(self.clone(), state.id, index, kind))
    }

    async fn write_whole(&self, content: Content) -> Result<usize> {
        let (id, index) = {
            let mut state = lock_state(&self.state)?;
            state.ensure_writable()?;
            let index = state.slots.len();
            state.slots.push(Slot::Writing);
            (state.id, index)
        };
        let mut pending = PendingSlot {
            state: &self.state,
            index,
            done: false,
        };

        self.context.sink.append_content(id, index, &content).await?;

        let kind = content.kind();
        let mut state = lock_state(&self.state)?;
        if state.committed || state.committing {
            // The commit snapshot was taken while this item was being written
            return Err(AnamnesisError::State(format!(
                "message {} was committed before {} content in slot {} was written",
                id, kind, index
            )));
        }
        state.slots[index] = Slot::Closed(content);
        pending.done = true;
        debug!(message = %id, slot = index, kind, "Wrote content");
        Ok(index)
    }
}

/// Resets the `committing` flag unless the commit completed, so a failed
/// commit leaves the message writable.
struct CommittingGuard {
    state: SharedState,
    armed: bool,
}

impl CommittingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CommittingGuard {
    fn drop(&mut self) {
        if self.armed
            && let Ok(mut state) = self.state.lock()
        {
            state.committing = false;
        }
    }
}

/// Marks a whole-item slot abandoned if its write does not complete
struct PendingSlot<'a> {
    state: &'a SharedState,
    index: usize,
    done: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.done
            && let Ok(mut state) = self.state.lock()
            && let Some(slot) = state.slots.get_mut(self.index)
        {
            *slot = Slot::Abandoned;
        }
    }
}
