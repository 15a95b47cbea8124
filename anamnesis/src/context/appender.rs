//! Exclusive, buffered writer for one content slot.

use tracing::{debug, trace, warn};

use super::message::{Content, MessageId, ToolUse};
use super::message_store::{MessageStore, Slot, SlotKind, lock_state};
use crate::{AnamnesisError, Result};

/// Owns one content slot of an uncommitted message until it is closed,
/// discarded or dropped.
///
/// Fragments are only buffered by [`append`](Self::append); [`close`](Self::close)
/// flushes them to the content sink and into the message. A slot released
/// without closing (discard, drop, failed close) can be reopened with
/// [`MessageStore::open_content`].
#[derive(Debug)]
pub struct ContentAppender {
    message: MessageStore,
    message_id: MessageId,
    slot: usize,
    kind: SlotKind,
    buffer: String,
    finished: bool,
}

impl ContentAppender {
    pub(crate) fn new(
        message: MessageStore,
        message_id: MessageId,
        slot: usize,
        kind: SlotKind,
    ) -> Self {
        Self {
            message,
            message_id,
            slot,
            kind,
            buffer: String::new(),
            finished: false,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Index of the slot within the message
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Fragments appended so far
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn append(&mut self, fragment: &str) {
        trace!(
            message = %self.message_id,
            slot = self.slot,
            len = fragment.len(),
            "Appending fragment"
        );
        self.buffer.push_str(fragment);
    }

    /// Flush the buffer into the message.
    ///
    /// On any error the slot is released rather than closed.
    pub async fn close(mut self) -> Result<()> {
        match self.flush().await {
            Ok(kind) => {
                self.finished = true;
                debug!(message = %self.message_id, slot = self.slot, kind, "Closed content slot");
                Ok(())
            }
            Err(err) => {
                self.release();
                debug!(
                    message = %self.message_id,
                    slot = self.slot,
                    error = %err,
                    "Close failed, released slot"
                );
                Err(err)
            }
        }
    }

    async fn flush(&mut self) -> Result<&'static str> {
        let content = match &self.kind {
            SlotKind::Text => Content::Text(std::mem::take(&mut self.buffer)),
            SlotKind::ToolUse { id, name } => {
                let input = if self.buffer.trim().is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_str(&self.buffer).map_err(|e| {
                        AnamnesisError::Validation(format!(
                            "tool use input in slot {} of message {} is not valid JSON: {}",
                            self.slot, self.message_id, e
                        ))
                    })?
                };
                Content::ToolUse(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input,
                })
            }
        };

        lock_state(&self.message.state)?.ensure_writable()?;

        self.message
            .context
            .sink
            .append_content(self.message_id, self.slot, &content)
            .await?;

        let kind = content.kind();
        let mut state = lock_state(&self.message.state)?;
        state.ensure_writable()?;
        match state.slots.get_mut(self.slot) {
            Some(slot) if matches!(slot, Slot::Open(_)) => *slot = Slot::Closed(content),
            _ => {
                return Err(AnamnesisError::State(format!(
                    "content slot {} of message {} is no longer owned by this appender",
                    self.slot, self.message_id
                )));
            }
        }
        Ok(kind)
    }

    /// Release the slot without writing anything
    pub fn discard(mut self) {
        self.release();
        debug!(message = %self.message_id, slot = self.slot, "Discarded content slot");
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Ok(mut state) = lock_state(&self.message.state)
            && let Some(slot) = state.slots.get_mut(self.slot)
            && matches!(slot, Slot::Open(_))
        {
            *slot = Slot::Released(self.kind.clone());
        }
    }
}

impl Drop for ContentAppender {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                message = %self.message_id,
                slot = self.slot,
                buffered = self.buffer.len(),
                "Content appender dropped without close, releasing slot"
            );
            self.release();
        }
    }
}
