//! Conversation ledger
//!
//! A [`ContextStore`] hands out [`MessageStore`] handles for new messages.
//! Content is streamed into a message through [`ContentAppender`]s, one per
//! content slot, and the message becomes part of the ledger only when it is
//! committed.

pub mod appender;
pub mod message;
pub mod message_store;
pub mod store;

pub use appender::ContentAppender;
pub use message::{Binary, Content, Message, MessageId, Role, ScriptCall, ToolUse};
pub use message_store::MessageStore;
pub use store::{ContextStore, MessageStoreStream};
