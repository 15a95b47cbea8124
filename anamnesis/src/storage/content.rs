//! Content sinks: where closed message content and commit markers are persisted

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, warn};

use crate::context::message::{Content, Message, MessageId};
use crate::storage::errors::StorageError;
use crate::storage::traits::ContentSink;

/// Content sink that keeps everything in process memory.
///
/// Closed slots are held only until their message commits; the committed
/// message then carries the content.
#[derive(Debug, Default)]
pub struct MemoryContentSink {
    contents: Mutex<HashMap<(MessageId, usize), Content>>,
    committed: Mutex<BTreeMap<MessageId, Message>>,
}

impl MemoryContentSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content appended for a slot of a not yet committed message
    pub fn content(&self, message_id: MessageId, slot: usize) -> Option<Content> {
        self.contents
            .lock()
            .ok()
            .and_then(|contents| contents.get(&(message_id, slot)).cloned())
    }

    pub fn committed_count(&self) -> usize {
        self.committed.lock().map(|c| c.len()).unwrap_or(0)
    }
}

fn poisoned() -> StorageError {
    StorageError::Internal("content sink lock poisoned".to_string())
}

#[async_trait]
impl ContentSink for MemoryContentSink {
    async fn append_content(
        &self,
        message_id: MessageId,
        slot: usize,
        content: &Content,
    ) -> Result<(), StorageError> {
        self.contents
            .lock()
            .map_err(|_| poisoned())?
            .insert((message_id, slot), content.clone());
        Ok(())
    }

    async fn commit_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut committed = self.committed.lock().map_err(|_| poisoned())?;
        let mut contents = self.contents.lock().map_err(|_| poisoned())?;
        committed.insert(message.id, message.clone());
        contents.retain(|(id, _), _| *id != message.id);
        Ok(())
    }

    async fn load_committed(&self) -> Result<Vec<Message>, StorageError> {
        Ok(self
            .committed
            .lock()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }

    async fn highest_message_id(&self) -> Result<Option<MessageId>, StorageError> {
        let committed = self.committed.lock().map_err(|_| poisoned())?;
        let contents = self.contents.lock().map_err(|_| poisoned())?;
        Ok(committed
            .keys()
            .copied()
            .chain(contents.keys().map(|(id, _)| *id))
            .max())
    }
}

const COMMIT_MARKER: &str = "message.json";

/// Content sink writing one directory per message:
///
/// ```text
/// <root>/000001/000000-text.txt
/// <root>/000001/000001-tool_use.json
/// <root>/000001/message.json      (commit marker, the full committed message)
/// ```
///
/// A message directory without a commit marker is an uncommitted message and
/// is ignored when the ledger is restored.
#[derive(Debug, Clone)]
pub struct FileContentSink {
    root: PathBuf,
}

impl FileContentSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn message_dir(&self, message_id: MessageId) -> PathBuf {
        self.root.join(format!("{:06}", message_id.value()))
    }

    fn content_path(&self, message_id: MessageId, slot: usize, content: &Content) -> PathBuf {
        let extension = match content {
            Content::Text(_) => "txt",
            _ => "json",
        };
        self.message_dir(message_id)
            .join(format!("{:06}-{}.{}", slot, content.kind(), extension))
    }
}

/// Write through a temporary file so readers never see a partial file
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ContentSink for FileContentSink {
    async fn append_content(
        &self,
        message_id: MessageId,
        slot: usize,
        content: &Content,
    ) -> Result<(), StorageError> {
        fs::create_dir_all(self.message_dir(message_id)).await?;
        let path = self.content_path(message_id, slot, content);
        let bytes = match content {
            Content::Text(text) => text.as_bytes().to_vec(),
            other => serde_json::to_vec_pretty(other)?,
        };
        write_atomically(&path, &bytes).await?;
        debug!(path = %path.display(), "Wrote content file");
        Ok(())
    }

    async fn commit_message(&self, message: &Message) -> Result<(), StorageError> {
        let dir = self.message_dir(message.id);
        fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(message)?;
        write_atomically(&dir.join(COMMIT_MARKER), &bytes).await?;
        debug!(message = %message.id, dir = %dir.display(), "Wrote commit marker");
        Ok(())
    }

    /// Scans every message directory, with or without a commit marker
    async fn highest_message_id(&self) -> Result<Option<MessageId>, StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut highest = None;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                highest = highest.max(Some(id));
            }
        }
        Ok(highest.map(MessageId::new))
    }

    async fn load_committed(&self) -> Result<Vec<Message>, StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<u64>().ok()) else {
                continue;
            };
            let marker = entry.path().join(COMMIT_MARKER);
            let bytes = match fs::read(&marker).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(message = id, "Skipping uncommitted message directory");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let message: Message = serde_json::from_slice(&bytes)?;
            if message.id.value() != id {
                warn!(
                    directory = id,
                    message = %message.id,
                    "Commit marker id does not match its directory"
                );
                return Err(StorageError::Validation(format!(
                    "commit marker in {} belongs to message {}",
                    marker.display(),
                    message.id
                )));
            }
            messages.push(message);
        }

        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::message::{Binary, Role};
    use chrono::Utc;

    fn message(id: u64, contents: Vec<Content>) -> Message {
        Message {
            id: MessageId::new(id),
            role: Role::User,
            created_at: Utc::now(),
            committed_at: Some(Utc::now()),
            contents,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileContentSink::new(dir.path());
        let text = Content::Text("Hello, world".to_string());
        sink.append_content(MessageId::new(3), 0, &text).await.unwrap();
        sink.commit_message(&message(3, vec![text])).await.unwrap();

        let message_dir = dir.path().join("000003");
        let written = std::fs::read_to_string(message_dir.join("000000-text.txt")).unwrap();
        assert_eq!(written, "Hello, world");
        assert!(message_dir.join("message.json").exists());
    }

    #[tokio::test]
    async fn test_load_skips_uncommitted_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileContentSink::new(dir.path());

        let binary = Content::Binary(Binary {
            media_type: "application/octet-stream".to_string(),
            data: vec![9, 8, 7],
        });
        sink.commit_message(&message(10, vec![binary.clone()]))
            .await
            .unwrap();
        sink.commit_message(&message(2, Vec::new())).await.unwrap();
        sink.append_content(MessageId::new(11), 0, &binary)
            .await
            .unwrap();

        let loaded = sink.load_committed().await.unwrap();
        let ids: Vec<u64> = loaded.iter().map(|m| m.id.value()).collect();
        assert_eq!(ids, vec![2, 10]);
        assert_eq!(loaded[1].contents, vec![binary]);
    }

    #[tokio::test]
    async fn test_missing_root_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileContentSink::new(dir.path().join("not-there"));
        assert!(sink.load_committed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_sink_releases_slots_on_commit() {
        let sink = MemoryContentSink::new();
        let text = Content::Text("x".to_string());
        sink.append_content(MessageId::new(1), 4, &text).await.unwrap();
        sink.append_content(MessageId::new(2), 0, &text).await.unwrap();
        assert_eq!(sink.content(MessageId::new(1), 4), Some(text.clone()));
        assert_eq!(sink.committed_count(), 0);

        sink.commit_message(&message(1, vec![text.clone()]))
            .await
            .unwrap();
        assert_eq!(sink.content(MessageId::new(1), 4), None);
        assert_eq!(sink.content(MessageId::new(2), 0), Some(text));
        assert_eq!(sink.committed_count(), 1);
        assert_eq!(
            sink.highest_message_id().await.unwrap(),
            Some(MessageId::new(2))
        );
    }

    #[tokio::test]
    async fn test_highest_id_includes_uncommitted_directories() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileContentSink::new(dir.path());
        assert_eq!(sink.highest_message_id().await.unwrap(), None);

        sink.commit_message(&message(4, Vec::new())).await.unwrap();
        sink.append_content(MessageId::new(7), 0, &Content::Text("draft".to_string()))
            .await
            .unwrap();
        std::fs::write(dir.path().join("99"), b"not a message").unwrap();

        assert_eq!(
            sink.highest_message_id().await.unwrap(),
            Some(MessageId::new(7))
        );
        assert_eq!(sink.load_committed().await.unwrap().len(), 1);
    }
}
