//! ABOUTME: File-backed broker transport — one JSON file per message under
//! ABOUTME: `<base_dir>/<queue>/{pending,processing,dead_letter}/`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::message::{MessageStatus, QueueMessage};
use crate::transport::{QueueTransport, DEFAULT_QUEUE};

/// A queue transport that persists each message as a JSON file on disk,
/// for single-host deployments that want at-least-once delivery to survive
/// a process restart without standing up an external broker. A single
/// in-process mutex serialises directory scans the way the in-memory
/// transport serialises its Vec.
pub struct FileQueue {
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileQueue {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(Self {
            base_dir,
            lock: Mutex::new(()),
        })
    }

    fn queue_dir(&self, queue: &str, sub: &str) -> PathBuf {
        self.base_dir.join(queue).join(sub)
    }

    fn ensure_dirs(&self, queue: &str) -> Result<()> {
        for sub in ["pending", "processing", "dead_letter"] {
            std::fs::create_dir_all(self.queue_dir(queue, sub))
                .map_err(|e| QueueError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    fn message_path(&self, queue: &str, sub: &str, id: &str) -> PathBuf {
        self.queue_dir(queue, sub).join(format!("{id}.json"))
    }

    fn write_message(&self, queue: &str, sub: &str, message: &QueueMessage) -> Result<()> {
        let path = self.message_path(queue, sub, &message.id);
        let body = serde_json::to_vec_pretty(message)?;
        std::fs::write(path, body).map_err(|e| QueueError::Transport(e.to_string()))
    }

    fn read_message(path: &Path) -> Result<QueueMessage> {
        let body = std::fs::read(path).map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Lists `sub`'s messages ordered by [`QueueMessage::sort_key`],
    /// mirroring the in-memory transport's priority/FIFO ordering since
    /// the filesystem gives us no native ordering primitive.
    fn list_sorted(&self, queue: &str, sub: &str) -> Result<Vec<(PathBuf, QueueMessage)>> {
        let dir = self.queue_dir(queue, sub);
        let mut entries = Vec::new();
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::Transport(e.to_string())),
        };
        for entry in read_dir {
            let entry = entry.map_err(|e| QueueError::Transport(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let message = Self::read_message(&path)?;
            entries.push((path, message));
        }
        entries.sort_by_key(|(_, m)| m.sort_key());
        Ok(entries)
    }
}

#[async_trait]
impl QueueTransport for FileQueue {
    async fn publish(&self, message: QueueMessage, queue: Option<&str>) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let _guard = self.lock.lock();
        self.ensure_dirs(queue)?;
        self.write_message(queue, "pending", &message)
    }

    async fn receive(&self, queue: Option<&str>, batch_size: usize) -> Result<Vec<QueueMessage>> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let _guard = self.lock.lock();
        self.ensure_dirs(queue)?;

        let pending = self.list_sorted(queue, "pending")?;
        let mut delivered = Vec::with_capacity(batch_size.min(pending.len()));
        for (path, mut message) in pending.into_iter().take(batch_size) {
            message.status = MessageStatus::Processing;
            message.attempts += 1;
            self.write_message(queue, "processing", &message)?;
            std::fs::remove_file(&path).map_err(|e| QueueError::Transport(e.to_string()))?;
            delivered.push(message);
        }
        Ok(delivered)
    }

    async fn ack(&self, queue: Option<&str>, id: &str) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let _guard = self.lock.lock();
        let path = self.message_path(queue, "processing", id);
        if !path.exists() {
            return Err(QueueError::NotFound(id.to_string()));
        }
        std::fs::remove_file(path).map_err(|e| QueueError::Transport(e.to_string()))
    }

    async fn nack(&self, queue: Option<&str>, id: &str, requeue: bool) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let _guard = self.lock.lock();
        let path = self.message_path(queue, "processing", id);
        if !path.exists() {
            return Err(QueueError::NotFound(id.to_string()));
        }
        let mut message = Self::read_message(&path)?;
        std::fs::remove_file(&path).map_err(|e| QueueError::Transport(e.to_string()))?;

        if requeue && message.attempts < message.max_attempts {
            message.status = MessageStatus::Pending;
            self.write_message(queue, "pending", &message)?;
        } else {
            message.status = MessageStatus::DeadLetter;
            self.write_message(queue, "dead_letter", &message)?;
        }
        Ok(())
    }

    async fn length(&self, queue: Option<&str>) -> Result<usize> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let _guard = self.lock.lock();
        Ok(self.list_sorted(queue, "pending")?.len() + self.list_sorted(queue, "processing")?.len())
    }

    async fn purge(&self, queue: Option<&str>) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let _guard = self.lock.lock();
        for sub in ["pending", "processing"] {
            for (path, _) in self.list_sorted(queue, sub)? {
                std::fs::remove_file(path).map_err(|e| QueueError::Transport(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn peek_dead_letter(&self, queue: Option<&str>) -> Result<Vec<QueueMessage>> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let _guard = self.lock.lock();
        Ok(self
            .list_sorted(queue, "dead_letter")?
            .into_iter()
            .map(|(_, m)| m)
            .collect())
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path()).unwrap();
        let message = QueueMessage::new("wf", json!({"x": 1}));
        let id = message.id.clone();

        queue.publish(message, None).await.unwrap();
        assert_eq!(queue.length(None).await.unwrap(), 1);

        let batch = queue.receive(None, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);

        queue.ack(None, &id).await.unwrap();
        assert_eq!(queue.length(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_exhausting_attempts_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path()).unwrap();
        let message = QueueMessage::new("wf", json!({})).with_max_attempts(1);
        let id = message.id.clone();

        queue.publish(message, None).await.unwrap();
        queue.receive(None, 1).await.unwrap();
        queue.nack(None, &id, true).await.unwrap();

        let dead = queue.peek_dead_letter(None).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
    }
}
