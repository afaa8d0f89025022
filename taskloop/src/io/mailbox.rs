//! Durable mailbox of pending change requests (`mailbox.json`).
//!
//! Every mutation holds an exclusive lock on `mailbox.lock`, so a message sent
//! while the orchestrator drains the box lands either in the drained batch or
//! in the next one, never in both and never nowhere.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::merge::{ANONYMOUS, MailboxMessage, Priority, sort_for_merge};
use crate::io::fs::{FileLockGuard, read_json, write_json};
use crate::io::state_store::StatePaths;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct MailboxFile {
    messages: Vec<MailboxMessage>,
    last_checked: Option<DateTime<Utc>>,
    total_messages_received: u64,
}

/// Truncated view of one pending message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePreview {
    pub id: String,
    pub sender: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub content_preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxStatus {
    pub count: usize,
    pub previews: Vec<MessagePreview>,
    pub last_checked: Option<DateTime<Utc>>,
    pub total_messages_received: u64,
}

#[derive(Debug, Clone)]
pub struct MailboxStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl MailboxStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            path: paths.mailbox(),
            lock_path: paths.mailbox_lock(),
        }
    }

    /// Append a message and return its id. Content is stored verbatim.
    pub fn send(
        &self,
        content: &str,
        sender: &str,
        priority: Priority,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let sender = if sender.trim().is_empty() {
            ANONYMOUS
        } else {
            sender.trim()
        };
        let message = MailboxMessage {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            priority,
            timestamp: Utc::now(),
            metadata,
        };
        let id = message.id.clone();

        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let mut file = self.read();
        file.messages.push(message);
        file.total_messages_received += 1;
        write_json(&self.path, &file)?;
        info!(id = %id, sender, priority = %priority, "mailbox message received");
        Ok(id)
    }

    pub fn status(&self) -> Result<MailboxStatus> {
        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let file = self.read();
        let mut sorted = file.messages.clone();
        sort_for_merge(&mut sorted);
        let previews = sorted
            .iter()
            .map(|m| MessagePreview {
                id: m.id.clone(),
                sender: m.sender.clone(),
                priority: m.priority,
                timestamp: m.timestamp,
                content_preview: preview(&m.content),
            })
            .collect();
        Ok(MailboxStatus {
            count: file.messages.len(),
            previews,
            last_checked: file.last_checked,
            total_messages_received: file.total_messages_received,
        })
    }

    /// Atomically take every pending message, in merge order.
    pub fn get_and_clear(&self) -> Result<Vec<MailboxMessage>> {
        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let mut file = self.read();
        let mut batch = std::mem::take(&mut file.messages);
        file.last_checked = Some(Utc::now());
        write_json(&self.path, &file)?;
        sort_for_merge(&mut batch);
        debug!(count = batch.len(), "mailbox drained");
        Ok(batch)
    }

    /// Drop every pending message. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let mut file = self.read();
        let removed = file.messages.len();
        file.messages.clear();
        write_json(&self.path, &file)?;
        info!(removed, "mailbox cleared");
        Ok(removed)
    }

    /// Put a drained batch back after its plan update failed. The messages
    /// keep their ids and timestamps and do not count as newly received.
    pub fn restore(&self, batch: Vec<MailboxMessage>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = FileLockGuard::acquire(&self.lock_path)?;
        let mut file = self.read();
        let restored = batch.len();
        let newer: Vec<MailboxMessage> = std::mem::take(&mut file.messages)
            .into_iter()
            .filter(|m| !batch.iter().any(|b| b.id == m.id))
            .collect();
        file.messages = batch;
        file.messages.extend(newer);
        write_json(&self.path, &file)?;
        warn!(restored, "mailbox batch restored");
        Ok(())
    }

    /// Corrupt or missing files read as an empty mailbox.
    fn read(&self) -> MailboxFile {
        if !self.path.exists() {
            return MailboxFile::default();
        }
        match read_json(&self.path) {
            Ok(file) => file,
            Err(err) => {
                warn!(err = %err, path = %self.path.display(), "unreadable mailbox, treating as empty");
                MailboxFile::default()
            }
        }
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    let mut out: String = content.chars().take(PREVIEW_CHARS - 3).collect();
    out.push_str("...");
    out
}
