//! File-backed outbound message queue.
//!
//! Scripted plugins append one JSON object per line to
//! `<data_dir>/py_msg_queue.jsonl`; a drain worker empties the file every
//! 50 ms and invokes the transport send callbacks in file order. Lines
//! that cannot be handled yet are re-appended for the next tick, so
//! delivery is at-least-once.

use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE_FILE_NAME: &str = "py_msg_queue.jsonl";
pub const DRAIN_TICK: Duration = Duration::from_millis(50);

/// message text, target id
pub type SendCallback = Arc<dyn Fn(&str, i64) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub action: String,
    pub target_id: i64,
    pub message: String,
}

pub struct OutboundQueue {
    path: PathBuf,
    file_lock: Mutex<()>,
    send_group: RwLock<Option<SendCallback>>,
    send_private: RwLock<Option<SendCallback>>,
    running: AtomicBool,
}

impl OutboundQueue {
    pub fn new(data_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Arc::new(Self {
            path: data_dir.join(QUEUE_FILE_NAME),
            file_lock: Mutex::new(()),
            send_group: RwLock::new(None),
            send_private: RwLock::new(None),
            running: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_send_group(&self, cb: SendCallback) {
        *self.send_group.write() = Some(cb);
    }

    pub fn set_send_private(&self, cb: SendCallback) {
        *self.send_private.write() = Some(cb);
    }

    /// Producer side: append one entry under the queue lock.
    pub fn enqueue(&self, item: &QueueItem) -> Result<()> {
        let line = serde_json::to_string(item)
            .map_err(|e| crate::error::BotError::Io(std::io::Error::other(e)))?;
        let _guard = self.file_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// One drain pass: read everything, truncate, dispatch in file order.
    /// Returns how many entries were delivered.
    pub fn drain_once(&self) -> Result<usize> {
        let lines: Vec<String> = {
            let _guard = self.file_lock.lock();
            if !self.path.exists() {
                return Ok(0);
            }
            let text = std::fs::read_to_string(&self.path)?;
            if text.is_empty() {
                return Ok(0);
            }
            std::fs::write(&self.path, "")?;
            text.lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut delivered = 0usize;
        let mut retry: Vec<String> = Vec::new();

        for line in lines {
            let item: QueueItem = match serde_json::from_str(&line) {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!(error = %e, "queue line kept for retry");
                    retry.push(line);
                    continue;
                }
            };
            // Missing required fields: the entry can never become valid,
            // drop it instead of spinning on it forever.
            if item.action.is_empty() || item.target_id == 0 || item.message.is_empty() {
                continue;
            }
            let callback = match item.action.as_str() {
                "send_group_msg" => self.send_group.read().clone(),
                "send_private_msg" => self.send_private.read().clone(),
                _ => None,
            };
            match callback {
                Some(cb) => {
                    cb(&item.message, item.target_id);
                    delivered += 1;
                    tracing::debug!(
                        action = %item.action,
                        target = item.target_id,
                        len = item.message.len(),
                        "queue entry delivered"
                    );
                }
                None => retry.push(line),
            }
        }

        if !retry.is_empty() {
            let _guard = self.file_lock.lock();
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            for line in &retry {
                writeln!(file, "{line}")?;
            }
        }
        Ok(delivered)
    }

    /// Spawn the drain worker.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRAIN_TICK);
            while queue.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(e) = queue.drain_once() {
                    tracing::error!(error = %e, "queue drain failed");
                }
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
