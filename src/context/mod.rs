//! Durable per-conversation message log and the prompt-window builder.
//!
//! One table on the embedded engine holds every conversation, keyed by
//! `g_<group_id>` / `p_<user_id>`. Each key is capped at 2000 rows; the
//! cap is enforced atomically with the insert inside a transaction using
//! the engine's `DELETE … ORDER BY … LIMIT` extension.

use crate::error::Result;
use crate::table::{Database, DbValue, Row};
use parking_lot::Mutex;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Max rows kept per context key.
pub const CONTEXT_CAP: usize = 2000;
/// UTF-8 byte budget for one prompt window.
pub const WINDOW_BUDGET_BYTES: usize = 15_000;
/// Rows fetched for the prompt window before budgeting.
const WINDOW_FETCH: usize = 200;
/// Default lazy-sweep horizon: seven days.
pub const DEFAULT_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextMessage {
    pub id: i64,
    pub context_key: String,
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    pub sender_name: String,
    pub sender_id: i64,
}

impl ContextMessage {
    fn from_row(row: &Row) -> Self {
        let get = |k: &str| row.get(k).cloned().unwrap_or(DbValue::Null);
        Self {
            id: get("id").as_int(),
            context_key: get("context_key").as_text().to_string(),
            role: get("role").as_text().to_string(),
            content: get("content").as_text().to_string(),
            timestamp: get("timestamp").as_int(),
            sender_name: get("sender_name").as_text().to_string(),
            sender_id: get("sender_id").as_int(),
        }
    }

    fn prompt_line(&self) -> String {
        if self.role == "user" {
            if self.sender_name.is_empty() {
                format!("User: {}", self.content)
            } else {
                format!("{}: {}", self.sender_name, self.content)
            }
        } else if self.sender_name.is_empty() {
            format!("Assistant: {}", self.content)
        } else {
            format!("{}: {}", self.sender_name, self.content)
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct ContextStore {
    db: Mutex<Database>,
    cap: usize,
    window_budget: usize,
}

impl ContextStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut db = Database::open(path)?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS messages (\
                id INTEGER, \
                context_key TEXT, \
                role TEXT, \
                content TEXT, \
                timestamp INTEGER, \
                sender_name TEXT, \
                sender_id INTEGER, \
                PRIMARY KEY(id))",
            &[],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_key ON messages (context_key)",
            &[],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages (timestamp)",
            &[],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages (sender_name)",
            &[],
        )?;
        Ok(Self {
            db: Mutex::new(db),
            cap: CONTEXT_CAP,
            window_budget: WINDOW_BUDGET_BYTES,
        })
    }

    #[cfg(test)]
    fn with_limits(path: &Path, cap: usize, window_budget: usize) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.cap = cap;
        store.window_budget = window_budget;
        Ok(store)
    }

    /// Insert one message, trimming the oldest rows for the key when the
    /// cap is exceeded. Insert and trim commit together.
    pub fn append(
        &self,
        context_key: &str,
        role: &str,
        content: &str,
        sender_name: &str,
        sender_id: i64,
    ) -> Result<()> {
        self.append_at(context_key, role, content, sender_name, sender_id, now_secs())
    }

    fn append_at(
        &self,
        context_key: &str,
        role: &str,
        content: &str,
        sender_name: &str,
        sender_id: i64,
        timestamp: i64,
    ) -> Result<()> {
        let mut db = self.db.lock();
        db.begin()?;
        let result: Result<()> = (|| {
            db.execute(
                "INSERT INTO messages (context_key, role, content, timestamp, sender_name, sender_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    DbValue::Text(context_key.into()),
                    DbValue::Text(role.into()),
                    DbValue::Text(content.into()),
                    DbValue::Int(timestamp),
                    DbValue::Text(sender_name.into()),
                    DbValue::Int(sender_id),
                ],
            )?;
            let count = db
                .query(
                    "SELECT id FROM messages WHERE context_key = ?",
                    &[DbValue::Text(context_key.into())],
                )?
                .len();
            if count > self.cap {
                db.execute(
                    "DELETE FROM messages WHERE context_key = ? ORDER BY timestamp LIMIT ?",
                    &[
                        DbValue::Text(context_key.into()),
                        DbValue::Int((count - self.cap) as i64),
                    ],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => db.commit(),
            Err(e) => {
                let _ = db.rollback();
                Err(e)
            }
        }
    }

    /// Most recent `n` rows in ascending time order.
    pub fn recent(&self, context_key: &str, n: usize) -> Result<Vec<ContextMessage>> {
        let db = self.db.lock();
        let mut rows = db.query(
            "SELECT * FROM messages WHERE context_key = ? ORDER BY id DESC LIMIT ?",
            &[DbValue::Text(context_key.into()), DbValue::Int(n as i64)],
        )?;
        rows.reverse();
        Ok(rows.iter().map(ContextMessage::from_row).collect())
    }

    fn all_for_key(&self, context_key: &str) -> Result<Vec<ContextMessage>> {
        let db = self.db.lock();
        let rows = db.query(
            "SELECT * FROM messages WHERE context_key = ? ORDER BY id",
            &[DbValue::Text(context_key.into())],
        )?;
        Ok(rows.iter().map(ContextMessage::from_row).collect())
    }

    /// Most recent `n` messages containing `substr`, ascending.
    pub fn search_keyword(
        &self,
        context_key: &str,
        substr: &str,
        n: usize,
    ) -> Result<Vec<ContextMessage>> {
        let mut hits: Vec<ContextMessage> = self
            .all_for_key(context_key)?
            .into_iter()
            .filter(|m| m.content.contains(substr))
            .collect();
        if hits.len() > n {
            hits.drain(..hits.len() - n);
        }
        Ok(hits)
    }

    /// Most recent `n` messages from `sender_name`, ascending.
    pub fn search_sender(
        &self,
        context_key: &str,
        sender_name: &str,
        n: usize,
    ) -> Result<Vec<ContextMessage>> {
        let mut hits: Vec<ContextMessage> = self
            .all_for_key(context_key)?
            .into_iter()
            .filter(|m| m.sender_name == sender_name)
            .collect();
        if hits.len() > n {
            hits.drain(..hits.len() - n);
        }
        Ok(hits)
    }

    /// Messages with `from <= timestamp <= to`, ascending, capped at `n`.
    pub fn time_range(
        &self,
        context_key: &str,
        from: i64,
        to: i64,
        n: usize,
    ) -> Result<Vec<ContextMessage>> {
        let mut hits: Vec<ContextMessage> = self
            .all_for_key(context_key)?
            .into_iter()
            .filter(|m| m.timestamp >= from && m.timestamp <= to)
            .collect();
        if hits.len() > n {
            hits.drain(..hits.len() - n);
        }
        Ok(hits)
    }

    /// Delete all rows for a key.
    pub fn clear(&self, context_key: &str) -> Result<usize> {
        let mut db = self.db.lock();
        db.execute(
            "DELETE FROM messages WHERE context_key = ?",
            &[DbValue::Text(context_key.into())],
        )
    }

    /// Delete rows older than `older_than_s` seconds, across all keys.
    pub fn sweep(&self, older_than_s: i64) -> Result<usize> {
        let cutoff = now_secs() - older_than_s;
        let mut db = self.db.lock();
        let stale = db
            .query("SELECT id, timestamp FROM messages ORDER BY timestamp", &[])?
            .iter()
            .filter(|row| {
                row.get("timestamp")
                    .map(|v| v.as_int() < cutoff)
                    .unwrap_or(false)
            })
            .count();
        if stale == 0 {
            return Ok(0);
        }
        db.execute(
            "DELETE FROM messages ORDER BY timestamp LIMIT ?",
            &[DbValue::Int(stale as i64)],
        )
    }

    pub fn count(&self, context_key: &str) -> Result<usize> {
        let db = self.db.lock();
        Ok(db
            .query(
                "SELECT id FROM messages WHERE context_key = ?",
                &[DbValue::Text(context_key.into())],
            )?
            .len())
    }

    /// Assemble the history window handed to the AI, capped at the byte
    /// budget. When the full tail does not fit, the start index jumps to
    /// the midpoint of the remaining tail until it does.
    pub fn build_window(&self, context_key: &str, _current_query: &str) -> Result<String> {
        let messages = self.recent(context_key, WINDOW_FETCH)?;
        if messages.is_empty() {
            return Ok(String::new());
        }

        let lines: Vec<String> = messages.iter().map(|m| m.prompt_line()).collect();
        let total = lines.len();
        let mut start = 0usize;

        loop {
            let shown = total - start;
            let truncated = start > 0;
            let header = if truncated {
                format!("[chat history: last {shown} of {total} messages, truncated]")
            } else {
                format!("[chat history: {shown} messages]")
            };
            let body_bytes: usize = lines[start..].iter().map(|l| l.len() + 1).sum();
            if header.len() + 1 + body_bytes <= self.window_budget || start + 1 >= total {
                let mut out = header;
                for line in &lines[start..] {
                    out.push('\n');
                    out.push_str(line);
                }
                return Ok(out);
            }
            start += (total - start) / 2;
        }
    }
}
