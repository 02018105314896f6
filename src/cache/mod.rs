//! LRU + TTL response cache with a byte budget and optional persistence.
//!
//! LRU order lives in an intrusive doubly-linked list over a slab of
//! nodes; the entry map stores each key's node index so promotion on hit
//! is O(1). `get_or_compute` deliberately does not serialize the miss
//! path; concurrent computations may race and the last write wins.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_BYTES: usize = 100 * 1024 * 1024;
pub const DEFAULT_TTL_SECS: i64 = 3600;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_bytes: usize,
    pub entry_count: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    value: String,
    created_at: i64,
    /// 0 = never expires.
    expires_at: i64,
    last_accessed: i64,
    access_count: u64,
    bytes: usize,
    node: usize,
}

struct LruNode {
    key: String,
    prev: usize,
    next: usize,
}

/// MRU at head, LRU at tail.
struct LruList {
    nodes: Vec<LruNode>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruList {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn push_front(&mut self, key: String) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = LruNode {
                    key,
                    prev: NIL,
                    next: self.head,
                };
                idx
            }
            None => {
                self.nodes.push(LruNode {
                    key,
                    prev: NIL,
                    next: self.head,
                });
                self.nodes.len() - 1
            }
        };
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
        self.free.push(idx);
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        let key = self.nodes[idx].key.clone();
        self.unlink(idx);
        // unlink pushed idx to the free list; reuse it immediately.
        let new_idx = self.push_front(key);
        debug_assert_eq!(new_idx, idx);
    }

    fn tail_key(&self) -> Option<&str> {
        if self.tail == NIL {
            None
        } else {
            Some(&self.nodes[self.tail].key)
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    lru: LruList,
    stats: CacheStats,
}

pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    default_ttl: i64,
    persist_path: Option<PathBuf>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ResponseCache {
    pub fn new(max_bytes: usize, default_ttl: i64, persist_path: Option<PathBuf>) -> Self {
        let cache = Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru: LruList::new(),
                stats: CacheStats::default(),
            }),
            max_bytes,
            default_ttl,
            persist_path,
        };
        if cache.persist_path.is_some() {
            if let Err(e) = cache.load_from_disk() {
                tracing::warn!(error = %e, "cache reload failed");
            }
        }
        cache
    }

    /// FNV-1a over `prompt|model|context`, rendered as hex.
    pub fn cache_key(prompt: &str, model: &str, context: &str) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for chunk in [prompt, "|", model, "|", context] {
            for b in chunk.bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
            }
        }
        format!("{hash:x}")
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = now_secs();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(key) else {
            inner.stats.misses += 1;
            return None;
        };
        if entry.expires_at > 0 && entry.expires_at < now {
            let node = entry.node;
            let bytes = entry.bytes;
            inner.entries.remove(key);
            inner.lru.unlink(node);
            inner.stats.total_bytes -= bytes;
            inner.stats.entry_count -= 1;
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }
        let entry = inner.entries.get_mut(key).expect("checked above");
        entry.last_accessed = now;
        entry.access_count += 1;
        let value = entry.value.clone();
        let node = entry.node;
        inner.lru.move_to_front(node);
        inner.stats.hits += 1;
        Some(value)
    }

    /// Insert or replace. `ttl` of `None` uses the default; `Some(0)`
    /// never expires.
    pub fn set(&self, key: &str, value: &str, ttl: Option<i64>) {
        let now = now_secs();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = if ttl > 0 { now + ttl } else { 0 };
        let bytes = value.len();

        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            let old_bytes = entry.bytes;
            entry.value = value.to_string();
            entry.bytes = bytes;
            entry.expires_at = expires_at;
            entry.last_accessed = now;
            let node = entry.node;
            inner.lru.move_to_front(node);
            inner.stats.total_bytes = inner.stats.total_bytes - old_bytes + bytes;
            return;
        }

        // Evict from the LRU end until the new entry fits.
        while inner.stats.total_bytes + bytes > self.max_bytes {
            let Some(victim) = inner.lru.tail_key().map(str::to_string) else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.lru.unlink(entry.node);
                inner.stats.total_bytes -= entry.bytes;
                inner.stats.entry_count -= 1;
                inner.stats.evictions += 1;
            }
        }

        let node = inner.lru.push_front(key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                created_at: now,
                expires_at,
                last_accessed: now,
                access_count: 0,
                bytes,
                node,
            },
        );
        inner.stats.total_bytes += bytes;
        inner.stats.entry_count += 1;
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            inner.lru.unlink(entry.node);
            inner.stats.total_bytes -= entry.bytes;
            inner.stats.entry_count -= 1;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.stats.total_bytes = 0;
        inner.stats.entry_count = 0;
    }

    pub fn clear_expired(&self) {
        let now = now_secs();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at > 0 && e.expires_at < now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.lru.unlink(entry.node);
                inner.stats.total_bytes -= entry.bytes;
                inner.stats.entry_count -= 1;
                inner.stats.expirations += 1;
            }
        }
    }

    /// Unserialized miss path: concurrent callers may all compute and the
    /// results overwrite one another.
    pub fn get_or_compute<F>(&self, key: &str, compute: F, ttl: Option<i64>) -> String
    where
        F: FnOnce() -> String,
    {
        if let Some(hit) = self.get(key) {
            return hit;
        }
        let value = compute();
        self.set(key, &value, ttl);
        value
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    // ── persistence ─────────────────────────────────────────────

    fn encode_value(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                other => out.push(other),
            }
        }
        out
    }

    fn decode_value(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        out
    }

    /// Write non-expired entries to the persistence file (tab-separated,
    /// one entry per line).
    pub fn save_to_disk(&self) -> std::io::Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let now = now_secs();
        let mut out = String::new();
        {
            let inner = self.inner.lock();
            for (key, entry) in &inner.entries {
                if entry.expires_at > 0 && entry.expires_at < now {
                    continue;
                }
                out.push_str(&format!(
                    "{key}\t{}\t{}\t{}\t{}\n",
                    entry.created_at,
                    entry.expires_at,
                    entry.access_count,
                    Self::encode_value(&entry.value)
                ));
            }
        }
        std::fs::write(path, out)
    }

    fn load_from_disk(&self) -> std::io::Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(path)?;
        let now = now_secs();
        for line in text.lines() {
            let mut parts = line.splitn(5, '\t');
            let (Some(key), Some(created), Some(expires), Some(access), Some(raw)) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                continue;
            };
            let expires_at: i64 = expires.parse().unwrap_or(0);
            if expires_at > 0 && expires_at < now {
                continue;
            }
            let value = Self::decode_value(raw);
            self.set(key, &value, Some(0));
            // Restore bookkeeping the plain set() cannot know.
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.created_at = created.parse().unwrap_or(now);
                entry.expires_at = expires_at;
                entry.access_count = access.parse().unwrap_or(0);
            }
        }
        Ok(())
    }

    /// Periodic expiry sweep + persist tick.
    pub fn start_maintenance(
        self: &std::sync::Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let cache = std::sync::Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                cache.clear_expired();
                if let Err(e) = cache.save_to_disk() {
                    tracing::warn!(error = %e, "cache persist failed");
                }
            }
        })
    }
}
