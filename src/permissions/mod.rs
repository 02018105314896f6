//! Persistent user/group permission store (`config/permissions.json`).

use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    User,
    Vip,
    Moderator,
    Admin,
    SuperAdmin,
    Owner,
}

impl PermissionLevel {
    pub fn from_code(code: i32) -> Self {
        match code {
            32.. => PermissionLevel::Owner,
            16..=31 => PermissionLevel::SuperAdmin,
            8..=15 => PermissionLevel::Admin,
            4..=7 => PermissionLevel::Moderator,
            2..=3 => PermissionLevel::Vip,
            _ => PermissionLevel::User,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            PermissionLevel::User => 1,
            PermissionLevel::Vip => 2,
            PermissionLevel::Moderator => 4,
            PermissionLevel::Admin => 8,
            PermissionLevel::SuperAdmin => 16,
            PermissionLevel::Owner => 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserEntry {
    pub level: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Epoch seconds; expired entries fall back to User.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

fn default_true() -> bool {
    true
}

fn default_daily_limit() -> i32 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    #[serde(default = "default_true")]
    pub ai_enabled: bool,
    #[serde(default = "default_true")]
    pub commands_enabled: bool,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: i32,
    #[serde(skip)]
    pub current_usage: i32,
    #[serde(skip)]
    pub last_reset_day: i64,
}

impl Default for GroupEntry {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            commands_enabled: true,
            daily_limit: default_daily_limit(),
            current_usage: 0,
            last_reset_day: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PermissionsFile {
    #[serde(default)]
    owners: Vec<i64>,
    #[serde(default)]
    users: BTreeMap<String, UserEntry>,
    #[serde(default)]
    groups: BTreeMap<String, GroupEntry>,
}

struct Inner {
    owners: BTreeSet<i64>,
    users: BTreeMap<i64, UserEntry>,
    groups: BTreeMap<i64, GroupEntry>,
}

pub struct PermissionStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl PermissionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file: PermissionsFile = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            PermissionsFile::default()
        };

        let inner = Inner {
            owners: file.owners.into_iter().collect(),
            users: file
                .users
                .into_iter()
                .filter_map(|(k, v)| k.parse().ok().map(|id: i64| (id, v)))
                .collect(),
            groups: file
                .groups
                .into_iter()
                .filter_map(|(k, v)| k.parse().ok().map(|id: i64| (id, v)))
                .collect(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    fn save_locked(&self, inner: &Inner) -> Result<()> {
        let file = PermissionsFile {
            owners: inner.owners.iter().copied().collect(),
            users: inner
                .users
                .iter()
                .map(|(id, v)| (id.to_string(), v.clone()))
                .collect(),
            groups: inner
                .groups
                .iter()
                .map(|(id, v)| (id.to_string(), v.clone()))
                .collect(),
        };
        let text = serde_json::to_string_pretty(&file)
            .map_err(|e| crate::error::BotError::Io(std::io::Error::other(e)))?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        self.inner.lock().owners.contains(&user_id)
    }

    pub fn add_owner(&self, user_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.owners.insert(user_id);
        self.save_locked(&inner)
    }

    pub fn remove_owner(&self, user_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.owners.remove(&user_id);
        self.save_locked(&inner)
    }

    pub fn level_of(&self, user_id: i64) -> PermissionLevel {
        let inner = self.inner.lock();
        if inner.owners.contains(&user_id) {
            return PermissionLevel::Owner;
        }
        match inner.users.get(&user_id) {
            Some(entry) => {
                if entry.expires.is_some_and(|exp| exp > 0 && now_secs() > exp) {
                    PermissionLevel::User
                } else {
                    PermissionLevel::from_code(entry.level)
                }
            }
            None => PermissionLevel::User,
        }
    }

    pub fn set_user_level(
        &self,
        user_id: i64,
        level: PermissionLevel,
        note: Option<String>,
        expires: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.users.insert(
            user_id,
            UserEntry {
                level: level.code(),
                note,
                expires,
            },
        );
        self.save_locked(&inner)
    }

    pub fn group_entry(&self, group_id: i64) -> GroupEntry {
        self.inner
            .lock()
            .groups
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_group_entry(&self, group_id: i64, entry: GroupEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.groups.insert(group_id, entry);
        self.save_locked(&inner)
    }

    pub fn group_ai_enabled(&self, group_id: i64) -> bool {
        self.group_entry(group_id).ai_enabled
    }

    /// Count one use against the group's daily limit; false when the
    /// limit is exhausted. Usage resets on day rollover.
    pub fn consume_group_usage(&self, group_id: i64) -> bool {
        let today = now_secs() / 86_400;
        let mut inner = self.inner.lock();
        let entry = inner.groups.entry(group_id).or_default();
        if entry.last_reset_day != today {
            entry.current_usage = 0;
            entry.last_reset_day = today;
        }
        if entry.daily_limit > 0 && entry.current_usage >= entry.daily_limit {
            return false;
        }
        entry.current_usage += 1;
        true
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "owners": inner.owners.iter().collect::<Vec<_>>(),
            "users": inner
                .users
                .iter()
                .map(|(id, e)| (id.to_string(), serde_json::json!({
                    "level": e.level,
                    "note": e.note,
                    "expires": e.expires,
                })))
                .collect::<BTreeMap<_, _>>(),
            "groups": inner
                .groups
                .iter()
                .map(|(id, e)| (id.to_string(), serde_json::json!({
                    "ai_enabled": e.ai_enabled,
                    "commands_enabled": e.commands_enabled,
                    "daily_limit": e.daily_limit,
                })))
                .collect::<BTreeMap<_, _>>(),
        })
    }
}
