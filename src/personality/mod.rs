//! Persona registry: a named system prompt per personality, a global
//! default, and per-group overrides.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const DEFAULT_PERSONALITY_ID: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Personality {
    pub id: String,
    pub name: String,
    pub prompt: String,
}

fn builtin_default() -> Personality {
    Personality {
        id: DEFAULT_PERSONALITY_ID.into(),
        name: "LCHBOT".into(),
        prompt: String::new(),
    }
}

struct Inner {
    personas: BTreeMap<String, Personality>,
    current: String,
    per_group: HashMap<i64, String>,
}

pub struct PersonalitySystem {
    config_path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl PersonalitySystem {
    /// `config_path` points at an optional JSON array of personalities.
    pub fn new(config_path: Option<PathBuf>) -> Self {
        let system = Self {
            config_path,
            inner: Mutex::new(Inner {
                personas: BTreeMap::new(),
                current: DEFAULT_PERSONALITY_ID.to_string(),
                per_group: HashMap::new(),
            }),
        };
        system.reload();
        system
    }

    /// Re-read the personality file; unknown current/group selections
    /// fall back to the default persona.
    pub fn reload(&self) {
        let mut personas = BTreeMap::new();
        let default = builtin_default();
        personas.insert(default.id.clone(), default);

        if let Some(path) = &self.config_path {
            match Self::load_file(path) {
                Ok(loaded) => {
                    for p in loaded {
                        personas.insert(p.id.clone(), p);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "personality reload failed");
                }
            }
        }

        let mut inner = self.inner.lock();
        if !personas.contains_key(&inner.current) {
            inner.current = DEFAULT_PERSONALITY_ID.to_string();
        }
        let stale: Vec<i64> = inner
            .per_group
            .iter()
            .filter(|(_, id)| !personas.contains_key(*id))
            .map(|(gid, _)| *gid)
            .collect();
        for gid in stale {
            inner.per_group.remove(&gid);
        }
        inner.personas = personas;
    }

    fn load_file(path: &Path) -> std::io::Result<Vec<Personality>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(std::io::Error::other)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .personas
            .values()
            .map(|p| (p.id.clone(), p.name.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().personas.len()
    }

    pub fn current_name(&self) -> String {
        let inner = self.inner.lock();
        inner
            .personas
            .get(&inner.current)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "LCHBOT".into())
    }

    pub fn current_prompt(&self) -> String {
        let inner = self.inner.lock();
        inner
            .personas
            .get(&inner.current)
            .map(|p| p.prompt.clone())
            .unwrap_or_default()
    }

    fn group_persona_id(inner: &Inner, group_id: i64) -> String {
        inner
            .per_group
            .get(&group_id)
            .cloned()
            .unwrap_or_else(|| inner.current.clone())
    }

    pub fn name_for_group(&self, group_id: i64) -> String {
        let inner = self.inner.lock();
        let id = Self::group_persona_id(&inner, group_id);
        inner
            .personas
            .get(&id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "LCHBOT".into())
    }

    pub fn prompt_for_group(&self, group_id: i64) -> String {
        let inner = self.inner.lock();
        let id = Self::group_persona_id(&inner, group_id);
        inner
            .personas
            .get(&id)
            .map(|p| p.prompt.clone())
            .unwrap_or_default()
    }

    /// Switch the global persona; false when the id is unknown.
    pub fn switch(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.personas.contains_key(id) {
            inner.current = id.to_string();
            true
        } else {
            false
        }
    }

    /// Switch one group's persona; false when the id is unknown.
    pub fn switch_for_group(&self, group_id: i64, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.personas.contains_key(id) {
            inner.per_group.insert(group_id, id.to_string());
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn with_personas() -> (TempDir, PersonalitySystem) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("personalities.json");
        std::fs::write(
            &path,
            serde_json::json!([
                {"id": "cat", "name": "Whiskers", "prompt": "You are a cat."},
                {"id": "pirate", "name": "Redbeard", "prompt": "Arr."}
            ])
            .to_string(),
        )
        .unwrap();
        let system = PersonalitySystem::new(Some(path));
        (tmp, system)
    }

    #[test]
    fn default_persona_always_present() {
        let system = PersonalitySystem::new(None);
        assert_eq!(system.count(), 1);
        assert_eq!(system.current_name(), "LCHBOT");
        assert_eq!(system.current_prompt(), "");
    }

    #[test]
    fn file_personas_load_and_switch() {
        let (_tmp, system) = with_personas();
        assert_eq!(system.count(), 3);
        assert!(system.switch("cat"));
        assert_eq!(system.current_name(), "Whiskers");
        assert!(!system.switch("dog"));
        assert_eq!(system.current_name(), "Whiskers");
    }

    #[test]
    fn group_override_beats_global() {
        let (_tmp, system) = with_personas();
        assert!(system.switch("cat"));
        assert!(system.switch_for_group(7, "pirate"));
        assert_eq!(system.name_for_group(7), "Redbeard");
        assert_eq!(system.prompt_for_group(7), "Arr.");
        // Unconfigured group follows the global selection.
        assert_eq!(system.name_for_group(8), "Whiskers");
    }

    #[test]
    fn reload_drops_stale_selection() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.json");
        std::fs::write(
            &path,
            serde_json::json!([{"id": "x", "name": "X", "prompt": ""}]).to_string(),
        )
        .unwrap();
        let system = PersonalitySystem::new(Some(path.clone()));
        assert!(system.switch("x"));
        assert!(system.switch_for_group(1, "x"));

        std::fs::write(&path, "[]").unwrap();
        system.reload();
        assert_eq!(system.current_name(), "LCHBOT");
        assert_eq!(system.name_for_group(1), "LCHBOT");
    }
}
