//! Small persisted key/value preferences.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::common::mutex_lock_or_recover;

use super::paths::dot_dir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub notifications_enabled: bool,
}

#[derive(Debug)]
pub struct PreferencesStore {
    path: PathBuf,
    current: Mutex<Preferences>,
}

impl PreferencesStore {
    pub fn load() -> Self {
        Self::load_from(dot_dir().join("preferences.json"))
    }

    pub fn load_from(path: PathBuf) -> Self {
        let current = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(prefs) => prefs,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Preferences file corrupted, using defaults");
                    Preferences::default()
                }
            },
            Err(_) => Preferences::default(),
        };
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    pub fn get(&self) -> Preferences {
        *mutex_lock_or_recover(&self.current, "preferences")
    }

    pub fn set(&self, prefs: Preferences) -> std::io::Result<Preferences> {
        let mut current = mutex_lock_or_recover(&self.current, "preferences");
        *current = prefs;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&prefs).unwrap_or_default())?;
        fs::rename(&tmp, &self.path)?;
        Ok(prefs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PreferencesStore::load_from(tmp.path().join("preferences.json"));
        assert!(!store.get().notifications_enabled);
    }

    #[test]
    fn set_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("preferences.json");

        let store = PreferencesStore::load_from(path.clone());
        store
            .set(Preferences {
                notifications_enabled: true,
            })
            .unwrap();

        let reloaded = PreferencesStore::load_from(path);
        assert!(reloaded.get().notifications_enabled);
    }

    #[test]
    fn corrupted_file_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("preferences.json");
        fs::write(&path, "{not json").unwrap();

        let store = PreferencesStore::load_from(path);
        assert_eq!(store.get(), Preferences::default());
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let json = serde_json::to_value(Preferences {
            notifications_enabled: true,
        })
        .unwrap();
        assert_eq!(json["notificationsEnabled"], true);
    }
}
