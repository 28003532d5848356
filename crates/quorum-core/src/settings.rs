use std::path::{Path, PathBuf};

use anyhow::Context;

use quorum_ledger::StateLock;
use quorum_types::Settings;

const SETTINGS_FILE: &str = "settings.json";
const SETTINGS_LOCK: &str = "settings";

/// Read-through access to `<state_dir>/settings.json`. Settings are loaded
/// fresh at each consumption point (cluster start, task spawn) and never
/// cached across task executions; a mid-run edit applies to the next task,
/// not retroactively to in-flight ones.
#[derive(Clone)]
pub struct SettingsStore {
    state_dir: PathBuf,
}

impl SettingsStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.state_dir.join(SETTINGS_FILE)
    }

    pub fn load(&self) -> anyhow::Result<Settings> {
        let _lock = StateLock::acquire(&self.state_dir, SETTINGS_LOCK)?;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> anyhow::Result<Settings> {
        let path = self.path();
        if !path.exists() {
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid settings file {}", path.display()))
    }

    /// Write defaults if no settings file exists yet; returns the effective
    /// settings either way.
    pub fn init_default(&self) -> anyhow::Result<Settings> {
        let _lock = StateLock::acquire(&self.state_dir, SETTINGS_LOCK)?;
        let path = self.path();
        if !path.exists() {
            std::fs::create_dir_all(&self.state_dir)?;
            let defaults = Settings::default();
            std::fs::write(&path, serde_json::to_string_pretty(&defaults)?)?;
            return Ok(defaults);
        }
        self.read_unlocked()
    }

    pub fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let _lock = StateLock::acquire(&self.state_dir, SETTINGS_LOCK)?;
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::write(self.path(), serde_json::to_string_pretty(settings)?)?;
        Ok(())
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_types::ModelLevel;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        let settings = store.load().unwrap();
        assert_eq!(settings.max_model, ModelLevel::Level3);
        assert!(settings.strict_schema);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        let mut settings = Settings::default();
        settings.max_model = ModelLevel::Level2;
        store.save(&settings).unwrap();
        assert_eq!(store.load().unwrap().max_model, ModelLevel::Level2);
    }

    #[test]
    fn load_is_read_through() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        store.init_default().unwrap();

        // An out-of-band edit is visible on the very next load.
        let raw = std::fs::read_to_string(store.path()).unwrap();
        let edited = raw.replace("\"level3\"", "\"level1\"");
        std::fs::write(store.path(), edited).unwrap();
        assert_eq!(store.load().unwrap().max_model, ModelLevel::Level1);
    }

    #[test]
    fn legacy_model_names_load() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        std::fs::write(
            store.path(),
            r#"{ "max_model": "opus", "min_model": "haiku" }"#,
        )
        .unwrap();
        let settings = store.load().unwrap();
        assert_eq!(settings.max_model, ModelLevel::Level3);
        assert_eq!(settings.min_model, Some(ModelLevel::Level1));
    }
}
