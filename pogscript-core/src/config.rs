use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "POGSCRIPT_IDE_CONFIG";

fn default_ui_state() -> Map<String, Value> {
    let mut ui = Map::new();
    ui.insert("controlsVisible".into(), Value::Bool(false));
    ui.insert("terminalVisible".into(), Value::Bool(true));
    ui
}

/// Application configuration, persisted to `config.json`.
///
/// Missing fields fall back to their defaults, so config files written by
/// older versions keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Download the pogscript executable at startup when it is missing.
    pub auto_install_pogscript: bool,
    /// Explicit executable location, overriding the managed install.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
    /// Free-form UI state keyed by the frontend (panel visibility and such).
    pub ui: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            auto_install_pogscript: true,
            executable_path: None,
            ui: default_ui_state(),
        }
    }
}

/// JSON schema of the config file.
pub fn settings_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(Settings)).unwrap_or(Value::Null)
}

/// Default config file location: `$POGSCRIPT_IDE_CONFIG`, else
/// `<config dir>/pogscript-ide/config.json`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pogscript-ide")
        .join("config.json")
}

/// Loaded configuration plus the file it is saved to.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    /// Load the config at `path`, writing the defaults first if the file does
    /// not exist yet.
    pub fn load_or_init(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        if !path.exists() {
            let store = Self {
                path,
                settings: Settings::default(),
            };
            store.save()?;
            return Ok(store);
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let settings = match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Invalid config at {}: {}", path.display(), e);
                Settings::default()
            }
        };
        Ok(Self { path, settings })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn save(&self) -> Result<(), String> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        let json = serde_json::to_string_pretty(&self.settings)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        std::fs::write(&self.path, json)
            .map_err(|e| format!("Failed to write {}: {}", self.path.display(), e))
    }

    /// Set one UI state entry and persist the config.
    pub fn update_ui_state(&mut self, key: &str, value: Value) -> Result<(), String> {
        self.settings.ui.insert(key.to_string(), value);
        self.save()
    }

    pub fn ui_state(&self, key: &str) -> Option<Value> {
        self.settings.ui.get(key).cloned()
    }

    pub fn set_auto_install(&mut self, enabled: bool) -> Result<(), String> {
        self.settings.auto_install_pogscript = enabled;
        self.save()
    }
}
