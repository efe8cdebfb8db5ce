use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::{env, fs};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub dirs: Vec<String>,
    pub recent_ops_capacity: usize,
    pub pattern_interval_seconds: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dirs: vec![
                "~/Desktop".to_string(),
                "~/Downloads".to_string(),
                "~/Documents".to_string(),
            ],
            recent_ops_capacity: 1000,
            pattern_interval_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.5-flash-lite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { port: 8002 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSavedConfig {
    pub file_op_seconds: u64,
    pub rename_seconds: u64,
}

impl Default for TimeSavedConfig {
    fn default() -> Self {
        Self {
            file_op_seconds: 20,
            rename_seconds: 25,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub watch: WatchConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
    pub backend: BackendConfig,
    pub time_saved: TimeSavedConfig,
}

impl AppConfig {
    /// Watch directories with `~` expanded, keeping only ones that exist.
    pub fn expanded_watch_dirs(&self) -> Vec<PathBuf> {
        self.watch
            .dirs
            .iter()
            .map(|d| expand_home(d))
            .filter(|p| p.is_dir())
            .collect()
    }
}

/// Flat key/value view served on GET /config and accepted on PUT /config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub watch_dirs: Option<Vec<String>>,
    pub recent_ops_capacity: Option<usize>,
    pub pattern_interval_seconds: Option<u64>,
    pub logging_enabled: Option<bool>,
    pub backend_port: Option<u16>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub time_saved_file_op_seconds: Option<u64>,
    pub time_saved_rename_seconds: Option<u64>,
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Directory that holds config.yaml and every persisted store.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var("ENCORE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".encore")
}

pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<AppConfig>,
}

impl ConfigStore {
    /// Load config.yaml, writing the defaults out on first run so the user
    /// has a file to edit.
    pub fn load(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            let defaults = AppConfig::default();
            write_config(&path, &defaults)?;
            defaults
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn current(&self) -> AppConfig {
        self.data.read().unwrap().clone()
    }

    /// Flattened view for the API.
    pub fn flattened(&self) -> HashMap<String, serde_json::Value> {
        let config = self.current();
        let mut out = HashMap::new();
        out.insert("watch_dirs".into(), serde_json::json!(config.watch.dirs));
        out.insert(
            "recent_ops_capacity".into(),
            serde_json::json!(config.watch.recent_ops_capacity),
        );
        out.insert(
            "pattern_interval_seconds".into(),
            serde_json::json!(config.watch.pattern_interval_seconds),
        );
        out.insert("logging_enabled".into(), serde_json::json!(config.logging.enabled));
        out.insert("backend_port".into(), serde_json::json!(config.backend.port));
        // The key itself is never echoed back, only whether one is set.
        out.insert(
            "llm_api_key_set".into(),
            serde_json::json!(!config.llm.api_key.is_empty()),
        );
        out.insert("llm_model".into(), serde_json::json!(config.llm.model));
        out.insert(
            "time_saved_file_op_seconds".into(),
            serde_json::json!(config.time_saved.file_op_seconds),
        );
        out.insert(
            "time_saved_rename_seconds".into(),
            serde_json::json!(config.time_saved.rename_seconds),
        );
        out
    }

    /// Apply a partial update and persist. Returns the updated config.
    pub fn apply(&self, update: ConfigUpdate) -> Result<AppConfig> {
        let updated = {
            let mut guard = self.data.write().unwrap();
            if let Some(dirs) = update.watch_dirs {
                guard.watch.dirs = dirs;
            }
            if let Some(capacity) = update.recent_ops_capacity {
                guard.watch.recent_ops_capacity = capacity;
            }
            if let Some(interval) = update.pattern_interval_seconds {
                guard.watch.pattern_interval_seconds = interval.max(1);
            }
            if let Some(enabled) = update.logging_enabled {
                guard.logging.enabled = enabled;
            }
            if let Some(port) = update.backend_port {
                guard.backend.port = port;
            }
            if let Some(key) = update.llm_api_key {
                guard.llm.api_key = key;
            }
            if let Some(model) = update.llm_model {
                guard.llm.model = model;
            }
            if let Some(secs) = update.time_saved_file_op_seconds {
                guard.time_saved.file_op_seconds = secs;
            }
            if let Some(secs) = update.time_saved_rename_seconds {
                guard.time_saved.rename_seconds = secs;
            }
            guard.clone()
        };
        write_config(&self.path, &updated)?;
        Ok(updated)
    }
}

fn write_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let serialized = serde_yaml::to_string(config)?;
    fs::write(path, serialized)
        .with_context(|| format!("failed to write config to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let store = ConfigStore::load(path.clone()).unwrap();
        assert!(path.exists());
        let config = store.current();
        assert_eq!(config.backend.port, 8002);
        assert_eq!(config.watch.recent_ops_capacity, 1000);
        assert_eq!(config.time_saved.rename_seconds, 25);
    }

    #[test]
    fn apply_updates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let store = ConfigStore::load(path.clone()).unwrap();

        let update = ConfigUpdate {
            watch_dirs: Some(vec!["/tmp".into()]),
            backend_port: Some(9100),
            ..Default::default()
        };
        let updated = store.apply(update).unwrap();
        assert_eq!(updated.backend.port, 9100);
        assert_eq!(updated.watch.dirs, vec!["/tmp".to_string()]);

        // A fresh store sees the persisted values.
        let reloaded = ConfigStore::load(path).unwrap();
        assert_eq!(reloaded.current().backend.port, 9100);
    }

    #[test]
    fn flattened_never_leaks_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.yaml")).unwrap();
        store
            .apply(ConfigUpdate {
                llm_api_key: Some("secret".into()),
                ..Default::default()
            })
            .unwrap();
        let flat = store.flattened();
        assert_eq!(flat.get("llm_api_key_set"), Some(&serde_json::json!(true)));
        assert!(!flat.contains_key("llm_api_key"));
    }

    #[test]
    fn expand_home_handles_tilde() {
        let expanded = expand_home("~/Downloads");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_home("/var/log"), PathBuf::from("/var/log"));
    }
}
