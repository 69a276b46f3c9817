use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// User preferences applied to every session. Session history is never stored here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default)]
    pub camera_enabled_on_join: bool,
    #[serde(default = "default_max_visible")]
    pub max_visible_notifications: usize,
    #[serde(default = "default_notification_ttl_ms")]
    pub notification_ttl_ms: u64,
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    #[serde(default = "default_history_limit")]
    pub notification_history_limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_visible() -> usize {
    3
}

fn default_notification_ttl_ms() -> u64 {
    5_000
}

fn default_teardown_timeout_ms() -> u64 {
    5_000
}

fn default_history_limit() -> usize {
    50
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: false,
            max_visible_notifications: default_max_visible(),
            notification_ttl_ms: default_notification_ttl_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            notification_history_limit: default_history_limit(),
        }
    }
}

impl Settings {
    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Name shown on locally authored chat entries.
    pub fn author_name(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => "You".to_string(),
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.settings.lock().display_name = name;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.settings.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.settings.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_max_visible_notifications(&self, max: usize) {
        self.settings.lock().max_visible_notifications = max.max(1);
        self.save();
    }

    pub fn set_teardown_timeout_ms(&self, timeout_ms: u64) {
        self.settings.lock().teardown_timeout_ms = timeout_ms;
        self.save();
    }

    pub fn set_notification_ttl_ms(&self, ttl_ms: u64) {
        self.settings.lock().notification_ttl_ms = ttl_ms;
        self.save();
    }

    pub fn set_notification_history_limit(&self, limit: usize) {
        self.settings.lock().notification_history_limit = limit;
        self.save();
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("settings: cannot create {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("settings: write {} failed: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("settings: serialize failed: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("settings: {} is corrupt, using defaults: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
