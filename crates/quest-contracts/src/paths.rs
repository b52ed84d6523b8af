use std::env;
use std::path::{Path, PathBuf};

pub const PLUGIN_SLUG: &str = "quest-helper";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const EVENTS_FILE_NAME: &str = "events.jsonl";
pub const LOG_FILE_NAME: &str = "quest-helper.log";

/// Directories handed to the plugin by the host loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPaths {
    pub user_home: PathBuf,
    pub host_home: PathBuf,
    pub settings_dir: PathBuf,
    pub log_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl PluginPaths {
    /// Resolve every directory from the host environment, falling back to the
    /// loader's default layout under `<user_home>/homebrew`.
    pub fn from_env() -> Self {
        let user_home = non_empty_env("DECKY_USER_HOME")
            .or_else(|| non_empty_env("HOME"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let host_home = non_empty_env("DECKY_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_home.join("homebrew"));
        let mut paths = Self::under(user_home, host_home);
        if let Some(dir) = non_empty_env("DECKY_PLUGIN_SETTINGS_DIR") {
            paths.settings_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("DECKY_PLUGIN_LOG_DIR") {
            paths.log_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("DECKY_PLUGIN_RUNTIME_DIR") {
            paths.runtime_dir = PathBuf::from(dir);
        }
        paths
    }

    pub fn under(user_home: impl Into<PathBuf>, host_home: impl Into<PathBuf>) -> Self {
        let user_home = user_home.into();
        let host_home = host_home.into();
        Self {
            settings_dir: host_home.join("settings").join(PLUGIN_SLUG),
            log_dir: host_home.join("logs").join(PLUGIN_SLUG),
            runtime_dir: host_home.join("data").join(PLUGIN_SLUG),
            user_home,
            host_home,
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.settings_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn events_file(&self) -> PathBuf {
        self.runtime_dir.join(EVENTS_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }

    /// Steam screenshot roots, in scan order.
    pub fn screenshot_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.user_home.join(".steam").join("steam").join("screenshots"),
            self.user_home
                .join(".local")
                .join("share")
                .join("Steam")
                .join("screenshots"),
        ]
    }

    pub fn with_settings_dir(mut self, dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            self.settings_dir = dir.to_path_buf();
        }
        self
    }

    pub fn with_log_dir(mut self, dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            self.log_dir = dir.to_path_buf();
        }
        self
    }

    pub fn with_runtime_dir(mut self, dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            self.runtime_dir = dir.to_path_buf();
        }
        self
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
