//! Coordinator settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/nbsession/settings.json
//! - Linux: ~/.config/nbsession/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\nbsession\settings.json

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// What to do when a session exists for a path but cannot be connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnreachablePolicy {
    /// Start a fresh session alongside the unreachable one
    #[default]
    StartNew,
    /// Report the unreachable session as an error
    Fail,
}

impl std::fmt::Display for UnreachablePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnreachablePolicy::StartNew => write!(f, "start_new"),
            UnreachablePolicy::Fail => write!(f, "fail"),
        }
    }
}

/// Settings consumed by the lifecycle coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Kernel used when the notebook declares nothing the catalog knows
    #[serde(default = "default_kernel")]
    pub default_kernel: String,

    /// Policy for sessions that exist but refuse connection
    #[serde(default)]
    pub unreachable_session: UnreachablePolicy,

    /// Ask before shutting down a live kernel when its notebook closes
    #[serde(default = "default_true")]
    pub confirm_shutdown_on_close: bool,
}

fn default_kernel() -> String {
    "python3".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_kernel: default_kernel(),
            unreachable_session: UnreachablePolicy::default(),
            confirm_shutdown_on_close: true,
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nbsession")
        .join("settings.json")
}

/// Load settings from the default location, falling back to defaults.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`. Missing or unreadable files yield defaults.
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(
                "[settings] Ignoring invalid settings at {}: {}",
                path.display(),
                e
            );
            Settings::default()
        }),
        Err(e) => {
            warn!("[settings] Failed to read {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

/// Save settings to `path`, creating parent directories.
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
