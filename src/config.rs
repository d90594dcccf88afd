//! Crate configuration and global settings.
//!
//! `Config` holds deployment-level tunables loaded once at startup; `Settings`
//! holds the user-visible global toggles that participate in rule resolution
//! and in the export/import document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Debounce window for change notifications, in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;

/// Minimum DNS TTL in seconds (three days).
pub const DEFAULT_MIN_TTL_SECS: i64 = 259_200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Delay after the last write in a burst before listeners are notified.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// DNS records with a smaller TTL are floored to this value.
    #[serde(default = "default_min_ttl_secs")]
    pub min_ttl_secs: i64,
    /// Directory holding the database file.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_min_ttl_secs() -> i64 {
    DEFAULT_MIN_TTL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            min_ttl_secs: DEFAULT_MIN_TTL_SECS,
            data_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// absent keys, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)
                    .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("APPWALL_DEBOUNCE_MS") {
            self.debounce_ms = value
                .parse()
                .map_err(|_| StoreError::Config(format!("APPWALL_DEBOUNCE_MS: {value}")))?;
        }
        if let Ok(value) = std::env::var("APPWALL_MIN_TTL") {
            self.min_ttl_secs = value
                .parse()
                .map_err(|_| StoreError::Config(format!("APPWALL_MIN_TTL: {value}")))?;
        }
        Ok(())
    }

    /// Path of the database file.
    pub fn db_path(&self) -> PathBuf {
        let dir = self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("appwall")
        });
        dir.join("appwall.db")
    }
}

/// Sort order for the computed rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sort {
    #[default]
    Name,
    Uid,
}

/// Global user settings: rule defaults, visibility filters and sort order.
///
/// These are the scalar preferences of the original application; they travel
/// through the export/import document alongside the per-package overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Block Wi-Fi traffic by default (whitelist mode).
    pub default_wifi_blocked: bool,
    /// Block mobile/other traffic by default.
    pub default_other_blocked: bool,
    /// Allow Wi-Fi while the screen is on, by default.
    pub default_screen_wifi: bool,
    /// Allow mobile/other while the screen is on, by default.
    pub default_screen_other: bool,
    /// Block roaming traffic by default.
    pub default_roaming_blocked: bool,

    /// Honor the screen-on exceptions at all.
    pub screen_on: bool,
    /// Apply rules to system apps instead of force-allowing them.
    pub manage_system: bool,

    pub show_user: bool,
    pub show_system: bool,
    pub show_nointernet: bool,
    pub show_disabled: bool,

    pub sort: Sort,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_wifi_blocked: true,
            default_other_blocked: true,
            default_screen_wifi: false,
            default_screen_other: false,
            default_roaming_blocked: true,
            screen_on: true,
            manage_system: false,
            show_user: true,
            show_system: false,
            show_nointernet: true,
            show_disabled: true,
            sort: Sort::Name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.debounce_ms, 1_000);
        assert_eq!(config.min_ttl_secs, 259_200);
    }

    #[test]
    fn load_missing_file_falls_back() {
        let config = Config::load(Some(Path::new("/nonexistent/appwall.toml"))).unwrap();
        assert_eq!(config.debounce_ms, DEFAULT_DEBOUNCE_MS);
    }

    #[test]
    fn load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appwall.toml");
        std::fs::write(&path, "debounce_ms = 250\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.min_ttl_secs, DEFAULT_MIN_TTL_SECS);
    }
}
