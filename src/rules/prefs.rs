//! The per-package override store.
//!
//! One typed table keyed by (package, attribute) replaces the original's
//! parallel preference files. The table is persisted as a TOML document with
//! one map per attribute and saved atomically (write to a temporary file,
//! then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};

/// The per-package rule attributes a user can override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAttr {
    WifiBlocked,
    OtherBlocked,
    ScreenWifi,
    ScreenOther,
    Roaming,
    Lockdown,
    Apply,
    Notify,
}

impl RuleAttr {
    pub const ALL: [RuleAttr; 8] = [
        RuleAttr::WifiBlocked,
        RuleAttr::OtherBlocked,
        RuleAttr::ScreenWifi,
        RuleAttr::ScreenOther,
        RuleAttr::Roaming,
        RuleAttr::Lockdown,
        RuleAttr::Apply,
        RuleAttr::Notify,
    ];

    /// Stable key, used in the TOML document and the export format.
    pub fn key(self) -> &'static str {
        match self {
            RuleAttr::WifiBlocked => "wifi",
            RuleAttr::OtherBlocked => "other",
            RuleAttr::ScreenWifi => "screen_wifi",
            RuleAttr::ScreenOther => "screen_other",
            RuleAttr::Roaming => "roaming",
            RuleAttr::Lockdown => "lockdown",
            RuleAttr::Apply => "apply",
            RuleAttr::Notify => "notify",
        }
    }

    pub fn from_key(key: &str) -> Option<RuleAttr> {
        RuleAttr::ALL.into_iter().find(|attr| attr.key() == key)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Overrides {
    #[serde(default)]
    wifi: BTreeMap<String, bool>,
    #[serde(default)]
    other: BTreeMap<String, bool>,
    #[serde(default)]
    screen_wifi: BTreeMap<String, bool>,
    #[serde(default)]
    screen_other: BTreeMap<String, bool>,
    #[serde(default)]
    roaming: BTreeMap<String, bool>,
    #[serde(default)]
    lockdown: BTreeMap<String, bool>,
    #[serde(default)]
    apply: BTreeMap<String, bool>,
    #[serde(default)]
    notify: BTreeMap<String, bool>,
}

impl Overrides {
    fn map(&self, attr: RuleAttr) -> &BTreeMap<String, bool> {
        match attr {
            RuleAttr::WifiBlocked => &self.wifi,
            RuleAttr::OtherBlocked => &self.other,
            RuleAttr::ScreenWifi => &self.screen_wifi,
            RuleAttr::ScreenOther => &self.screen_other,
            RuleAttr::Roaming => &self.roaming,
            RuleAttr::Lockdown => &self.lockdown,
            RuleAttr::Apply => &self.apply,
            RuleAttr::Notify => &self.notify,
        }
    }

    fn map_mut(&mut self, attr: RuleAttr) -> &mut BTreeMap<String, bool> {
        match attr {
            RuleAttr::WifiBlocked => &mut self.wifi,
            RuleAttr::OtherBlocked => &mut self.other,
            RuleAttr::ScreenWifi => &mut self.screen_wifi,
            RuleAttr::ScreenOther => &mut self.screen_other,
            RuleAttr::Roaming => &mut self.roaming,
            RuleAttr::Lockdown => &mut self.lockdown,
            RuleAttr::Apply => &mut self.apply,
            RuleAttr::Notify => &mut self.notify,
        }
    }
}

/// Persistent (package, attribute) → bool override table.
#[derive(Debug)]
pub struct OverrideStore {
    path: Option<PathBuf>,
    data: Mutex<Overrides>,
}

impl OverrideStore {
    /// Load the table from `path`; a missing file yields an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)
                .map_err(|e| StoreError::Prefs(format!("{}: {e}", path.display())))?
        } else {
            Overrides::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            data: Mutex::new(data),
        })
    }

    /// Table without a backing file, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(Overrides::default()),
        }
    }

    pub fn get(&self, package: &str, attr: RuleAttr) -> Option<bool> {
        self.data.lock().map(attr).get(package).copied()
    }

    pub fn set(&self, package: &str, attr: RuleAttr, value: bool) -> Result<()> {
        let mut data = self.data.lock();
        data.map_mut(attr).insert(package.to_string(), value);
        debug!(package, attr = attr.key(), value, "override set");
        self.save(&data)
    }

    pub fn remove(&self, package: &str, attr: RuleAttr) -> Result<()> {
        let mut data = self.data.lock();
        if data.map_mut(attr).remove(package).is_some() {
            debug!(package, attr = attr.key(), "override removed");
            return self.save(&data);
        }
        Ok(())
    }

    /// Snapshot of one attribute's overrides, for the export document.
    pub fn entries(&self, attr: RuleAttr) -> BTreeMap<String, bool> {
        self.data.lock().map(attr).clone()
    }

    /// Replace one attribute's overrides wholesale, as the import does when
    /// it encounters the attribute's section.
    pub fn replace(&self, attr: RuleAttr, entries: BTreeMap<String, bool>) -> Result<()> {
        let mut data = self.data.lock();
        *data.map_mut(attr) = entries;
        self.save(&data)
    }

    pub fn clear(&self) -> Result<()> {
        let mut data = self.data.lock();
        *data = Overrides::default();
        self.save(&data)
    }

    fn save(&self, data: &Overrides) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = toml::to_string_pretty(data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
