//! Built-in overrides shipped with the crate.
//!
//! A small embedded table of packages with known-good defaults and relation
//! groups. A user override still wins over anything listed here.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Deserialize;
use tracing::error;

#[derive(Debug, Clone, Deserialize)]
pub struct PredefinedEntry {
    pub name: String,
    pub wifi_blocked: Option<bool>,
    pub other_blocked: Option<bool>,
    pub roaming_blocked: Option<bool>,
    #[serde(default)]
    pub system: bool,
    /// Packages whose rules follow this one on edit.
    #[serde(default)]
    pub related: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PredefinedDoc {
    #[serde(default, rename = "package")]
    packages: Vec<PredefinedEntry>,
}

#[derive(Debug, Default)]
pub struct PredefinedTable {
    by_package: HashMap<String, PredefinedEntry>,
}

static BUILTIN: OnceLock<PredefinedTable> = OnceLock::new();

impl PredefinedTable {
    /// The table embedded at build time. A malformed document is reported and
    /// degrades to an empty table.
    pub fn builtin() -> &'static PredefinedTable {
        BUILTIN.get_or_init(|| match toml::from_str::<PredefinedDoc>(TABLE) {
            Ok(doc) => PredefinedTable::from_entries(doc.packages),
            Err(e) => {
                error!(error = %e, "embedded override table is malformed");
                PredefinedTable::default()
            }
        })
    }

    fn from_entries(entries: Vec<PredefinedEntry>) -> Self {
        let by_package = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        Self { by_package }
    }

    pub fn get(&self, package: &str) -> Option<&PredefinedEntry> {
        self.by_package.get(package)
    }
}

const TABLE: &str = include_str!("predefined.toml");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_parses() {
        let table = PredefinedTable::builtin();
        let downloads = table.get("com.android.providers.downloads").unwrap();
        assert_eq!(downloads.wifi_blocked, Some(false));
        assert!(downloads.system);
        assert!(table.get("org.example.unknown").is_none());
    }

    #[test]
    fn relations_are_listed() {
        let table = PredefinedTable::builtin();
        let vending = table.get("com.android.vending").unwrap();
        assert!(vending
            .related
            .iter()
            .any(|pkg| pkg == "com.google.android.gms"));
    }
}
