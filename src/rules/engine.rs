//! Rule resolution: turning installed applications, defaults, predefined
//! overrides and the user's override table into effective [`Rule`]s, and
//! writing edits back with fan-out to related packages.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{Settings, Sort};
use crate::error::Result;
use crate::rules::predefined::PredefinedTable;
use crate::rules::prefs::{OverrideStore, RuleAttr};
use crate::rules::Rule;
use crate::storage::RecordStore;
use crate::types::{AppRecord, Uid};

/// Metadata for one rule candidate, as reported by the platform.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub package: String,
    pub uid: u32,
    pub label: Option<String>,
    pub system: bool,
    pub internet: bool,
    pub enabled: bool,
}

/// Platform seam: enumerates installed applications and maps between
/// packages and uids.
pub trait AppProvider: Send + Sync {
    fn installed_apps(&self) -> Result<Vec<AppInfo>>;
    fn packages_for_uid(&self, uid: u32) -> Result<Vec<String>>;
    fn uid_for_package(&self, package: &str) -> Result<Option<u32>>;
    /// The store's own uid; it never gets a rule.
    fn own_uid(&self) -> u32;
}

/// Seam towards the packet engine and the notification system.
pub trait EngineControl: Send + Sync {
    fn reload(&self, reason: &str);
    fn cancel_notification(&self, uid: u32);
}

pub struct RuleEngine {
    store: Arc<RecordStore>,
    prefs: Arc<OverrideStore>,
    provider: Arc<dyn AppProvider>,
    control: Arc<dyn EngineControl>,
    settings: RwLock<Settings>,
}

impl RuleEngine {
    pub fn new(
        store: Arc<RecordStore>,
        prefs: Arc<OverrideStore>,
        provider: Arc<dyn AppProvider>,
        control: Arc<dyn EngineControl>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            prefs,
            provider,
            control,
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: Settings) {
        *self.settings.write() = settings;
    }

    pub fn prefs(&self) -> &OverrideStore {
        &self.prefs
    }

    /// Resolve the effective rule list.
    ///
    /// With `include_all` every candidate is returned; otherwise the
    /// visibility filters apply. A candidate whose lookups fail is skipped
    /// and reported, it never aborts the whole list.
    pub fn compute_rules(&self, include_all: bool) -> Result<Vec<Rule>> {
        let settings = self.settings();
        let own_uid = self.provider.own_uid();

        let mut candidates = self.provider.installed_apps()?;
        for pseudo in Uid::ALL {
            if !candidates.iter().any(|app| app.uid == pseudo.code()) {
                candidates.push(AppInfo {
                    package: pseudo.package_name().to_string(),
                    uid: pseudo.code(),
                    label: Some(pseudo.title().to_string()),
                    system: false,
                    internet: true,
                    enabled: true,
                });
            }
        }

        let mut rules = Vec::with_capacity(candidates.len());
        for app in candidates {
            if app.uid == own_uid {
                continue;
            }
            match self.build_rule(&app, &settings) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(package = %app.package, error = %e, "skipping candidate"),
            }
        }

        if !include_all {
            rules.retain(|rule| visible(rule, &settings));
        }
        sort_rules(&mut rules, settings.sort, include_all);
        Ok(rules)
    }

    fn build_rule(&self, app: &AppInfo, settings: &Settings) -> Result<Rule> {
        let meta = match self.store.get_app(&app.package)? {
            Some(cached) => cached,
            None => {
                let record = AppRecord {
                    package: app.package.clone(),
                    label: app.label.clone(),
                    system: app.system,
                    internet: app.internet,
                    enabled: app.enabled,
                };
                self.store.add_app(&record)?;
                record
            }
        };

        let entry = PredefinedTable::builtin().get(&app.package);
        let system = meta.system || entry.is_some_and(|e| e.system);

        let default_wifi_blocked = entry
            .and_then(|e| e.wifi_blocked)
            .unwrap_or(settings.default_wifi_blocked);
        let default_other_blocked = entry
            .and_then(|e| e.other_blocked)
            .unwrap_or(settings.default_other_blocked);
        let default_roaming = entry
            .and_then(|e| e.roaming_blocked)
            .unwrap_or(settings.default_roaming_blocked);
        // Screen defaults only exist while the screen toggle is on; gating
        // them here keeps untouched rules unchanged when it is off.
        let default_screen_wifi = settings.default_screen_wifi && settings.screen_on;
        let default_screen_other = settings.default_screen_other && settings.screen_on;

        // System apps stay unblocked unless the user manages them.
        let managed = !(system && !settings.manage_system);
        let package = app.package.as_str();
        let wifi_blocked = managed
            && self
                .prefs
                .get(package, RuleAttr::WifiBlocked)
                .unwrap_or(default_wifi_blocked);
        let other_blocked = managed
            && self
                .prefs
                .get(package, RuleAttr::OtherBlocked)
                .unwrap_or(default_other_blocked);
        let screen_wifi = self
            .prefs
            .get(package, RuleAttr::ScreenWifi)
            .unwrap_or(default_screen_wifi)
            && settings.screen_on;
        let screen_other = self
            .prefs
            .get(package, RuleAttr::ScreenOther)
            .unwrap_or(default_screen_other)
            && settings.screen_on;
        let roaming = self
            .prefs
            .get(package, RuleAttr::Roaming)
            .unwrap_or(default_roaming);
        let lockdown = self.prefs.get(package, RuleAttr::Lockdown).unwrap_or(false);
        let apply = self.prefs.get(package, RuleAttr::Apply).unwrap_or(true);
        let notify = self.prefs.get(package, RuleAttr::Notify).unwrap_or(true);

        let hosts = self.store.get_host_count(app.uid, true)?;

        let mut related: Vec<String> = entry.map(|e| e.related.clone()).unwrap_or_default();
        let mut related_uids = false;
        for peer in self.provider.packages_for_uid(app.uid)? {
            if peer != app.package && !related.contains(&peer) {
                related.push(peer);
                related_uids = true;
            }
        }

        let mut rule = Rule {
            uid: app.uid,
            package: app.package.clone(),
            name: meta
                .label
                .clone()
                .unwrap_or_else(|| app.package.clone()),
            system,
            internet: meta.internet,
            enabled: meta.enabled,
            pkg: Uid::from_package(&app.package).is_none(),
            default_wifi_blocked,
            default_other_blocked,
            default_screen_wifi,
            default_screen_other,
            default_roaming,
            wifi_blocked,
            other_blocked,
            screen_wifi,
            screen_other,
            roaming,
            lockdown,
            apply,
            notify,
            hosts,
            changed: false,
            related,
            related_uids,
        };
        rule.update_changed();
        Ok(rule)
    }

    /// Persist an edited rule and fan the edit out to related rules.
    ///
    /// Propagation walks a worklist with a visited set, so mutually related
    /// packages terminate. Only the top-level edit reloads the engine and
    /// cancels the uid's notification.
    pub fn apply_rule_edit(&self, index: usize, rules: &mut [Rule]) -> Result<()> {
        if index >= rules.len() {
            warn!(index, "rule index out of range");
            return Ok(());
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(rules[index].package.clone());
        let mut work: VecDeque<usize> = VecDeque::from([index]);
        let mut top_level = true;

        while let Some(i) = work.pop_front() {
            self.persist_rule(&mut rules[i])?;
            if top_level {
                top_level = false;
                self.control.cancel_notification(rules[i].uid);
                self.control.reload("rule changed");
            }

            let source = rules[i].clone();
            for package in &source.related {
                if !visited.insert(package.clone()) {
                    continue;
                }
                match rules.iter().position(|r| r.package == *package) {
                    Some(j) => {
                        let target = &mut rules[j];
                        target.wifi_blocked = source.wifi_blocked;
                        target.other_blocked = source.other_blocked;
                        target.screen_wifi = source.screen_wifi;
                        target.screen_other = source.screen_other;
                        target.roaming = source.roaming;
                        target.lockdown = source.lockdown;
                        target.apply = source.apply;
                        target.notify = source.notify;
                        work.push_back(j);
                    }
                    None => warn!(package = %package, "related package not in rule list"),
                }
            }
        }
        Ok(())
    }

    fn persist_rule(&self, rule: &mut Rule) -> Result<()> {
        let attrs = [
            (RuleAttr::WifiBlocked, rule.wifi_blocked, rule.default_wifi_blocked),
            (RuleAttr::OtherBlocked, rule.other_blocked, rule.default_other_blocked),
            (RuleAttr::ScreenWifi, rule.screen_wifi, rule.default_screen_wifi),
            (RuleAttr::ScreenOther, rule.screen_other, rule.default_screen_other),
            (RuleAttr::Roaming, rule.roaming, rule.default_roaming),
            (RuleAttr::Lockdown, rule.lockdown, false),
            (RuleAttr::Apply, rule.apply, true),
            (RuleAttr::Notify, rule.notify, true),
        ];
        for (attr, value, default) in attrs {
            if value == default {
                self.prefs.remove(&rule.package, attr)?;
            } else {
                self.prefs.set(&rule.package, attr, value)?;
            }
        }
        rule.update_changed();
        info!(package = %rule.package, changed = rule.changed, "rule updated");
        Ok(())
    }
}

fn visible(rule: &Rule, settings: &Settings) -> bool {
    if rule.system {
        if !settings.show_system {
            return false;
        }
    } else if !settings.show_user {
        return false;
    }
    if !settings.show_nointernet && !rule.internet {
        return false;
    }
    if !settings.show_disabled && !rule.enabled {
        return false;
    }
    true
}

fn sort_rules(rules: &mut [Rule], sort: Sort, include_all: bool) {
    match sort {
        Sort::Uid => rules.sort_by(|a, b| a.uid.cmp(&b.uid).then_with(|| by_name(a, b))),
        Sort::Name if include_all => rules.sort_by(by_name),
        // Changed rules first, each group alphabetical.
        Sort::Name => rules.sort_by(|a, b| b.changed.cmp(&a.changed).then_with(|| by_name(a, b))),
    }
}

fn by_name(a: &Rule, b: &Rule) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.package.cmp(&b.package))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{AccessKey, BLOCK_DENY, PROTO_TCP};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct MockProvider {
        apps: Vec<AppInfo>,
        failing_uids: HashSet<u32>,
    }

    impl AppProvider for MockProvider {
        fn installed_apps(&self) -> Result<Vec<AppInfo>> {
            Ok(self.apps.clone())
        }

        fn packages_for_uid(&self, uid: u32) -> Result<Vec<String>> {
            if self.failing_uids.contains(&uid) {
                return Err(crate::StoreError::UnknownPackage(format!("uid {uid}")));
            }
            Ok(self
                .apps
                .iter()
                .filter(|app| app.uid == uid)
                .map(|app| app.package.clone())
                .collect())
        }

        fn uid_for_package(&self, package: &str) -> Result<Option<u32>> {
            Ok(self
                .apps
                .iter()
                .find(|app| app.package == package)
                .map(|app| app.uid))
        }

        fn own_uid(&self) -> u32 {
            10_000
        }
    }

    #[derive(Default)]
    struct CountingControl {
        reloads: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl EngineControl for CountingControl {
        fn reload(&self, _reason: &str) {
            self.reloads.fetch_add(1, AtomicOrdering::SeqCst);
        }

        fn cancel_notification(&self, _uid: u32) {
            self.cancelled.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn app(package: &str, uid: u32, system: bool) -> AppInfo {
        AppInfo {
            package: package.into(),
            uid,
            label: Some(package.rsplit('.').next().unwrap().to_string()),
            system,
            internet: true,
            enabled: true,
        }
    }

    fn engine_with(apps: Vec<AppInfo>, settings: Settings) -> (RuleEngine, Arc<CountingControl>) {
        engine_failing(apps, settings, HashSet::new())
    }

    fn engine_failing(
        apps: Vec<AppInfo>,
        settings: Settings,
        failing_uids: HashSet<u32>,
    ) -> (RuleEngine, Arc<CountingControl>) {
        let config = Config {
            debounce_ms: 10,
            ..Config::default()
        };
        let store = Arc::new(RecordStore::open_in_memory(&config).unwrap());
        let control = Arc::new(CountingControl::default());
        let engine = RuleEngine::new(
            store,
            Arc::new(OverrideStore::in_memory()),
            Arc::new(MockProvider { apps, failing_uids }),
            control.clone(),
            settings,
        );
        (engine, control)
    }

    fn find<'a>(rules: &'a [Rule], package: &str) -> &'a Rule {
        rules
            .iter()
            .find(|r| r.package == package)
            .unwrap_or_else(|| panic!("no rule for {package}"))
    }

    #[test]
    fn system_apps_forced_unblocked_unless_managed() {
        let apps = vec![app("com.vendor.radio", 1_000, true)];
        let (engine, _) = engine_with(apps.clone(), Settings::default());
        let rules = engine.compute_rules(true).unwrap();
        let rule = find(&rules, "com.vendor.radio");
        assert!(!rule.wifi_blocked);
        assert!(!rule.other_blocked);

        let settings = Settings {
            manage_system: true,
            ..Settings::default()
        };
        let (engine, _) = engine_with(apps, settings);
        let rules = engine.compute_rules(true).unwrap();
        assert!(find(&rules, "com.vendor.radio").wifi_blocked);
    }

    #[test]
    fn predefined_defaults_win_over_globals() {
        let (engine, _) = engine_with(Vec::new(), Settings::default());
        let rules = engine.compute_rules(true).unwrap();

        // Global default blocks, but the dns identity is predefined open.
        let dns = find(&rules, "android.dns");
        assert!(!dns.wifi_blocked);
        assert!(!dns.roaming);
        assert!(!dns.changed);

        let gps = find(&rules, "android.gps");
        assert!(gps.wifi_blocked);
    }

    #[test]
    fn user_override_wins_over_default() {
        let apps = vec![app("org.example.app", 10_001, false)];
        let (engine, _) = engine_with(apps, Settings::default());
        engine
            .prefs()
            .set("org.example.app", RuleAttr::WifiBlocked, false)
            .unwrap();

        let rules = engine.compute_rules(true).unwrap();
        let rule = find(&rules, "org.example.app");
        assert!(!rule.wifi_blocked);
        assert!(rule.changed);
    }

    #[test]
    fn own_uid_is_excluded() {
        let apps = vec![app("org.example.own", 10_000, false)];
        let (engine, _) = engine_with(apps, Settings::default());
        let rules = engine.compute_rules(true).unwrap();
        assert!(!rules.iter().any(|r| r.package == "org.example.own"));
    }

    #[test]
    fn failing_candidate_is_skipped_not_fatal() {
        let apps = vec![
            app("org.example.good", 10_001, false),
            app("org.example.bad", 10_002, false),
        ];
        let (engine, _) = engine_failing(apps, Settings::default(), HashSet::from([10_002]));
        let rules = engine.compute_rules(true).unwrap();
        assert!(rules.iter().any(|r| r.package == "org.example.good"));
        assert!(!rules.iter().any(|r| r.package == "org.example.bad"));
    }

    #[test]
    fn visibility_gates_apply_unless_all() {
        let mut disabled = app("org.example.off", 10_001, false);
        disabled.enabled = false;
        let apps = vec![disabled, app("org.example.on", 10_002, false)];
        let settings = Settings {
            show_disabled: false,
            ..Settings::default()
        };
        let (engine, _) = engine_with(apps, settings);

        let filtered = engine.compute_rules(false).unwrap();
        assert!(!filtered.iter().any(|r| r.package == "org.example.off"));

        let all = engine.compute_rules(true).unwrap();
        assert!(all.iter().any(|r| r.package == "org.example.off"));
    }

    #[test]
    fn changed_rules_sort_first_in_filtered_list() {
        let apps = vec![
            app("org.example.alpha", 10_001, false),
            app("org.example.zulu", 10_002, false),
        ];
        let (engine, _) = engine_with(apps, Settings::default());
        engine
            .prefs()
            .set("org.example.zulu", RuleAttr::Lockdown, true)
            .unwrap();

        let rules = engine.compute_rules(false).unwrap();
        assert_eq!(rules[0].package, "org.example.zulu");

        let all = engine.compute_rules(true).unwrap();
        let alpha = all.iter().position(|r| r.package == "org.example.alpha");
        let zulu = all.iter().position(|r| r.package == "org.example.zulu");
        assert!(alpha < zulu);
    }

    #[test]
    fn screen_toggle_off_gates_screen_defaults() {
        let apps = vec![app("org.example.app", 10_001, false)];
        let settings = Settings {
            screen_on: false,
            default_screen_wifi: true,
            default_screen_other: true,
            ..Settings::default()
        };
        let (engine, _) = engine_with(apps, settings);

        let mut rules = engine.compute_rules(true).unwrap();
        let index = rules
            .iter()
            .position(|r| r.package == "org.example.app")
            .unwrap();
        let rule = &rules[index];
        assert!(!rule.screen_wifi);
        assert!(!rule.default_screen_wifi);
        assert!(!rule.default_screen_other);
        assert!(!rule.changed);

        // An unrelated edit must not persist a spurious screen override.
        engine.apply_rule_edit(index, &mut rules).unwrap();
        assert_eq!(
            engine.prefs().get("org.example.app", RuleAttr::ScreenWifi),
            None
        );
        assert_eq!(
            engine.prefs().get("org.example.app", RuleAttr::ScreenOther),
            None
        );
    }

    #[test]
    fn equal_display_names_sort_by_package() {
        // Both labels resolve to "client".
        let apps = vec![
            app("com.beta.client", 10_002, false),
            app("com.alpha.client", 10_001, false),
        ];
        let (engine, _) = engine_with(apps, Settings::default());
        let rules = engine.compute_rules(true).unwrap();

        let alpha = rules.iter().position(|r| r.package == "com.alpha.client");
        let beta = rules.iter().position(|r| r.package == "com.beta.client");
        assert!(alpha < beta);
    }

    #[test]
    fn decided_hosts_mark_rule_changed() {
        let apps = vec![app("org.example.app", 10_001, false)];
        let (engine, _) = engine_with(apps, Settings::default());
        engine
            .store
            .update_access(
                &AccessKey {
                    uid: 10_001,
                    version: 4,
                    protocol: PROTO_TCP,
                    daddr: "1.2.3.4".into(),
                    dport: 443,
                },
                1_000,
                1,
                BLOCK_DENY,
            )
            .unwrap();

        let rules = engine.compute_rules(true).unwrap();
        let rule = find(&rules, "org.example.app");
        assert_eq!(rule.hosts, 1);
        assert!(rule.changed);
    }

    #[test]
    fn edit_writes_override_and_removes_at_default() {
        let apps = vec![app("org.example.app", 10_001, false)];
        let (engine, control) = engine_with(apps, Settings::default());

        let mut rules = engine.compute_rules(true).unwrap();
        let index = rules
            .iter()
            .position(|r| r.package == "org.example.app")
            .unwrap();

        rules[index].wifi_blocked = false;
        engine.apply_rule_edit(index, &mut rules).unwrap();
        assert_eq!(
            engine.prefs().get("org.example.app", RuleAttr::WifiBlocked),
            Some(false)
        );
        assert!(rules[index].changed);
        assert_eq!(control.reloads.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(control.cancelled.load(AtomicOrdering::SeqCst), 1);

        rules[index].wifi_blocked = true;
        engine.apply_rule_edit(index, &mut rules).unwrap();
        assert_eq!(
            engine.prefs().get("org.example.app", RuleAttr::WifiBlocked),
            None
        );
        assert!(!rules[index].changed);
    }

    #[test]
    fn related_propagation_handles_mutual_relations() {
        // Two packages sharing a uid relate to each other.
        let apps = vec![
            app("org.example.one", 10_001, false),
            app("org.example.two", 10_001, false),
        ];
        let (engine, control) = engine_with(apps, Settings::default());

        let mut rules = engine.compute_rules(true).unwrap();
        let one = rules
            .iter()
            .position(|r| r.package == "org.example.one")
            .unwrap();
        assert!(rules[one].related_uids);

        rules[one].wifi_blocked = false;
        rules[one].notify = false;
        engine.apply_rule_edit(one, &mut rules).unwrap();

        let two = find(&rules, "org.example.two");
        assert!(!two.wifi_blocked);
        assert!(!two.notify);
        assert_eq!(
            engine.prefs().get("org.example.two", RuleAttr::WifiBlocked),
            Some(false)
        );
        assert_eq!(
            engine.prefs().get("org.example.two", RuleAttr::Notify),
            Some(false)
        );
        // Only the top-level edit reloads.
        assert_eq!(control.reloads.load(AtomicOrdering::SeqCst), 1);
    }
}
