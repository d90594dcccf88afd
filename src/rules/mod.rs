//! Per-application rule resolution.

pub mod engine;
pub mod predefined;
pub mod prefs;

/// The effective firewall rule for one application (or pseudo identity),
/// resolved from defaults, predefined overrides and the user's override
/// store.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub uid: u32,
    pub package: String,
    pub name: String,
    pub system: bool,
    pub internet: bool,
    pub enabled: bool,
    /// False for kernel-level pseudo identities without an installed package.
    pub pkg: bool,

    pub default_wifi_blocked: bool,
    pub default_other_blocked: bool,
    pub default_screen_wifi: bool,
    pub default_screen_other: bool,
    pub default_roaming: bool,

    pub wifi_blocked: bool,
    pub other_blocked: bool,
    pub screen_wifi: bool,
    pub screen_other: bool,
    pub roaming: bool,
    pub lockdown: bool,
    pub apply: bool,
    pub notify: bool,

    /// Decided destinations, from the host-count cache.
    pub hosts: u64,
    pub changed: bool,

    /// Packages whose rules follow this one on edit.
    pub related: Vec<String>,
    /// True when `related` includes same-uid peers rather than only the
    /// predefined relations.
    pub related_uids: bool,
}

impl Rule {
    /// Recompute whether this rule deviates from its defaults.
    ///
    /// Screen exceptions only matter while the corresponding network is
    /// blocked, and roaming only matters while mobile traffic can flow.
    pub fn update_changed(&mut self) {
        self.changed = self.wifi_blocked != self.default_wifi_blocked
            || self.other_blocked != self.default_other_blocked
            || (self.wifi_blocked && self.screen_wifi != self.default_screen_wifi)
            || (self.other_blocked && self.screen_other != self.default_screen_other)
            || ((!self.other_blocked || self.screen_other)
                && self.roaming != self.default_roaming)
            || self.hosts > 0
            || self.lockdown
            || !self.apply;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> Rule {
        Rule {
            uid: 10_001,
            package: "org.example.app".into(),
            name: "Example".into(),
            system: false,
            internet: true,
            enabled: true,
            pkg: true,
            default_wifi_blocked: true,
            default_other_blocked: true,
            default_screen_wifi: false,
            default_screen_other: false,
            default_roaming: true,
            wifi_blocked: true,
            other_blocked: true,
            screen_wifi: false,
            screen_other: false,
            roaming: true,
            lockdown: false,
            apply: true,
            notify: true,
            hosts: 0,
            changed: false,
            related: Vec::new(),
            related_uids: false,
        }
    }

    #[test]
    fn unchanged_at_defaults() {
        let mut r = rule();
        r.update_changed();
        assert!(!r.changed);
    }

    #[test]
    fn deviating_block_marks_changed() {
        let mut r = rule();
        r.wifi_blocked = false;
        r.update_changed();
        assert!(r.changed);
    }

    #[test]
    fn screen_exception_matters_only_while_blocked() {
        let mut r = rule();
        r.screen_wifi = true;
        r.update_changed();
        assert!(r.changed);

        r.wifi_blocked = false;
        r.default_wifi_blocked = false;
        r.update_changed();
        assert!(!r.changed);
    }

    #[test]
    fn roaming_matters_only_while_mobile_can_flow() {
        let mut r = rule();
        // Mobile fully blocked, no screen exception: roaming is moot.
        r.roaming = false;
        r.update_changed();
        assert!(!r.changed);

        r.screen_other = true;
        r.default_screen_other = true;
        r.update_changed();
        assert!(r.changed);
    }

    #[test]
    fn hosts_lockdown_and_noapply_mark_changed() {
        let mut r = rule();
        r.hosts = 3;
        r.update_changed();
        assert!(r.changed);

        let mut r = rule();
        r.lockdown = true;
        r.update_changed();
        assert!(r.changed);

        let mut r = rule();
        r.apply = false;
        r.update_changed();
        assert!(r.changed);
    }
}
