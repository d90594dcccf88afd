//! Export and import of the full user state as an XML document.
//!
//! The document carries the global settings, the per-package override table,
//! the decided access rows (one `<rule>` per package of the owning uid) and
//! the port forwards. Import replaces each section wholesale when it is
//! encountered; unknown setting keys and unresolvable packages are dropped
//! and reported, never fatal.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{info, warn};

use crate::config::{Settings, Sort};
use crate::error::{Result, StoreError};
use crate::rules::engine::AppProvider;
use crate::rules::prefs::{OverrideStore, RuleAttr};
use crate::storage::RecordStore;
use crate::types::{AccessKey, ForwardRule, Uid, ALLOWED_UNKNOWN};

const ROOT: &str = "appwall";

pub struct Backup<'a> {
    store: &'a RecordStore,
    prefs: &'a OverrideStore,
    provider: &'a dyn AppProvider,
}

impl<'a> Backup<'a> {
    pub fn new(
        store: &'a RecordStore,
        prefs: &'a OverrideStore,
        provider: &'a dyn AppProvider,
    ) -> Self {
        Self {
            store,
            prefs,
            provider,
        }
    }

    pub fn export<W: Write>(&self, settings: &Settings, out: W) -> Result<()> {
        let mut writer = Writer::new_with_indent(out, b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(export_err)?;

        let mut root = BytesStart::new(ROOT);
        root.push_attribute(("version", crate::VERSION));
        writer.write_event(Event::Start(root)).map_err(export_err)?;

        self.export_settings(&mut writer, settings)?;
        for attr in RuleAttr::ALL {
            self.export_overrides(&mut writer, attr)?;
        }
        self.export_rules(&mut writer)?;
        self.export_forwards(&mut writer)?;

        writer
            .write_event(Event::End(BytesEnd::new(ROOT)))
            .map_err(export_err)?;
        Ok(())
    }

    fn export_settings<W: Write>(&self, writer: &mut Writer<W>, settings: &Settings) -> Result<()> {
        writer
            .write_event(Event::Start(BytesStart::new("settings")))
            .map_err(export_err)?;
        let booleans = [
            ("default_wifi_blocked", settings.default_wifi_blocked),
            ("default_other_blocked", settings.default_other_blocked),
            ("default_screen_wifi", settings.default_screen_wifi),
            ("default_screen_other", settings.default_screen_other),
            ("default_roaming_blocked", settings.default_roaming_blocked),
            ("screen_on", settings.screen_on),
            ("manage_system", settings.manage_system),
            ("show_user", settings.show_user),
            ("show_system", settings.show_system),
            ("show_nointernet", settings.show_nointernet),
            ("show_disabled", settings.show_disabled),
        ];
        for (key, value) in booleans {
            write_setting(writer, key, "boolean", &value.to_string())?;
        }
        write_setting(writer, "sort", "string", sort_key(settings.sort))?;
        writer
            .write_event(Event::End(BytesEnd::new("settings")))
            .map_err(export_err)?;
        Ok(())
    }

    fn export_overrides<W: Write>(&self, writer: &mut Writer<W>, attr: RuleAttr) -> Result<()> {
        writer
            .write_event(Event::Start(BytesStart::new(attr.key())))
            .map_err(export_err)?;
        for (package, value) in self.prefs.entries(attr) {
            write_setting(writer, &package, "boolean", &value.to_string())?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(attr.key())))
            .map_err(export_err)?;
        Ok(())
    }

    fn export_rules<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        writer
            .write_event(Event::Start(BytesStart::new("filter")))
            .map_err(export_err)?;
        for record in self.store.get_access_decided()? {
            let packages = self.packages_for(record.key.uid)?;
            if packages.is_empty() {
                warn!(uid = record.key.uid, "no package for uid, dropping rule");
                continue;
            }
            for package in packages {
                let mut el = BytesStart::new("rule");
                el.push_attribute(("pkg", package.as_str()));
                el.push_attribute(("version", record.key.version.to_string().as_str()));
                el.push_attribute(("protocol", record.key.protocol.to_string().as_str()));
                el.push_attribute(("daddr", record.key.daddr.as_str()));
                el.push_attribute(("dport", record.key.dport.to_string().as_str()));
                el.push_attribute(("time", record.time.to_string().as_str()));
                el.push_attribute(("block", record.block.to_string().as_str()));
                writer.write_event(Event::Empty(el)).map_err(export_err)?;
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new("filter")))
            .map_err(export_err)?;
        Ok(())
    }

    fn export_forwards<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        writer
            .write_event(Event::Start(BytesStart::new("forward")))
            .map_err(export_err)?;
        for forward in self.store.get_forwarding()? {
            let packages = self.packages_for(forward.ruid)?;
            let Some(package) = packages.first() else {
                warn!(uid = forward.ruid, "no package for uid, dropping forward");
                continue;
            };
            let mut el = BytesStart::new("port");
            el.push_attribute(("pkg", package.as_str()));
            el.push_attribute(("protocol", forward.protocol.to_string().as_str()));
            el.push_attribute(("dport", forward.dport.to_string().as_str()));
            el.push_attribute(("raddr", forward.raddr.as_str()));
            el.push_attribute(("rport", forward.rport.to_string().as_str()));
            writer.write_event(Event::Empty(el)).map_err(export_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("forward")))
            .map_err(export_err)?;
        Ok(())
    }

    fn packages_for(&self, uid: u32) -> Result<Vec<String>> {
        let mut packages = self.provider.packages_for_uid(uid)?;
        if packages.is_empty() {
            if let Some(pseudo) = Uid::from_code(uid) {
                packages.push(pseudo.package_name().to_string());
            }
        }
        Ok(packages)
    }

    /// Read a document back, returning the imported settings.
    pub fn import<R: BufRead>(&self, input: R) -> Result<Settings> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);

        let mut settings = Settings::default();
        let mut section = Section::None;
        let mut pending: BTreeMap<String, bool> = BTreeMap::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf).map_err(import_err)? {
                Event::Start(e) => {
                    if !self.handle_leaf(&e, &section, &mut settings, &mut pending)? {
                        section = self.open_section(&e, section, &mut pending)?;
                    }
                }
                Event::Empty(e) => {
                    if !self.handle_leaf(&e, &section, &mut settings, &mut pending)? {
                        // An empty section element opens and closes at once.
                        let opened = self.open_section(&e, Section::None, &mut pending)?;
                        self.close_section(opened, &mut pending)?;
                    }
                }
                Event::End(e) => {
                    if section.matches(e.name().as_ref()) {
                        section = self.close_section(section, &mut pending)?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        info!("import complete");
        Ok(settings)
    }

    fn open_section(
        &self,
        e: &BytesStart<'_>,
        current: Section,
        pending: &mut BTreeMap<String, bool>,
    ) -> Result<Section> {
        let name = e.name();
        let name = name.as_ref();
        if name == ROOT.as_bytes() {
            return Ok(current);
        }
        if name == b"settings" {
            return Ok(Section::Settings);
        }
        if let Some(attr) = std::str::from_utf8(name).ok().and_then(RuleAttr::from_key) {
            pending.clear();
            return Ok(Section::Attr(attr));
        }
        if name == b"filter" {
            // The section replaces all access state.
            self.store.clear_access(None, false)?;
            return Ok(Section::Filter);
        }
        if name == b"forward" {
            self.store.clear_forward()?;
            return Ok(Section::Forward);
        }
        warn!(element = %String::from_utf8_lossy(name), "unknown element, ignored");
        Ok(current)
    }

    fn close_section(
        &self,
        section: Section,
        pending: &mut BTreeMap<String, bool>,
    ) -> Result<Section> {
        if let Section::Attr(attr) = section {
            self.prefs.replace(attr, std::mem::take(pending))?;
        }
        Ok(Section::None)
    }

    /// Returns true when the element was a leaf of the current section.
    fn handle_leaf(
        &self,
        e: &BytesStart<'_>,
        section: &Section,
        settings: &mut Settings,
        pending: &mut BTreeMap<String, bool>,
    ) -> Result<bool> {
        let name = e.name();
        match (section, name.as_ref()) {
            (Section::Settings, b"setting") => {
                let key = required(e, "key")?;
                let value = required(e, "value")?;
                apply_setting(settings, &key, &value);
                Ok(true)
            }
            (Section::Attr(_), b"setting") => {
                let key = required(e, "key")?;
                let value = required(e, "value")?;
                match value.parse::<bool>() {
                    Ok(value) => {
                        pending.insert(key, value);
                    }
                    Err(_) => warn!(key = %key, value = %value, "override is not a boolean, dropped"),
                }
                Ok(true)
            }
            (Section::Filter, b"rule") => {
                self.import_rule(e)?;
                Ok(true)
            }
            (Section::Forward, b"port") => {
                self.import_forward(e)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn import_rule(&self, e: &BytesStart<'_>) -> Result<()> {
        let package = required(e, "pkg")?;
        let Some(uid) = self.resolve_uid(&package)? else {
            warn!(package = %package, "unknown package, dropping rule");
            return Ok(());
        };
        let key = AccessKey {
            uid,
            version: parse_attr(e, "version", 4)?,
            protocol: parse_attr(e, "protocol", 0)?,
            daddr: required(e, "daddr")?,
            dport: parse_attr(e, "dport", 0)?,
        };
        let time: i64 = parse_attr(e, "time", 0)?;
        let block: i32 = parse_attr(e, "block", 0)?;
        self.store.update_access(&key, time, ALLOWED_UNKNOWN, block)?;
        Ok(())
    }

    fn import_forward(&self, e: &BytesStart<'_>) -> Result<()> {
        let package = required(e, "pkg")?;
        let Some(ruid) = self.resolve_uid(&package)? else {
            warn!(package = %package, "unknown package, dropping forward");
            return Ok(());
        };
        let forward = ForwardRule {
            protocol: parse_attr(e, "protocol", 0)?,
            dport: parse_attr(e, "dport", 0)?,
            raddr: required(e, "raddr")?,
            rport: parse_attr(e, "rport", 0)?,
            ruid,
        };
        if let Err(e) = self.store.add_forward(&forward) {
            warn!(dport = forward.dport, error = %e, "duplicate forward, dropped");
        }
        Ok(())
    }

    fn resolve_uid(&self, package: &str) -> Result<Option<u32>> {
        if let Some(uid) = self.provider.uid_for_package(package)? {
            return Ok(Some(uid));
        }
        Ok(Uid::from_package(package).map(Uid::code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Settings,
    Attr(RuleAttr),
    Filter,
    Forward,
}

impl Section {
    fn matches(self, name: &[u8]) -> bool {
        match self {
            Section::None => false,
            Section::Settings => name == b"settings",
            Section::Attr(attr) => name == attr.key().as_bytes(),
            Section::Filter => name == b"filter",
            Section::Forward => name == b"forward",
        }
    }
}

fn write_setting<W: Write>(
    writer: &mut Writer<W>,
    key: &str,
    ty: &str,
    value: &str,
) -> Result<()> {
    let mut el = BytesStart::new("setting");
    el.push_attribute(("key", key));
    el.push_attribute(("type", ty));
    el.push_attribute(("value", value));
    writer.write_event(Event::Empty(el)).map_err(export_err)
}

fn apply_setting(settings: &mut Settings, key: &str, value: &str) {
    if key == "sort" {
        match value {
            "name" => settings.sort = Sort::Name,
            "uid" => settings.sort = Sort::Uid,
            _ => warn!(value, "unknown sort order, dropped"),
        }
        return;
    }
    let Ok(value) = value.parse::<bool>() else {
        warn!(key, value, "setting is not a boolean, dropped");
        return;
    };
    match key {
        "default_wifi_blocked" => settings.default_wifi_blocked = value,
        "default_other_blocked" => settings.default_other_blocked = value,
        "default_screen_wifi" => settings.default_screen_wifi = value,
        "default_screen_other" => settings.default_screen_other = value,
        "default_roaming_blocked" => settings.default_roaming_blocked = value,
        "screen_on" => settings.screen_on = value,
        "manage_system" => settings.manage_system = value,
        "show_user" => settings.show_user = value,
        "show_system" => settings.show_system = value,
        "show_nointernet" => settings.show_nointernet = value,
        "show_disabled" => settings.show_disabled = value,
        _ => warn!(key, "unknown setting, dropped"),
    }
}

fn sort_key(sort: Sort) -> &'static str {
    match sort {
        Sort::Name => "name",
        Sort::Uid => "uid",
    }
}

fn attr_value(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let value = e
        .try_get_attribute(name)
        .map_err(import_err)?
        .map(|a| a.unescape_value().map(|v| v.into_owned()))
        .transpose()
        .map_err(import_err)?;
    Ok(value)
}

fn required(e: &BytesStart<'_>, name: &str) -> Result<String> {
    attr_value(e, name)?.ok_or_else(|| {
        StoreError::Import(format!(
            "element <{}> is missing attribute {name}",
            String::from_utf8_lossy(e.name().as_ref())
        ))
    })
}

fn parse_attr<T: std::str::FromStr>(e: &BytesStart<'_>, name: &str, default: T) -> Result<T> {
    match attr_value(e, name)? {
        Some(raw) => raw
            .parse()
            .map_err(|_| StoreError::Import(format!("attribute {name} is not a number: {raw}"))),
        None => Ok(default),
    }
}

fn export_err<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Export(e.to_string())
}

fn import_err<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Import(e.to_string())
}
