//! Record types stored by the persistence layer.
//!
//! All timestamps are epoch milliseconds. Protocol numbers follow the IP
//! protocol registry (6 = TCP, 17 = UDP); `version` is the IP version (4/6).

/// Current wall clock as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// IP protocol number for TCP.
pub const PROTO_TCP: i32 = 6;
/// IP protocol number for UDP.
pub const PROTO_UDP: i32 = 17;

/// An observed connection, appended to the traffic log.
///
/// Log rows are immutable once written; they are removed only by bulk clear
/// or age-based cleanup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEntry {
    pub time: i64,
    pub version: i32,
    pub protocol: Option<i32>,
    pub flags: String,
    pub saddr: String,
    pub sport: Option<i32>,
    pub daddr: String,
    pub dport: Option<i32>,
    pub dname: Option<String>,
    pub uid: Option<u32>,
    pub data: Option<String>,
    pub allowed: bool,
    pub connection: i32,
    pub interactive: bool,
}

/// A log row as read back from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub id: i64,
    pub entry: LogEntry,
}

/// Protocol/allowed filter for `get_log`.
#[derive(Debug, Clone, Copy)]
pub struct LogFilter {
    pub udp: bool,
    pub tcp: bool,
    pub other: bool,
    pub allowed: bool,
    pub blocked: bool,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            udp: true,
            tcp: true,
            other: true,
            allowed: true,
            blocked: true,
        }
    }
}

/// The unique key of an access record: one row per
/// (uid, version, protocol, destination, port) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessKey {
    pub uid: u32,
    pub version: i32,
    pub protocol: i32,
    /// Destination address or resolved name, whichever the caller knows.
    pub daddr: String,
    pub dport: i32,
}

/// Explicit block decision on an access record.
///
/// `-1` = unset (follow the per-app rule), `0` = allow, `1` = block.
pub const BLOCK_UNSET: i32 = -1;
pub const BLOCK_ALLOW: i32 = 0;
pub const BLOCK_DENY: i32 = 1;

/// Last observed outcome; `-1` means not yet (re-)observed.
pub const ALLOWED_UNKNOWN: i32 = -1;

/// A per-destination access record with usage counters.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRecord {
    pub id: i64,
    pub key: AccessKey,
    pub time: i64,
    pub allowed: i32,
    pub block: i32,
    pub sent: i64,
    pub received: i64,
    pub connections: i64,
}

/// An access row annotated with the number of alternate domain names that
/// resolved to the same resource (for display disambiguation).
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRow {
    pub record: AccessRecord,
    pub alternate_names: i64,
}

/// A decided access row joined with the addresses its destination name
/// resolved to; feeds address-level filtering of named destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDnsEntry {
    pub uid: u32,
    pub version: i32,
    pub protocol: i32,
    pub daddr: String,
    /// Resolved address, absent when the destination never hit the DNS cache.
    pub resource: Option<String>,
    pub dport: i32,
    pub block: i32,
    pub time: Option<i64>,
    pub ttl: Option<i64>,
}

/// A cached DNS resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub time: i64,
    pub qname: String,
    pub aname: String,
    pub resource: String,
    /// TTL in milliseconds.
    pub ttl: i64,
}

impl DnsRecord {
    /// A record is expired when its time-to-live has elapsed. Expiry does not
    /// delete the row; it only filters lookups until `cleanup_dns` runs.
    pub fn is_expired(&self, now: i64) -> bool {
        self.time + self.ttl < now
    }
}

/// A port-forwarding rule, unique on (protocol, dport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub protocol: i32,
    pub dport: i32,
    pub raddr: String,
    pub rport: i32,
    pub ruid: u32,
}

/// Cached application metadata, unique on package name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRecord {
    pub package: String,
    pub label: Option<String>,
    pub system: bool,
    pub internet: bool,
    pub enabled: bool,
}

/// Kernel-level traffic sources that have no installed package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uid {
    Root,
    Media,
    Multicast,
    Gps,
    Dns,
    Nobody,
}

/// Identities per user profile are offset by this factor.
pub const USER_FACTOR: u32 = 100_000;

impl Uid {
    pub const ALL: [Uid; 6] = [
        Uid::Root,
        Uid::Media,
        Uid::Multicast,
        Uid::Gps,
        Uid::Dns,
        Uid::Nobody,
    ];

    pub fn code(self) -> u32 {
        match self {
            Uid::Root => 0,
            Uid::Media => 1013,
            Uid::Multicast => 1020,
            Uid::Gps => 1021,
            Uid::Dns => 1051,
            Uid::Nobody => 9999,
        }
    }

    /// Synthetic package name used in rule lists and the export format.
    pub fn package_name(self) -> &'static str {
        match self {
            Uid::Root => "root",
            Uid::Media => "android.media",
            Uid::Multicast => "android.multicast",
            Uid::Gps => "android.gps",
            Uid::Dns => "android.dns",
            Uid::Nobody => "nobody",
        }
    }

    /// Human-readable name for the pseudo identity.
    pub fn title(self) -> &'static str {
        match self {
            Uid::Root => "root",
            Uid::Media => "mediaserver",
            Uid::Multicast => "multicast",
            Uid::Gps => "gps",
            Uid::Dns => "dns",
            Uid::Nobody => "nobody",
        }
    }

    pub fn from_package(package: &str) -> Option<Uid> {
        Uid::ALL
            .into_iter()
            .find(|uid| uid.package_name() == package)
    }

    pub fn from_code(code: u32) -> Option<Uid> {
        Uid::ALL.into_iter().find(|uid| uid.code() == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_expiry_boundary() {
        let rr = DnsRecord {
            time: 1_000,
            qname: "example.com".into(),
            aname: "example.com".into(),
            resource: "93.184.216.34".into(),
            ttl: 5_000,
        };
        assert!(!rr.is_expired(1_000 + 4_999));
        assert!(!rr.is_expired(1_000 + 5_000));
        assert!(rr.is_expired(1_000 + 5_001));
    }

    #[test]
    fn pseudo_uid_lookup() {
        assert_eq!(Uid::from_package("android.media"), Some(Uid::Media));
        assert_eq!(Uid::from_code(1051), Some(Uid::Dns));
        assert_eq!(Uid::from_package("com.example.app"), None);
        assert_eq!(Uid::Nobody.code(), 9999);
    }
}
