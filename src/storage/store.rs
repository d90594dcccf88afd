//! The record store: traffic log, per-destination access records, the DNS
//! cache, port forwards and the application-metadata cache.
//!
//! One SQLite connection behind a mutex serializes all writers; every
//! mutating operation commits its own transaction and then notifies the
//! affected record family, never on failure. The host-count cache is kept
//! beside the connection and is refreshed only on explicit request.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::storage::migrations;
use crate::storage::notifier::{ChangeNotifier, Family};
use crate::types::{
    AccessDnsEntry, AccessKey, AccessRecord, AccessRow, AppRecord, DnsRecord, ForwardRule,
    LogEntry, LogFilter, LogRow, ALLOWED_UNKNOWN, PROTO_TCP, PROTO_UDP,
};

/// Rows returned per uid by [`RecordStore::get_access`].
const ACCESS_LIMIT: u32 = 250;

pub struct RecordStore {
    conn: Mutex<Connection>,
    hosts: Mutex<HashMap<u32, u64>>,
    notifier: ChangeNotifier,
    min_ttl_ms: i64,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Open (or create) the database at the configured location.
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open_at(&path, config)
    }

    pub fn open_at(path: &Path, config: &Config) -> Result<Self> {
        info!(path = %path.display(), "opening record store");
        Self::from_connection(Connection::open(path)?, config)
    }

    /// Ephemeral store, used by tests and tooling.
    pub fn open_in_memory(config: &Config) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(mut conn: Connection, config: &Config) -> Result<Self> {
        let version = migrations::ensure_schema(&mut conn)?;
        info!(version, "schema ready");
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
            hosts: Mutex::new(HashMap::new()),
            notifier: ChangeNotifier::new(Duration::from_millis(config.debounce_ms)),
            min_ttl_ms: config.min_ttl_secs * 1_000,
        })
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    // ===== traffic log =====

    pub fn insert_log(&self, entry: &LogEntry) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO log (time, version, protocol, flags, saddr, sport,
                                  daddr, dport, dname, uid, data, allowed,
                                  connection, interactive)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    entry.time,
                    entry.version,
                    entry.protocol,
                    entry.flags,
                    entry.saddr,
                    entry.sport,
                    entry.daddr,
                    entry.dport,
                    entry.dname,
                    entry.uid,
                    entry.data,
                    entry.allowed,
                    entry.connection,
                    entry.interactive,
                ],
            )?;
        }
        self.notifier.notify(Family::Log);
        Ok(())
    }

    pub fn clear_log(&self, uid: Option<u32>) -> Result<()> {
        {
            let conn = self.conn.lock();
            match uid {
                Some(uid) => conn.execute("DELETE FROM log WHERE uid = ?1", params![uid])?,
                None => conn.execute("DELETE FROM log", [])?,
            };
        }
        self.notifier.notify(Family::Log);
        Ok(())
    }

    /// Age-based cleanup: drop log rows older than `before`.
    pub fn cleanup_log(&self, before: i64) -> Result<usize> {
        let deleted = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM log WHERE time < ?1", params![before])?
        };
        if deleted > 0 {
            info!(deleted, "cleaned up log");
            self.notifier.notify(Family::Log);
        }
        Ok(deleted)
    }

    /// Periodic maintenance against the wall clock: drop log rows older than
    /// the retention window and purge expired DNS rows.
    pub fn cleanup(&self, log_retention_ms: i64) -> Result<()> {
        let now = crate::types::now_millis();
        self.cleanup_log(now - log_retention_ms)?;
        self.cleanup_dns(now)?;
        Ok(())
    }

    pub fn get_log(&self, filter: &LogFilter) -> Result<Vec<LogRow>> {
        let mut clauses: Vec<String> = Vec::new();

        if !(filter.udp && filter.tcp && filter.other) {
            let mut protocols: Vec<String> = Vec::new();
            if filter.udp {
                protocols.push(format!("protocol = {PROTO_UDP}"));
            }
            if filter.tcp {
                protocols.push(format!("protocol = {PROTO_TCP}"));
            }
            if filter.other {
                protocols.push(format!("protocol NOT IN ({PROTO_TCP}, {PROTO_UDP})"));
            }
            clauses.push(if protocols.is_empty() {
                "0".into()
            } else {
                format!("({})", protocols.join(" OR "))
            });
        }
        if !(filter.allowed && filter.blocked) {
            clauses.push(match (filter.allowed, filter.blocked) {
                (true, false) => "allowed <> 0".into(),
                (false, true) => "allowed = 0".into(),
                _ => "0".into(),
            });
        }

        let mut sql = String::from(
            "SELECT id, time, version, protocol, flags, saddr, sport, daddr,
                    dport, dname, uid, data, allowed, connection, interactive
             FROM log",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY time DESC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn search_log(&self, find: &str) -> Result<Vec<LogRow>> {
        let pattern = format!("%{find}%");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, time, version, protocol, flags, saddr, sport, daddr,
                    dport, dname, uid, data, allowed, connection, interactive
             FROM log
             WHERE daddr LIKE ?1 OR dname LIKE ?1 OR uid LIKE ?1
             ORDER BY time DESC",
        )?;
        let rows = stmt
            .query_map(params![pattern], map_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ===== access records =====

    /// Upsert an access record. Returns `true` when a new row was created.
    ///
    /// An unset block (`block < 0`) leaves an existing decision untouched on
    /// update but is stored verbatim on insert.
    pub fn update_access(
        &self,
        key: &AccessKey,
        time: i64,
        allowed: i32,
        block: i32,
    ) -> Result<bool> {
        let inserted = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            let rows = if block >= 0 {
                tx.execute(
                    "UPDATE access SET time = ?1, allowed = ?2, block = ?3
                     WHERE uid = ?4 AND version = ?5 AND protocol = ?6
                       AND daddr = ?7 AND dport = ?8",
                    params![
                        time,
                        allowed,
                        block,
                        key.uid,
                        key.version,
                        key.protocol,
                        key.daddr,
                        key.dport
                    ],
                )?
            } else {
                tx.execute(
                    "UPDATE access SET time = ?1, allowed = ?2
                     WHERE uid = ?3 AND version = ?4 AND protocol = ?5
                       AND daddr = ?6 AND dport = ?7",
                    params![
                        time,
                        allowed,
                        key.uid,
                        key.version,
                        key.protocol,
                        key.daddr,
                        key.dport
                    ],
                )?
            };

            if rows == 0 {
                tx.execute(
                    "INSERT INTO access (uid, version, protocol, daddr, dport,
                                         time, allowed, block)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        key.uid,
                        key.version,
                        key.protocol,
                        key.daddr,
                        key.dport,
                        time,
                        allowed,
                        block
                    ],
                )?;
            } else if rows > 1 {
                error!(rows, uid = key.uid, daddr = %key.daddr, "access key not unique");
            }

            tx.commit()?;
            rows == 0
        };
        self.notifier.notify(Family::Access);
        Ok(inserted)
    }

    /// Accumulate byte counters onto an existing access record. A key without
    /// a row is ignored.
    pub fn update_usage(&self, key: &AccessKey, sent: i64, received: i64) -> Result<()> {
        let updated = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            let row: Option<(i64, i64, i64, i64)> = tx
                .query_row(
                    "SELECT id, IFNULL(sent, 0), IFNULL(received, 0),
                            IFNULL(connections, 0)
                     FROM access
                     WHERE uid = ?1 AND version = ?2 AND protocol = ?3
                       AND daddr = ?4 AND dport = ?5",
                    params![key.uid, key.version, key.protocol, key.daddr, key.dport],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let updated = if let Some((id, old_sent, old_received, connections)) = row {
                tx.execute(
                    "UPDATE access SET sent = ?1, received = ?2, connections = ?3
                     WHERE id = ?4",
                    params![old_sent + sent, old_received + received, connections + 1, id],
                )?;
                true
            } else {
                warn!(uid = key.uid, daddr = %key.daddr, "usage for unknown access record");
                false
            };

            tx.commit()?;
            updated
        };
        if updated {
            self.notifier.notify(Family::Access);
        }
        Ok(())
    }

    /// Record an explicit allow/block decision; the last observed outcome is
    /// reset so the next connection re-reports it.
    pub fn set_access(&self, id: i64, block: i32) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE access SET block = ?1, allowed = ?2 WHERE id = ?3",
                params![block, ALLOWED_UNKNOWN, id],
            )?;
        }
        self.notifier.notify(Family::Access);
        Ok(())
    }

    pub fn clear_access(&self, uid: Option<u32>, keep_decisions: bool) -> Result<()> {
        {
            let conn = self.conn.lock();
            let mut sql = String::from("DELETE FROM access");
            let mut clauses: Vec<String> = Vec::new();
            if let Some(uid) = uid {
                clauses.push(format!("uid = {uid}"));
            }
            if keep_decisions {
                clauses.push("block < 0".into());
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            conn.execute(&sql, [])?;
        }
        self.notifier.notify(Family::Access);
        Ok(())
    }

    pub fn reset_usage(&self, uid: Option<u32>) -> Result<()> {
        {
            let conn = self.conn.lock();
            match uid {
                Some(uid) => conn.execute(
                    "UPDATE access SET sent = NULL, received = NULL,
                                       connections = NULL
                     WHERE uid = ?1",
                    params![uid],
                )?,
                None => conn.execute(
                    "UPDATE access SET sent = NULL, received = NULL,
                                       connections = NULL",
                    [],
                )?,
            };
        }
        self.notifier.notify(Family::Access);
        Ok(())
    }

    /// Access rows for one uid, newest first, annotated with the number of
    /// other domain names that resolved to the same destination.
    pub fn get_access(&self, uid: u32) -> Result<Vec<AccessRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.uid, a.version, a.protocol, a.daddr, a.dport,
                    a.time, a.allowed, a.block,
                    IFNULL(a.sent, 0), IFNULL(a.received, 0),
                    IFNULL(a.connections, 0),
                    (SELECT COUNT(DISTINCT d.qname) FROM dns d
                     WHERE d.resource = a.daddr AND d.qname <> a.daddr)
             FROM access a
             WHERE a.uid = ?1
             ORDER BY a.time DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![uid, ACCESS_LIMIT], |row| {
                Ok(AccessRow {
                    record: map_access(row)?,
                    alternate_names: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All rows carrying an explicit decision; source of the export document.
    pub fn get_access_decided(&self) -> Result<Vec<AccessRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, uid, version, protocol, daddr, dport, time, allowed,
                    block, IFNULL(sent, 0), IFNULL(received, 0),
                    IFNULL(connections, 0)
             FROM access
             WHERE block >= 0
             ORDER BY uid, daddr",
        )?;
        let rows = stmt
            .query_map([], map_access)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Undecided rows for a uid seen since `since`, newest first.
    pub fn get_access_unset(&self, uid: u32, limit: u32, since: i64) -> Result<Vec<AccessRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, uid, version, protocol, daddr, dport, time, allowed,
                    block, IFNULL(sent, 0), IFNULL(received, 0),
                    IFNULL(connections, 0)
             FROM access
             WHERE uid = ?1 AND block < 0 AND time >= ?2
             ORDER BY time DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![uid, since, limit], map_access)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Decided rows joined with the addresses their destination names
    /// resolved to, for filtering named destinations at the address level.
    pub fn get_access_dns(&self) -> Result<Vec<AccessDnsEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.uid, a.version, a.protocol, a.daddr, d.resource, a.dport,
                    a.block, d.time, d.ttl
             FROM access a
             LEFT JOIN dns d ON d.qname = a.daddr
             WHERE a.block >= 0
             ORDER BY a.uid, a.daddr, d.resource",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AccessDnsEntry {
                    uid: row.get(0)?,
                    version: row.get(1)?,
                    protocol: row.get(2)?,
                    daddr: row.get(3)?,
                    resource: row.get(4)?,
                    dport: row.get(5)?,
                    block: row.get(6)?,
                    time: row.get(7)?,
                    ttl: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ===== host-count cache =====

    /// Number of decided destinations for a uid. With `use_cache` a previously
    /// computed value is returned even if stale; without it the count is
    /// recomputed and cached.
    pub fn get_host_count(&self, uid: u32, use_cache: bool) -> Result<u64> {
        if use_cache {
            if let Some(count) = self.hosts.lock().get(&uid).copied() {
                return Ok(count);
            }
        }
        let count: i64 = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT COUNT(*) FROM access WHERE block >= 0 AND uid = ?1",
                params![uid],
                |row| row.get(0),
            )?
        };
        let count = u64::try_from(count).unwrap_or_default();
        self.hosts.lock().insert(uid, count);
        Ok(count)
    }

    pub fn clear_cache(&self) {
        self.hosts.lock().clear();
    }

    // ===== dns cache =====

    /// Upsert a DNS resolution, flooring the TTL to the configured minimum.
    /// Returns `true` when a new row was created.
    pub fn insert_dns(&self, rr: &DnsRecord) -> Result<bool> {
        let ttl = rr.ttl.max(self.min_ttl_ms);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE dns SET time = ?1, ttl = ?2
             WHERE qname = ?3 AND aname = ?4 AND resource = ?5",
            params![rr.time, ttl, rr.qname, rr.aname, rr.resource],
        )?;
        if rows == 0 {
            tx.execute(
                "INSERT INTO dns (time, qname, aname, resource, ttl)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![rr.time, rr.qname, rr.aname, rr.resource, ttl],
            )?;
        } else if rows > 1 {
            error!(rows, qname = %rr.qname, "dns key not unique");
        }

        tx.commit()?;
        Ok(rows == 0)
    }

    /// Purge rows whose TTL elapsed before `now`.
    pub fn cleanup_dns(&self, now: i64) -> Result<usize> {
        let deleted = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM dns WHERE time + ttl < ?1", params![now])?
        };
        if deleted > 0 {
            info!(deleted, "cleaned up dns");
        }
        Ok(deleted)
    }

    pub fn clear_dns(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM dns", [])?;
        Ok(())
    }

    pub fn get_dns(&self) -> Result<Vec<DnsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, qname, aname, resource, ttl FROM dns ORDER BY qname, resource",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DnsRecord {
                    time: row.get(0)?,
                    qname: row.get(1)?,
                    aname: row.get(2)?,
                    resource: row.get(3)?,
                    ttl: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Best-known domain name for an address.
    pub fn get_qname(&self, ip: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let qname = conn
            .query_row(
                "SELECT qname FROM dns WHERE resource = ?1 ORDER BY qname LIMIT 1",
                params![ip],
                |row| row.get(0),
            )
            .optional()?;
        Ok(qname)
    }

    /// Other names that resolved to any of the same addresses as `qname`.
    pub fn get_alternate_qnames(&self, qname: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT d2.qname
             FROM dns d1 JOIN dns d2 ON d2.resource = d1.resource
             WHERE d1.qname = ?1 AND d2.qname <> ?1
             ORDER BY d2.qname",
        )?;
        let rows = stmt
            .query_map(params![qname], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ===== port forwards =====

    /// Add a forward. The (protocol, dport) pair is unique; a duplicate is a
    /// constraint error.
    pub fn add_forward(&self, rule: &ForwardRule) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO forward (protocol, dport, raddr, rport, ruid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![rule.protocol, rule.dport, rule.raddr, rule.rport, rule.ruid],
            )?;
        }
        self.notifier.notify(Family::Forward);
        Ok(())
    }

    pub fn delete_forward(&self, protocol: i32, dport: i32) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM forward WHERE protocol = ?1 AND dport = ?2",
                params![protocol, dport],
            )?;
        }
        self.notifier.notify(Family::Forward);
        Ok(())
    }

    pub fn clear_forward(&self) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM forward", [])?;
        }
        self.notifier.notify(Family::Forward);
        Ok(())
    }

    pub fn get_forwarding(&self) -> Result<Vec<ForwardRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT protocol, dport, raddr, rport, ruid FROM forward ORDER BY dport",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForwardRule {
                    protocol: row.get(0)?,
                    dport: row.get(1)?,
                    raddr: row.get(2)?,
                    rport: row.get(3)?,
                    ruid: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ===== application cache =====

    pub fn add_app(&self, app: &AppRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO app (package, label, system, internet, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![app.package, app.label, app.system, app.internet, app.enabled],
        )?;
        Ok(())
    }

    pub fn get_app(&self, package: &str) -> Result<Option<AppRecord>> {
        let conn = self.conn.lock();
        let app = conn
            .query_row(
                "SELECT package, label, system, internet, enabled
                 FROM app WHERE package = ?1",
                params![package],
                |row| {
                    Ok(AppRecord {
                        package: row.get(0)?,
                        label: row.get(1)?,
                        system: row.get(2)?,
                        internet: row.get(3)?,
                        enabled: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(app)
    }

    pub fn clear_apps(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM app", [])?;
        Ok(())
    }
}

fn map_log(row: &Row<'_>) -> rusqlite::Result<LogRow> {
    Ok(LogRow {
        id: row.get(0)?,
        entry: LogEntry {
            time: row.get(1)?,
            version: row.get(2)?,
            protocol: row.get(3)?,
            flags: row.get(4)?,
            saddr: row.get(5)?,
            sport: row.get(6)?,
            daddr: row.get(7)?,
            dport: row.get(8)?,
            dname: row.get(9)?,
            uid: row.get(10)?,
            data: row.get(11)?,
            allowed: row.get(12)?,
            connection: row.get(13)?,
            interactive: row.get(14)?,
        },
    })
}

fn map_access(row: &Row<'_>) -> rusqlite::Result<AccessRecord> {
    Ok(AccessRecord {
        id: row.get(0)?,
        key: AccessKey {
            uid: row.get(1)?,
            version: row.get(2)?,
            protocol: row.get(3)?,
            daddr: row.get(4)?,
            dport: row.get(5)?,
        },
        time: row.get(6)?,
        allowed: row.get(7)?,
        block: row.get(8)?,
        sent: row.get(9)?,
        received: row.get(10)?,
        connections: row.get(11)?,
    })
}
