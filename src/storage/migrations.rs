//! Schema creation and incremental upgrades.
//!
//! The on-disk version lives in `PRAGMA user_version`. Upgrades run as an
//! ordered ladder of idempotent steps inside a single transaction; every step
//! is guarded so a recovery run over a partially-applied prior migration is
//! safe. Reaching anything other than [`SCHEMA_VERSION`] is fatal: the caller
//! must treat the database as corrupt and not issue any read or write.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: u32 = 5;

/// Bring the schema up to [`SCHEMA_VERSION`], returning the version reached.
pub fn ensure_schema(conn: &mut Connection) -> Result<u32> {
    let mut version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

    if version > SCHEMA_VERSION {
        return Err(StoreError::Schema {
            reached: version,
            required: SCHEMA_VERSION,
        });
    }
    if version == SCHEMA_VERSION {
        return Ok(version);
    }

    info!(from = version, to = SCHEMA_VERSION, "upgrading schema");

    let tx = conn.transaction()?;

    if version < 1 {
        create_table_log(&tx)?;
        create_table_access(&tx)?;
        create_table_dns(&tx)?;
        create_table_forward(&tx)?;
        version = 1;
    }
    if version < 2 {
        add_column_if_missing(&tx, "access", "sent", "INTEGER")?;
        add_column_if_missing(&tx, "access", "received", "INTEGER")?;
        version = 2;
    }
    if version < 3 {
        add_column_if_missing(&tx, "access", "connections", "INTEGER")?;
        version = 3;
    }
    if version < 4 {
        tx.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_access_block ON access(block);
             CREATE INDEX IF NOT EXISTS idx_access_daddr ON access(daddr);",
        )?;
        version = 4;
    }
    if version < 5 {
        create_table_app(&tx)?;
        version = 5;
    }

    if version != SCHEMA_VERSION {
        return Err(StoreError::Schema {
            reached: version,
            required: SCHEMA_VERSION,
        });
    }

    tx.pragma_update(None, "user_version", version)?;
    tx.commit()?;

    info!(version, "schema upgraded");
    Ok(version)
}

fn create_table_log(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            time INTEGER NOT NULL,
            version INTEGER,
            protocol INTEGER,
            flags TEXT,
            saddr TEXT,
            sport INTEGER,
            daddr TEXT,
            dport INTEGER,
            dname TEXT,
            uid INTEGER,
            data TEXT,
            allowed INTEGER,
            connection INTEGER,
            interactive INTEGER
         );
         CREATE INDEX IF NOT EXISTS idx_log_time ON log(time);
         CREATE INDEX IF NOT EXISTS idx_log_dest ON log(daddr);
         CREATE INDEX IF NOT EXISTS idx_log_dname ON log(dname);
         CREATE INDEX IF NOT EXISTS idx_log_dport ON log(dport);
         CREATE INDEX IF NOT EXISTS idx_log_uid ON log(uid);",
    )?;
    Ok(())
}

fn create_table_access(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS access (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid INTEGER NOT NULL,
            version INTEGER NOT NULL,
            protocol INTEGER NOT NULL,
            daddr TEXT NOT NULL,
            dport INTEGER NOT NULL,
            time INTEGER NOT NULL,
            allowed INTEGER,
            block INTEGER NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_access
             ON access(uid, version, protocol, daddr, dport);",
    )?;
    Ok(())
}

fn create_table_dns(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            time INTEGER NOT NULL,
            qname TEXT NOT NULL,
            aname TEXT NOT NULL,
            resource TEXT NOT NULL,
            ttl INTEGER
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_dns ON dns(qname, aname, resource);
         CREATE INDEX IF NOT EXISTS idx_dns_resource ON dns(resource);",
    )?;
    Ok(())
}

fn create_table_forward(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS forward (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            protocol INTEGER NOT NULL,
            dport INTEGER NOT NULL,
            raddr TEXT NOT NULL,
            rport INTEGER NOT NULL,
            ruid INTEGER NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_forward ON forward(protocol, dport);",
    )?;
    Ok(())
}

fn create_table_app(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS app (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package TEXT,
            label TEXT,
            system INTEGER NOT NULL,
            internet INTEGER NOT NULL,
            enabled INTEGER NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_package ON app(package);",
    )?;
    Ok(())
}

fn column_missing(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let stmt = conn.prepare(&format!("SELECT * FROM {table} LIMIT 0"))?;
    let missing = !stmt
        .column_names()
        .iter()
        .any(|name| name.eq_ignore_ascii_case(column));
    Ok(missing)
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, ty: &str) -> Result<()> {
    if column_missing(conn, table, column)? {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {ty}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reaches_target() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(ensure_schema(&mut conn).unwrap(), SCHEMA_VERSION);
        let version: u32 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn).unwrap();
        assert_eq!(ensure_schema(&mut conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn all_tables_created() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn).unwrap();
        for table in ["log", "access", "dns", "forward", "app"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "table {table} should exist");
        }
    }

    #[test]
    fn upgrade_from_v1_adds_usage_columns() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_table_log(&conn).unwrap();
        create_table_access(&conn).unwrap();
        create_table_dns(&conn).unwrap();
        create_table_forward(&conn).unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();

        assert!(column_missing(&conn, "access", "sent").unwrap());
        ensure_schema(&mut conn).unwrap();
        assert!(!column_missing(&conn, "access", "sent").unwrap());
        assert!(!column_missing(&conn, "access", "received").unwrap());
        assert!(!column_missing(&conn, "access", "connections").unwrap());
    }

    #[test]
    fn newer_on_disk_version_is_fatal() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let err = ensure_schema(&mut conn).unwrap_err();
        assert!(matches!(err, StoreError::Schema { .. }));
    }

    #[test]
    fn recovery_over_partial_migration() {
        // Simulate a prior run that created the column but crashed before
        // bumping the version.
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn).unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();
        assert_eq!(ensure_schema(&mut conn).unwrap(), SCHEMA_VERSION);
    }
}
