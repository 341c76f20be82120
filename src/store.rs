//! SQLite backing store shared by the catalog, key records, scan ledger and
//! audit logs.
//!
//! Each request opens its own [`Store`] handle.  Cross-request coordination
//! happens only through the database: WAL journaling, a busy timeout, and
//! IMMEDIATE transactions for read-modify-write sequences.  Append-only and
//! write-once invariants are enforced with triggers so that no caller can
//! bypass them.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension as _, Transaction, TransactionBehavior};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{QrAuthError, Result, ResultExt as _};

pub const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta(
  k TEXT PRIMARY KEY,
  v TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products(
  id TEXT PRIMARY KEY,
  barcode TEXT UNIQUE,
  qr_code TEXT UNIQUE,
  batch_number TEXT NOT NULL,
  product_name TEXT NOT NULL,
  manufacturing_date TEXT,
  expiry_date TEXT NOT NULL,
  distribution_locations TEXT NOT NULL DEFAULT '[]',
  signed_qr_data TEXT,
  qr_signature TEXT,
  qr_generated_at TEXT
);

CREATE TABLE IF NOT EXISTS signing_keys(
  id INTEGER PRIMARY KEY,
  key_name TEXT NOT NULL,
  public_key_pem TEXT NOT NULL,
  private_key_ref TEXT NOT NULL,
  is_active INTEGER NOT NULL CHECK (is_active IN (0, 1)),
  created_at_utc TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_signing_keys_single_active
  ON signing_keys(is_active) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS scan_ledger(
  qr_id TEXT PRIMARY KEY,
  product_id TEXT,
  first_scan_time TEXT NOT NULL,
  first_scan_location TEXT,
  first_scan_device_id TEXT,
  first_scan_ip TEXT,
  last_scan_time TEXT NOT NULL,
  last_scan_location TEXT,
  last_scan_device_id TEXT,
  last_scan_ip TEXT,
  scan_count INTEGER NOT NULL CHECK (scan_count >= 1)
);

CREATE TRIGGER IF NOT EXISTS scan_ledger_first_scan_write_once
BEFORE UPDATE ON scan_ledger
WHEN NEW.qr_id IS NOT OLD.qr_id
  OR NEW.first_scan_time IS NOT OLD.first_scan_time
  OR NEW.first_scan_location IS NOT OLD.first_scan_location
  OR NEW.first_scan_device_id IS NOT OLD.first_scan_device_id
  OR NEW.first_scan_ip IS NOT OLD.first_scan_ip
  OR NEW.scan_count < OLD.scan_count
BEGIN
  SELECT RAISE(ABORT, 'scan_ledger first scan is write-once and scan_count never decreases');
END;

CREATE TRIGGER IF NOT EXISTS scan_ledger_no_delete
BEFORE DELETE ON scan_ledger
BEGIN
  SELECT RAISE(ABORT, 'scan_ledger entries are never deleted');
END;

CREATE TABLE IF NOT EXISTS scan_attempts(
  seq INTEGER PRIMARY KEY,
  attempt_id TEXT NOT NULL,
  qr_id TEXT NOT NULL,
  scan_location TEXT,
  device_id TEXT,
  ip_address TEXT,
  user_agent TEXT,
  verification_status TEXT NOT NULL,
  created_at_utc TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scan_attempts_qr_id ON scan_attempts(qr_id);

CREATE TABLE IF NOT EXISTS scan_logs(
  seq INTEGER PRIMARY KEY,
  barcode TEXT,
  qr_code TEXT,
  scan_location TEXT,
  device_fingerprint TEXT,
  ip_address TEXT,
  user_agent TEXT,
  status TEXT NOT NULL,
  security_flag TEXT NOT NULL,
  anomaly_score REAL NOT NULL,
  response_time_ms INTEGER NOT NULL,
  created_at_utc TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scan_logs_ip ON scan_logs(ip_address, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_scan_logs_device ON scan_logs(device_fingerprint, created_at_ms);

CREATE TABLE IF NOT EXISTS suspicious_activities(
  seq INTEGER PRIMARY KEY,
  device_fingerprint TEXT,
  ip_address TEXT,
  activity_type TEXT NOT NULL,
  severity TEXT NOT NULL,
  details_json TEXT NOT NULL,
  blocked INTEGER NOT NULL,
  created_at_utc TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS scan_attempts_append_only_update
BEFORE UPDATE ON scan_attempts BEGIN SELECT RAISE(ABORT, 'scan_attempts is append-only'); END;
CREATE TRIGGER IF NOT EXISTS scan_attempts_append_only_delete
BEFORE DELETE ON scan_attempts BEGIN SELECT RAISE(ABORT, 'scan_attempts is append-only'); END;
CREATE TRIGGER IF NOT EXISTS scan_logs_append_only_update
BEFORE UPDATE ON scan_logs BEGIN SELECT RAISE(ABORT, 'scan_logs is append-only'); END;
CREATE TRIGGER IF NOT EXISTS scan_logs_append_only_delete
BEFORE DELETE ON scan_logs BEGIN SELECT RAISE(ABORT, 'scan_logs is append-only'); END;
CREATE TRIGGER IF NOT EXISTS suspicious_append_only_update
BEFORE UPDATE ON suspicious_activities BEGIN SELECT RAISE(ABORT, 'suspicious_activities is append-only'); END;
CREATE TRIGGER IF NOT EXISTS suspicious_append_only_delete
BEFORE DELETE ON suspicious_activities BEGIN SELECT RAISE(ABORT, 'suspicious_activities is append-only'); END;
"#;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create (or upgrade an empty file into) a store with the current schema.
    pub fn create_new(db_path: &Path, cfg: &StoreConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ctx_storage("create db parent dir")?;
            }
        }
        let conn = Connection::open(db_path)
            .map_err(|e| QrAuthError::Storage(format!("open db {}: {e}", db_path.display())))?;
        apply_pragmas(&conn, cfg)?;
        conn.execute_batch(SCHEMA_SQL).ctx_storage("create tables")?;
        init_meta(&conn)?;
        debug!(path = %db_path.display(), "store created");
        Ok(Self { conn })
    }

    /// Open an existing store.  Fails if the schema version is unknown.
    pub fn open_existing(db_path: &Path, cfg: &StoreConfig) -> Result<Self> {
        if !db_path.exists() {
            return Err(QrAuthError::Storage(format!(
                "store {} does not exist",
                db_path.display()
            )));
        }
        let conn = Connection::open(db_path)
            .map_err(|e| QrAuthError::Storage(format!("open db {}: {e}", db_path.display())))?;
        apply_pragmas(&conn, cfg)?;
        check_schema_version(&conn)?;
        Ok(Self { conn })
    }

    /// Open an existing store, creating it when absent.
    pub fn open_or_create(db_path: &Path, cfg: &StoreConfig) -> Result<Self> {
        if db_path.exists() {
            Self::open_existing(db_path, cfg)
        } else {
            Self::create_new(db_path, cfg)
        }
    }

    /// Private in-memory store, used by unit tests and benchmarks.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().ctx_storage("open in-memory db")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .ctx_storage("apply pragmas")?;
        conn.execute_batch(SCHEMA_SQL).ctx_storage("create tables")?;
        init_meta(&conn)?;
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<i64> {
        read_schema_version(&self.conn)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction that takes the database write lock up front,
    /// so concurrent read-modify-write sequences serialize instead of
    /// failing on lock upgrade.
    pub(crate) fn immediate_tx(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .ctx_storage("begin tx")
    }
}

fn apply_pragmas(conn: &Connection, cfg: &StoreConfig) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
        .ctx_storage("set busy timeout")?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=FULL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .ctx_storage("apply pragmas")
}

fn init_meta(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO meta(k,v) VALUES (?1,?2)",
        params!["schema_version", STORE_SCHEMA_VERSION.to_string()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(k,v) VALUES (?1,?2)",
        params!["created_at_utc", crate::util::now_utc_rfc3339()],
    )?;
    check_schema_version(conn)
}

fn read_schema_version(conn: &Connection) -> Result<i64> {
    let v: Option<String> = conn
        .query_row("SELECT v FROM meta WHERE k='schema_version'", [], |row| row.get(0))
        .optional()?;
    v.ok_or_else(|| QrAuthError::Storage("store has no schema_version".into()))?
        .parse()
        .ctx_storage("parse schema_version")
}

fn check_schema_version(conn: &Connection) -> Result<()> {
    let version = read_schema_version(conn)?;
    if version != STORE_SCHEMA_VERSION {
        return Err(QrAuthError::Storage(format!(
            "unsupported schema_version {version} (expected {STORE_SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
