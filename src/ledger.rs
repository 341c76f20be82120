//! Scan ledger: atomic first-use / reuse detection keyed by payload id.
//!
//! Exactly one caller observes the first use of an id, however many
//! verify it concurrently.  The PRIMARY KEY on `qr_id` arbitrates: the
//! insert runs inside an IMMEDIATE transaction and a primary-key violation
//! falls back to incrementing the existing entry.  Any other constraint
//! failure is a storage error.

use rusqlite::{ffi, params, Connection, OptionalExtension as _, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QrAuthError, Result, ResultExt as _};
use crate::store::Store;
use crate::util;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Where and by whom a scan happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMeta {
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub time: String,
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLedgerEntry {
    pub qr_id: String,
    pub product_id: Option<String>,
    pub first_scan: ScanPoint,
    pub last_scan: ScanPoint,
    pub scan_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub is_first_use: bool,
    pub entry: ScanLedgerEntry,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Record a verified scan of `qr_id` in its own transaction.
pub fn record_or_detect(
    store: &Store,
    qr_id: &str,
    product_id: &str,
    meta: &ScanMeta,
) -> Result<LedgerOutcome> {
    let tx = store.immediate_tx()?;
    let outcome = record_or_detect_in(&tx, qr_id, product_id, meta)?;
    tx.commit().ctx_storage("commit scan ledger")?;
    Ok(outcome)
}

/// Record a verified scan using a caller-owned transaction, so the ledger
/// write and the attempt log commit together.  `conn` must be inside an
/// IMMEDIATE transaction.
pub(crate) fn record_or_detect_in(
    conn: &Connection,
    qr_id: &str,
    product_id: &str,
    meta: &ScanMeta,
) -> Result<LedgerOutcome> {
    let now = util::now_utc_rfc3339();
    let inserted = conn.execute(
        r#"
        INSERT INTO scan_ledger(
          qr_id, product_id,
          first_scan_time, first_scan_location, first_scan_device_id, first_scan_ip,
          last_scan_time, last_scan_location, last_scan_device_id, last_scan_ip,
          scan_count
        ) VALUES (?1,?2,?3,?4,?5,?6,?3,?4,?5,?6,1)
        "#,
        params![qr_id, product_id, now, meta.location, meta.device_id, meta.ip],
    );

    let is_first_use = match inserted {
        Ok(_) => true,
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
            let updated = conn
                .execute(
                    r#"
                    UPDATE scan_ledger SET
                      scan_count = scan_count + 1,
                      last_scan_time = ?2,
                      last_scan_location = ?3,
                      last_scan_device_id = ?4,
                      last_scan_ip = ?5
                    WHERE qr_id = ?1
                    "#,
                    params![qr_id, now, meta.location, meta.device_id, meta.ip],
                )
                .ctx_storage("increment scan ledger entry")?;
            if updated != 1 {
                return Err(QrAuthError::Storage(format!(
                    "scan ledger entry {qr_id} vanished during update"
                )));
            }
            false
        }
        Err(e) => return Err(QrAuthError::Storage(format!("insert scan ledger entry: {e}"))),
    };

    let entry = select_entry(conn, qr_id)?.ok_or_else(|| {
        QrAuthError::Storage(format!("scan ledger entry {qr_id} missing after write"))
    })?;
    debug!(qr_id, is_first_use, scan_count = entry.scan_count, "scan ledger recorded");
    Ok(LedgerOutcome {
        is_first_use,
        entry,
    })
}

/// Read-only lookup.
pub fn get_entry(store: &Store, qr_id: &str) -> Result<Option<ScanLedgerEntry>> {
    select_entry(store.conn(), qr_id)
}

fn select_entry(conn: &Connection, qr_id: &str) -> Result<Option<ScanLedgerEntry>> {
    conn.query_row(
        r#"
        SELECT qr_id, product_id,
               first_scan_time, first_scan_location, first_scan_device_id, first_scan_ip,
               last_scan_time, last_scan_location, last_scan_device_id, last_scan_ip,
               scan_count
        FROM scan_ledger WHERE qr_id = ?1
        "#,
        params![qr_id],
        entry_from_row,
    )
    .optional()
    .ctx_storage("select scan ledger entry")
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ScanLedgerEntry> {
    Ok(ScanLedgerEntry {
        qr_id: row.get(0)?,
        product_id: row.get(1)?,
        first_scan: ScanPoint {
            time: row.get(2)?,
            location: row.get(3)?,
            device_id: row.get(4)?,
            ip: row.get(5)?,
        },
        last_scan: ScanPoint {
            time: row.get(6)?,
            location: row.get(7)?,
            device_id: row.get(8)?,
            ip: row.get(9)?,
        },
        scan_count: row.get(10)?,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
