//! Append-only audit logs: signed-path scan attempts, legacy scan logs and
//! suspicious-activity records.
//!
//! Rows are only ever inserted; store triggers reject updates and deletes.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, ResultExt as _};
use crate::store::Store;
use crate::util;

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Final status of a signed verification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    FirstUse,
    Reused,
    SignatureInvalid,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstUse => "first_use",
            Self::Reused => "reused",
            Self::SignatureInvalid => "signature_invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    RateLimitExceeded,
    LocationMismatch,
}

impl ActivityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::LocationMismatch => "location_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

// ---------------------------------------------------------------------------
// Scan attempts (signed path)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAttempt {
    pub attempt_id: Uuid,
    pub qr_id: String,
    pub scan_location: Option<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// `first_use`, `reused` or `signature_invalid`.
    pub verification_status: String,
    pub created_at_utc: String,
}

impl ScanAttempt {
    pub fn new(
        qr_id: &str,
        status: ScanStatus,
        scan_location: Option<&str>,
        device_id: Option<&str>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            qr_id: qr_id.to_string(),
            scan_location: scan_location.map(str::to_string),
            device_id: device_id.map(str::to_string),
            ip_address: ip_address.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            verification_status: status.as_str().to_string(),
            created_at_utc: util::now_utc_rfc3339(),
        }
    }
}

pub(crate) fn append_scan_attempt(conn: &Connection, attempt: &ScanAttempt) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO scan_attempts(
          attempt_id, qr_id, scan_location, device_id, ip_address, user_agent,
          verification_status, created_at_utc, created_at_ms
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
        "#,
        params![
            attempt.attempt_id.to_string(),
            attempt.qr_id,
            attempt.scan_location,
            attempt.device_id,
            attempt.ip_address,
            attempt.user_agent,
            attempt.verification_status,
            attempt.created_at_utc,
            util::unix_ms(util::now_utc()),
        ],
    )
    .ctx_storage("insert scan attempt")?;
    Ok(())
}

/// Attempts recorded for one payload id, oldest first.
pub fn list_scan_attempts(store: &Store, qr_id: &str) -> Result<Vec<ScanAttempt>> {
    let mut stmt = store
        .conn()
        .prepare(
            r#"
            SELECT attempt_id, qr_id, scan_location, device_id, ip_address, user_agent,
                   verification_status, created_at_utc
            FROM scan_attempts WHERE qr_id = ?1 ORDER BY seq ASC
            "#,
        )
        .ctx_storage("prepare select scan attempts")?;
    let rows = stmt
        .query_map(params![qr_id], attempt_from_row)
        .ctx_storage("query scan attempts")?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<ScanAttempt> {
    let attempt_id: String = row.get(0)?;
    Ok(ScanAttempt {
        attempt_id: Uuid::parse_str(&attempt_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        qr_id: row.get(1)?,
        scan_location: row.get(2)?,
        device_id: row.get(3)?,
        ip_address: row.get(4)?,
        user_agent: row.get(5)?,
        verification_status: row.get(6)?,
        created_at_utc: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Legacy scan logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyScanLog {
    pub barcode: Option<String>,
    pub qr_code: Option<String>,
    pub scan_location: Option<String>,
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub security_flag: String,
    pub anomaly_score: f64,
    pub response_time_ms: u64,
}

pub(crate) fn append_scan_log(conn: &Connection, log: &LegacyScanLog) -> Result<()> {
    let now = util::now_utc();
    conn.execute(
        r#"
        INSERT INTO scan_logs(
          barcode, qr_code, scan_location, device_fingerprint, ip_address, user_agent,
          status, security_flag, anomaly_score, response_time_ms, created_at_utc, created_at_ms
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
        "#,
        params![
            log.barcode,
            log.qr_code,
            log.scan_location,
            log.device_fingerprint,
            log.ip_address,
            log.user_agent,
            log.status,
            log.security_flag,
            log.anomaly_score,
            i64::try_from(log.response_time_ms).unwrap_or(i64::MAX),
            util::rfc3339(now),
            util::unix_ms(now),
        ],
    )
    .ctx_storage("insert scan log")?;
    Ok(())
}

/// Legacy scan logs at or after `since_ms` whose IP or device fingerprint
/// matches.  Absent identifiers match nothing.
pub fn count_recent_scans(
    store: &Store,
    ip_address: Option<&str>,
    device_fingerprint: Option<&str>,
    since_ms: i64,
) -> Result<u64> {
    let n: i64 = store
        .conn()
        .query_row(
            r#"
            SELECT COUNT(*) FROM scan_logs
            WHERE created_at_ms >= ?1
              AND ((?2 IS NOT NULL AND ip_address = ?2)
                OR (?3 IS NOT NULL AND device_fingerprint = ?3))
            "#,
            params![since_ms, ip_address, device_fingerprint],
            |row| row.get(0),
        )
        .ctx_storage("count recent scans")?;
    Ok(u64::try_from(n).unwrap_or(0))
}

pub fn list_scan_logs(store: &Store) -> Result<Vec<LegacyScanLog>> {
    let mut stmt = store
        .conn()
        .prepare(
            r#"
            SELECT barcode, qr_code, scan_location, device_fingerprint, ip_address, user_agent,
                   status, security_flag, anomaly_score, response_time_ms
            FROM scan_logs ORDER BY seq ASC
            "#,
        )
        .ctx_storage("prepare select scan logs")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(LegacyScanLog {
                barcode: row.get(0)?,
                qr_code: row.get(1)?,
                scan_location: row.get(2)?,
                device_fingerprint: row.get(3)?,
                ip_address: row.get(4)?,
                user_agent: row.get(5)?,
                status: row.get(6)?,
                security_flag: row.get(7)?,
                anomaly_score: row.get(8)?,
                response_time_ms: u64::try_from(row.get::<_, i64>(9)?).unwrap_or(0),
            })
        })
        .ctx_storage("query scan logs")?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Suspicious activity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub activity_type: ActivityType,
    pub severity: Severity,
    pub details: Value,
    pub blocked: bool,
}

pub(crate) fn append_suspicious_activity(conn: &Connection, rec: &SuspiciousActivity) -> Result<()> {
    let now = util::now_utc();
    let details = serde_json::to_string(&rec.details).ctx_storage("encode details")?;
    conn.execute(
        r#"
        INSERT INTO suspicious_activities(
          device_fingerprint, ip_address, activity_type, severity, details_json,
          blocked, created_at_utc, created_at_ms
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
        "#,
        params![
            rec.device_fingerprint,
            rec.ip_address,
            rec.activity_type.as_str(),
            rec.severity.as_str(),
            details,
            rec.blocked,
            util::rfc3339(now),
            util::unix_ms(now),
        ],
    )
    .ctx_storage("insert suspicious activity")?;
    Ok(())
}

pub fn list_suspicious_activities(store: &Store) -> Result<Vec<SuspiciousActivity>> {
    let mut stmt = store
        .conn()
        .prepare(
            r#"
            SELECT device_fingerprint, ip_address, activity_type, severity, details_json, blocked
            FROM suspicious_activities ORDER BY seq ASC
            "#,
        )
        .ctx_storage("prepare select suspicious activities")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })
        .ctx_storage("query suspicious activities")?;

    let mut out = Vec::new();
    for row in rows {
        let (device_fingerprint, ip_address, activity_type, severity, details, blocked) = row?;
        out.push(SuspiciousActivity {
            device_fingerprint,
            ip_address,
            activity_type: serde_json::from_value(Value::String(activity_type))
                .ctx_storage("parse activity_type")?,
            severity: serde_json::from_value(Value::String(severity)).ctx_storage("parse severity")?,
            details: serde_json::from_str(&details).ctx_storage("parse details_json")?,
            blocked,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
