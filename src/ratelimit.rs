//! Sliding-window rate limiting for the legacy verification path.
//!
//! Attempts are counted from the legacy scan log, matching the caller's IP
//! OR device fingerprint over the trailing window.  Counts are read-then-act
//! and therefore approximate under heavy concurrency.

use serde_json::json;
use tracing::warn;

use crate::audit::{self, ActivityType, Severity, SuspiciousActivity};
use crate::config::RiskConfig;
use crate::error::{QrAuthError, Result};
use crate::store::Store;
use crate::util;

/// Who is calling.  Either identifier may be unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerIdentity<'a> {
    pub ip_address: Option<&'a str>,
    pub device_fingerprint: Option<&'a str>,
}

/// Count the caller's attempts in the trailing window, the current one
/// included.  At or above the hard limit the request is rejected and a single
/// blocked suspicious-activity record is written for it.
pub fn check(store: &Store, cfg: &RiskConfig, caller: CallerIdentity<'_>) -> Result<u64> {
    let window_ms = i64::try_from(cfg.window_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let since_ms = util::unix_ms(util::now_utc()).saturating_sub(window_ms);
    let recent = audit::count_recent_scans(
        store,
        caller.ip_address,
        caller.device_fingerprint,
        since_ms,
    )? + 1;

    if recent >= cfg.hard_limit {
        let rec = SuspiciousActivity {
            device_fingerprint: caller.device_fingerprint.map(str::to_string),
            ip_address: caller.ip_address.map(str::to_string),
            activity_type: ActivityType::RateLimitExceeded,
            severity: Severity::High,
            details: json!({
                "recent_attempts": recent,
                "window_secs": cfg.window_secs,
                "hard_limit": cfg.hard_limit,
            }),
            blocked: true,
        };
        if let Err(e) = audit::append_suspicious_activity(store.conn(), &rec) {
            warn!(error = %e, "failed to record rate-limit violation (non-fatal)");
        }
        warn!(
            recent_attempts = recent,
            ip = caller.ip_address.unwrap_or("-"),
            "rate limit exceeded"
        );
        return Err(QrAuthError::RateLimited(format!(
            "{recent} attempts in the last {}s",
            cfg.window_secs
        )));
    }
    Ok(recent)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
