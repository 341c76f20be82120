//! Legacy verification of printed barcodes / plain QR codes.
//!
//! No signature is involved: the code is looked up in the catalog and the
//! request is gated by the rate limiter and scored by the risk engine.
//! Every accepted request leaves one row in the legacy scan log.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{self, ActivityType, LegacyScanLog, Severity, SuspiciousActivity};
use crate::catalog::{self, ProductCode, ProductRecord};
use crate::error::{QrAuthError, Result};
use crate::ratelimit::{self, CallerIdentity};
use crate::risk::{RiskEngine, RiskSignals, SecurityFlag};
use crate::store::Store;
use crate::util;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyVerifyRequest {
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub qr_code: Option<String>,
    #[serde(default)]
    pub scan_location: Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    /// Opaque token from the CAPTCHA provider, checked upstream.
    #[serde(default)]
    pub captcha_token: Option<String>,
    #[serde(default)]
    pub user_consents: Option<UserConsents>,
    #[serde(default)]
    pub timestamp_data: Option<TimestampData>,
    #[serde(default)]
    pub browser_info: Option<BrowserInfo>,
    #[serde(default)]
    pub geolocation_accuracy: Option<f64>,
    /// Transport-provided caller address.
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Transport-provided user agent header.
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserConsents {
    pub basic_verification: bool,
    pub location_access: bool,
    pub camera_snapshot: bool,
    pub device_info: bool,
    pub timestamp_logging: bool,
}

/// Client-side milestones, Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampData {
    pub scan_initiated: Option<u64>,
    pub captcha_completed: Option<u64>,
    pub camera_ready: Option<u64>,
    pub scan_completed: Option<u64>,
    pub total_duration: Option<u64>,
}

impl TimestampData {
    pub fn duration_ms(&self) -> Option<u64> {
        self.total_duration.or_else(|| {
            self.scan_completed?.checked_sub(self.scan_initiated?)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserInfo {
    pub user_agent: Option<String>,
    pub language: Option<String>,
    pub platform: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyStatus {
    Genuine,
    /// Reserved: a code absent from the catalog is reported as `unverified`.
    Counterfeit,
    Unverified,
}

impl LegacyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Genuine => "genuine",
            Self::Counterfeit => "counterfeit",
            Self::Unverified => "unverified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: String,
    pub batch_no: String,
    pub mfg_date: Option<String>,
    pub expiry: String,
}

impl From<&ProductRecord> for ProductDetails {
    fn from(p: &ProductRecord) -> Self {
        Self {
            name: p.product_name.clone(),
            batch_no: p.batch_number.clone(),
            mfg_date: p.manufacturing_date.clone(),
            expiry: p.expiry_date.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyVerifyResponse {
    pub status: LegacyStatus,
    pub product_details: Option<ProductDetails>,
    pub security_flag: SecurityFlag,
    pub response_time_ms: u64,
    pub anomaly_score: f64,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// `true` when the scan location matches one of the distribution regions
/// (case-insensitive substring, either direction).
pub fn location_matches(scan_location: &str, regions: &[String]) -> bool {
    let scan = scan_location.to_lowercase();
    regions.iter().any(|r| {
        let r = r.to_lowercase();
        r.contains(&scan) || scan.contains(&r)
    })
}

pub fn verify_legacy(
    store: &Store,
    engine: &RiskEngine,
    req: &LegacyVerifyRequest,
) -> Result<LegacyVerifyResponse> {
    let started = Instant::now();

    if non_empty(&req.captcha_token).is_none() {
        return Err(QrAuthError::MalformedInput("CAPTCHA verification required".into()));
    }
    let consents = match req.user_consents {
        Some(c) if c.basic_verification => c,
        _ => return Err(QrAuthError::MalformedInput("user consent is required".into())),
    };
    let barcode = non_empty(&req.barcode);
    let qr_code = non_empty(&req.qr_code);
    let code = match (barcode, qr_code) {
        (Some(b), _) => {
            util::validate_code(b, "barcode")?;
            ProductCode::Barcode(b)
        }
        (None, Some(q)) => {
            util::validate_code(q, "qr_code")?;
            ProductCode::QrCode(q)
        }
        (None, None) => {
            return Err(QrAuthError::MalformedInput(
                "either barcode or qr_code is required".into(),
            ))
        }
    };
    let device = non_empty(&req.device_fingerprint);
    let ip = non_empty(&req.ip_address);
    let scan_location = non_empty(&req.scan_location);

    let recent_scans = ratelimit::check(
        store,
        engine.config(),
        CallerIdentity {
            ip_address: ip,
            device_fingerprint: device,
        },
    )?;

    let product = catalog::find_by_code(store, code)?;

    let location_consistent = match (&product, scan_location) {
        (Some(p), Some(loc)) if consents.location_access && !p.distribution_locations.is_empty() => {
            Some(location_matches(loc, &p.distribution_locations))
        }
        _ => None,
    };
    let bot_ua = req
        .browser_info
        .as_ref()
        .and_then(|b| b.user_agent.clone())
        .or_else(|| req.user_agent.clone());

    let assessment = engine.assess(&RiskSignals {
        recent_scans,
        scan_duration_ms: req.timestamp_data.and_then(|t| t.duration_ms()),
        user_agent: bot_ua,
        geolocation_accuracy_m: req.geolocation_accuracy,
        location_consistent,
        product_found: product.is_some(),
    });

    if let (Some(p), Some(false)) = (&product, location_consistent) {
        let rec = SuspiciousActivity {
            device_fingerprint: device.map(str::to_string),
            ip_address: ip.map(str::to_string),
            activity_type: ActivityType::LocationMismatch,
            severity: Severity::Medium,
            details: json!({
                "scan_location": scan_location,
                "valid_locations": p.distribution_locations,
                "product_id": p.id,
                "anomaly_score": assessment.anomaly_score,
            }),
            blocked: false,
        };
        if let Err(e) = audit::append_suspicious_activity(store.conn(), &rec) {
            warn!(error = %e, "failed to record location mismatch (non-fatal)");
        }
    }

    let status = if product.is_some() {
        LegacyStatus::Genuine
    } else {
        debug!("code not found in catalog");
        LegacyStatus::Unverified
    };
    let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    audit::append_scan_log(
        store.conn(),
        &LegacyScanLog {
            barcode: barcode.map(str::to_string),
            qr_code: qr_code.map(str::to_string),
            scan_location: scan_location.map(str::to_string),
            device_fingerprint: device.map(str::to_string),
            ip_address: ip.map(str::to_string),
            user_agent: req.user_agent.clone(),
            status: status.as_str().to_string(),
            security_flag: assessment.security_flag.as_str().to_string(),
            anomaly_score: assessment.anomaly_score,
            response_time_ms,
        },
    )?;

    info!(
        status = status.as_str(),
        security_flag = assessment.security_flag.as_str(),
        anomaly_score = assessment.anomaly_score,
        recent_scans,
        response_time_ms,
        "legacy verification"
    );
    Ok(LegacyVerifyResponse {
        status,
        product_details: product.as_ref().map(ProductDetails::from),
        security_flag: assessment.security_flag,
        response_time_ms,
        anomaly_score: assessment.anomaly_score,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::testutil;

    fn engine() -> RiskEngine {
        RiskEngine::new(&RiskConfig::default()).unwrap()
    }

    fn consents() -> UserConsents {
        UserConsents {
            basic_verification: true,
            location_access: true,
            ..UserConsents::default()
        }
    }

    fn request(barcode: &str) -> LegacyVerifyRequest {
        LegacyVerifyRequest {
            barcode: Some(barcode.into()),
            captcha_token: Some("tok".into()),
            user_consents: Some(consents()),
            device_fingerprint: Some("dev-a".into()),
            ip_address: Some("10.0.0.1".into()),
            timestamp_data: Some(TimestampData {
                total_duration: Some(12_000),
                ..TimestampData::default()
            }),
            ..LegacyVerifyRequest::default()
        }
    }

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        catalog::upsert_product(&store, &testutil::demo_product()).unwrap();
        store
    }

    #[test]
    fn known_barcode_is_genuine() {
        let store = store();
        let resp = verify_legacy(&store, &engine(), &request("FIN123456789")).unwrap();
        assert_eq!(resp.status, LegacyStatus::Genuine);
        assert_eq!(resp.security_flag, SecurityFlag::LowRisk);
        let details = resp.product_details.unwrap();
        assert_eq!(details.batch_no, "B2024-001");
        assert_eq!(details.expiry, "2026-01-15");
        assert_eq!(audit::list_scan_logs(&store).unwrap().len(), 1);
    }

    #[test]
    fn unknown_code_is_unverified_medium_risk() {
        let store = store();
        let resp = verify_legacy(&store, &engine(), &request("NOPE-1")).unwrap();
        assert_eq!(resp.status, LegacyStatus::Unverified);
        assert_eq!(resp.security_flag, SecurityFlag::MediumRisk);
        assert_eq!(resp.anomaly_score, 0.2);
        assert!(resp.product_details.is_none());
    }

    #[test]
    fn missing_captcha_or_consent_fails_before_any_write() {
        let store = store();
        let mut req = request("FIN123456789");
        req.captcha_token = Some(String::new());
        assert!(matches!(
            verify_legacy(&store, &engine(), &req),
            Err(QrAuthError::MalformedInput(_))
        ));

        let mut req = request("FIN123456789");
        req.user_consents = None;
        assert!(verify_legacy(&store, &engine(), &req).is_err());

        let mut req = request("FIN123456789");
        req.barcode = None;
        assert!(verify_legacy(&store, &engine(), &req).is_err());

        assert!(audit::list_scan_logs(&store).unwrap().is_empty());
    }

    #[test]
    fn location_outside_distribution_is_high_risk() {
        let store = store();
        let mut req = request("FIN123456789");
        req.scan_location = Some("Kolkata".into());
        let resp = verify_legacy(&store, &engine(), &req).unwrap();
        assert_eq!(resp.status, LegacyStatus::Genuine);
        assert_eq!(resp.security_flag, SecurityFlag::HighRisk);
        assert_eq!(resp.anomaly_score, 0.3);

        let recs = audit::list_suspicious_activities(&store).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].activity_type, ActivityType::LocationMismatch);
        assert!(!recs[0].blocked);

        // Without location consent the check is skipped.
        req.user_consents = Some(UserConsents {
            location_access: false,
            ..consents()
        });
        let resp = verify_legacy(&store, &engine(), &req).unwrap();
        assert_eq!(resp.security_flag, SecurityFlag::LowRisk);
    }

    #[test]
    fn declined_basic_consent_is_rejected_before_store_access() {
        let store = store();
        let mut req = request("FIN123456789");
        req.user_consents = Some(UserConsents {
            basic_verification: false,
            ..consents()
        });
        // Past the hard limit: none of these reach the rate limiter.
        for _ in 0..12 {
            let err = verify_legacy(&store, &engine(), &req).unwrap_err();
            assert!(matches!(err, QrAuthError::MalformedInput(_)), "{err}");
        }
        assert!(audit::list_scan_logs(&store).unwrap().is_empty());
        assert!(audit::list_suspicious_activities(&store).unwrap().is_empty());
    }

    #[test]
    fn product_without_regions_skips_location_check() {
        let store = store();
        let mut p = testutil::demo_product();
        p.distribution_locations.clear();
        catalog::upsert_product(&store, &p).unwrap();

        let mut req = request("FIN123456789");
        req.scan_location = Some("Kolkata".into());
        let resp = verify_legacy(&store, &engine(), &req).unwrap();
        assert_eq!(resp.status, LegacyStatus::Genuine);
        assert_eq!(resp.security_flag, SecurityFlag::LowRisk);
        assert!(audit::list_suspicious_activities(&store).unwrap().is_empty());
    }

    #[test]
    fn location_match_is_substring_either_way() {
        let regions = vec!["Mumbai".to_string(), "Pune".to_string()];
        assert!(location_matches("mumbai, maharashtra", &regions));
        assert!(location_matches("PUN", &regions));
        assert!(!location_matches("Delhi", &regions));
    }

    #[test]
    fn duration_falls_back_to_milestones() {
        let t = TimestampData {
            scan_initiated: Some(1_000),
            scan_completed: Some(3_500),
            ..TimestampData::default()
        };
        assert_eq!(t.duration_ms(), Some(2_500));
        assert_eq!(TimestampData::default().duration_ms(), None);
    }
}
