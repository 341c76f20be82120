mod common;

use anyhow::Result;

use qrauth_core::{
    api,
    audit::{self, ActivityType, Severity},
    config::RiskConfig,
    error::QrAuthError,
    legacy::{self, LegacyStatus, LegacyVerifyRequest, TimestampData, UserConsents},
    risk::{RiskEngine, RiskSignals, SecurityFlag},
};

fn engine() -> Result<RiskEngine> {
    Ok(RiskEngine::new(&RiskConfig::default())?)
}

fn request(barcode: &str, ip: &str) -> LegacyVerifyRequest {
    LegacyVerifyRequest {
        barcode: Some(barcode.into()),
        captcha_token: Some("captcha-ok".into()),
        user_consents: Some(UserConsents {
            basic_verification: true,
            ..UserConsents::default()
        }),
        ip_address: Some(ip.into()),
        timestamp_data: Some(TimestampData {
            total_duration: Some(9_000),
            ..TimestampData::default()
        }),
        ..LegacyVerifyRequest::default()
    }
}

#[test]
fn tenth_attempt_in_window_is_blocked_once() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let engine = engine()?;

    for i in 1..=9 {
        let resp = legacy::verify_legacy(&store, &engine, &request("FIN123456789", "198.51.100.4"))?;
        assert_eq!(resp.status, LegacyStatus::Genuine, "attempt {i}");
    }
    let err = legacy::verify_legacy(&store, &engine, &request("FIN123456789", "198.51.100.4")).unwrap_err();
    assert!(matches!(err, QrAuthError::RateLimited(_)));

    let recs = audit::list_suspicious_activities(&store)?;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].activity_type, ActivityType::RateLimitExceeded);
    assert_eq!(recs[0].severity, Severity::High);
    assert!(recs[0].blocked);
    // Rejected attempts are not logged as scans.
    assert_eq!(audit::list_scan_logs(&store)?.len(), 9);

    // A different caller is unaffected.
    let other = legacy::verify_legacy(&store, &engine, &request("FIN123456789", "198.51.100.5"))?;
    assert_eq!(other.security_flag, SecurityFlag::LowRisk);
    Ok(())
}

#[test]
fn soft_limit_raises_the_score() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let engine = engine()?;

    let mut last = None;
    for _ in 0..6 {
        last = Some(legacy::verify_legacy(&store, &engine, &request("FIN123456789", "192.0.2.9"))?);
    }
    let resp = last.expect("at least one response");
    assert_eq!(resp.anomaly_score, 0.3);
    assert_eq!(resp.security_flag, SecurityFlag::LowRisk);
    Ok(())
}

#[test]
fn assessment_is_deterministic() -> Result<()> {
    let engine = engine()?;
    let signals = RiskSignals {
        recent_scans: 6,
        scan_duration_ms: Some(3_000),
        user_agent: Some("Googlebot/2.1".into()),
        geolocation_accuracy_m: Some(1_500.0),
        location_consistent: Some(true),
        product_found: true,
    };
    let a = engine.assess(&signals);
    let b = engine.assess(&signals);
    assert_eq!(a, b);
    assert_eq!(a.anomaly_score, 1.1);
    assert_eq!(a.security_flag, SecurityFlag::HighRisk);
    Ok(())
}

#[test]
fn qr_code_lookup_and_unknown_codes() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let engine = engine()?;

    let mut req = request("UNKNOWN-0001", "203.0.113.50");
    let resp = legacy::verify_legacy(&store, &engine, &req)?;
    assert_eq!(resp.status, LegacyStatus::Unverified);
    assert!(resp.product_details.is_none());
    assert!(resp.security_flag >= SecurityFlag::MediumRisk);

    req.barcode = None;
    req.qr_code = Some("FIN123456789".into());
    let resp = legacy::verify_legacy(&store, &engine, &req)?;
    assert_eq!(resp.status, LegacyStatus::Unverified);

    let logs = audit::list_scan_logs(&store)?;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].qr_code.as_deref(), Some("FIN123456789"));
    assert_eq!(logs[1].status, "unverified");
    Ok(())
}

#[test]
fn bot_user_agent_from_transport_is_scored() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let mut req = request("FIN123456789", "203.0.113.60");
    req.user_agent = Some("curl-bot/1.0".into());
    let resp = legacy::verify_legacy(&store, &engine()?, &req)?;
    assert_eq!(resp.status, LegacyStatus::Genuine);
    assert_eq!(resp.anomaly_score, 0.5);
    assert_eq!(resp.security_flag, SecurityFlag::MediumRisk);
    Ok(())
}

#[test]
fn wire_shape_of_legacy_exchange() -> Result<()> {
    let fx = common::fixture()?;
    let store = fx.open()?;
    let req: LegacyVerifyRequest = serde_json::from_value(serde_json::json!({
        "barcode": "FIN123456789",
        "scan_location": "Pune",
        "captcha_token": "captcha-ok",
        "user_consents": {"basicVerification": true, "locationAccess": true},
        "timestamp_data": {"scan_initiated": 1_000, "scan_completed": 8_000},
        "ip_address": "203.0.113.70"
    }))?;
    let resp = api::handle_verify_legacy(&store, &engine()?, &req)
        .map_err(|b| anyhow::anyhow!("{}: {}", b.kind, b.error))?;
    let v = serde_json::to_value(&resp)?;
    assert_eq!(v["status"], "genuine");
    assert_eq!(v["security_flag"], "low_risk");
    assert_eq!(v["anomaly_score"], 0.0);
    assert_eq!(v["product_details"]["name"], "Finolex PVC Pipe 4 inch");
    assert_eq!(v["product_details"]["batch_no"], "B2024-001");
    Ok(())
}
