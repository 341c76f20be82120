//! Request / response shapes for the issuance and verification endpoints,
//! and handlers that map library results onto them.
//!
//! Transports (CLI, FFI, an HTTP layer) deserialize a request, call one
//! handler and serialize whatever comes back.  Verification handlers never
//! return an error to the transport: infrastructure faults become an
//! `error` status (signed path) or an [`ErrorBody`] (legacy path).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::error::{QrAuthError, Result};
use crate::keys::KeyProvider;
use crate::legacy::{self, LegacyVerifyRequest, LegacyVerifyResponse};
use crate::payload::{self, QrData, ScannedPayload};
use crate::risk::RiskEngine;
use crate::signing;
use crate::store::Store;
use crate::verify::{self, ScanContext, VerificationOutcome};

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub product_id: String,
    #[serde(default)]
    pub batch_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueResponse {
    /// `{data, sig}` JSON, ready to encode into a QR symbol.
    pub qr_payload: String,
    pub qr_data: QrData,
    pub signature: String,
}

pub fn handle_issue(store: &Store, keys: &dyn KeyProvider, req: &IssueRequest) -> Result<IssueResponse> {
    let payload = signing::issue(store, keys, &req.product_id, req.batch_number.as_deref())?;
    Ok(IssueResponse {
        qr_payload: payload.to_qr_string()?,
        qr_data: payload.data,
        signature: payload.signature,
    })
}

// ---------------------------------------------------------------------------
// Verify (signed)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Kept as raw JSON so schema violations surface as malformed input
    /// rather than a transport-level parse failure.
    pub qr_data: Value,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl VerifyRequest {
    pub fn scan_context(&self) -> ScanContext {
        ScanContext {
            device_id: self.device_id.clone(),
            location: self.location.clone(),
            user_agent: self.user_agent.clone(),
            ip_address: self.ip_address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyResponse {
    FirstUse,
    #[serde(rename_all = "camelCase")]
    Reused {
        first_scan_time: String,
        first_scan_location: Option<String>,
        scan_count: i64,
        message: String,
    },
    SignatureInvalid {
        message: String,
    },
    Error {
        message: String,
    },
}

impl VerifyResponse {
    pub fn status(&self) -> &'static str {
        match self {
            Self::FirstUse => "first_use",
            Self::Reused { .. } => "reused",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::Error { .. } => "error",
        }
    }
}

impl From<VerificationOutcome> for VerifyResponse {
    fn from(outcome: VerificationOutcome) -> Self {
        match outcome {
            VerificationOutcome::FirstUse { .. } => Self::FirstUse,
            VerificationOutcome::Reused { entry } => Self::Reused {
                message: verify::reused_message(&entry),
                first_scan_time: entry.first_scan.time,
                first_scan_location: entry.first_scan.location,
                scan_count: entry.scan_count,
            },
            VerificationOutcome::SignatureInvalid => Self::SignatureInvalid {
                message: "Invalid or tampered QR code signature".into(),
            },
        }
    }
}

fn error_response(e: &QrAuthError) -> VerifyResponse {
    error!(error = %e, kind = e.kind().as_str(), "verification failed");
    VerifyResponse::Error {
        message: format!("Verification failed: {e}"),
    }
}

pub fn handle_verify(store: &Store, keys: &dyn KeyProvider, req: &VerifyRequest) -> VerifyResponse {
    let outcome = ScannedPayload::from_parts(&req.qr_data, req.signature.as_deref())
        .and_then(|scanned| verify::verify_scanned(store, keys, &scanned, &req.scan_context()));
    match outcome {
        Ok(outcome) => outcome.into(),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// Client-side companion
// ---------------------------------------------------------------------------

/// What the payload claims about the product, shown next to a successful
/// verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedProduct {
    pub id: String,
    pub name: String,
    pub batch: String,
    pub expiry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrVerificationResult {
    #[serde(flatten)]
    pub response: VerifyResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_details: Option<ScannedProduct>,
}

impl QrVerificationResult {
    /// Attach product details for `first_use` / `reused` outcomes only.
    pub fn new(response: VerifyResponse, data: &QrData) -> Self {
        let product_details = matches!(response, VerifyResponse::FirstUse | VerifyResponse::Reused { .. })
            .then(|| ScannedProduct {
                id: data.id.clone(),
                name: data.name.clone(),
                batch: data.batch.clone(),
                expiry: data.exp.clone(),
            });
        Self {
            response,
            product_details,
        }
    }
}

/// Verify the raw text read from a QR symbol.
pub fn verify_scanned_text(
    store: &Store,
    keys: &dyn KeyProvider,
    text: &str,
    ctx: &ScanContext,
) -> QrVerificationResult {
    let scanned = match payload::parse_scanned_text(text) {
        Ok(s) => s,
        Err(e) => {
            return QrVerificationResult {
                response: error_response(&e),
                product_details: None,
            }
        }
    };
    let response = match verify::verify_scanned(store, keys, &scanned, ctx) {
        Ok(outcome) => outcome.into(),
        Err(e) => error_response(&e),
    };
    match scanned.typed() {
        Ok(payload) => QrVerificationResult::new(response, &payload.data),
        Err(_) => QrVerificationResult {
            response,
            product_details: None,
        },
    }
}

// ---------------------------------------------------------------------------
// Verify (legacy)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

impl From<&QrAuthError> for ErrorBody {
    fn from(e: &QrAuthError) -> Self {
        Self {
            error: e.to_string(),
            kind: e.kind().as_str().to_string(),
        }
    }
}

pub fn handle_verify_legacy(
    store: &Store,
    engine: &RiskEngine,
    req: &LegacyVerifyRequest,
) -> std::result::Result<LegacyVerifyResponse, ErrorBody> {
    legacy::verify_legacy(store, engine, req).map_err(|e| {
        error!(error = %e, kind = e.kind().as_str(), "legacy verification failed");
        ErrorBody::from(&e)
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{PrivateKeySource, StoreKeyProvider};
    use crate::testutil;
    use serde_json::json;

    #[test]
    fn response_wire_shapes() {
        assert_eq!(
            serde_json::to_value(VerifyResponse::FirstUse).unwrap(),
            json!({"status": "first_use"})
        );
        let reused = VerifyResponse::Reused {
            first_scan_time: "2025-01-15T10:00:00Z".into(),
            first_scan_location: Some("Mumbai".into()),
            scan_count: 2,
            message: "m".into(),
        };
        assert_eq!(
            serde_json::to_value(&reused).unwrap(),
            json!({
                "status": "reused",
                "firstScanTime": "2025-01-15T10:00:00Z",
                "firstScanLocation": "Mumbai",
                "scanCount": 2,
                "message": "m"
            })
        );
        let back: VerifyResponse = serde_json::from_value(json!({
            "status": "signature_invalid", "message": "x"
        }))
        .unwrap();
        assert_eq!(back.status(), "signature_invalid");
    }

    #[test]
    fn issue_then_verify_over_the_wire_types() {
        let (store, pem) = testutil::keyed_store_with_demo_product();
        let issuer = StoreKeyProvider::with_private_key(&store, PrivateKeySource::Pem(pem));
        let issued = handle_issue(
            &store,
            &issuer,
            &IssueRequest {
                product_id: "demo-product-uuid".into(),
                batch_number: Some("B1".into()),
            },
        )
        .unwrap();

        let req: VerifyRequest = serde_json::from_value(json!({
            "qrData": issued.qr_data,
            "signature": issued.signature,
            "deviceId": "dev-1",
            "location": "Mumbai"
        }))
        .unwrap();
        let verifier = StoreKeyProvider::public_only(&store);
        assert_eq!(handle_verify(&store, &verifier, &req), VerifyResponse::FirstUse);
        match handle_verify(&store, &verifier, &req) {
            VerifyResponse::Reused {
                scan_count,
                first_scan_location,
                ..
            } => {
                assert_eq!(scan_count, 2);
                assert_eq!(first_scan_location.as_deref(), Some("Mumbai"));
            }
            other => panic!("expected reused, got {other:?}"),
        }

        let scanned = verify_scanned_text(
            &store,
            &verifier,
            &issued.qr_payload,
            &ScanContext {
                device_id: "dev-2".into(),
                ..ScanContext::default()
            },
        );
        assert_eq!(scanned.response.status(), "reused");
        assert_eq!(scanned.product_details.unwrap().batch, "B1");
    }

    #[test]
    fn malformed_request_is_error_status() {
        let store = Store::open_in_memory().unwrap();
        let req: VerifyRequest = serde_json::from_value(json!({
            "qrData": {"productId": "p"},
            "signature": "c2ln",
            "deviceId": "dev-1"
        }))
        .unwrap();
        let resp = handle_verify(&store, &StoreKeyProvider::public_only(&store), &req);
        match resp {
            VerifyResponse::Error { message } => assert!(message.starts_with("Verification failed:")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_scan_has_no_product_details() {
        let store = Store::open_in_memory().unwrap();
        let r = verify_scanned_text(
            &store,
            &StoreKeyProvider::public_only(&store),
            "FIN123456789",
            &ScanContext::default(),
        );
        assert_eq!(r.response.status(), "error");
        assert!(r.product_details.is_none());
    }

    #[test]
    fn legacy_errors_become_error_bodies() {
        let store = Store::open_in_memory().unwrap();
        let engine = RiskEngine::new(&crate::config::RiskConfig::default()).unwrap();
        let body = handle_verify_legacy(&store, &engine, &LegacyVerifyRequest::default()).unwrap_err();
        assert_eq!(body.kind, "malformed_input");
        assert!(body.error.contains("CAPTCHA"));
    }
}
