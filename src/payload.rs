//! Signed QR wire payload and its canonical byte form.
//!
//! The signature covers the compact JSON serialization of [`QrData`] with
//! fields in exactly this order: `id, productId, batch, name, ts, exp`.  The
//! struct field order below *is* that contract; reordering the fields breaks
//! every code already printed.
//!
//! Scanned content is untrusted.  [`ScannedPayload`] checks only what
//! verification needs (`data.id`, `data.ts`, a signature); everything else in
//! `data` is judged by the signature.  [`parse_qr_payload`] and
//! [`SignedPayload::from_parts`] additionally apply the strict schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OptionExt as _, QrAuthError, Result, ResultExt as _};

/// Upper bound on scanned payload text.  A version 40 QR code holds < 3 KB.
pub const MAX_QR_PAYLOAD_BYTES: usize = 4096;

/// Upper bound on `data.id`, the scan ledger key.
pub const MAX_QR_ID_BYTES: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QrData {
    /// Payload id: the product's printed code, and the scan ledger key.
    pub id: String,
    pub product_id: String,
    pub batch: String,
    pub name: String,
    /// Issuance time, Unix seconds.
    pub ts: i64,
    /// Product expiry date as catalogued.
    pub exp: String,
}

impl QrData {
    /// Bytes covered by the signature.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).ctx_signing("serialize canonical payload")
    }
}

/// `{data, sig}` as printed into the QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub data: QrData,
    /// Base64 RSA-PSS signature over [`QrData::canonical_bytes`].
    #[serde(rename = "sig")]
    pub signature: String,
}

/// A scanned `{data, sig}` pair that has the fields needed to attempt
/// verification, before any claim about the rest of `data` is trusted.
///
/// Tampering can break the strict [`QrData`] schema (a renamed key, a
/// retyped value).  Such data cannot carry a valid signature, so it is
/// reported as a signature mismatch rather than as malformed input.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedPayload {
    pub qr_id: String,
    pub data: Value,
    pub signature: String,
}

impl ScannedPayload {
    /// Check the envelope: `data` is an object with a non-empty string `id`
    /// and a numeric `ts`, and a signature is present.
    pub fn from_parts(data: &Value, signature: Option<&str>) -> Result<Self> {
        let obj = data
            .as_object()
            .ok_or_else(|| QrAuthError::MalformedInput("data must be a JSON object".into()))?;

        let qr_id = match obj.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(QrAuthError::MalformedInput("missing data.id".into())),
        };
        if qr_id.len() > MAX_QR_ID_BYTES {
            return Err(QrAuthError::MalformedInput(format!(
                "data.id exceeds {MAX_QR_ID_BYTES} bytes"
            )));
        }
        if !obj.get("ts").is_some_and(Value::is_number) {
            return Err(QrAuthError::MalformedInput("missing data.ts".into()));
        }
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| QrAuthError::MalformedInput("missing signature".into()))?;

        Ok(Self {
            qr_id: qr_id.clone(),
            data: data.clone(),
            signature: signature.to_string(),
        })
    }

    /// Strict typed view, or the schema violation.
    pub fn typed(&self) -> Result<SignedPayload> {
        let data: QrData = serde_json::from_value(self.data.clone()).ctx_input("data")?;
        Ok(SignedPayload {
            data,
            signature: self.signature.clone(),
        })
    }
}

impl SignedPayload {
    /// Build a payload from the separately transmitted parts of a verify
    /// request, enforcing the strict schema.
    pub fn from_parts(data: &Value, signature: Option<&str>) -> Result<Self> {
        ScannedPayload::from_parts(data, signature)?.typed()
    }

    /// Serialized form printed into the QR code.
    pub fn to_qr_string(&self) -> Result<String> {
        serde_json::to_string(self).ctx_signing("serialize qr payload")
    }
}

/// Split the text read from a QR code into its envelope.
pub fn parse_scanned_text(text: &str) -> Result<ScannedPayload> {
    if text.len() > MAX_QR_PAYLOAD_BYTES {
        return Err(QrAuthError::MalformedInput(format!(
            "qr payload exceeds {MAX_QR_PAYLOAD_BYTES} bytes"
        )));
    }
    let value: Value = serde_json::from_str(text).ctx_input("qr payload is not JSON")?;
    let data = value.get("data").required_input("missing data")?;
    let sig = value.get("sig").and_then(Value::as_str);
    ScannedPayload::from_parts(data, sig)
}

/// Parse the text read from a QR code into a [`SignedPayload`].
pub fn parse_qr_payload(text: &str) -> Result<SignedPayload> {
    parse_scanned_text(text)?.typed()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
