//! Verification service for signed QR payloads.
//!
//! Outcomes (`first_use`, `reused`, `signature_invalid`) are values.  Errors
//! are reserved for malformed input, a missing active key and storage
//! faults; a verification never falls back to a weaker check.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{self, ScanAttempt, ScanStatus};
use crate::error::{QrAuthError, Result, ResultExt as _};
use crate::keys::{ActivePublicKey, KeyProvider};
use crate::ledger::{self, ScanLedgerEntry, ScanMeta};
use crate::payload::{ScannedPayload, SignedPayload};
use crate::signing;
use crate::store::Store;
use crate::util;

const MAX_CONTEXT_FIELD_LEN: usize = 512;

/// Caller context recorded with each attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanContext {
    pub device_id: String,
    pub location: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl ScanContext {
    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(QrAuthError::MalformedInput("missing deviceId".into()));
        }
        let fields = [
            ("deviceId", Some(self.device_id.as_str())),
            ("location", self.location.as_deref()),
            ("userAgent", self.user_agent.as_deref()),
            ("ipAddress", self.ip_address.as_deref()),
        ];
        for (label, value) in fields {
            if value.is_some_and(|v| v.len() > MAX_CONTEXT_FIELD_LEN) {
                return Err(QrAuthError::MalformedInput(format!(
                    "{label} exceeds {MAX_CONTEXT_FIELD_LEN} bytes"
                )));
            }
        }
        Ok(())
    }

    fn scan_meta(&self) -> ScanMeta {
        ScanMeta {
            location: self.location.clone(),
            device_id: Some(self.device_id.clone()),
            ip: self.ip_address.clone(),
        }
    }

    fn attempt(&self, qr_id: &str, status: ScanStatus) -> ScanAttempt {
        ScanAttempt::new(
            qr_id,
            status,
            self.location.as_deref(),
            Some(&self.device_id),
            self.ip_address.as_deref(),
            self.user_agent.as_deref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    FirstUse { entry: ScanLedgerEntry },
    Reused { entry: ScanLedgerEntry },
    SignatureInvalid,
}

impl VerificationOutcome {
    pub fn status(&self) -> ScanStatus {
        match self {
            Self::FirstUse { .. } => ScanStatus::FirstUse,
            Self::Reused { .. } => ScanStatus::Reused,
            Self::SignatureInvalid => ScanStatus::SignatureInvalid,
        }
    }
}

/// Human-readable explanation for a reused code.
pub fn reused_message(entry: &ScanLedgerEntry) -> String {
    format!(
        "This QR was first scanned at {} on {}",
        entry
            .first_scan
            .location
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or("unknown location"),
        entry.first_scan.time
    )
}

/// Verify a structurally valid payload and record the scan.
pub fn verify(
    store: &Store,
    keys: &dyn KeyProvider,
    payload: &SignedPayload,
    ctx: &ScanContext,
) -> Result<VerificationOutcome> {
    let public = begin(keys, ctx)?;
    check_and_record(store, &public, payload, ctx)
}

/// Verify a scan whose `data` has only passed the envelope checks.  Data
/// that does not fit the strict schema is recorded as a signature mismatch.
pub fn verify_scanned(
    store: &Store,
    keys: &dyn KeyProvider,
    scanned: &ScannedPayload,
    ctx: &ScanContext,
) -> Result<VerificationOutcome> {
    let public = begin(keys, ctx)?;
    match scanned.typed() {
        Ok(payload) => check_and_record(store, &public, &payload, ctx),
        Err(e) => {
            debug!(qr_id = %scanned.qr_id, error = %e, "scanned data does not fit the signed schema");
            record_invalid(store, &scanned.qr_id, ctx)
        }
    }
}

fn begin(keys: &dyn KeyProvider, ctx: &ScanContext) -> Result<ActivePublicKey> {
    if let Err(e) = ctx.validate() {
        warn!(error = %e, "rejected verification request");
        return Err(e);
    }
    keys.active_public_key()
}

fn record_invalid(store: &Store, qr_id: &str, ctx: &ScanContext) -> Result<VerificationOutcome> {
    let tx = store.immediate_tx()?;
    audit::append_scan_attempt(&tx, &ctx.attempt(qr_id, ScanStatus::SignatureInvalid))?;
    tx.commit().ctx_storage("commit scan attempt")?;
    warn!(qr_id, device_id = %ctx.device_id, "signature invalid");
    Ok(VerificationOutcome::SignatureInvalid)
}

fn check_and_record(
    store: &Store,
    public: &ActivePublicKey,
    payload: &SignedPayload,
    ctx: &ScanContext,
) -> Result<VerificationOutcome> {
    let qr_id = payload.data.id.as_str();
    let msg = payload.data.canonical_bytes()?;
    // Undecodable signature text is a mismatch, same as wrong bytes.
    let valid = match util::b64_decode(&payload.signature) {
        Ok(sig) => signing::verify_rsa_pss(&public.key, &msg, &sig),
        Err(_) => false,
    };
    if !valid {
        return record_invalid(store, qr_id, ctx);
    }

    let tx = store.immediate_tx()?;
    let recorded = ledger::record_or_detect_in(&tx, qr_id, &payload.data.product_id, &ctx.scan_meta())?;
    let outcome = if recorded.is_first_use {
        VerificationOutcome::FirstUse {
            entry: recorded.entry,
        }
    } else {
        VerificationOutcome::Reused {
            entry: recorded.entry,
        }
    };
    audit::append_scan_attempt(&tx, &ctx.attempt(qr_id, outcome.status()))?;
    tx.commit().ctx_storage("commit verification")?;

    match &outcome {
        VerificationOutcome::Reused { entry } => warn!(
            qr_id,
            scan_count = entry.scan_count,
            first_scan_time = %entry.first_scan.time,
            "qr code reused"
        ),
        _ => info!(qr_id, status = outcome.status().as_str(), "qr code verified"),
    }
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
