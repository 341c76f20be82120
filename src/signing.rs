//! RSA-PSS signing primitives and the QR issuance service.
//!
//! Scheme: RSASSA-PSS, SHA-256 digest, MGF1(SHA-256), salt length 32 bytes.
//! Signatures travel as standard base64.

use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner as _, SignatureEncoding as _, Verifier as _};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::catalog::{self, IssuedQr, ProductRecord};
use crate::error::{OptionExt as _, QrAuthError, Result, ResultExt as _};
use crate::keys::{ActiveKeyPair, KeyProvider};
use crate::payload::{QrData, SignedPayload};
use crate::store::Store;
use crate::util;

/// PSS salt length in bytes.
pub const PSS_SALT_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerDescriptor {
    /// SHA-256 hex of the PKCS#8 DER private key, matching the key record's
    /// `private_key_ref`.
    pub key_id: String,
    /// Human-readable descriptor (e.g., "rsa-pss-sha256/pkcs8-pem").
    pub kind: String,
}

/// Trait boundary for signer implementations.
///
/// Production: an HSM / KMS holding the key.
/// Development: [`RsaPssSigner`] over a PKCS#8 PEM.
pub trait Signer {
    fn descriptor(&self) -> &SignerDescriptor;
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// In-process signer
// ---------------------------------------------------------------------------

pub struct RsaPssSigner {
    signing_key: BlindedSigningKey<Sha256>,
    descriptor: SignerDescriptor,
}

impl std::fmt::Debug for RsaPssSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaPssSigner")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl RsaPssSigner {
    pub fn new(private: RsaPrivateKey, key_id: String) -> Self {
        Self {
            signing_key: BlindedSigningKey::<Sha256>::new_with_salt_len(private, PSS_SALT_LEN),
            descriptor: SignerDescriptor {
                key_id,
                kind: "rsa-pss-sha256/pkcs8-pem".to_string(),
            },
        }
    }

    pub fn from_key_pair(pair: ActiveKeyPair) -> Self {
        Self::new(pair.private, pair.public.record.private_key_ref)
    }
}

impl Signer for RsaPssSigner {
    fn descriptor(&self) -> &SignerDescriptor {
        &self.descriptor
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let sig: Signature = self
            .signing_key
            .try_sign_with_rng(&mut rand_core::OsRng, msg)
            .ctx_signing("RSA-PSS sign")?;
        Ok(sig.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Standalone verification
// ---------------------------------------------------------------------------

/// Check an RSA-PSS signature.  Any structural problem with the signature
/// bytes (wrong length, out of range) counts as a mismatch.
pub fn verify_rsa_pss(public: &RsaPublicKey, msg: &[u8], sig: &[u8]) -> bool {
    let Ok(sig) = Signature::try_from(sig) else {
        return false;
    };
    VerifyingKey::<Sha256>::new_with_salt_len(public.clone(), PSS_SALT_LEN)
        .verify(msg, &sig)
        .is_ok()
}

// ---------------------------------------------------------------------------
// Issuance
// ---------------------------------------------------------------------------

/// Issue a signed payload for a catalogued product with the active key.
///
/// The product is resolved before the key.  A missing active key surfaces as
/// a configuration error: issuance is an operator action and the operator
/// has not finished provisioning.
pub fn issue(
    store: &Store,
    keys: &dyn KeyProvider,
    product_id: &str,
    batch_number: Option<&str>,
) -> Result<SignedPayload> {
    let product = lookup_product(store, product_id)?;
    let pair = keys.active_key_pair().map_err(|e| match e {
        QrAuthError::KeyNotFound(msg) => QrAuthError::Configuration(msg),
        other => other,
    })?;
    let signer = RsaPssSigner::from_key_pair(pair);
    sign_for_product(store, &signer, &product, batch_number)
}

/// Issue with an explicit signer (HSM-backed signers plug in here).
pub fn issue_with_signer(
    store: &Store,
    signer: &dyn Signer,
    product_id: &str,
    batch_number: Option<&str>,
) -> Result<SignedPayload> {
    let product = lookup_product(store, product_id)?;
    sign_for_product(store, signer, &product, batch_number)
}

fn lookup_product(store: &Store, product_id: &str) -> Result<ProductRecord> {
    util::validate_code(product_id, "productId")?;
    catalog::get_product(store, product_id)?.required_found(&format!("product {product_id}"))
}

fn sign_for_product(
    store: &Store,
    signer: &dyn Signer,
    product: &ProductRecord,
    batch_number: Option<&str>,
) -> Result<SignedPayload> {
    let code = product
        .code()
        .required_input(&format!("product {} has no code", product.id))?
        .to_string();

    let batch = batch_number
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(&product.batch_number)
        .to_string();

    let data = QrData {
        id: code,
        product_id: product.id.clone(),
        batch,
        name: product.product_name.clone(),
        ts: util::now_unix_secs(),
        exp: product.expiry_date.clone(),
    };
    let sig = signer.sign(&data.canonical_bytes()?)?;
    let payload = SignedPayload {
        data,
        signature: util::b64_encode(&sig),
    };

    let issued = IssuedQr {
        data: payload.data.clone(),
        signature_b64: payload.signature.clone(),
        generated_at_utc: util::now_utc_rfc3339(),
    };
    if let Err(e) = catalog::record_issued(store, &product.id, &issued) {
        warn!(error = %e, product_id = %product.id, "failed to record issued payload (non-fatal)");
    }

    info!(
        product_id = %product.id,
        qr_id = %payload.data.id,
        key_id = %signer.descriptor().key_id,
        "qr payload issued"
    );
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
