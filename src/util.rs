//! Hashing, encoding and time helpers plus input validation.

use base64::Engine as _;
use std::path::{Path, PathBuf};
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{QrAuthError, Result};

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

// ---------------------------------------------------------------------------
// Base64
// ---------------------------------------------------------------------------

pub fn b64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| QrAuthError::MalformedInput(format!("invalid base64: {e}")))
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn now_utc_rfc3339() -> String {
    rfc3339(now_utc())
}

pub fn unix_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn now_unix_secs() -> i64 {
    now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Product codes and ids: starts with alphanumeric, then up to 127 more
/// alphanumeric / hyphen / dot / underscore characters.
static CODE_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.]{0,127}$").unwrap()
});

/// Validate a product code / id format.
pub fn validate_code(code: &str, label: &str) -> Result<()> {
    if code.is_empty() {
        return Err(QrAuthError::MalformedInput(format!(
            "{label} must not be empty"
        )));
    }
    if !CODE_RE.is_match(code) {
        return Err(QrAuthError::MalformedInput(format!(
            "invalid {label}: 1-128 chars, alphanumeric/hyphen/dot/underscore"
        )));
    }
    Ok(())
}

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(QrAuthError::MalformedInput(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(QrAuthError::MalformedInput(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

/// Canonicalize a path if it exists, otherwise return it unchanged.
pub fn canonicalize_if_exists(p: &Path, label: &str) -> Result<PathBuf> {
    validate_path(p, label)?;
    if p.exists() {
        std::fs::canonicalize(p).map_err(|e| {
            QrAuthError::MalformedInput(format!("{label} path invalid: {e}"))
        })
    } else {
        Ok(p.to_path_buf())
    }
}

/// Maximum number of rows allowed in CSV inputs.
pub const MAX_CSV_ROWS: usize = 10_000;

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("QRAUTH_GIT_HASH");
pub const BUILD_TS: &str = env!("QRAUTH_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("qrauth v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let digest = sha256(b"");
        assert_eq!(
            hex::encode(digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn b64_decode_invalid() {
        assert!(b64_decode("not!!valid!!base64").is_err());
    }

    #[test]
    fn valid_codes() {
        assert!(validate_code("FIN123456789", "code").is_ok());
        assert!(validate_code("demo-product-uuid", "code").is_ok());
        assert!(validate_code("B2024_001.v2", "code").is_ok());
    }

    #[test]
    fn invalid_codes() {
        assert!(validate_code("", "code").is_err());
        assert!(validate_code("-leading-hyphen", "code").is_err());
        assert!(validate_code("has space", "code").is_err());
        assert!(validate_code(&"A".repeat(200), "code").is_err());
    }

    #[test]
    fn unix_ms_matches_seconds() {
        let t = now_utc();
        assert_eq!(unix_ms(t) / 1000, t.unix_timestamp());
    }

    #[test]
    fn version_string_non_empty() {
        assert!(version_string().contains("qrauth"));
    }
}
