//! Structured error types for the qrauth library.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! [`QrAuthError`].  Business outcomes of a verification (`first_use`,
//! `reused`, `signature_invalid`) are *not* errors and never appear here;
//! only client faults and infrastructure faults do.  The FFI boundary
//! converts errors into integer status codes via [`FfiErrorCode`].

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the qrauth library.
#[derive(Error, Debug)]
pub enum QrAuthError {
    /// The caller supplied input that does not match the expected schema.
    /// Retrying unmodified will fail the same way.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No active key record exists.  Verification and signing fail closed.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("signing: {0}")]
    Signing(String),

    /// Ledger / log / catalog I/O failure.  Retryable.
    #[error("storage: {0}")]
    Storage(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Direct database errors (auto-converted via `?` in the store modules).
    #[error("storage: database: {0}")]
    Database(#[from] rusqlite::Error),

    /// Catch-all for errors that do not fit a specific class.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, QrAuthError>;

/// Stable, machine-readable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    NotFound,
    KeyNotFound,
    Configuration,
    Signing,
    Storage,
    RateLimited,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedInput => "malformed_input",
            Self::NotFound => "not_found",
            Self::KeyNotFound => "key_not_found",
            Self::Configuration => "configuration_error",
            Self::Signing => "signing_error",
            Self::Storage => "storage_error",
            Self::RateLimited => "rate_limited",
            Self::Internal => "internal_error",
        }
    }
}

impl QrAuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedInput(_) => ErrorKind::MalformedInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::KeyNotFound(_) => ErrorKind::KeyNotFound,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Signing(_) => ErrorKind::Signing,
            Self::Storage(_) | Self::Database(_) => ErrorKind::Storage,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Only infrastructure faults are worth retrying unmodified.  Re-verifying
    /// an id that was already recorded only increments its counter.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }
}

// ---------------------------------------------------------------------------
// FFI error codes
// ---------------------------------------------------------------------------

/// Integer status codes returned across the C-ABI boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    InvalidArgument = -1,
    NotFound = -2,
    KeyNotFound = -3,
    ConfigError = -4,
    SigningError = -5,
    StorageError = -6,
    RateLimited = -7,
    InternalError = -99,
}

impl From<&QrAuthError> for FfiErrorCode {
    fn from(e: &QrAuthError) -> Self {
        match e.kind() {
            ErrorKind::MalformedInput => Self::InvalidArgument,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::KeyNotFound => Self::KeyNotFound,
            ErrorKind::Configuration => Self::ConfigError,
            ErrorKind::Signing => Self::SigningError,
            ErrorKind::Storage => Self::StorageError,
            ErrorKind::RateLimited => Self::RateLimited,
            ErrorKind::Internal => Self::InternalError,
        }
    }
}

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Extension trait that tags any `Result<T, E>` with the error class of the
/// subsystem it came from.
///
/// ```ignore
/// std::fs::read_to_string(path).ctx_config("read config file")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_input(self, msg: &str) -> Result<T>;
    fn ctx_storage(self, msg: &str) -> Result<T>;
    fn ctx_signing(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_input(self, msg: &str) -> Result<T> {
        self.map_err(|e| QrAuthError::MalformedInput(format!("{msg}: {e}")))
    }
    fn ctx_storage(self, msg: &str) -> Result<T> {
        self.map_err(|e| QrAuthError::Storage(format!("{msg}: {e}")))
    }
    fn ctx_signing(self, msg: &str) -> Result<T> {
        self.map_err(|e| QrAuthError::Signing(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| QrAuthError::Configuration(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_input(self, msg: &str) -> Result<T>;
    fn required_found(self, msg: &str) -> Result<T>;
    fn required_config(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_input(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| QrAuthError::MalformedInput(msg.to_string()))
    }
    fn required_found(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| QrAuthError::NotFound(msg.to_string()))
    }
    fn required_config(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| QrAuthError::Configuration(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_are_storage_class() {
        let e = QrAuthError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(e.kind(), ErrorKind::Storage);
        assert!(e.is_retryable());
        assert_eq!(FfiErrorCode::from(&e), FfiErrorCode::StorageError);
    }

    #[test]
    fn client_faults_are_not_retryable() {
        let e = QrAuthError::MalformedInput("missing data.id".into());
        assert!(!e.is_retryable());
        assert_eq!(e.kind().as_str(), "malformed_input");
        assert_eq!(FfiErrorCode::from(&e), FfiErrorCode::InvalidArgument);
    }

    #[test]
    fn option_ext_maps_none() {
        let none: Option<u8> = None;
        let e = none.required_found("product p-1").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.to_string().contains("p-1"));
    }
}
