//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit `--config` path
//! 2. `qrauth.toml` next to the executable
//! 3. `$HOME/.config/qrauth/config.toml` (`%LOCALAPPDATA%\qrauth\config.toml` on Windows)
//! 4. Built-in defaults
//!
//! Environment variables override file values; CLI arguments override both.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Result, ResultExt as _};

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QrAuthConfig {
    pub paths: PathsConfig,
    pub keys: KeysConfig,
    pub store: StoreConfig,
    pub risk: RiskConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
    pub keys_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Name recorded on newly provisioned key records.
    pub key_name: String,
    /// PKCS#8 PEM file holding the signing key.  Only the issuer needs it.
    pub private_key_pem: Option<PathBuf>,
    /// PEM text supplied through `QRAUTH_RSA_PRIVATE_KEY`.  Never read from
    /// the config file.
    #[serde(skip)]
    pub private_key_pem_inline: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a connection waits on a locked database before the call
    /// fails with a storage error.
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Trailing window for rate counting.
    pub window_secs: u64,
    /// Recent attempts at which the anomaly score is raised.
    pub soft_limit: u64,
    /// Recent attempts at which the request is rejected.
    pub hard_limit: u64,
    /// Scans completed faster than this are suspicious.
    pub fast_scan_ms: u64,
    /// Geolocation accuracy (meters) above which the fix is considered poor.
    pub geo_accuracy_limit_m: f64,
    /// Case-insensitive regex matched against the client user agent.
    pub bot_user_agent_pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file.  Empty means no file logging.
    pub json_log_file: String,
    /// Whether to emit JSON to stdout instead of human-readable text.
    pub json_stdout: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("qrauth.db"),
            keys_dir: PathBuf::from("qrauth-keys"),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            key_name: "primary_signing_key".to_string(),
            private_key_pem: None,
            private_key_pem_inline: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            soft_limit: 5,
            hard_limit: 10,
            fast_scan_ms: 5_000,
            geo_accuracy_limit_m: 1_000.0,
            bot_user_agent_pattern: "bot".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl QrAuthConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: QrAuthConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load config using the standard search order.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("qrauth.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        #[cfg(windows)]
        {
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                let candidate = PathBuf::from(local).join("qrauth").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("qrauth")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("QRAUTH_DB") {
            self.paths.db = PathBuf::from(db);
        }
        if let Ok(level) = std::env::var("QRAUTH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(path) = std::env::var("QRAUTH_PRIVATE_KEY_PEM") {
            self.keys.private_key_pem = Some(PathBuf::from(path));
        }
        if let Ok(pem) = std::env::var("QRAUTH_RSA_PRIVATE_KEY") {
            self.keys.private_key_pem_inline = Some(SecretString::new(pem.into()));
        }
    }

    fn validate(&self) -> Result<()> {
        regex::RegexBuilder::new(&self.risk.bot_user_agent_pattern)
            .case_insensitive(true)
            .build()
            .ctx_config("risk.bot_user_agent_pattern")?;
        if self.risk.soft_limit > self.risk.hard_limit {
            return Err(crate::error::QrAuthError::Configuration(
                "risk.soft_limit must not exceed risk.hard_limit".into(),
            ));
        }
        Ok(())
    }
}
