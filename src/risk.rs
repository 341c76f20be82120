//! Anomaly scoring for the legacy (non-signed) verification path.
//!
//! Scores are accumulated as integer tenths so that identical signals always
//! produce bit-identical scores and tiers.
//!
//! | signal                             | points |
//! |------------------------------------|--------|
//! | recent scans >= soft limit         | +0.3   |
//! | scan duration < fast-scan limit    | +0.2   |
//! | bot user agent                     | +0.5   |
//! | geolocation accuracy > limit       | +0.1   |
//! | location outside distribution area | +0.3, forces `high_risk` |
//! | product not in catalog             | +0.2, at least `medium_risk` |

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::error::{Result, ResultExt as _};

const BURST_POINTS: u32 = 3;
const FAST_SCAN_POINTS: u32 = 2;
const BOT_POINTS: u32 = 5;
const POOR_GEO_POINTS: u32 = 1;
const LOCATION_MISMATCH_POINTS: u32 = 3;
const UNKNOWN_PRODUCT_POINTS: u32 = 2;

const HIGH_RISK_POINTS: u32 = 7;
const MEDIUM_RISK_POINTS: u32 = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityFlag {
    LowRisk,
    MediumRisk,
    HighRisk,
}

impl SecurityFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowRisk => "low_risk",
            Self::MediumRisk => "medium_risk",
            Self::HighRisk => "high_risk",
        }
    }

    fn from_points(points: u32) -> Self {
        if points >= HIGH_RISK_POINTS {
            Self::HighRisk
        } else if points >= MEDIUM_RISK_POINTS {
            Self::MediumRisk
        } else {
            Self::LowRisk
        }
    }
}

/// Inputs to one assessment.  Absent signals contribute nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskSignals {
    /// Attempts from this caller in the trailing window, current included.
    pub recent_scans: u64,
    pub scan_duration_ms: Option<u64>,
    pub user_agent: Option<String>,
    pub geolocation_accuracy_m: Option<f64>,
    /// `Some(false)` when the scan location lies outside the product's
    /// distribution area.
    pub location_consistent: Option<bool>,
    pub product_found: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    Burst,
    FastScan,
    BotUserAgent,
    PoorGeolocation,
    LocationMismatch,
    UnknownProduct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub security_flag: SecurityFlag,
    pub anomaly_score: f64,
    pub reasons: Vec<RiskReason>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RiskEngine {
    cfg: RiskConfig,
    bot_re: Regex,
}

impl RiskEngine {
    pub fn new(cfg: &RiskConfig) -> Result<Self> {
        let bot_re = RegexBuilder::new(&cfg.bot_user_agent_pattern)
            .case_insensitive(true)
            .build()
            .ctx_config("risk.bot_user_agent_pattern")?;
        Ok(Self {
            cfg: cfg.clone(),
            bot_re,
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    pub fn is_bot(&self, user_agent: &str) -> bool {
        self.bot_re.is_match(user_agent)
    }

    pub fn assess(&self, s: &RiskSignals) -> RiskAssessment {
        let mut points = 0u32;
        let mut reasons = Vec::new();
        let mut add = |p: u32, r: RiskReason| {
            points += p;
            reasons.push(r);
        };

        if s.recent_scans >= self.cfg.soft_limit {
            add(BURST_POINTS, RiskReason::Burst);
        }
        if s.scan_duration_ms.is_some_and(|d| d < self.cfg.fast_scan_ms) {
            add(FAST_SCAN_POINTS, RiskReason::FastScan);
        }
        if s.user_agent.as_deref().is_some_and(|ua| self.is_bot(ua)) {
            add(BOT_POINTS, RiskReason::BotUserAgent);
        }
        if s
            .geolocation_accuracy_m
            .is_some_and(|acc| acc > self.cfg.geo_accuracy_limit_m)
        {
            add(POOR_GEO_POINTS, RiskReason::PoorGeolocation);
        }
        let mismatch = s.product_found && s.location_consistent == Some(false);
        if mismatch {
            add(LOCATION_MISMATCH_POINTS, RiskReason::LocationMismatch);
        }
        if !s.product_found {
            add(UNKNOWN_PRODUCT_POINTS, RiskReason::UnknownProduct);
        }

        let mut security_flag = SecurityFlag::from_points(points);
        if mismatch {
            security_flag = SecurityFlag::HighRisk;
        }
        if !s.product_found {
            security_flag = security_flag.max(SecurityFlag::MediumRisk);
        }

        RiskAssessment {
            security_flag,
            anomaly_score: f64::from(points) / 10.0,
            reasons,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
