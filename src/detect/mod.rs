//! Rate-anomaly estimation, alert decisions and incident history.

pub mod estimator;
pub mod incident;
pub mod policy;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown alert level '{0}'")]
    UnknownLevel(String),
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
}

/// Severity attached to a delivered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Info" | "info" => Ok(Severity::Info),
            "Warning" | "warning" => Ok(Severity::Warning),
            "Critical" | "critical" => Ok(Severity::Critical),
            other => Err(DetectError::UnknownSeverity(other.to_string())),
        }
    }
}

/// Alert state of a single tracked key, remembered between runs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum AlertLevel {
    #[default]
    Normal,
    Elevated,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Elevated => "elevated",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(AlertLevel::Normal),
            "elevated" => Ok(AlertLevel::Elevated),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(DetectError::UnknownLevel(other.to_string())),
        }
    }
}

/// Figures computed for one key over one run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PeriodSummary {
    pub key: String,
    pub historical_count: u64,
    pub historical_secs: f64,
    pub new_count: u64,
    pub period_secs: f64,
    pub mean: f64,
    pub probability: f64,
    pub level: AlertLevel,
}
