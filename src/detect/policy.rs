//! Alert policy: turns a period estimate into alert actions.
//!
//! Three levels (normal, elevated, critical). A key that is elevated or
//! critical stays there while the probability is above the clear threshold,
//! so a sustained spike produces one message, not one per poll.

use serde::{Deserialize, Serialize};

use crate::detect::{AlertLevel, PeriodSummary, Severity};

/// Probability and count thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Thresholds {
    pub elevated_probability_threshold: f64,
    pub critical_probability_threshold: f64,
    /// An elevated or critical key returns to normal once the probability
    /// drops to or below this.
    pub clear_probability_threshold: f64,
    /// Counts at or below this never alert.
    pub minimum_significant_count: u64,
    /// Counts at or below this never page.
    pub minimum_page_count: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            elevated_probability_threshold: 0.999,
            critical_probability_threshold: 0.9995,
            clear_probability_threshold: 0.99,
            minimum_significant_count: 3,
            minimum_page_count: 10,
        }
    }
}

/// Per-source threshold changes; unset fields keep the global value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ThresholdOverrides {
    pub elevated_probability_threshold: Option<f64>,
    pub critical_probability_threshold: Option<f64>,
    pub clear_probability_threshold: Option<f64>,
    pub minimum_significant_count: Option<u64>,
    pub minimum_page_count: Option<u64>,
}

impl ThresholdOverrides {
    pub fn apply(&self, base: &Thresholds) -> Thresholds {
        Thresholds {
            elevated_probability_threshold: self
                .elevated_probability_threshold
                .unwrap_or(base.elevated_probability_threshold),
            critical_probability_threshold: self
                .critical_probability_threshold
                .unwrap_or(base.critical_probability_threshold),
            clear_probability_threshold: self.clear_probability_threshold.unwrap_or(base.clear_probability_threshold),
            minimum_significant_count: self.minimum_significant_count.unwrap_or(base.minimum_significant_count),
            minimum_page_count: self.minimum_page_count.unwrap_or(base.minimum_page_count),
        }
    }
}

/// Which comparison decides that a count is elevated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PolicyMode {
    /// Poisson cumulative probability against the thresholds.
    #[default]
    Poisson,
    /// Deprecated: elevated when the count exceeds `mean * ratio`. Never pages.
    Ratio {
        #[serde(default = "default_ratio")]
        ratio: f64,
    },
}

fn default_ratio() -> f64 {
    1.10
}

/// An outgoing notification, not yet delivered.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum AlertAction {
    Notify {
        channel: String,
        severity: Severity,
        message: String,
    },
    Page {
        service: String,
        message: String,
    },
}

impl AlertAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertAction::Notify { .. } => "notify",
            AlertAction::Page { .. } => "page",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            AlertAction::Notify { channel, .. } => channel,
            AlertAction::Page { service, .. } => service,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AlertAction::Notify { severity, .. } => *severity,
            AlertAction::Page { .. } => Severity::Critical,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AlertAction::Notify { message, .. } | AlertAction::Page { message, .. } => message,
        }
    }
}

/// Outcome of one policy decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub level: AlertLevel,
    pub actions: Vec<AlertAction>,
}

/// Naming used in alert messages.
#[derive(Debug, Clone, Copy)]
pub struct AlertSubject<'a> {
    pub source: &'a str,
    pub link: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct AlertPolicy {
    thresholds: Thresholds,
    mode: PolicyMode,
    channel: String,
    page_service: Option<String>,
}

impl AlertPolicy {
    pub fn new(thresholds: Thresholds, mode: PolicyMode, channel: impl Into<String>, page_service: Option<String>) -> Self {
        Self {
            thresholds,
            mode,
            channel: channel.into(),
            page_service,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Level implied by this period alone, ignoring history.
    pub fn level_for(&self, new_count: u64, mean: f64, probability: f64) -> AlertLevel {
        // No history means no rate to be surprised against.
        if mean <= 0.0 || !mean.is_finite() {
            return AlertLevel::Normal;
        }
        let t = &self.thresholds;
        if new_count <= t.minimum_significant_count {
            return AlertLevel::Normal;
        }

        match self.mode {
            PolicyMode::Poisson => {
                if probability > t.critical_probability_threshold && new_count > t.minimum_page_count {
                    AlertLevel::Critical
                } else if probability > t.elevated_probability_threshold {
                    AlertLevel::Elevated
                } else {
                    AlertLevel::Normal
                }
            }
            PolicyMode::Ratio { ratio } => {
                if new_count as f64 > mean * ratio {
                    AlertLevel::Elevated
                } else {
                    AlertLevel::Normal
                }
            }
        }
    }

    /// Decide the new level for a key previously at `previous`, and what to send.
    pub fn decide(&self, previous: AlertLevel, summary: &PeriodSummary, subject: AlertSubject<'_>) -> Decision {
        let raw = self.level_for(summary.new_count, summary.mean, summary.probability);
        let holding = raw < previous
            && summary.mean > 0.0
            && summary.probability > self.thresholds.clear_probability_threshold;
        let level = if holding { previous } else { raw };

        let mut actions = Vec::new();
        if level > previous {
            let message = elevated_message(subject, summary);
            let severity = if level == AlertLevel::Critical {
                Severity::Critical
            } else {
                Severity::Warning
            };
            actions.push(AlertAction::Notify {
                channel: self.channel.clone(),
                severity,
                message: message.clone(),
            });
            if level == AlertLevel::Critical {
                if let Some(service) = &self.page_service {
                    actions.push(AlertAction::Page {
                        service: service.clone(),
                        message,
                    });
                }
            }
        } else if level == AlertLevel::Normal && previous > AlertLevel::Normal {
            actions.push(AlertAction::Notify {
                channel: self.channel.clone(),
                severity: Severity::Info,
                message: cleared_message(subject, summary),
            });
        }

        Decision { level, actions }
    }
}

fn elevated_message(subject: AlertSubject<'_>, s: &PeriodSummary) -> String {
    let mut message = format!(
        "Elevated bug report rate on {} ('{}')! We saw {} in the last {} minutes, \
         while the mean indicates we should see around {}. \
         Probability that this is abnormally elevated: {:.4}.",
        subject.source,
        s.key,
        thousand_commas(s.new_count),
        thousand_commas((s.period_secs / 60.0) as u64),
        format_mean(s.mean),
        s.probability,
    );
    if let Some(link) = subject.link {
        message.push_str(&format!(" See {}", link));
    }
    message
}

fn cleared_message(subject: AlertSubject<'_>, s: &PeriodSummary) -> String {
    format!(
        "Bug report rate on {} ('{}') is back to normal: {} in the last {} minutes, around {} expected.",
        subject.source,
        s.key,
        thousand_commas(s.new_count),
        thousand_commas((s.period_secs / 60.0) as u64),
        format_mean(s.mean),
    )
}

/// Insert thousands separators: `1234567` -> `1,234,567`.
pub fn thousand_commas(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_mean(mean: f64) -> String {
    let rounded = (mean * 100.0).round() / 100.0;
    let whole = rounded.trunc() as u64;
    let frac = format!("{:.2}", rounded.fract());
    let frac = frac.trim_start_matches('0').trim_end_matches('0').trim_end_matches('.');
    format!("{}{}", thousand_commas(whole), frac)
}
