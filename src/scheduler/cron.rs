use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

/// Fire times of the watch loop.
#[derive(Debug, Clone)]
pub struct Ticker {
    expr: String,
    schedule: CronSchedule,
}

impl Ticker {
    pub fn new(cron_expr: &str) -> Result<Self> {
        let schedule = CronSchedule::from_str(cron_expr)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", cron_expr, e))?;
        Ok(Self {
            expr: cron_expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`.
    pub fn next_tick(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The next `count` fire times, for display.
    pub fn preview(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&after).take(count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_ten_minutes() {
        let ticker = Ticker::new("0 */10 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 6, 12, 3, 17).unwrap();
        assert_eq!(ticker.next_tick(after), Some(Utc.with_ymd_and_hms(2024, 5, 6, 12, 10, 0).unwrap()));

        // strictly after: a tick exactly on the boundary moves on
        let on = Utc.with_ymd_and_hms(2024, 5, 6, 12, 10, 0).unwrap();
        assert_eq!(ticker.next_tick(on), Some(Utc.with_ymd_and_hms(2024, 5, 6, 12, 20, 0).unwrap()));

        let preview = ticker.preview(after, 3);
        assert_eq!(preview.len(), 3);
        assert_eq!(preview[2], Utc.with_ymd_and_hms(2024, 5, 6, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_invalid_expression() {
        assert!(Ticker::new("every ten minutes").is_err());
    }
}
