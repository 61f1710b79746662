//! Recurring schedules: moment -> next execution moment.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use super::cron::{CronParseError, CronSchedule};

#[derive(Debug, Clone, PartialEq)]
pub enum RecurringSchedule {
    /// `moment + period`, measured from the reference moment (no drift correction).
    FixedDelay(Duration),
    Cron(CronSchedule),
}

impl RecurringSchedule {
    pub fn every(period: Duration) -> Self {
        Self::FixedDelay(period)
    }

    pub fn cron(expr: &str) -> Result<Self, CronParseError> {
        CronSchedule::parse(expr).map(Self::Cron)
    }

    /// `None` only when a cron expression has no further fire time.
    pub fn next_execution(&self, moment: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::FixedDelay(period) => Some(add_duration(moment, *period)),
            Self::Cron(cron) => cron.next_after(moment),
        }
    }
}

/// `moment + duration`, saturating at chrono's maximum representable time.
pub fn add_duration(moment: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| moment.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
