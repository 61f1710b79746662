//! Cron expression parsing and evaluation (Quartz dialect).
//!
//! ```text
//! ┌───────────── second (0-59)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31, ?)
//! │ │ │ │ ┌───────────── month (1-12, JAN-DEC)
//! │ │ │ │ │ ┌───────────── day of week (1-7, SUN-SAT, 1 = Sunday, ?)
//! │ │ │ │ │ │ ┌───────────── year (1970-2099, optional)
//! │ │ │ │ │ │ │
//! * * * * * ? *
//! ```
//!
//! `L`, `W`, `#` は未対応（パースエラー）。
//!
//! 評価するタイムゾーンは [`CronZone`]（IANA 名 or ホストのローカル）。DST の扱い:
//! - 存在しない時刻（spring forward の隙間）は発火しない
//! - 2 回現れる時刻（fall back）は、基準時刻より後の最初の 1 回だけ発火する

use chrono::{
    DateTime, Datelike, Local, LocalResult, NaiveDate, NaiveDateTime, TimeDelta, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const YEAR_MIN: u32 = 1970;
const YEAR_MAX: u32 = 2099;
const MAX_STEPS: usize = 500_000;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("Invalid cron expression: expected 6 or 7 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Value {value} is out of range [{min}, {max}] for '{field}'")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Invalid range: {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("Invalid step value: {0}")]
    InvalidStep(String),
    #[error("Unsupported cron syntax: {0}")]
    Unsupported(String),
    #[error("Unknown time zone: {0}")]
    UnknownTimeZone(String),
}

/// Time zone a cron expression is evaluated in.
///
/// Serialized as the IANA name (`"Asia/Tokyo"`) or `"local"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CronZone {
    Named(Tz),
    /// The host's local zone.
    Local,
}

impl CronZone {
    pub const UTC: CronZone = CronZone::Named(Tz::UTC);
}

impl Default for CronZone {
    fn default() -> Self {
        Self::UTC
    }
}

impl fmt::Display for CronZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronZone::Named(tz) => f.write_str(tz.name()),
            CronZone::Local => f.write_str("local"),
        }
    }
}

impl FromStr for CronZone {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("local") {
            return Ok(CronZone::Local);
        }
        s.parse::<Tz>()
            .map(CronZone::Named)
            .map_err(|_| CronParseError::UnknownTimeZone(s.to_string()))
    }
}

impl TryFrom<String> for CronZone {
    type Error = CronParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CronZone> for String {
    fn from(zone: CronZone) -> Self {
        zone.to_string()
    }
}

/// A single field of a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    values: BTreeSet<u32>,
    min: u32,
    max: u32,
    /// false for `*` and `?`
    restricted: bool,
}

impl CronField {
    fn parse(
        expr: &str,
        min: u32,
        max: u32,
        allow_any: bool,
        names: Option<(&[&str], u32)>,
    ) -> Result<Self, CronParseError> {
        let mut field = Self {
            values: BTreeSet::new(),
            min,
            max,
            restricted: true,
        };

        let expr = expr.to_ascii_uppercase();
        if expr == "*" || (allow_any && expr == "?") {
            field.restricted = false;
            field.values.extend(min..=max);
            return Ok(field);
        }
        if expr == "?" {
            return Err(CronParseError::InvalidField {
                field: expr,
                reason: "'?' is only allowed for day-of-month and day-of-week".to_string(),
            });
        }

        let expr = match names {
            Some((names, first)) => substitute_names(&expr, names, first),
            None => expr,
        };
        if expr.contains(['L', 'W', '#']) {
            return Err(CronParseError::Unsupported(expr));
        }
        for part in expr.split(',') {
            field.parse_part(part.trim())?;
        }
        Ok(field)
    }

    fn parse_part(&mut self, part: &str) -> Result<(), CronParseError> {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str
                    .parse::<u32>()
                    .map_err(|_| CronParseError::InvalidStep(step_str.to_string()))?;
                if step == 0 || step > self.max {
                    return Err(CronParseError::InvalidStep(step_str.to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            (self.min, self.max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let start = parse_value(lo, range_part, "invalid start of range")?;
            let end = parse_value(hi, range_part, "invalid end of range")?;
            if start > end {
                return Err(CronParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = parse_value(range_part, range_part, "invalid value")?;
            // "a/n" は a から最大値までを n 刻み
            if step.is_some() { (value, self.max) } else { (value, value) }
        };

        if start < self.min || end > self.max {
            return Err(CronParseError::OutOfRange {
                field: range_part.to_string(),
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        let step = step.unwrap_or(1);
        let mut value = Some(start);
        while let Some(current) = value.filter(|v| *v <= end) {
            self.values.insert(current);
            value = current.checked_add(step);
        }
        Ok(())
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Next matching value >= `value`.
    fn next(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }
}

fn parse_value(raw: &str, field: &str, reason: &str) -> Result<u32, CronParseError> {
    raw.parse::<u32>().map_err(|_| CronParseError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

fn substitute_names(expr: &str, names: &[&str], first: u32) -> String {
    let mut out = expr.to_string();
    for (index, name) in (first..).zip(names) {
        out = out.replace(name, &index.to_string());
    }
    out
}

/// A parsed cron expression bound to a time zone (UTC unless set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    zone: CronZone,
    second: CronField,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
    year: CronField,
}

impl CronSchedule {
    /// Parse an expression evaluated in UTC.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if !(6..=7).contains(&parts.len()) {
            return Err(CronParseError::InvalidFieldCount(parts.len()));
        }

        Ok(Self {
            expr: parts.join(" "),
            zone: CronZone::UTC,
            second: CronField::parse(parts[0], 0, 59, false, None)?,
            minute: CronField::parse(parts[1], 0, 59, false, None)?,
            hour: CronField::parse(parts[2], 0, 23, false, None)?,
            day_of_month: CronField::parse(parts[3], 1, 31, true, None)?,
            month: CronField::parse(parts[4], 1, 12, false, Some((&MONTH_NAMES[..], 1)))?,
            day_of_week: CronField::parse(parts[5], 1, 7, true, Some((&DAY_NAMES[..], 1)))?,
            year: match parts.get(6) {
                Some(year) => CronField::parse(year, YEAR_MIN, YEAR_MAX, false, None)?,
                None => CronField::parse("*", YEAR_MIN, YEAR_MAX, false, None)?,
            },
        })
    }

    /// Evaluate the expression in another time zone.
    pub fn in_zone(mut self, zone: CronZone) -> Self {
        self.zone = zone;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    pub fn zone(&self) -> CronZone {
        self.zone
    }

    // 両方指定されていれば OR、片方だけならその片方
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self.day_of_week.matches(date.weekday().number_from_sunday());
        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First fire time strictly after `moment`, or `None` if the expression
    /// never fires again before the year bound.
    pub fn next_after(&self, moment: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.zone {
            CronZone::Named(tz) => self.next_after_in(&tz, moment),
            CronZone::Local => self.next_after_in(&Local, moment),
        }
    }

    fn next_after_in<Z: TimeZone>(
        &self,
        zone: &Z,
        moment: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let local = moment.with_timezone(zone).naive_local();
        let mut t = local.with_nanosecond(0)? + TimeDelta::seconds(1);

        for _ in 0..MAX_STEPS {
            let year = u32::try_from(t.year()).ok()?;
            if year > YEAR_MAX {
                return None;
            }
            if !self.year.matches(year) {
                t = start_of_month(self.year.next(year)?, 1)?;
                continue;
            }
            if !self.month.matches(t.month()) {
                t = match self.month.next(t.month()) {
                    Some(month) => start_of_month(year, month)?,
                    None => start_of_month(year + 1, 1)?,
                };
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.matches(t.hour()) {
                t = match self.hour.next(t.hour()) {
                    Some(hour) => t.date().and_hms_opt(hour, 0, 0)?,
                    None => t.date().succ_opt()?.and_hms_opt(0, 0, 0)?,
                };
                continue;
            }
            if !self.minute.matches(t.minute()) {
                t = match self.minute.next(t.minute()) {
                    Some(minute) => t.date().and_hms_opt(t.hour(), minute, 0)?,
                    None => t.date().and_hms_opt(t.hour(), 0, 0)? + TimeDelta::hours(1),
                };
                continue;
            }
            if !self.second.matches(t.second()) {
                t = match self.second.next(t.second()) {
                    Some(second) => t.date().and_hms_opt(t.hour(), t.minute(), second)?,
                    None => {
                        t.date().and_hms_opt(t.hour(), t.minute(), 0)? + TimeDelta::minutes(1)
                    }
                };
                continue;
            }
            match resolve(zone, &t, moment) {
                Some(fire) => return Some(fire),
                None => t = t + TimeDelta::seconds(1),
            }
        }
        None
    }
}

/// The instant of wall-clock time `t` that is strictly after `moment`, if any.
fn resolve<Z: TimeZone>(
    zone: &Z,
    t: &NaiveDateTime,
    moment: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let candidates = match zone.from_local_datetime(t) {
        LocalResult::Single(dt) => vec![dt],
        LocalResult::Ambiguous(earliest, latest) => vec![earliest, latest],
        LocalResult::None => Vec::new(),
    };
    candidates
        .into_iter()
        .map(|dt| dt.with_timezone(&Utc))
        .find(|dt| *dt > moment)
}

fn start_of_month(year: u32, month: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for CronSchedule {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.expr, self.zone)
    }
}
