//! Periodicity parsing and randomized next-run computation.
//!
//! Periods with calendar components (years, months) are approximated as
//! 365- and 30-day multiples; the arithmetic is not calendar aware.

use std::sync::LazyLock;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AkrunError, Result};

/// Canonical timestamp format used by the task store.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SECONDS_PER_DAY: i64 = 86_400;

/// Longest accepted repeat period.
pub const MAX_PERIOD_DAYS: i64 = 100 * 365;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Period {
    pub years: u32,
    pub months: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

#[derive(Clone, Copy)]
enum Field {
    Years,
    Months,
    Days,
    Hours,
    Minutes,
    Seconds,
}

// Most specific shape first; the first structural match wins.
static PERIOD_SHAPES: LazyLock<Vec<(Regex, &'static [Field])>> = LazyLock::new(|| {
    use Field::*;
    let shapes: [(&str, &'static [Field]); 7] = [
        (
            r"^(\d+)-(\d+)-(\d+) (\d+):(\d+):(\d+)$",
            &[Years, Months, Days, Hours, Minutes, Seconds],
        ),
        (
            r"^(\d+)-(\d+)-(\d+) (\d+):(\d+)$",
            &[Years, Months, Days, Hours, Minutes],
        ),
        (r"^(\d+) (\d+):(\d+):(\d+)$", &[Days, Hours, Minutes, Seconds]),
        (r"^(\d+) (\d+):(\d+)$", &[Days, Hours, Minutes]),
        (r"^(\d+):(\d+):(\d+)$", &[Hours, Minutes, Seconds]),
        (r"^(\d+):(\d+)$", &[Hours, Minutes]),
        (r"^(\d+)$", &[Days]),
    ];
    shapes
        .into_iter()
        .map(|(pattern, fields)| (Regex::new(pattern).expect("static period pattern"), fields))
        .collect()
});

impl Period {
    pub fn is_calendar(&self) -> bool {
        self.years != 0 || self.months != 0
    }

    fn has_fixed_length_part(&self) -> bool {
        self.days != 0 || self.hours != 0 || self.minutes != 0 || self.seconds != 0
    }

    /// Length in seconds. Every component fits a `u32`, so the sum cannot overflow.
    fn total_seconds(&self) -> i64 {
        if self.is_calendar() {
            return (365 * i64::from(self.years) + 30 * i64::from(self.months)) * SECONDS_PER_DAY;
        }
        i64::from(self.days) * SECONDS_PER_DAY
            + i64::from(self.hours) * 3600
            + i64::from(self.minutes) * 60
            + i64::from(self.seconds)
    }

    /// Saturates at `TimeDelta::MAX` for periods chrono cannot represent.
    pub fn to_duration(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.total_seconds()).unwrap_or(TimeDelta::MAX)
    }

    /// `Y-MM-DDD HH:MM:SS` rendering stored alongside tasks.
    pub fn formatted(&self) -> String {
        format!(
            "{}-{:02}-{:03} {:02}:{:02}:{:02}",
            self.years, self.months, self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// Parse a free-form periodicity string such as `"1 2:30"` or `"0-1-0 0:0:0"`.
pub fn normalize_period(text: &str) -> Result<Period> {
    let text = text.trim();
    let (caps, fields) = PERIOD_SHAPES
        .iter()
        .find_map(|(re, fields)| re.captures(text).map(|caps| (caps, *fields)))
        .ok_or_else(|| AkrunError::InvalidTimeFormat(format!("unrecognized period '{text}'")))?;

    let mut period = Period::default();
    for (idx, field) in fields.iter().enumerate() {
        let raw = &caps[idx + 1];
        let value: u32 = raw.parse().map_err(|_| {
            AkrunError::InvalidTimeFormat(format!("period component '{raw}' out of range"))
        })?;
        match field {
            Field::Years => period.years = value,
            Field::Months => period.months = value,
            Field::Days => period.days = value,
            Field::Hours => period.hours = value,
            Field::Minutes => period.minutes = value,
            Field::Seconds => period.seconds = value,
        }
    }

    if period.is_calendar() && period.has_fixed_length_part() {
        return Err(AkrunError::AmbiguousPeriod(text.to_string()));
    }
    if period.total_seconds() > MAX_PERIOD_DAYS * SECONDS_PER_DAY {
        return Err(AkrunError::InvalidTimeFormat(format!(
            "period '{text}' is longer than {MAX_PERIOD_DAYS} days"
        )));
    }
    Ok(period)
}

/// Parse a time of day written as `HH:MM` or `HH:MM:SS`.
pub fn parse_clock(text: &str) -> Result<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .map_err(|_| AkrunError::InvalidTimeFormat(format!("invalid time of day '{text}'")))
}

/// Parse a requested start time; empty means `now`, a bare time of day means today.
pub fn parse_time_to_start(text: Option<&str>, now: NaiveDateTime) -> Result<NaiveDateTime> {
    let text = match text.map(str::trim) {
        None | Some("") => return Ok(now.with_nanosecond(0).unwrap_or(now)),
        Some(text) => text,
    };

    // chrono's %Y accepts two-digit years, so pick the year width up front
    let long_year = text.split('-').next().is_some_and(|year| year.len() == 4);
    let (datetime_formats, date_format) = if long_year {
        (["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"], "%Y-%m-%d")
    } else {
        (["%y-%m-%d %H:%M:%S", "%y-%m-%d %H:%M"], "%y-%m-%d")
    };
    for format in datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, date_format) {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    if let Ok(time) = parse_clock(text) {
        return Ok(now.date().and_time(time));
    }
    Err(AkrunError::InvalidTimeFormat(format!(
        "incorrect date-time format for time_to_start: '{text}'"
    )))
}

pub fn format_time(dt: NaiveDateTime) -> String {
    dt.format(TIME_FORMAT).to_string()
}

pub fn parse_time(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), TIME_FORMAT)
        .map_err(|_| AkrunError::InvalidTimeFormat(format!("invalid timestamp '{text}'")))
}

pub fn now_local() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Time-of-day window a recurring task may start in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl StartWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self {
            start: parse_clock(start)?,
            end: parse_clock(end)?,
        })
    }

    /// Window named by a task's `window_start`/`window_end` parameters.
    ///
    /// `None` when neither is set. Naming only one end, or a value that is not
    /// a `HH:MM[:SS]` string, is an error.
    pub fn from_task_param(task_param: &Map<String, Value>) -> Result<Option<Self>> {
        let clock = |key: &str| match task_param.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => Ok(Some(raw.as_str())),
            Some(other) => Err(AkrunError::InvalidTimeFormat(format!(
                "{key} must be a time of day, got {other}"
            ))),
        };
        match (clock("window_start")?, clock("window_end")?) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => Self::parse(start, end).map(Some),
            _ => Err(AkrunError::InvalidRequest(
                "window_start and window_end must be given together".to_string(),
            )),
        }
    }
}

/// Random `(day, second)` offsets from the midnight preceding the period start.
fn sample_offsets<R: Rng + ?Sized>(rng: &mut R, period: &Period, window: StartWindow) -> (i64, i64) {
    let duration = period.to_duration();
    let days = duration.num_days();
    let remaining = (duration - TimeDelta::days(days)).num_seconds();

    let lower = i64::from(window.start.num_seconds_from_midnight());
    let mut upper = i64::from(window.end.num_seconds_from_midnight());
    if upper < lower {
        // window wraps past midnight
        upper += SECONDS_PER_DAY;
    }

    if days > 1 {
        let day = rng.gen_range(0..=days);
        let second = rng.gen_range(lower..=upper + remaining);
        (day, second)
    } else {
        (0, rng.gen_range(lower..=upper))
    }
}

fn out_of_range(from: NaiveDateTime) -> AkrunError {
    AkrunError::InvalidTimeFormat(format!("next run after {} is out of range", format_time(from)))
}

/// Randomized start of the occurrence beginning at `start`, kept inside `window`.
pub fn next_start_with<R: Rng + ?Sized>(
    rng: &mut R,
    start: NaiveDateTime,
    period: &Period,
    window: StartWindow,
) -> Result<NaiveDateTime> {
    let midnight = start.date().and_time(NaiveTime::MIN);
    let (day, second) = sample_offsets(rng, period, window);
    TimeDelta::try_days(day)
        .and_then(|days| days.checked_add(&TimeDelta::try_seconds(second)?))
        .and_then(|offset| midnight.checked_add_signed(offset))
        .ok_or_else(|| out_of_range(start))
}

pub fn next_start(
    start: NaiveDateTime,
    period: &Period,
    window: StartWindow,
) -> Result<NaiveDateTime> {
    next_start_with(&mut rand::thread_rng(), start, period, window)
}

/// First `previous + k * period` (k >= 1) that lies after `now`.
pub fn next_occurrence(
    previous: NaiveDateTime,
    period: &Period,
    now: NaiveDateTime,
) -> Result<NaiveDateTime> {
    let step = period.to_duration();
    if step <= TimeDelta::zero() {
        return Err(AkrunError::InvalidTimeFormat(
            "repeating period must be longer than zero".to_string(),
        ));
    }
    let advance = |from: NaiveDateTime, by: TimeDelta| {
        from.checked_add_signed(by).ok_or_else(|| out_of_range(previous))
    };
    let mut next = advance(previous, step)?;
    if next <= now {
        let behind = (now - next).num_seconds() / step.num_seconds().max(1);
        let skip = i32::try_from(behind)
            .ok()
            .and_then(|periods| step.checked_mul(periods))
            .ok_or_else(|| out_of_range(previous))?;
        next = advance(next, skip)?;
        while next <= now {
            next = advance(next, step)?;
        }
    }
    Ok(next)
}
