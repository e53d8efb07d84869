//! Cron expression compilation and next-instant search.
//!
//! An expression is six whitespace-separated fields in the order
//! `second minute hour day-of-month month day-of-week`. Each field is a
//! comma-separated list of items; an item is `*`, a single value `N`, a
//! range `A-B`, or a step form `A/S`, `A-B/S`, `*/S`. Months accept
//! `JAN`..`DEC` and weekdays `MON`..`SUN`, case-insensitive. Weekdays are
//! numbered 1-7 with Monday = 1; `0` and `7` both mean Sunday.
//!
//! Each field compiles to a single `u64` bitmask (bit *i* set iff value *i*
//! is allowed), so matching a candidate instant is six bit tests.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::error::{Result, SchedulerError};

/// Upper bound on field rollovers before the search gives up. Guards
/// against expressions that can never match, such as February 30.
const MAX_ROLLOVERS: usize = 366;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

struct FieldSpec {
    kind: FieldKind,
    name: &'static str,
    min: u32,
    max: u32,
}

const SECOND: FieldSpec = FieldSpec { kind: FieldKind::Second, name: "second", min: 0, max: 59 };
const MINUTE: FieldSpec = FieldSpec { kind: FieldKind::Minute, name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { kind: FieldKind::Hour, name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec =
    FieldSpec { kind: FieldKind::DayOfMonth, name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { kind: FieldKind::Month, name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec =
    FieldSpec { kind: FieldKind::DayOfWeek, name: "day-of-week", min: 1, max: 7 };

/// A compiled cron expression: one bitmask per field, never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

impl CronExpression {
    /// Compile a six-field cron string.
    ///
    /// # Errors
    ///
    /// `InvalidCronExpression` when the field count is not six, an item is
    /// empty, a step is missing/zero/non-numeric, a value is out of range,
    /// a range minimum exceeds its maximum, or a symbolic name is unknown.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.is_empty() {
            return Err(SchedulerError::InvalidCronExpression(
                "expression must not be empty".to_string(),
            ));
        }
        if fields.len() != 6 {
            return Err(SchedulerError::InvalidCronExpression(format!(
                "expected 6 fields, found {} in \"{}\"",
                fields.len(),
                expression
            )));
        }

        // User input 0 and 7 both mean Sunday; internally only bit 7 is used.
        let mut days_of_week = parse_field(fields[5], &DAY_OF_WEEK)?;
        if days_of_week & 1 != 0 {
            days_of_week = (days_of_week & !1) | (1 << 7);
        }

        Ok(Self {
            seconds: parse_field(fields[0], &SECOND)?,
            minutes: parse_field(fields[1], &MINUTE)?,
            hours: parse_field(fields[2], &HOUR)?,
            days_of_month: parse_field(fields[3], &DAY_OF_MONTH)?,
            months: parse_field(fields[4], &MONTH)?,
            days_of_week,
        })
    }

    /// The smallest instant strictly after `after` whose local components in
    /// `after`'s zone satisfy every field, or `None` when the search rolls
    /// over more than [`MAX_ROLLOVERS`] times without converging.
    ///
    /// Day-of-month and day-of-week are enforced as a conjunction; a field
    /// whose mask covers its full range restricts nothing, so the joint test
    /// degenerates to the other field.
    pub fn next_after<Tz: TimeZone>(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let zone = after.timezone();

        // The answer is at second resolution and strictly after the anchor,
        // so start from the next whole second.
        let mut t = after.naive_local().with_nanosecond(0)? + Duration::seconds(1);

        for _ in 0..MAX_ROLLOVERS {
            let month = t.month();
            if !bit_set(self.months, month) {
                t = match next_set_bit(self.months, month) {
                    Some(m) => month_start(t.year(), m)?,
                    None => month_start(t.year() + 1, self.months.trailing_zeros())?,
                };
                continue;
            }

            match self.next_day_in_month(t.year(), t.month(), t.day()) {
                Some(day) if day != t.day() => {
                    t = NaiveDate::from_ymd_opt(t.year(), t.month(), day)?.and_hms_opt(0, 0, 0)?;
                }
                Some(_) => {}
                None => {
                    t = match next_set_bit(self.months, t.month() + 1) {
                        Some(m) => month_start(t.year(), m)?,
                        None => month_start(t.year() + 1, self.months.trailing_zeros())?,
                    };
                    continue;
                }
            }

            if !bit_set(self.hours, t.hour()) {
                match next_set_bit(self.hours, t.hour()) {
                    Some(h) => t = t.date().and_hms_opt(h, 0, 0)?,
                    None => {
                        t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                        continue;
                    }
                }
            }

            if !bit_set(self.minutes, t.minute()) {
                match next_set_bit(self.minutes, t.minute()) {
                    Some(m) => t = t.with_minute(m)?.with_second(0)?,
                    None => {
                        t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                        continue;
                    }
                }
            }

            if !bit_set(self.seconds, t.second()) {
                match next_set_bit(self.seconds, t.second()) {
                    Some(s) => t = t.with_second(s)?,
                    None => {
                        t = t.with_second(0)? + Duration::minutes(1);
                        continue;
                    }
                }
            }

            match zone.from_local_datetime(&t) {
                LocalResult::Single(resolved) => return Some(resolved),
                LocalResult::Ambiguous(earliest, _) => return Some(earliest),
                // The candidate falls in a DST gap; skip past it and retry.
                LocalResult::None => t += Duration::hours(1),
            }
        }

        None
    }

    /// First day >= `from_day` in the given month satisfying both the
    /// day-of-month and day-of-week masks.
    fn next_day_in_month(&self, year: i32, month: u32, from_day: u32) -> Option<u32> {
        let last = days_in_month(year, month);
        (from_day..=last).find(|&day| {
            bit_set(self.days_of_month, day)
                && NaiveDate::from_ymd_opt(year, month, day)
                    .map(|date| bit_set(self.days_of_week, date.weekday().number_from_monday()))
                    .unwrap_or(false)
        })
    }
}

impl std::str::FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Fold one field's comma-separated items into a bitmask.
fn parse_field(value: &str, field: &FieldSpec) -> Result<u64> {
    if value.is_empty() {
        return Err(SchedulerError::InvalidCronExpression(format!(
            "the {} field must not be empty",
            field.name
        )));
    }

    let value = match field.kind {
        FieldKind::Month => replace_ordinals(value, &MONTH_NAMES),
        FieldKind::DayOfWeek => replace_ordinals(value, &DAY_NAMES),
        _ => value.to_string(),
    };

    let mut bits = 0u64;

    for item in value.split(',') {
        if item.is_empty() {
            return Err(SchedulerError::InvalidCronExpression(format!(
                "empty item in the {} field",
                field.name
            )));
        }

        let ((min, max), step) = match item.split_once('/') {
            Some((range_str, step_str)) => {
                let (min, mut max) = parse_range(range_str, field)?;
                // `A/S` without an explicit upper bound runs to the field
                // maximum.
                if !range_str.contains('-') {
                    max = field.max;
                }
                let step: i64 = step_str.parse().map_err(|_| {
                    SchedulerError::InvalidCronExpression(format!(
                        "step must be a number: \"{step_str}\""
                    ))
                })?;
                if step <= 0 {
                    return Err(SchedulerError::InvalidCronExpression(format!(
                        "step must be 1 or higher in \"{item}\""
                    )));
                }
                ((min, max), step as u32)
            }
            None => (parse_range(item, field)?, 1),
        };

        let mut v = min;
        while v <= max {
            bits |= 1u64 << v;
            v += step;
        }
    }

    Ok(bits)
}

/// Parse `*`, a single value, or `A-B` into an inclusive range.
fn parse_range(value: &str, field: &FieldSpec) -> Result<(u32, u32)> {
    if value == "*" {
        return Ok((field.min, field.max));
    }

    match value.split_once('-') {
        None => {
            let v = parse_value(value, field)?;
            Ok((v, v))
        }
        Some((min_str, max_str)) => {
            let mut min = parse_value(min_str, field)?;
            let max = parse_value(max_str, field)?;
            // `SUN-x` wraps to the week start rather than inverting the range.
            if field.kind == FieldKind::DayOfWeek && min == 7 {
                min = 0;
            }
            if min > max {
                return Err(SchedulerError::InvalidCronExpression(format!(
                    "range minimum exceeds maximum in \"{value}\" for the {} field",
                    field.name
                )));
            }
            Ok((min, max))
        }
    }
}

fn parse_value(value: &str, field: &FieldSpec) -> Result<u32> {
    let v: u32 = value.parse().map_err(|_| {
        SchedulerError::InvalidCronExpression(format!(
            "the {} field must be a number: \"{value}\"",
            field.name
        ))
    })?;

    if field.kind == FieldKind::DayOfWeek && v == 0 {
        return Ok(0);
    }

    if v < field.min || v > field.max {
        return Err(SchedulerError::InvalidCronExpression(format!(
            "the {} field must be between {} and {}, got {v}",
            field.name, field.min, field.max
        )));
    }

    Ok(v)
}

/// Replace three-letter symbolic names with their one-based position.
fn replace_ordinals(value: &str, names: &[&str]) -> String {
    let mut value = value.to_uppercase();
    for (index, name) in names.iter().enumerate() {
        value = value.replace(name, &(index + 1).to_string());
    }
    value
}

fn bit_set(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

/// Lowest set bit at or above `from`, if any.
fn next_set_bit(mask: u64, from: u32) -> Option<u32> {
    let masked = mask & (u64::MAX << from);
    if masked == 0 {
        None
    } else {
        Some(masked.trailing_zeros())
    }
}

fn month_start(year: i32, month: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn is_leap_year(year: i32) -> bool {
    year % 400 == 0 || (year % 100 != 0 && year % 4 == 0)
}
