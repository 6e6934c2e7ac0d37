//! Standard 5-field cron expressions (minute hour day-of-month month
//! day-of-week) with lists, ranges, and steps, evaluated on the UTC wall
//! clock.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression {found:?} must have exactly 5 fields")]
    WrongFieldCount { found: String },
    #[error("bad cron field {value:?} for {field}")]
    BadField { field: &'static str, value: String },
    #[error("cron field {field} value {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// One cron field, kept as a bitmask over its valid values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    mask: u64,
    /// True when the field named explicit values rather than `*`.
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.mask & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

/// How far ahead `next_after` searches before giving up. Five years covers
/// the rarest valid combination (Feb 29).
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(CronError::WrongFieldCount {
                found: expr.to_string(),
            });
        };

        Ok(Self {
            minute: parse_field(minute, "minute", 0, 59)?,
            hour: parse_field(hour, "hour", 0, 23)?,
            day_of_month: parse_field(dom, "day-of-month", 1, 31)?,
            month: parse_field(month, "month", 1, 12)?,
            day_of_week: parse_dow_field(dow)?,
        })
    }

    /// The first activation strictly after `after`, or None when no
    /// activation exists within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after + Duration::seconds(60 - i64::from(after.second()) % 60);
        let start = start.with_nanosecond(0)?.with_second(0)?;

        let first_day = start.date_naive();
        for day_offset in 0..SEARCH_HORIZON_DAYS {
            let date = first_day + Duration::days(day_offset);
            if !self.day_matches(date) {
                continue;
            }

            let from_minute = if day_offset == 0 {
                start.hour() * 60 + start.minute()
            } else {
                0
            };

            for hour in 0..24u32 {
                if !self.hour.contains(hour) {
                    continue;
                }
                for minute in 0..60u32 {
                    if hour * 60 + minute < from_minute || !self.minute.contains(minute) {
                        continue;
                    }
                    let time = date.and_hms_opt(hour, minute, 0)?;
                    return Some(Utc.from_utc_datetime(&time));
                }
            }
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.month.contains(date.month()) {
            return false;
        }

        let dom_ok = self.day_of_month.contains(date.day());
        let dow_ok = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());

        // Standard cron rule: when both day fields are restricted, a day
        // matching either one fires.
        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom_ok || dow_ok,
            _ => dom_ok && dow_ok,
        }
    }
}

fn parse_field(value: &str, field: &'static str, min: u32, max: u32) -> Result<Field, CronError> {
    let bad = || CronError::BadField {
        field,
        value: value.to_string(),
    };

    let mut mask = 0u64;
    let mut restricted = false;

    for part in value.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| bad())?;
                if step == 0 {
                    return Err(bad());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else {
            restricted = true;
            match range_part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.parse().map_err(|_| bad())?;
                    let hi: u32 = hi.parse().map_err(|_| bad())?;
                    if lo > hi {
                        return Err(bad());
                    }
                    (lo, hi)
                }
                None => {
                    let single: u32 = range_part.parse().map_err(|_| bad())?;
                    (single, single)
                }
            }
        };

        for bound in [lo, hi] {
            if bound < min || bound > max {
                return Err(CronError::OutOfRange {
                    field,
                    value: bound,
                    min,
                    max,
                });
            }
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }

        // `*/n` restricts the field even though it spans the full range.
        if step > 1 {
            restricted = true;
        }
    }

    Ok(Field { mask, restricted })
}

fn parse_dow_field(value: &str) -> Result<Field, CronError> {
    // Accept 7 as an alias for Sunday before the range check.
    let normalized = value
        .split(',')
        .map(|part| part.replace('7', "0"))
        .collect::<Vec<_>>()
        .join(",");
    parse_field(&normalized, "day-of-week", 0, 6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_minute_fires_on_the_next_minute_boundary() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let next = schedule.next_after(at(2024, 3, 1, 10, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 1, 10, 1));
    }

    #[test]
    fn next_is_strictly_after_even_mid_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let mid = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap();
        assert_eq!(schedule.next_after(mid).unwrap(), at(2024, 3, 1, 10, 1));
    }

    #[test]
    fn step_fields_fire_on_multiples() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 10, 0)).unwrap(),
            at(2024, 3, 1, 10, 15)
        );
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 10, 50)).unwrap(),
            at(2024, 3, 1, 11, 0)
        );
    }

    #[test]
    fn fixed_time_rolls_to_the_next_day() {
        let schedule = CronSchedule::parse("30 4 * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 5, 0)).unwrap(),
            at(2024, 3, 2, 4, 30)
        );
    }

    #[test]
    fn day_of_week_restriction_skips_to_the_weekday() {
        // 2024-03-01 is a Friday; 1 = Monday.
        let schedule = CronSchedule::parse("0 9 * * 1").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 10, 0)).unwrap(),
            at(2024, 3, 4, 9, 0)
        );
    }

    #[test]
    fn sunday_alias_seven_is_accepted() {
        let by_zero = CronSchedule::parse("0 9 * * 0").unwrap();
        let by_seven = CronSchedule::parse("0 9 * * 7").unwrap();
        let from = at(2024, 3, 1, 0, 0);
        assert_eq!(by_zero.next_after(from), by_seven.next_after(from));
    }

    #[test]
    fn restricted_dom_and_dow_fire_on_either() {
        // Day 15 or any Monday, whichever comes first.
        let schedule = CronSchedule::parse("0 0 15 * 1").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 0, 0)).unwrap(),
            at(2024, 3, 4, 0, 0)
        );
        assert_eq!(
            schedule.next_after(at(2024, 3, 12, 0, 0)).unwrap(),
            at(2024, 3, 15, 0, 0)
        );
    }

    #[test]
    fn lists_and_ranges_combine() {
        let schedule = CronSchedule::parse("0,30 8-10 * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 8, 30)).unwrap(),
            at(2024, 3, 1, 9, 0)
        );
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 10, 30)).unwrap(),
            at(2024, 3, 2, 8, 0)
        );
    }

    #[test]
    fn february_29_waits_for_a_leap_year() {
        let schedule = CronSchedule::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 0, 0)).unwrap(),
            at(2028, 2, 29, 0, 0)
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "61 * * * *",
            "a * * * *",
            "*/0 * * * *",
            "10-5 * * * *",
            "* 25 * * *",
            "* * 0 * *",
        ] {
            assert!(CronSchedule::parse(expr).is_err(), "expected {expr:?} to fail");
        }
    }
}
