//! Tabular (civil) Islamic calendar arithmetic.
//!
//! The 30-year arithmetic cycle with leap years
//! {2, 5, 7, 10, 13, 16, 18, 21, 24, 26, 29} is used, which keeps date
//! resolution deterministic and testable. Anchors: AH 1445-01-01 is
//! 2023-07-19, AH 1447-01-01 is 2025-06-27.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

/// JDN offset of the proleptic-Gregorian day count chrono uses.
const JDN_DAYS_FROM_CE: i64 = 1_721_425;
/// JDN of the day before AH 1 Muharram 1.
const ISLAMIC_EPOCH: i64 = 1_948_439;

const MONTH_NAMES: &[(&str, u32)] = &[
    ("muharram", 1),
    ("safar", 2),
    ("rabialawwal", 3),
    ("rabiulawwal", 3),
    ("rabialthani", 4),
    ("rabiulthani", 4),
    ("rabialakhir", 4),
    ("jumadaalawwal", 5),
    ("jumadaalula", 5),
    ("jumadaalthani", 6),
    ("jumadaalakhirah", 6),
    ("jumadaalakhira", 6),
    ("rajab", 7),
    ("shaban", 8),
    ("ramadan", 9),
    ("ramadhan", 9),
    ("shawwal", 10),
    ("dhualqadah", 11),
    ("dhulqadah", 11),
    ("dhualhijjah", 12),
    ("dhulhijjah", 12),
];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HijriError {
    #[error("invalid hijri date '{0}': expected '<day> <month name>'")]
    Format(String),
    #[error("unknown hijri month '{0}'")]
    UnknownMonth(String),
    #[error("invalid hijri day {0}")]
    Day(u32),
    #[error("invalid time '{0}'")]
    Time(String),
}

fn is_leap_year(year: i64) -> bool {
    (11 * year + 14).rem_euclid(30) < 11
}

fn month_length(year: i64, month: u32) -> u32 {
    if month == 12 && is_leap_year(year) {
        30
    } else if month % 2 == 1 {
        30
    } else {
        29
    }
}

fn to_jdn(year: i64, month: u32, day: u32) -> i64 {
    day as i64
        + (59 * (month as i64 - 1) + 1) / 2
        + 354 * (year - 1)
        + (3 + 11 * year).div_euclid(30)
        + ISLAMIC_EPOCH
}

fn jdn_to_date(jdn: i64) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt((jdn - JDN_DAYS_FROM_CE) as i32)
}

/// Gregorian date of a tabular Islamic date; None when the day does not
/// exist in that month of that year.
pub fn to_gregorian(year: i64, month: u32, day: u32) -> Option<NaiveDate> {
    if !(1..=12).contains(&month) || day < 1 || day > month_length(year, month) {
        return None;
    }
    jdn_to_date(to_jdn(year, month, day))
}

fn approximate_year(date: NaiveDate) -> i64 {
    let jdn = date.num_days_from_ce() as i64 + JDN_DAYS_FROM_CE;
    (30 * (jdn - ISLAMIC_EPOCH) + 10646).div_euclid(10631)
}

/// Parse "<day> <month name>"; month names are matched case-insensitively
/// with apostrophes, hyphens, and spaces ignored.
pub fn parse_date(spec: &str) -> Result<(u32, u32), HijriError> {
    let mut parts = spec.split_whitespace();
    let day: u32 = parts
        .next()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| HijriError::Format(spec.to_string()))?;
    let name: String = parts.collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(HijriError::Format(spec.to_string()));
    }
    if day < 1 || day > 30 {
        return Err(HijriError::Day(day));
    }

    let normalized: String = name
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect();
    let month = MONTH_NAMES
        .iter()
        .find(|(candidate, _)| *candidate == normalized)
        .map(|(_, month)| *month)
        .ok_or(HijriError::UnknownMonth(name))?;
    Ok((day, month))
}

/// Parse a trigger time: "HH:MM", "HH:MM:SS", optionally suffixed with "Z"
/// or a "+HH:MM"/"-HH:MM" offset. Defaults to midnight UTC when absent.
pub fn parse_time(spec: Option<&str>) -> Result<(NaiveTime, FixedOffset), HijriError> {
    let spec = match spec {
        Some(spec) => spec.trim(),
        None => return Ok((NaiveTime::MIN, FixedOffset::east_opt(0).unwrap())),
    };
    let err = || HijriError::Time(spec.to_string());

    let (clock, offset) = if let Some(stripped) = spec.strip_suffix('Z') {
        (stripped, FixedOffset::east_opt(0).unwrap())
    } else if let Some(position) = spec.rfind(['+', '-']).filter(|&p| p > 0) {
        let (clock, raw_offset) = spec.split_at(position);
        let sign = if raw_offset.starts_with('-') { -1 } else { 1 };
        let body = &raw_offset[1..];
        let (hours, minutes) = body.split_once(':').ok_or_else(err)?;
        let hours: i32 = hours.parse().map_err(|_| err())?;
        let minutes: i32 = minutes.parse().map_err(|_| err())?;
        let offset =
            FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(err)?;
        (clock, offset)
    } else {
        (spec, FixedOffset::east_opt(0).unwrap())
    };

    let time = NaiveTime::parse_from_str(clock, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(clock, "%H:%M:%S"))
        .map_err(|_| err())?;
    Ok((time, offset))
}

/// The next instant at or after `now` on which `(day, month)` falls,
/// combined with the trigger time.
pub fn next_occurrence(
    day: u32,
    month: u32,
    time: NaiveTime,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let estimate = approximate_year(now.date_naive());
    for year in estimate - 1..=estimate + 2 {
        let date = match to_gregorian(year, month, day) {
            Some(date) => date,
            // Day 30 of a 29-day month this year; try the next one.
            None => continue,
        };
        let instant = offset
            .from_local_datetime(&date.and_time(time))
            .single()?
            .with_timezone(&Utc);
        if instant >= now {
            return Some(instant);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn new_year_anchors() {
        assert_eq!(
            to_gregorian(1445, 1, 1),
            NaiveDate::from_ymd_opt(2023, 7, 19)
        );
        assert_eq!(
            to_gregorian(1446, 1, 1),
            NaiveDate::from_ymd_opt(2024, 7, 8)
        );
        assert_eq!(
            to_gregorian(1447, 1, 1),
            NaiveDate::from_ymd_opt(2025, 6, 27)
        );
    }

    #[test]
    fn ashura_falls_nine_days_after_new_year() {
        assert_eq!(
            to_gregorian(1446, 1, 10),
            NaiveDate::from_ymd_opt(2024, 7, 17)
        );
    }

    #[test]
    fn leap_year_cycle() {
        assert!(is_leap_year(1445)); // 1445 % 30 == 5
        assert!(!is_leap_year(1446));
        assert_eq!(month_length(1445, 12), 30);
        assert_eq!(month_length(1446, 12), 29);
        assert!(to_gregorian(1446, 12, 30).is_none());
    }

    #[test]
    fn parse_date_normalises_month_names() {
        assert_eq!(parse_date("1 Muharram"), Ok((1, 1)));
        assert_eq!(parse_date("27 ramadan"), Ok((27, 9)));
        assert_eq!(parse_date("10 Dhu al-Hijjah"), Ok((10, 12)));
        assert_eq!(parse_date("12 Rabi' al-awwal"), Ok((12, 3)));
        assert!(matches!(
            parse_date("1 Nonsense"),
            Err(HijriError::UnknownMonth(_))
        ));
        assert!(matches!(parse_date("Muharram"), Err(HijriError::Format(_))));
        assert!(matches!(parse_date("31 Muharram"), Err(HijriError::Day(31))));
    }

    #[test]
    fn parse_time_variants() {
        let (time, offset) = parse_time(None).expect("default");
        assert_eq!(time, NaiveTime::MIN);
        assert_eq!(offset.local_minus_utc(), 0);

        let (time, _) = parse_time(Some("10:00")).expect("hh:mm");
        assert_eq!(time.hour(), 10);

        let (time, offset) = parse_time(Some("10:30:15+02:00")).expect("offset");
        assert_eq!((time.hour(), time.minute(), time.second()), (10, 30, 15));
        assert_eq!(offset.local_minus_utc(), 7200);

        assert!(parse_time(Some("25:00")).is_err());
        assert!(parse_time(Some("not a time")).is_err());
    }

    #[test]
    fn next_occurrence_resolves_forward() {
        let now = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
        let (time, offset) = parse_time(Some("10:00")).expect("time");
        let next = next_occurrence(1, 1, time, offset, now).expect("occurrence");
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 27, 10, 0, 0).unwrap());
    }

    #[test]
    fn next_occurrence_includes_today() {
        // 1 Muharram 1446 is 2024-07-08; at 00:00 that morning the 10:00
        // firing is still ahead.
        let now = Utc.with_ymd_and_hms(2024, 7, 8, 0, 0, 0).unwrap();
        let (time, offset) = parse_time(Some("10:00")).expect("time");
        let next = next_occurrence(1, 1, time, offset, now).expect("occurrence");
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 7, 8, 10, 0, 0).unwrap());
    }
}
