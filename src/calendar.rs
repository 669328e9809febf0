//! Wall-clock arithmetic: time-of-day strings, date ranges, weekdays and
//! conversions between local calendar time and instants.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::model::Ms;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    #[error("malformed time of day {0:?}, expected HH:MM")]
    MalformedTime(String),
    #[error("malformed date {0:?}, expected YYYY-MM-DD")]
    MalformedDate(String),
    #[error("malformed local date-time {0:?}, expected YYYY-MM-DDTHH:MM")]
    MalformedDateTime(String),
    #[error("{0} does not exist in the business timezone")]
    NonexistentLocalTime(String),
}

/// "HH:MM" → minutes since midnight. "24:00" is accepted as end of day.
pub fn parse_time_of_day(s: &str) -> Result<u16, CalendarError> {
    let bad = || CalendarError::MalformedTime(s.to_string());
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(bad());
    }
    let h: u16 = h.parse().map_err(|_| bad())?;
    let m: u16 = m.parse().map_err(|_| bad())?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

/// Minutes since midnight → zero-padded "HH:MM".
pub fn format_time_of_day(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| CalendarError::MalformedDate(s.to_string()))
}

/// "YYYY-MM-DDTHH:MM" (a space is accepted in place of `T`), seconds optional.
pub fn parse_local_datetime(s: &str) -> Result<NaiveDateTime, CalendarError> {
    let trimmed = s.trim();
    ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| CalendarError::MalformedDateTime(s.to_string()))
}

/// Every date from `start` to `end` inclusive. Empty when `end < start`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    #[serde(alias = "lunes")]
    Monday,
    #[serde(alias = "martes")]
    Tuesday,
    #[serde(alias = "miercoles", alias = "miércoles")]
    Wednesday,
    #[serde(alias = "jueves")]
    Thursday,
    #[serde(alias = "viernes")]
    Friday,
    #[serde(alias = "sabado", alias = "sábado")]
    Saturday,
    #[serde(alias = "domingo")]
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn of(date: NaiveDate) -> Self {
        Self::ALL[date.weekday().num_days_from_monday() as usize]
    }

    /// Monday = 0.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Monday => "monday",
            Weekday::Tuesday => "tuesday",
            Weekday::Wednesday => "wednesday",
            Weekday::Thursday => "thursday",
            Weekday::Friday => "friday",
            Weekday::Saturday => "saturday",
            Weekday::Sunday => "sunday",
        }
    }

    /// Canonical English token or its Spanish name, case-insensitive.
    pub fn from_token(s: &str) -> Option<Self> {
        let token = s.trim().to_lowercase();
        let day = match token.as_str() {
            "monday" | "lunes" => Weekday::Monday,
            "tuesday" | "martes" => Weekday::Tuesday,
            "wednesday" | "miercoles" | "miércoles" => Weekday::Wednesday,
            "thursday" | "jueves" => Weekday::Thursday,
            "friday" | "viernes" => Weekday::Friday,
            "saturday" | "sabado" | "sábado" => Weekday::Saturday,
            "sunday" | "domingo" => Weekday::Sunday,
            _ => return None,
        };
        Some(day)
    }
}

// ── Local time ⇄ instant ─────────────────────────────────────────

/// Instant of `minutes` past local midnight on `date`. `None` inside a DST gap;
/// an ambiguous wall time resolves to its earliest instant. 24:00 is the next
/// day's midnight.
pub fn local_instant(tz: Tz, date: NaiveDate, minutes: u16) -> Option<Ms> {
    let (date, minutes) = if minutes >= MINUTES_PER_DAY {
        (date.succ_opt()?, minutes - MINUTES_PER_DAY)
    } else {
        (date, minutes)
    };
    let time = NaiveTime::from_hms_opt(u32::from(minutes / 60), u32::from(minutes % 60), 0)?;
    instant_of(tz, date.and_time(time))
}

pub fn instant_of(tz: Tz, local: NaiveDateTime) -> Option<Ms> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

pub fn local_datetime(tz: Tz, ms: Ms) -> Option<NaiveDateTime> {
    tz.timestamp_millis_opt(ms).single().map(|dt| dt.naive_local())
}

pub fn local_date(tz: Tz, ms: Ms) -> Option<NaiveDate> {
    local_datetime(tz, ms).map(|dt| dt.date())
}

/// Minutes past local midnight.
pub fn local_minutes(tz: Tz, ms: Ms) -> Option<u16> {
    local_datetime(tz, ms).map(|dt| (dt.hour() * 60 + dt.minute()) as u16)
}

pub fn format_local_time(tz: Tz, ms: Ms) -> Option<String> {
    local_minutes(tz, ms).map(format_time_of_day)
}

/// `[local midnight of date, local midnight of the next day)`.
pub fn day_bounds(tz: Tz, date: NaiveDate) -> Option<(Ms, Ms)> {
    let start = first_instant_of(tz, date)?;
    let end = first_instant_of(tz, date.succ_opt()?)?;
    Some((start, end))
}

/// Local midnight, or the first valid minute after it when midnight itself
/// falls in a DST gap.
fn first_instant_of(tz: Tz, date: NaiveDate) -> Option<Ms> {
    (0..120u16).find_map(|m| local_instant(tz, date, m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Madrid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn time_of_day_roundtrip() {
        for m in 0..MINUTES_PER_DAY {
            assert_eq!(parse_time_of_day(&format_time_of_day(m)), Ok(m));
        }
    }

    #[test]
    fn time_of_day_formats() {
        assert_eq!(format_time_of_day(0), "00:00");
        assert_eq!(format_time_of_day(545), "09:05");
        assert_eq!(parse_time_of_day("9:30"), Ok(570));
        assert_eq!(parse_time_of_day("24:00"), Ok(1440));
    }

    #[test]
    fn time_of_day_rejects_garbage() {
        for bad in ["", "10", "10:5", "25:00", "24:01", "10:60", "ab:cd", "10:00:00", "-1:00"] {
            assert!(parse_time_of_day(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn date_range_single_day() {
        assert_eq!(date_range(d(2025, 1, 1), d(2025, 1, 1)), vec![d(2025, 1, 1)]);
    }

    #[test]
    fn date_range_length_and_order() {
        let start = d(2024, 2, 25);
        let end = d(2024, 3, 5);
        let days = date_range(start, end);
        assert_eq!(days.len() as i64, (end - start).num_days() + 1);
        assert!(days.windows(2).all(|w| (w[1] - w[0]).num_days() == 1));
        assert_eq!(days[4], d(2024, 2, 29));
    }

    #[test]
    fn date_range_empty_when_reversed() {
        assert!(date_range(d(2025, 1, 2), d(2025, 1, 1)).is_empty());
    }

    #[test]
    fn weekday_mapping() {
        assert_eq!(Weekday::of(d(2025, 3, 3)), Weekday::Monday);
        assert_eq!(Weekday::of(d(2025, 3, 9)), Weekday::Sunday);
        assert_eq!(Weekday::of(d(2024, 2, 29)), Weekday::Thursday);
        assert_eq!(Weekday::Sunday.index(), 6);
        assert_eq!(Weekday::from_token("Miércoles"), Some(Weekday::Wednesday));
        assert_eq!(Weekday::from_token("someday"), None);
        for day in Weekday::ALL {
            assert_eq!(Weekday::from_token(day.as_str()), Some(day));
        }
    }

    #[test]
    fn weekday_serde_accepts_spanish() {
        let day: Weekday = serde_json::from_str("\"sabado\"").unwrap();
        assert_eq!(day, Weekday::Saturday);
        assert_eq!(serde_json::to_string(&Weekday::Saturday).unwrap(), "\"saturday\"");
    }

    #[test]
    fn local_instant_winter_and_summer() {
        // CET = UTC+1, CEST = UTC+2
        let winter = local_instant(Madrid, d(2025, 1, 15), 600).unwrap();
        assert_eq!(winter, 1_736_931_600_000); // 2025-01-15T09:00Z
        let summer = local_instant(Madrid, d(2025, 7, 15), 600).unwrap();
        assert_eq!(summer, 1_752_566_400_000); // 2025-07-15T08:00Z
        assert_eq!(local_minutes(Madrid, summer), Some(600));
        assert_eq!(local_date(Madrid, summer), Some(d(2025, 7, 15)));
        assert_eq!(format_local_time(Madrid, winter).as_deref(), Some("10:00"));
    }

    #[test]
    fn dst_gap_has_no_instant() {
        // 02:30 on 2025-03-30 is skipped in Madrid
        assert_eq!(local_instant(Madrid, d(2025, 3, 30), 150), None);
        assert!(local_instant(Madrid, d(2025, 3, 30), 180).is_some());
    }

    #[test]
    fn ambiguous_time_takes_earliest() {
        // 02:30 on 2025-10-26 happens twice; the first is still CEST
        let t = local_instant(Madrid, d(2025, 10, 26), 150).unwrap();
        let expected = chrono::DateTime::parse_from_rfc3339("2025-10-26T02:30:00+02:00")
            .unwrap()
            .timestamp_millis();
        assert_eq!(t, expected);
    }

    #[test]
    fn day_bounds_span_a_short_day() {
        let (start, end) = day_bounds(Madrid, d(2025, 3, 30)).unwrap();
        assert_eq!(end - start, 23 * 3_600_000);
        let (start, end) = day_bounds(Madrid, d(2025, 3, 31)).unwrap();
        assert_eq!(end - start, 24 * 3_600_000);
    }

    #[test]
    fn local_datetime_parsing() {
        let dt = parse_local_datetime("2025-03-03T10:30").unwrap();
        assert_eq!(dt, d(2025, 3, 3).and_hms_opt(10, 30, 0).unwrap());
        assert_eq!(parse_local_datetime("2025-03-03 10:30:00").unwrap(), dt);
        assert!(parse_local_datetime("2025-03-03").is_err());
        assert!(parse_date("2025-02-30").is_err());
    }
}
