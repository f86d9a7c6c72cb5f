use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// The school operates on a single fixed local clock (UTC+7). "Today" for
/// attendance windows and the session edit window is evaluated against it.
pub fn school_tz() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).expect("valid fixed offset")
}

pub fn local_now(now_utc: DateTime<Utc>) -> NaiveDateTime {
    now_utc.with_timezone(&school_tz()).naive_local()
}

pub fn local_today(now_utc: DateTime<Utc>) -> NaiveDate {
    local_now(now_utc).date()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeParseError {
    Date,
    Time,
}

impl TimeParseError {
    pub fn message(&self) -> &'static str {
        match self {
            TimeParseError::Date => "Invalid date format. Use YYYY-MM-DD",
            TimeParseError::Time => "Invalid time format. Use HH:MM or HH:MM:SS",
        }
    }
}

/// Parse a calendar date from user input. Accepts `YYYY-MM-DD`, optionally
/// followed by a `T...` time suffix (an ISO date-time is unambiguous, so the
/// date part is taken). Ambiguous forms like `MM/DD/YYYY` are rejected.
pub fn parse_date(input: &str) -> Result<NaiveDate, TimeParseError> {
    let date_part = match input.split_once('T') {
        Some((date, _)) => date,
        None => input,
    };
    NaiveDate::parse_from_str(date_part.trim(), "%Y-%m-%d").map_err(|_| TimeParseError::Date)
}

/// Parse a time of day from user input. Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time(input: &str) -> Result<NaiveTime, TimeParseError> {
    let trimmed = input.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| TimeParseError::Time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_iso_date() {
        assert_eq!(
            parse_date("2025-03-03"),
            Ok(NaiveDate::from_ymd_opt(2025, 3, 3).unwrap())
        );
    }

    #[test]
    fn parses_date_from_iso_datetime() {
        assert_eq!(
            parse_date("2025-03-03T09:00:00"),
            Ok(NaiveDate::from_ymd_opt(2025, 3, 3).unwrap())
        );
    }

    #[test]
    fn rejects_ambiguous_date_formats() {
        assert_eq!(parse_date("03/04/2025"), Err(TimeParseError::Date));
        assert_eq!(parse_date("2025/03/04"), Err(TimeParseError::Date));
        assert_eq!(parse_date("yesterday"), Err(TimeParseError::Date));
    }

    #[test]
    fn parses_time_with_and_without_seconds() {
        assert_eq!(
            parse_time("09:30"),
            Ok(NaiveTime::from_hms_opt(9, 30, 0).unwrap())
        );
        assert_eq!(
            parse_time("09:30:15"),
            Ok(NaiveTime::from_hms_opt(9, 30, 15).unwrap())
        );
    }

    #[test]
    fn rejects_bad_times() {
        assert_eq!(parse_time("25:00"), Err(TimeParseError::Time));
        assert_eq!(parse_time("9am"), Err(TimeParseError::Time));
        assert_eq!(parse_time(""), Err(TimeParseError::Time));
    }

    #[test]
    fn local_today_rolls_over_at_utc17() {
        // 17:30 UTC on March 3rd is already March 4th at UTC+7.
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 17, 30, 0).unwrap();
        assert_eq!(
            local_today(now),
            NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
        );
        let earlier = Utc.with_ymd_and_hms(2025, 3, 3, 16, 30, 0).unwrap();
        assert_eq!(
            local_today(earlier),
            NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
        );
    }
}
