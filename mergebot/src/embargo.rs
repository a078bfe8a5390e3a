//! Merge embargoes: a union of time windows during which no merge may happen.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    // "Friday 1pm" / "Friday 13:00" / "Monday 9am"
    static ref WEEKLY_RE: Regex = Regex::new(
        r"(?ix)^\s*
        (?P<day>monday|tuesday|wednesday|thursday|friday|saturday|sunday)
        \s+
        (?P<hour>\d{1,2})(?::(?P<minute>\d{2}))?
        \s*(?P<ampm>am|pm)?
        \s*$"
    ).unwrap();
}

/// Errors parsing an embargo specification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EmbargoError {
    /// A single interval endpoint couldn't be parsed.
    #[error("could not parse embargo time {:?}", text)]
    BadEndpoint {
        /// The text that failed to parse.
        text: String,
    },
    /// An interval was missing its separator.
    #[error("expected \"<start> - <end>\" in embargo interval {:?}", text)]
    BadInterval {
        /// The text that failed to parse.
        text: String,
    },
}

impl EmbargoError {
    fn bad_endpoint(text: &str) -> Self {
        EmbargoError::BadEndpoint {
            text: text.into(),
        }
    }

    fn bad_interval(text: &str) -> Self {
        EmbargoError::BadInterval {
            text: text.into(),
        }
    }
}

type EmbargoResult<T> = Result<T, EmbargoError>;

fn weekday_from_name(name: &str) -> Weekday {
    match name.to_lowercase().as_str() {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

/// A point within a repeating 7-day week, in whole minutes since Monday 00:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WeeklyInstant(u32);

impl WeeklyInstant {
    fn parse(text: &str) -> EmbargoResult<Self> {
        let caps = WEEKLY_RE
            .captures(text)
            .ok_or_else(|| EmbargoError::bad_endpoint(text))?;

        let day = weekday_from_name(&caps["day"]);
        let mut hour: u32 = caps["hour"]
            .parse()
            .map_err(|_| EmbargoError::bad_endpoint(text))?;
        let minute: u32 = caps
            .name("minute")
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0);

        if let Some(ampm) = caps.name("ampm") {
            let is_pm = ampm.as_str().eq_ignore_ascii_case("pm");
            hour %= 12;
            if is_pm {
                hour += 12;
            }
        }

        if hour > 23 || minute > 59 {
            return Err(EmbargoError::bad_endpoint(text));
        }

        let minutes = day.num_days_from_monday() * 24 * 60 + hour * 60 + minute;
        Ok(WeeklyInstant(minutes))
    }

    fn of(instant: DateTime<Utc>) -> Self {
        let day = instant.weekday().num_days_from_monday();
        let minutes = day * 24 * 60 + instant.hour() * 60 + instant.minute();
        WeeklyInstant(minutes)
    }
}

/// A single recurring weekly window, e.g. "Friday 1pm - Monday 9am".
#[derive(Debug, Clone, Copy)]
struct WeeklyWindow {
    start: WeeklyInstant,
    end: WeeklyInstant,
}

impl WeeklyWindow {
    fn covers(&self, at: WeeklyInstant) -> bool {
        if self.start.0 <= self.end.0 {
            at.0 >= self.start.0 && at.0 < self.end.0
        } else {
            // Wraps across the week boundary.
            at.0 >= self.start.0 || at.0 < self.end.0
        }
    }
}

/// A single absolute window, e.g. a one-off holiday freeze.
#[derive(Debug, Clone)]
struct AbsoluteWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl AbsoluteWindow {
    fn covers(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// A union of embargo windows: merges are forbidden while any member covers
/// the current instant.
#[derive(Debug, Clone, Default)]
pub struct IntervalUnion {
    weekly: Vec<WeeklyWindow>,
    absolute: Vec<AbsoluteWindow>,
}

impl IntervalUnion {
    /// The empty union: never embargoed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list of `start - end` windows.
    ///
    /// Each endpoint is either a weekly spec (`Friday 1pm`) or an absolute
    /// RFC 3339 timestamp.
    pub fn parse(spec: &str) -> EmbargoResult<Self> {
        let mut union = Self::none();
        for piece in spec.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }

            let (start, end) = piece
                .split_once(" - ")
                .map(|(a, b)| (a.trim(), b.trim()))
                .ok_or_else(|| EmbargoError::bad_interval(piece))?;

            if let (Ok(start), Ok(end)) = (
                DateTime::parse_from_rfc3339(start),
                DateTime::parse_from_rfc3339(end),
            ) {
                union.absolute.push(AbsoluteWindow {
                    start: start.with_timezone(&Utc),
                    end: end.with_timezone(&Utc),
                });
            } else {
                union.weekly.push(WeeklyWindow {
                    start: WeeklyInstant::parse(start)?,
                    end: WeeklyInstant::parse(end)?,
                });
            }
        }
        Ok(union)
    }

    /// Whether a merge started at `at` would fall inside an embargo.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        let weekly_at = WeeklyInstant::of(at);
        self.weekly.iter().any(|window| window.covers(weekly_at))
            || self.absolute.iter().any(|window| window.covers(at))
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::IntervalUnion;

    #[test]
    fn test_embargo_none() {
        let union = IntervalUnion::none();
        let now = chrono::Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap();
        assert!(!union.covers(now));
    }

    #[test]
    fn test_embargo_weekly_covers() {
        let union = IntervalUnion::parse("Friday 1pm - Monday 9am").unwrap();
        // Saturday, well inside the window.
        let sat = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        assert!(union.covers(sat));
    }

    #[test]
    fn test_embargo_weekly_outside() {
        let union = IntervalUnion::parse("Friday 1pm - Monday 9am").unwrap();
        // Wednesday, well outside the window.
        let wed = chrono::Utc.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap();
        assert!(!union.covers(wed));
    }

    #[test]
    fn test_embargo_absolute() {
        let union =
            IntervalUnion::parse("2026-12-24T00:00:00Z - 2026-12-26T00:00:00Z").unwrap();
        let xmas = chrono::Utc
            .with_ymd_and_hms(2026, 12, 25, 12, 0, 0)
            .unwrap();
        let new_year = chrono::Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        assert!(union.covers(xmas));
        assert!(!union.covers(new_year));
    }

    #[test]
    fn test_embargo_multiple() {
        let union = IntervalUnion::parse(
            "Friday 1pm - Monday 9am, 2026-12-24T00:00:00Z - 2026-12-26T00:00:00Z",
        )
        .unwrap();
        let xmas = chrono::Utc
            .with_ymd_and_hms(2026, 12, 25, 12, 0, 0)
            .unwrap();
        assert!(union.covers(xmas));
    }

    #[test]
    fn test_embargo_bad_endpoint() {
        assert!(IntervalUnion::parse("whenever - Monday 9am").is_err());
    }
}
