//! Execution windows.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Half-open `[start, end)` window a batch was extracted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if `end` is before `start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ConfigurationError> {
        if end < start {
            return Err(ConfigurationError::new(format!(
                "window end {end} is before window start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The whole UTC day `date`.
    #[must_use]
    pub fn day(date: NaiveDate) -> Self {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    /// The UTC day before `now`: a daily run processes yesterday's data.
    #[must_use]
    pub fn previous_day(now: DateTime<Utc>) -> Self {
        Self::day(now.date_naive() - Duration::days(1))
    }

    /// Every calendar date the window touches, in order.
    ///
    /// An empty window still yields its start date.
    #[must_use]
    pub fn dates(&self) -> Vec<NaiveDate> {
        let first = self.start.date_naive();
        let last = if self.end > self.start {
            (self.end - Duration::nanoseconds(1)).date_naive()
        } else {
            first
        };
        first
            .iter_days()
            .take_while(|d| *d <= last)
            .collect()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn previous_day_covers_yesterday() {
        let now = Utc.with_ymd_and_hms(2018, 11, 2, 0, 0, 0).unwrap();
        let window = TimeRange::previous_day(now);
        assert_eq!(window.start, Utc.with_ymd_and_hms(2018, 11, 1, 0, 0, 0).unwrap());
        assert_eq!(window.end, now);
        assert_eq!(
            window.dates(),
            vec![NaiveDate::from_ymd_opt(2018, 11, 1).unwrap()]
        );
    }

    #[test]
    fn multi_day_window_lists_each_date() {
        let start = Utc.with_ymd_and_hms(2018, 11, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2018, 11, 3, 6, 0, 0).unwrap();
        let window = TimeRange::new(start, end).unwrap();
        assert_eq!(window.dates().len(), 3);
    }

    #[test]
    fn inverted_window_rejected() {
        let start = Utc.with_ymd_and_hms(2018, 11, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2018, 11, 1, 0, 0, 0).unwrap();
        assert!(TimeRange::new(start, end).is_err());
    }
}
