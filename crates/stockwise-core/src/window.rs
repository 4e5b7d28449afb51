use std::fmt;

use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Inclusive date range bounding one full-load sub-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Requested full-load range and the month span of each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub window_months: u32,
}

impl LoadRange {
    pub fn windows(&self) -> Vec<Window> {
        iter_windows(self.start, self.end, self.window_months)
    }
}

/// Calendar month arithmetic; the day is clamped to the target month's length.
pub fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX)
}

/// Splits `[start, end]` into contiguous, non-overlapping windows of `months` calendar
/// months. The last window is truncated at `end`. A zero span is treated as one month.
pub fn iter_windows(start: NaiveDate, end: NaiveDate, months: u32) -> Vec<Window> {
    let months = months.max(1);
    let mut windows = Vec::new();
    let mut cursor = start;

    while cursor <= end {
        let next_start = add_months(cursor, months);
        let window_end = next_start
            .checked_sub_days(Days::new(1))
            .unwrap_or(cursor)
            .min(end);
        windows.push(Window {
            start: cursor,
            end: window_end,
        });
        match window_end.checked_add_days(Days::new(1)) {
            Some(next) => cursor = next,
            None => break,
        }
    }

    windows
}
