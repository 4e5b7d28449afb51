use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, Days, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use stockwise_core::add_months;

/// Source of "now" for schedule decisions; injected so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time; schedules are configured in local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Once a week at `weekday`/`time`, accepted for `window` after the scheduled instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    pub weekday: Weekday,
    pub time: NaiveTime,
    pub window: TimeDelta,
}

impl WeeklySchedule {
    /// Latest scheduled instant at or before `now`.
    pub fn occurrence(&self, now: NaiveDateTime) -> NaiveDateTime {
        let days_ago = (now.weekday().num_days_from_monday() + 7
            - self.weekday.num_days_from_monday())
            % 7;
        let date = now
            .date()
            .checked_sub_days(Days::new(u64::from(days_ago)))
            .unwrap_or(now.date());
        let scheduled = date.and_time(self.time);
        if scheduled > now {
            scheduled - TimeDelta::days(7)
        } else {
            scheduled
        }
    }

    /// The occurrence to run now, if `now` is inside its window and it has not run yet.
    pub fn due(&self, now: NaiveDateTime, last_run: Option<NaiveDateTime>) -> Option<NaiveDateTime> {
        due_within(self.occurrence(now), self.window, now, last_run)
    }
}

/// Once a month on `day` (clamped to the month's length) at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlySchedule {
    pub day: u32,
    pub time: NaiveTime,
    pub window: TimeDelta,
}

impl MonthlySchedule {
    pub fn occurrence(&self, now: NaiveDateTime) -> NaiveDateTime {
        let this_month = clamped_day(now.year(), now.month(), self.day).map(|d| d.and_time(self.time));
        match this_month {
            Some(scheduled) if scheduled <= now => scheduled,
            _ => {
                let (year, month) = if now.month() == 1 {
                    (now.year() - 1, 12)
                } else {
                    (now.year(), now.month() - 1)
                };
                clamped_day(year, month, self.day)
                    .map(|d| d.and_time(self.time))
                    .unwrap_or(NaiveDateTime::MIN)
            }
        }
    }

    pub fn due(&self, now: NaiveDateTime, last_run: Option<NaiveDateTime>) -> Option<NaiveDateTime> {
        due_within(self.occurrence(now), self.window, now, last_run)
    }
}

fn due_within(
    scheduled: NaiveDateTime,
    window: TimeDelta,
    now: NaiveDateTime,
    last_run: Option<NaiveDateTime>,
) -> Option<NaiveDateTime> {
    let in_window = now >= scheduled && now - scheduled <= window;
    let pending = last_run.map_or(true, |last| last < scheduled);
    (in_window && pending).then_some(scheduled)
}

fn clamped_day(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let last = add_months(first, 1).pred_opt()?;
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, last.day()))
}

/// Fixed-interval job. A `None` interval disables it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalJob {
    pub every: Option<TimeDelta>,
    pub last_run: Option<NaiveDateTime>,
}

impl IntervalJob {
    pub fn every(interval: Option<TimeDelta>) -> Self {
        Self {
            every: interval.filter(|i| *i > TimeDelta::zero()),
            last_run: None,
        }
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        match (self.every, self.last_run) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(every), Some(last)) => now - last >= every,
        }
    }

    pub fn mark(&mut self, now: NaiveDateTime) {
        self.last_run = Some(now);
    }
}

/// In-memory run history of the scheduler loop.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub last_weekly: Option<NaiveDateTime>,
    pub last_monthly: Option<NaiveDateTime>,
    pub open_orders: IntervalJob,
    pub core_refresh: IntervalJob,
    pub dashboard: IntervalJob,
}

/// Marker file present while a weekly job runs. Left behind on failure so the next
/// process start retries the job.
#[derive(Debug, Clone)]
pub struct WeeklyMarker {
    path: PathBuf,
}

impl WeeklyMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn write(&self, started_at: NaiveDateTime) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating marker directory {}", parent.display()))?;
        }
        let payload = format!("started_at={}\n", started_at.format("%Y-%m-%dT%H:%M:%S"));
        tokio::fs::write(&self.path, payload)
            .await
            .with_context(|| format!("writing weekly marker {}", self.path.display()))
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("removing weekly marker {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(h, min, 0))
            .expect("valid timestamp")
    }

    fn monday_two_am() -> WeeklySchedule {
        WeeklySchedule {
            weekday: Weekday::Mon,
            time: NaiveTime::from_hms_opt(2, 0, 0).expect("time"),
            window: TimeDelta::minutes(120),
        }
    }

    #[test]
    fn weekly_fires_once_inside_window() {
        let schedule = monday_two_am();
        // 2024-05-06 is a Monday.
        let now = at(2024, 5, 6, 2, 30);
        let scheduled = at(2024, 5, 6, 2, 0);

        assert_eq!(schedule.due(now, None), Some(scheduled));
        assert_eq!(schedule.due(now, Some(scheduled)), None);
        assert_eq!(schedule.due(at(2024, 5, 6, 3, 59), Some(now)), None);
        assert_eq!(schedule.due(now, Some(at(2024, 4, 29, 2, 10))), Some(scheduled));
    }

    #[test]
    fn weekly_outside_window_or_before_instant_compares_last_week() {
        let schedule = monday_two_am();
        assert_eq!(schedule.due(at(2024, 5, 6, 4, 1), None), None);
        assert_eq!(schedule.occurrence(at(2024, 5, 6, 1, 59)), at(2024, 4, 29, 2, 0));
        assert_eq!(schedule.occurrence(at(2024, 5, 9, 12, 0)), at(2024, 5, 6, 2, 0));
        assert_eq!(schedule.due(at(2024, 5, 6, 1, 59), None), None);
    }

    #[test]
    fn monthly_clamps_day_and_falls_back_to_previous_month() {
        let schedule = MonthlySchedule {
            day: 31,
            time: NaiveTime::from_hms_opt(2, 0, 0).expect("time"),
            window: TimeDelta::minutes(120),
        };
        assert_eq!(schedule.occurrence(at(2024, 2, 29, 3, 0)), at(2024, 2, 29, 2, 0));
        assert_eq!(schedule.occurrence(at(2024, 3, 5, 0, 0)), at(2024, 2, 29, 2, 0));
        assert_eq!(schedule.occurrence(at(2024, 1, 5, 0, 0)), at(2023, 12, 31, 2, 0));

        let second = MonthlySchedule { day: 2, ..schedule };
        assert_eq!(second.due(at(2024, 6, 2, 2, 5), None), Some(at(2024, 6, 2, 2, 0)));
        assert_eq!(second.due(at(2024, 6, 2, 2, 5), Some(at(2024, 6, 2, 2, 1))), None);
    }

    #[test]
    fn interval_jobs_fire_on_first_check_then_wait() {
        let mut job = IntervalJob::every(Some(TimeDelta::minutes(30)));
        let start = at(2024, 5, 6, 10, 0);
        assert!(job.is_due(start));
        job.mark(start);
        assert!(!job.is_due(at(2024, 5, 6, 10, 29)));
        assert!(job.is_due(at(2024, 5, 6, 10, 30)));

        assert!(!IntervalJob::every(None).is_due(start));
        assert!(!IntervalJob::every(Some(TimeDelta::zero())).is_due(start));
    }

    #[tokio::test]
    async fn marker_round_trip() {
        let dir = tempdir().expect("tempdir");
        let marker = WeeklyMarker::new(dir.path().join("logs").join("weekly.flag"));
        assert!(!marker.exists().await);

        marker.write(at(2024, 5, 6, 2, 0)).await.expect("write");
        assert!(marker.exists().await);
        let body = tokio::fs::read_to_string(marker.path()).await.expect("read");
        assert_eq!(body, "started_at=2024-05-06T02:00:00\n");

        marker.clear().await.expect("clear");
        marker.clear().await.expect("clearing twice is fine");
        assert!(!marker.exists().await);
    }
}
