use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveTime, TimeDelta, Weekday};
use stockwise_core::{LoadRange, RetryPolicy, OUTBOUND_DOCUMENT_TYPE};
use stockwise_source::SourceConfig;
use stockwise_storage::DestinationConfig;

use crate::schedule::{MonthlySchedule, WeeklySchedule};

/// Every setting of the sync daemon, read from `KEY=value` environment entries.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub destination: DestinationConfig,
    pub source: SourceConfig,
    pub batch_size: usize,
    pub sync_interval: Duration,
    pub full_range: LoadRange,
    pub weekly: Option<WeeklySchedule>,
    pub monthly: Option<MonthlySchedule>,
    pub open_order_interval: Option<TimeDelta>,
    pub core_refresh_sql: Option<PathBuf>,
    pub core_refresh_interval: Option<TimeDelta>,
    pub dashboard_sql: Option<PathBuf>,
    pub dashboard_interval: Option<TimeDelta>,
    pub weekly_pre_sql: Option<PathBuf>,
    pub weekly_post_sql: Option<PathBuf>,
    pub mapping_sql: Option<PathBuf>,
    pub monthly_seat_sql: Option<PathBuf>,
    pub script_root: PathBuf,
    pub forecast_command: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub backup_keep: usize,
    pub weekly_marker: PathBuf,
    pub outbound_document_type: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Missing or unparsable
    /// values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let string = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let int = |key: &str, default: i64| {
            get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| get(key).map(|v| parse_bool(&v)).unwrap_or(default);
        let path = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| default.to_string())
        };
        let optional_path = |key: &str, default: &str| {
            Some(path(key, default))
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        };
        let seconds = |key: &str, default: i64| {
            Some(int(key, default))
                .filter(|s| *s > 0)
                .map(TimeDelta::seconds)
        };

        let shared_dsn = get("FB_ODBC_DSN");
        let retry_pause = Duration::from_millis(u64::try_from(int("FB_RETRY_PAUSE_MS", 500)).unwrap_or(500));
        let select_retries = usize::try_from(int("FB_SELECT_RETRIES", 3)).unwrap_or(3);
        let line_retries = usize::try_from(int("FB_LINE_RETRIES", 5)).unwrap_or(5);

        let source = SourceConfig {
            host: string("FB_HOST", "127.0.0.1"),
            port: u16::try_from(int("FB_PORT", 3050)).unwrap_or(3050),
            database: string("FB_DB", ""),
            charset: string("FB_CHARSET", "UTF8"),
            live_dsn: get("FB_ODBC_DSN_LIVE")
                .or_else(|| shared_dsn.clone())
                .or_else(|| Some("live".to_string())),
            full_dsn: get("FB_ODBC_DSN_FULL")
                .or(shared_dsn)
                .or_else(|| Some("test".to_string())),
            driver_name: string("FB_ODBC_DRIVER", "FirebirdODBC"),
            driver_path: string("FB_ODBC_DRIVER_PATH", "/usr/lib/libOdbcFb.so"),
            select_retry: RetryPolicy::linear(select_retries, retry_pause),
            line_retry: RetryPolicy::linear(line_retries, retry_pause),
        };

        let destination = DestinationConfig {
            url: get("DATABASE_URL"),
            host: string("PG_HOST", "127.0.0.1"),
            port: u16::try_from(int("PG_PORT", 5432)).unwrap_or(5432),
            database: string("PG_DB", "tkis_stockwise"),
            user: string("PG_USER", "postgres"),
            password: string("PG_PASSWORD", "postgres"),
            raw_schema: string("PG_RAW_SCHEMA", "raw"),
            connect_retry: RetryPolicy::fixed(
                usize::try_from(int("PG_CONNECT_RETRIES", 30)).unwrap_or(30),
                Duration::from_secs(u64::try_from(int("PG_CONNECT_WAIT_SECONDS", 5)).unwrap_or(5)),
            ),
            ..DestinationConfig::default()
        };

        let today = Local::now().date_naive();
        let full_range = LoadRange {
            start: get("FULL_START")
                .and_then(|v| parse_date(&v))
                .unwrap_or_else(default_full_start),
            end: get("FULL_END").and_then(|v| parse_date(&v)).unwrap_or(today),
            window_months: u32::try_from(int("FULL_WINDOW_MONTHS", 6)).unwrap_or(6).max(1),
        };

        let weekly_day = int("WEEKLY_DAY", 0);
        let weekly = (flag("WEEKLY_ENABLED", true) && weekly_day >= 0).then(|| WeeklySchedule {
            weekday: weekday_from_index(weekly_day),
            time: parse_time(&string("WEEKLY_TIME", "02:00")),
            window: TimeDelta::minutes(int("WEEKLY_WINDOW_MINUTES", 120).max(0)),
        });

        let monthly_day = int("MONTHLY_DAY", 2);
        let monthly = (flag("MONTHLY_ENABLED", true) && monthly_day >= 1).then(|| MonthlySchedule {
            day: u32::try_from(monthly_day.min(31)).unwrap_or(1),
            time: parse_time(&string("MONTHLY_TIME", "02:00")),
            window: TimeDelta::minutes(int("MONTHLY_WINDOW_MINUTES", 120).max(0)),
        });

        let backup_dir = get("BACKUP_DIR")
            .or_else(|| get("BOM_BACKUP_DIR"))
            .map(PathBuf::from);
        let backup_keep = get("BACKUP_KEEP")
            .or_else(|| get("BOM_BACKUP_KEEP"))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1)
            .max(1);

        Self {
            destination,
            source,
            batch_size: usize::try_from(int("BATCH_SIZE", 2000)).unwrap_or(2000).max(1),
            sync_interval: Duration::from_secs(
                u64::try_from(int("SYNC_INTERVAL_SECONDS", 300)).unwrap_or(300),
            ),
            full_range,
            weekly,
            monthly,
            open_order_interval: seconds("OPEN_ORDER_SECONDS", 1800),
            core_refresh_sql: optional_path("CORE_5MIN_SQL", ""),
            core_refresh_interval: seconds("CORE_5MIN_SECONDS", 3600),
            dashboard_sql: optional_path("CORE_DASHBOARD_SQL", "etl/sql/core_dashboard_refresh.sql"),
            dashboard_interval: seconds("CORE_DASHBOARD_SECONDS", 1800),
            weekly_pre_sql: optional_path(
                "CORE_WEEKLY_PRE_SQL",
                "etl/sql/core_weekly_pre_forecast.sql",
            ),
            weekly_post_sql: optional_path(
                "CORE_WEEKLY_POST_SQL",
                "etl/sql/core_weekly_post_forecast.sql",
            ),
            mapping_sql: optional_path("CORE_MAPPING_SQL", ""),
            monthly_seat_sql: optional_path("MONTHLY_SEAT_SQL", "etl/sql/core_monthly_seat.sql"),
            script_root: PathBuf::from(string("SCRIPT_ROOT", ".")),
            forecast_command: get("FORECAST_COMMAND"),
            backup_dir,
            backup_keep,
            weekly_marker: PathBuf::from(string(
                "WEEKLY_MARKER_FILE",
                "logs/weekly_in_progress.flag",
            )),
            outbound_document_type: string("OUTBOUND_DOCUMENT_TYPE", OUTBOUND_DOCUMENT_TYPE),
        }
    }

    /// Relative script paths are resolved against `script_root`.
    pub fn resolve_script(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.script_root.join(path)
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn default_full_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// `HH:MM`; anything else means 02:00.
fn parse_time(value: &str) -> NaiveTime {
    let fallback = NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN);
    NaiveTime::parse_from_str(value.trim(), "%H:%M").unwrap_or(fallback)
}

/// 0 = Monday .. 6 = Sunday; larger values wrap.
fn weekday_from_index(index: i64) -> Weekday {
    match index.rem_euclid(7) {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        _ => Weekday::Sun,
    }
}
