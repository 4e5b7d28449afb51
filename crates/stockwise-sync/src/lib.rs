//! Sync orchestration: configuration, incremental and full-load engines, aggregate
//! maintenance, scheduling and the daemon loop.

mod aggregates;
mod config;
mod engine;
mod full_load;
mod orchestrator;
mod schedule;
#[cfg(test)]
mod testing;
mod verify;

pub use aggregates::{AggregateMaintainer, RefreshOutcome};
pub use config::SyncConfig;
pub use engine::{
    drain_keys, ConsumptionStream, IncrementalEngine, KeyedStream, MovementKey, MovementStream,
    SyncOutcome, WatermarkSource,
};
pub use full_load::{FullLoadEngine, FullLoadReport, LoadPhase};
pub use orchestrator::{ConnectionReport, ForecastRunner, IncrementalReport, Orchestrator};
pub use schedule::{
    Clock, IntervalJob, MonthlySchedule, SchedulerState, SystemClock, WeeklyMarker,
    WeeklySchedule,
};
pub use verify::{verify_stock, StockVerification, TOLERANCE};

pub const CRATE_NAME: &str = "stockwise-sync";
