pub mod policy;
pub mod scheduler;

pub use scheduler::{MonitorConfig, MonitorStatsSnapshot, MonitorView, RestockScheduler};
