pub mod deals;
pub mod orchestrator;
pub mod stats;

pub use deals::DealPipeline;
pub use orchestrator::{ScanConfig, ScanOrchestrator};
pub use stats::ScanStats;
