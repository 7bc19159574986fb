pub mod engine;
pub mod indicators;
pub mod schedule;

pub use engine::{BatchSummary, MetricsEngine, SymbolOutcome};
pub use schedule::{DailyTrigger, MetricsSchedule};
