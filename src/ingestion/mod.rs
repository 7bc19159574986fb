pub mod fetchers;
pub mod scheduler;

pub use fetchers::{build_fetchers, FetchBatch, Fetcher};
pub use scheduler::{FetchJob, FetchReport, FetchSchedule, Scheduler};
