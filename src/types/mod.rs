pub mod asset_class;
pub mod quote;
pub mod records;

pub use asset_class::AssetClass;
pub use quote::Quote;
pub use records::{DailyMetric, IngestReceipt, JobRun, JobStatus, PriceRecord, Symbol, UpsertOutcome};
