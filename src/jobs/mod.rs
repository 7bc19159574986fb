pub mod retry;
pub mod tracker;

pub use retry::RetryPolicy;
pub use tracker::JobTracker;
