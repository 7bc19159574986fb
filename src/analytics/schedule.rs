use std::sync::Arc;
use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::sync::watch;
use crate::analytics::engine::MetricsEngine;
use crate::types::AssetClass;
use crate::utils::helper::duration_until;

/// Fires once a day at a fixed UTC wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DailyTrigger {
    at: NaiveTime,
}

impl DailyTrigger {
    pub fn new(at: NaiveTime) -> Self {
        DailyTrigger { at }
    }

    /// First firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today.checked_add_days(Days::new(1)).unwrap_or(today)
        }
    }
}

/// Daily metrics timer for one asset class.
pub struct MetricsSchedule {
    engine: Arc<MetricsEngine>,
    class: AssetClass,
    trigger: DailyTrigger,
}

impl MetricsSchedule {
    pub fn new(engine: Arc<MetricsEngine>, class: AssetClass, trigger: DailyTrigger) -> Self {
        MetricsSchedule { engine, class, trigger }
    }

    /// Fire daily until `shutdown` flips to true. A batch in flight at that
    /// point stops at the next symbol boundary when the engine watches the
    /// same channel.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let now = Utc::now();
            let next = self.trigger.next_after(now);
            tracing::info!(asset_class = %self.class, next_run = %next, "metrics run scheduled");
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(duration_until(now, next)) => {}
            }

            // Failures were already recorded per attempt; the timer keeps going.
            if let Err(e) = self.engine.run_with_retry(self.class).await {
                tracing::error!(asset_class = %self.class, error = %e, "metrics batch failed after all retries");
            }
        }
        tracing::info!(asset_class = %self.class, "metrics schedule stopped");
    }
}
