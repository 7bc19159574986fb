use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use crate::ingestion::fetchers::Fetcher;
use crate::interfaces::QuotePublisher;
use crate::observability::metrics::{FETCH_FAILURES, QUOTES_FETCHED, QUOTES_PUBLISHED};
use crate::types::AssetClass;
use crate::utils::TaskSupervisor;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchReport {
    pub fetched: usize,
    pub published: usize,
    pub fetch_failures: usize,
    pub publish_failures: usize,
    pub throttled: Option<Duration>,
}

/// Fetch a class's symbol universe and publish every quote under `<class>.ticker`.
pub struct FetchJob {
    fetcher: Arc<dyn Fetcher>,
    publisher: Arc<dyn QuotePublisher>,
    symbols: Vec<String>,
}

impl FetchJob {
    pub fn new(fetcher: Arc<dyn Fetcher>, publisher: Arc<dyn QuotePublisher>, symbols: Vec<String>) -> Self {
        FetchJob { fetcher, publisher, symbols }
    }

    pub fn asset_class(&self) -> AssetClass {
        self.fetcher.asset_class()
    }

    /// Never fails: per-symbol and per-publish errors are logged and counted.
    pub async fn run_once(&self) -> FetchReport {
        let class = self.fetcher.asset_class();
        let label = [class.as_str()];
        tracing::info!(asset_class = %class, symbols = self.symbols.len(), "starting fetch job");

        let batch = self.fetcher.fetch_many(&self.symbols).await;
        QUOTES_FETCHED.with_label_values(&label).inc_by(batch.quotes.len() as u64);
        FETCH_FAILURES.with_label_values(&label).inc_by(batch.failed.len() as u64);

        let mut report = FetchReport {
            fetched: batch.quotes.len(),
            fetch_failures: batch.failed.len(),
            throttled: batch.throttled,
            ..FetchReport::default()
        };

        let routing_key = class.routing_key();
        for quote in &batch.quotes {
            match self.publisher.publish(&routing_key, quote).await {
                Ok(()) => {
                    QUOTES_PUBLISHED.with_label_values(&label).inc();
                    report.published += 1;
                }
                Err(e) => {
                    tracing::error!(asset_class = %class, symbol = %quote.symbol, error = %e, "failed to publish quote");
                    report.publish_failures += 1;
                }
            }
        }

        tracing::info!(
            asset_class = %class,
            published = report.published,
            failed = report.fetch_failures + report.publish_failures,
            "fetch job finished"
        );
        report
    }
}

/// A `FetchJob` on a fixed interval. The first tick fires immediately; missed ticks
/// are delayed rather than bursted; a throttled batch suspends ticks until the
/// provider's retry-after has passed. Each run is its own task, so a panicking
/// fetcher costs one tick, not the timer.
pub struct FetchSchedule {
    job: Arc<FetchJob>,
    interval: Duration,
}

impl FetchSchedule {
    pub fn new(job: FetchJob, interval: Duration) -> Self {
        FetchSchedule { job: Arc::new(job), interval }
    }

    pub async fn run(self) {
        let class = self.job.asset_class();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resume_at: Option<Instant> = None;

        loop {
            ticker.tick().await;
            if let Some(at) = resume_at {
                if Instant::now() < at {
                    tracing::debug!(asset_class = %class, "provider throttled, skipping tick");
                    continue;
                }
                resume_at = None;
            }

            let job = self.job.clone();
            let report = match tokio::spawn(async move { job.run_once().await }).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(asset_class = %class, error = %e, "fetch job panicked");
                    continue;
                }
            };
            if let Some(delay) = report.throttled {
                tracing::warn!(asset_class = %class, ?delay, "backing off after rate limit");
                resume_at = Some(Instant::now() + delay);
            }
        }
    }
}

/// Owns the per-class schedules until they are handed to a supervisor.
#[derive(Default)]
pub struct Scheduler {
    schedules: Vec<FetchSchedule>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    pub fn add(&mut self, job: FetchJob, interval: Duration) -> &mut Self {
        self.schedules.push(FetchSchedule::new(job, interval));
        self
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Spawn every schedule as its own task named `fetch.<class>`.
    pub fn start(self, supervisor: &mut TaskSupervisor) {
        for schedule in self.schedules {
            let name = format!("fetch.{}", schedule.job.asset_class());
            supervisor.spawn(name, schedule.run());
        }
    }
}
