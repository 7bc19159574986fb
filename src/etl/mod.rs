pub mod consumer;

use std::sync::Arc;
use tokio::sync::watch;
use crate::broker::Broker;
use crate::config::EtlConfig;
use crate::error::Result;
use crate::interfaces::PriceStore;
use crate::types::AssetClass;
use crate::utils::TaskSupervisor;

pub use consumer::{ProcessOutcome, QuoteConsumer, RedeliveryLedger};

/// Start `workers_per_class` consumers on every class queue. Workers are named
/// `etl.<class>.<n>` and stop once `shutdown` flips to true.
pub fn spawn_workers(
    broker: &Broker,
    store: Arc<dyn PriceStore>,
    config: &EtlConfig,
    shutdown: watch::Receiver<bool>,
    supervisor: &mut TaskSupervisor,
) -> Result<usize> {
    let mut spawned = 0;
    for class in AssetClass::ALL {
        let queue = class.queue_name();
        let attempts = RedeliveryLedger::default();
        for n in 0..config.workers_per_class {
            let consumer = QuoteConsumer::new(
                &queue,
                broker.queue(class)?,
                store.clone(),
                config,
                attempts.clone(),
            );
            supervisor.spawn(format!("etl.{}.{}", class, n), consumer.run(shutdown.clone()));
            spawned += 1;
        }
    }
    tracing::info!(workers = spawned, "ETL workers started");
    Ok(spawned)
}
