use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::Instrument;
use crate::config::EtlConfig;
use crate::error::{Error, Result};
use crate::interfaces::{Delivery, DeliveryTag, MessageSource, PriceStore, Settlement};
use crate::observability::metrics::{MESSAGES_CONSUMED, MESSAGE_PROCESSING_LATENCY};
use crate::jobs::RetryPolicy;
use crate::observability::tracing::trace_message;
use crate::types::{Quote, UpsertOutcome};

/// Failed processing attempts per message, shared by every worker of one queue.
pub type RedeliveryLedger = Arc<DashMap<DeliveryTag, u32>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Inserted,
    Duplicate,
    /// Unparseable or invalid payload.
    Rejected(String),
    /// Transient failure; the message goes back on the queue.
    Requeued(String),
    /// Failed permanently, or a bounded retryable error ran out of redeliveries.
    DeadLettered(String),
}

impl ProcessOutcome {
    pub fn settlement(&self) -> Settlement {
        match self {
            ProcessOutcome::Inserted | ProcessOutcome::Duplicate => Settlement::Ack,
            ProcessOutcome::Requeued(_) => Settlement::Requeue,
            ProcessOutcome::Rejected(_) | ProcessOutcome::DeadLettered(_) => Settlement::Reject,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Inserted => "inserted",
            ProcessOutcome::Duplicate => "duplicate",
            ProcessOutcome::Rejected(_) => "rejected",
            ProcessOutcome::Requeued(_) => "requeued",
            ProcessOutcome::DeadLettered(_) => "dead_lettered",
        }
    }
}

/// One ETL worker: decode, upsert, then settle. Settlement happens only after
/// the storage transaction has committed.
pub struct QuoteConsumer {
    queue: String,
    source: Arc<dyn MessageSource>,
    store: Arc<dyn PriceStore>,
    max_redeliveries: u32,
    requeue_backoff: RetryPolicy,
    attempts: RedeliveryLedger,
}

impl QuoteConsumer {
    pub fn new(
        queue: &str,
        source: Arc<dyn MessageSource>,
        store: Arc<dyn PriceStore>,
        config: &EtlConfig,
        attempts: RedeliveryLedger,
    ) -> Self {
        QuoteConsumer {
            queue: queue.to_string(),
            source,
            store,
            max_redeliveries: config.max_redeliveries,
            requeue_backoff: RetryPolicy {
                max_attempts: config.max_redeliveries.saturating_add(1),
                base_delay: Duration::from_millis(config.requeue_backoff_ms),
                factor: 2,
                max_delay: Duration::from_millis(config.max_requeue_backoff_ms),
            },
            attempts,
        }
    }

    /// Pause before requeueing a message that has failed `failures` times:
    /// doubles from `requeue_backoff_ms` up to `max_requeue_backoff_ms`.
    pub fn requeue_delay(&self, failures: u32) -> Duration {
        self.requeue_backoff.delay_for(failures)
    }

    /// Decide what to do with a delivery. Writes to storage but does not settle.
    pub async fn process(&self, delivery: &Delivery) -> ProcessOutcome {
        let quote = match Quote::decode(&delivery.payload) {
            Ok(quote) => quote,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting malformed message");
                return ProcessOutcome::Rejected(e.to_string());
            }
        };

        match self.store.ingest_quote(&quote).await {
            Ok(receipt) => {
                self.attempts.remove(&delivery.tag);
                if receipt.symbol_created {
                    tracing::info!(symbol = %quote.symbol, asset_class = %quote.asset_type, "created new symbol");
                }
                match receipt.outcome {
                    UpsertOutcome::Inserted => {
                        tracing::info!(symbol = %quote.symbol, ts = %quote.ts, price = quote.price, "price stored");
                        ProcessOutcome::Inserted
                    }
                    UpsertOutcome::Duplicate => {
                        tracing::debug!(symbol = %quote.symbol, ts = %quote.ts, "duplicate quote ignored");
                        ProcessOutcome::Duplicate
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                let failures = {
                    let mut entry = self.attempts.entry(delivery.tag.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                // A storage outage is waited out however long it lasts.
                let bounded = !matches!(e, Error::StorageTransient(_));
                if bounded && failures > self.max_redeliveries {
                    self.attempts.remove(&delivery.tag);
                    tracing::error!(symbol = %quote.symbol, failures, error = %e, "redeliveries exhausted");
                    ProcessOutcome::DeadLettered(e.to_string())
                } else {
                    tracing::warn!(symbol = %quote.symbol, failures, error = %e, "transient failure, requeueing");
                    ProcessOutcome::Requeued(e.to_string())
                }
            }
            Err(e) => {
                self.attempts.remove(&delivery.tag);
                tracing::error!(symbol = %quote.symbol, error = %e, "permanent storage failure");
                ProcessOutcome::DeadLettered(e.to_string())
            }
        }
    }

    /// Process and settle one delivery.
    pub async fn handle(&self, delivery: Delivery) -> Result<ProcessOutcome> {
        let span = trace_message(&self.queue, &delivery);
        async {
            let started = Instant::now();
            let outcome = self.process(&delivery).await;

            if matches!(outcome, ProcessOutcome::Requeued(_)) {
                let failures = self.attempts.get(&delivery.tag).map(|n| *n).unwrap_or(1);
                let delay = self.requeue_delay(failures);
                if !delay.is_zero() {
                    tracing::debug!(failures, ?delay, "backing off before requeue");
                    tokio::time::sleep(delay).await;
                }
            }
            self.source.settle(&delivery, outcome.settlement()).await?;

            MESSAGES_CONSUMED.with_label_values(&[self.queue.as_str(), outcome.label()]).inc();
            MESSAGE_PROCESSING_LATENCY.observe(started.elapsed().as_secs_f64());
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Consume until `shutdown` flips to true (or its sender goes away). A message
    /// already received is always finished and settled before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = %self.queue, "consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.source.receive() => match received {
                    Ok(delivery) => {
                        if let Err(e) = self.handle(delivery).await {
                            tracing::error!(queue = %self.queue, error = %e, "failed to settle message");
                        }
                    }
                    Err(e) => {
                        tracing::error!(queue = %self.queue, error = %e, "receive failed");
                        tokio::time::sleep(self.requeue_backoff.base_delay.max(Duration::from_millis(100))).await;
                    }
                },
            }
        }
        tracing::info!(queue = %self.queue, "consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use chrono::{TimeZone, Utc};
    use crate::broker::InMemoryBroker;
    use crate::interfaces::price_store::MockPriceStore;
    use crate::interfaces::QuotePublisher;
    use crate::storage::SqliteStore;
    use crate::types::{AssetClass, IngestReceipt};

    const QUEUE: &str = "etl.crypto.queue";

    fn config(max_redeliveries: u32) -> EtlConfig {
        EtlConfig {
            max_redeliveries,
            requeue_backoff_ms: 0,
            ..EtlConfig::default()
        }
    }

    fn broker() -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new("market_data"));
        broker.declare_queue(QUEUE, "crypto.*");
        broker
    }

    fn consumer(broker: &Arc<InMemoryBroker>, store: Arc<dyn PriceStore>, max_redeliveries: u32) -> QuoteConsumer {
        QuoteConsumer::new(
            QUEUE,
            Arc::new(broker.queue(QUEUE).unwrap()),
            store,
            &config(max_redeliveries),
            RedeliveryLedger::default(),
        )
    }

    fn btc() -> Quote {
        Quote::new("BTCUSDT", AssetClass::Crypto, "binance", 43_000.0)
            .at(Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap())
    }

    fn receipt() -> IngestReceipt {
        IngestReceipt { symbol_id: 1, symbol_created: false, outcome: UpsertOutcome::Inserted }
    }

    #[tokio::test]
    async fn duplicate_delivery_writes_once_and_acks_both() {
        let broker = broker();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let worker = consumer(&broker, store.clone(), 5);

        broker.publish("crypto.ticker", &btc()).await.unwrap();
        broker.publish("crypto.ticker", &btc()).await.unwrap();

        let source = broker.queue(QUEUE).unwrap();
        let first = worker.handle(source.receive().await.unwrap()).await.unwrap();
        let second = worker.handle(source.receive().await.unwrap()).await.unwrap();

        assert_eq!(first, ProcessOutcome::Inserted);
        assert_eq!(second, ProcessOutcome::Duplicate);
        assert_eq!(store.recent_prices("BTCUSDT", 10).await.unwrap().len(), 1);
        assert_eq!(broker.ready_len(QUEUE), 0);
        assert_eq!(broker.unacked_len(QUEUE), 0);
    }

    #[tokio::test]
    async fn concurrent_workers_converge_on_one_row() {
        let broker = broker();
        let store: Arc<dyn PriceStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let a = consumer(&broker, store.clone(), 5);
        let b = consumer(&broker, store.clone(), 5);

        broker.publish("crypto.ticker", &btc()).await.unwrap();
        broker.publish("crypto.ticker", &btc()).await.unwrap();
        let (da, db) = (
            broker.queue(QUEUE).unwrap().receive().await.unwrap(),
            broker.queue(QUEUE).unwrap().receive().await.unwrap(),
        );

        let (ra, rb) = tokio::join!(a.handle(da), b.handle(db));
        let mut outcomes = vec![ra.unwrap(), rb.unwrap()];
        outcomes.sort_by_key(|o| o.label());
        assert_eq!(outcomes, vec![ProcessOutcome::Duplicate, ProcessOutcome::Inserted]);
        assert_eq!(store.recent_prices("BTCUSDT", 10).await.unwrap().len(), 1);
        assert_eq!(broker.unacked_len(QUEUE), 0);
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered_and_not_stored() {
        let broker = broker();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let worker = consumer(&broker, store.clone(), 5);

        broker
            .publish_raw("crypto.ticker", br#"{"symbol":"BTCUSDT","asset_type":"crypto","source":"binance","ts":"2026-02-01T12:00:00Z","price":-1}"#.to_vec())
            .unwrap();
        let delivery = broker.queue(QUEUE).unwrap().receive().await.unwrap();
        let outcome = worker.handle(delivery).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.ready_len(QUEUE), 0);
        assert!(store.active_symbols(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_requeues_then_succeeds() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut store = MockPriceStore::new();
        store.expect_ingest_quote().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::StorageTransient("connection reset by peer".to_string()))
            } else {
                Ok(receipt())
            }
        });
        let worker = consumer(&broker, Arc::new(store), 5);
        let source = broker.queue(QUEUE).unwrap();

        broker.publish("crypto.ticker", &btc()).await.unwrap();
        let first = worker.handle(source.receive().await.unwrap()).await.unwrap();
        assert!(matches!(first, ProcessOutcome::Requeued(_)));

        let redelivery = source.receive().await.unwrap();
        assert!(redelivery.redelivered);
        assert_eq!(worker.handle(redelivery).await.unwrap(), ProcessOutcome::Inserted);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(broker.dead_letters().is_empty());
        assert_eq!(broker.unacked_len(QUEUE), 0);
    }

    #[tokio::test]
    async fn exhausted_redeliveries_are_dead_lettered() {
        let broker = broker();
        let mut store = MockPriceStore::new();
        store
            .expect_ingest_quote()
            .times(3)
            .returning(|_| Err(Error::Broker("replication stream closed".to_string())));
        let worker = consumer(&broker, Arc::new(store), 2);
        let source = broker.queue(QUEUE).unwrap();

        broker.publish("crypto.ticker", &btc()).await.unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(worker.handle(source.receive().await.unwrap()).await.unwrap());
        }

        assert!(matches!(outcomes[0], ProcessOutcome::Requeued(_)));
        assert!(matches!(outcomes[1], ProcessOutcome::Requeued(_)));
        assert!(matches!(outcomes[2], ProcessOutcome::DeadLettered(_)));
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.ready_len(QUEUE), 0);
    }

    #[tokio::test]
    async fn storage_outage_outlasting_redelivery_budget_keeps_requeueing() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut store = MockPriceStore::new();
        store.expect_ingest_quote().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 7 {
                Err(Error::StorageTransient("connection refused".to_string()))
            } else {
                Ok(receipt())
            }
        });
        let worker = consumer(&broker, Arc::new(store), 2);
        let source = broker.queue(QUEUE).unwrap();

        broker.publish("crypto.ticker", &btc()).await.unwrap();
        for _ in 0..7 {
            let outcome = worker.handle(source.receive().await.unwrap()).await.unwrap();
            assert!(matches!(outcome, ProcessOutcome::Requeued(_)));
        }
        let last = worker.handle(source.receive().await.unwrap()).await.unwrap();

        assert_eq!(last, ProcessOutcome::Inserted);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert!(broker.dead_letters().is_empty());
        assert_eq!(broker.unacked_len(QUEUE), 0);
    }

    #[test]
    fn requeue_delay_doubles_up_to_the_cap() {
        let broker = broker();
        let worker = QuoteConsumer::new(
            QUEUE,
            Arc::new(broker.queue(QUEUE).unwrap()),
            Arc::new(MockPriceStore::new()),
            &EtlConfig::default(),
            RedeliveryLedger::default(),
        );

        assert_eq!(worker.requeue_delay(1), Duration::from_secs(1));
        assert_eq!(worker.requeue_delay(2), Duration::from_secs(2));
        assert_eq!(worker.requeue_delay(5), Duration::from_secs(16));
        assert_eq!(worker.requeue_delay(7), Duration::from_secs(60));
        assert_eq!(worker.requeue_delay(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn permanent_storage_failure_is_not_retried() {
        let broker = broker();
        let mut store = MockPriceStore::new();
        store
            .expect_ingest_quote()
            .times(1)
            .returning(|_| Err(Error::Storage("value too long for type character varying(30)".to_string())));
        let worker = consumer(&broker, Arc::new(store), 5);

        broker.publish("crypto.ticker", &btc()).await.unwrap();
        let delivery = broker.queue(QUEUE).unwrap().receive().await.unwrap();
        assert!(matches!(worker.handle(delivery).await.unwrap(), ProcessOutcome::DeadLettered(_)));
        assert_eq!(broker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn run_drains_until_shutdown() {
        let broker = broker();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let worker = consumer(&broker, store.clone(), 5);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        for minute in 0..3 {
            let quote = btc().at(Utc.with_ymd_and_hms(2026, 2, 1, 12, minute, 0).unwrap());
            broker.publish("crypto.ticker", &quote).await.unwrap();
        }
        for _ in 0..100 {
            if store.recent_prices("BTCUSDT", 10).await.unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(store.recent_prices("BTCUSDT", 10).await.unwrap().len(), 3);
        assert_eq!(broker.unacked_len(QUEUE), 0);
    }
}
