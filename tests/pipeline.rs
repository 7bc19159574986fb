use std::sync::Arc;
use std::time::Duration;
use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use tokio::sync::watch;
use marketflow::analytics::MetricsEngine;
use marketflow::broker::{Broker, InMemoryBroker};
use marketflow::config::{BrokerConfig, EtlConfig};
use marketflow::etl;
use marketflow::interfaces::{MessageSource, PriceStore, QuotePublisher};
use marketflow::jobs::RetryPolicy;
use marketflow::storage::SqliteStore;
use marketflow::types::{AssetClass, JobStatus, Quote};
use marketflow::utils::TaskSupervisor;

struct Pipeline {
    broker: Broker,
    memory: Arc<InMemoryBroker>,
    store: Arc<dyn PriceStore>,
    workers: TaskSupervisor,
    shutdown: watch::Sender<bool>,
}

impl Pipeline {
    fn start() -> Self {
        let broker = Broker::from_config(&BrokerConfig::default());
        let Broker::Memory(memory) = &broker else {
            panic!("default broker should be in-process");
        };
        let memory = memory.clone();
        let store: Arc<dyn PriceStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let config = EtlConfig {
            workers_per_class: 2,
            requeue_backoff_ms: 0,
            ..EtlConfig::default()
        };
        let (shutdown, rx) = watch::channel(false);
        let mut workers = TaskSupervisor::new("workers");
        etl::spawn_workers(&broker, store.clone(), &config, rx, &mut workers).unwrap();

        Pipeline { broker, memory, store, workers, shutdown }
    }

    async fn wait_for_rows(&self, ticker: &str, expected: usize) {
        for _ in 0..300 {
            if self.store.recent_prices(ticker, 1000).await.unwrap().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} rows of {}", expected, ticker);
    }

    async fn wait_for_drain(&self) {
        for _ in 0..300 {
            let busy = AssetClass::ALL.iter().any(|class| {
                let queue = class.queue_name();
                self.memory.ready_len(&queue) + self.memory.unacked_len(&queue) > 0
            });
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queues did not drain");
    }

    async fn stop(mut self) {
        self.shutdown.send(true).unwrap();
        let aborted = self.workers.shutdown_graceful(Duration::from_secs(2)).await;
        assert!(aborted.is_empty(), "workers aborted: {:?}", aborted);
    }
}

fn daily_quote(symbol: &str, class: AssetClass, day: i64, close: f64) -> Quote {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 16, 0, 0).unwrap();
    Quote::new(symbol, class, "test", close).at(start + ChronoDuration::days(day))
}

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
}

#[tokio::test]
async fn quotes_flow_from_publisher_to_daily_metrics() {
    let pipeline = Pipeline::start();
    let publisher = pipeline.broker.publisher().unwrap();

    // 25 daily closes 100..=124, each published twice.
    for day in 0..25 {
        let quote = daily_quote("BTCUSDT", AssetClass::Crypto, day, 100.0 + day as f64);
        publisher.publish("crypto.ticker", &quote).await.unwrap();
        publisher.publish("crypto.ticker", &quote).await.unwrap();
    }
    for day in 0..5 {
        let quote = daily_quote("ETHUSDT", AssetClass::Crypto, day, 2000.0);
        publisher.publish("crypto.ticker", &quote).await.unwrap();
    }
    pipeline.memory.publish_raw("crypto.ticker", b"{not json".to_vec()).unwrap();

    pipeline.wait_for_rows("BTCUSDT", 25).await;
    pipeline.wait_for_rows("ETHUSDT", 5).await;
    pipeline.wait_for_drain().await;

    assert_eq!(pipeline.store.recent_prices("BTCUSDT", 1000).await.unwrap().len(), 25);
    assert_eq!(pipeline.memory.dead_letters().len(), 1);

    let engine = MetricsEngine::new(pipeline.store.clone(), RetryPolicy::no_delay(1));
    let summary = engine.run_batch(AssetClass::Crypto, run_date()).await.unwrap();
    assert_eq!((summary.total, summary.written, summary.skipped, summary.failed), (2, 1, 1, 0));

    // A second run the same day overwrites instead of adding a row.
    engine.run_batch(AssetClass::Crypto, run_date()).await.unwrap();

    let symbols = pipeline.store.active_symbols(Some(AssetClass::Crypto)).await.unwrap();
    let btc = symbols.iter().find(|s| s.symbol == "BTCUSDT").unwrap();
    let eth = symbols.iter().find(|s| s.symbol == "ETHUSDT").unwrap();

    let metrics = pipeline.store.daily_metrics(btc.id).await.unwrap();
    assert_eq!(metrics.len(), 1);
    let metric = &metrics[0];
    assert_eq!(metric.date, run_date());
    assert!((metric.ma_20 - 114.5).abs() < 1e-9);
    assert_eq!(metric.ma_50, None);
    assert_eq!(metric.rsi_14, 100.0);
    assert!((metric.volatility_20 - (399.0f64 / 12.0).sqrt()).abs() < 1e-9);
    assert!((metric.daily_return.unwrap() - 100.0 / 123.0).abs() < 1e-9);
    assert!(pipeline.store.daily_metrics(eth.id).await.unwrap().is_empty());

    let runs = pipeline.store.job_runs("metrics_crypto").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == JobStatus::Completed));
    assert!(runs.iter().all(|r| r.symbols_processed == Some(2) && r.symbols_total == Some(2)));

    pipeline.stop().await;
}

#[tokio::test]
async fn classes_are_routed_to_their_own_queues() {
    let pipeline = Pipeline::start();
    let publisher = pipeline.broker.publisher().unwrap();

    let quotes = [
        ("BTCUSDT", AssetClass::Crypto),
        ("AAPL", AssetClass::Equity),
        ("GOLD", AssetClass::Commodity),
        ("US10Y", AssetClass::Bond),
    ];
    for (symbol, class) in quotes {
        let quote = daily_quote(symbol, class, 0, 42.0);
        publisher.publish(&class.routing_key(), &quote).await.unwrap();
    }
    // No queue is bound to this key.
    publisher
        .publish("forex.ticker", &daily_quote("EURUSD", AssetClass::Crypto, 0, 1.1))
        .await
        .unwrap();

    for (symbol, _) in quotes {
        pipeline.wait_for_rows(symbol, 1).await;
    }
    for (symbol, class) in quotes {
        let stored = pipeline.store.active_symbols(Some(class)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].symbol, symbol);
    }
    assert!(pipeline.store.recent_prices("EURUSD", 10).await.unwrap().is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn unsettled_message_is_redelivered_after_consumer_loss() {
    let broker = Broker::from_config(&BrokerConfig::default());
    let Broker::Memory(memory) = &broker else {
        panic!("default broker should be in-process");
    };
    let quote = daily_quote("AAPL", AssetClass::Equity, 0, 190.0);
    broker.publisher().unwrap().publish("equity.ticker", &quote).await.unwrap();

    // A consumer takes the message and dies before settling it.
    let lost = broker.queue(AssetClass::Equity).unwrap();
    let taken = lost.receive().await.unwrap();
    assert!(!taken.redelivered);
    drop(lost);
    assert_eq!(memory.recover().unwrap(), 1);

    let store: Arc<dyn PriceStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let (shutdown, rx) = watch::channel(false);
    let mut workers = TaskSupervisor::new("workers");
    etl::spawn_workers(&broker, store.clone(), &EtlConfig::default(), rx, &mut workers).unwrap();

    for _ in 0..300 {
        if !store.recent_prices("AAPL", 10).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.recent_prices("AAPL", 10).await.unwrap().len(), 1);

    shutdown.send(true).unwrap();
    workers.shutdown_graceful(Duration::from_secs(2)).await;
}
