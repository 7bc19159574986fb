use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use crate::analytics::{DailyTrigger, MetricsEngine, MetricsSchedule};
use crate::api::{create_router, ApiState};
use crate::broker::Broker;
use crate::config::AppConfig;
use crate::error::Result;
use crate::etl;
use crate::ingestion::{build_fetchers, FetchJob, Scheduler};
use crate::interfaces::PriceStore;
use crate::jobs::RetryPolicy;
use crate::storage;
use crate::types::AssetClass;
use crate::utils::TaskSupervisor;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Every component built from `AppConfig`. Enabled roles run as supervised
/// task groups that are torn down in order.
pub struct Runtime {
    config: AppConfig,
    store: Arc<dyn PriceStore>,
    broker: Broker,
    timers: TaskSupervisor,
    batches: TaskSupervisor,
    workers: TaskSupervisor,
    server: TaskSupervisor,
    shutdown_tx: watch::Sender<bool>,
    server_stop: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl Runtime {
    /// Connect storage and the broker. Nothing is started yet.
    pub async fn build(config: AppConfig) -> Result<Self> {
        let store = storage::connect(&config.storage).await?;
        let broker = Broker::from_config(&config.broker);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Runtime {
            config,
            store,
            broker,
            timers: TaskSupervisor::new("timers"),
            batches: TaskSupervisor::new("metrics"),
            workers: TaskSupervisor::new("workers"),
            server: TaskSupervisor::new("api"),
            shutdown_tx,
            server_stop: None,
            local_addr: None,
        })
    }

    pub fn store(&self) -> Arc<dyn PriceStore> {
        self.store.clone()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Address the API is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<()> {
        let roles = self.config.roles.clone();
        // Consumers first so nothing published at startup waits on an idle queue.
        if roles.etl {
            self.start_etl()?;
        }
        if roles.ingestion {
            self.start_ingestion()?;
        }
        if roles.metrics {
            self.start_metrics()?;
        }
        if roles.api {
            self.start_api().await?;
        }
        tracing::info!(
            service = %self.config.service.name,
            ingestion = roles.ingestion,
            etl = roles.etl,
            metrics = roles.metrics,
            api = roles.api,
            "runtime started"
        );
        Ok(())
    }

    fn start_ingestion(&mut self) -> Result<()> {
        let publisher = self.broker.publisher()?;
        let mut scheduler = Scheduler::new();
        for (fetcher, symbols) in build_fetchers(&self.config.providers)? {
            let interval = self.config.schedule.interval_for(fetcher.asset_class());
            scheduler.add(FetchJob::new(fetcher, publisher.clone(), symbols), interval);
        }
        scheduler.start(&mut self.timers);
        Ok(())
    }

    fn start_etl(&mut self) -> Result<()> {
        etl::spawn_workers(
            &self.broker,
            self.store.clone(),
            &self.config.etl,
            self.shutdown_tx.subscribe(),
            &mut self.workers,
        )?;
        Ok(())
    }

    fn start_metrics(&mut self) -> Result<()> {
        let engine = Arc::new(
            MetricsEngine::new(self.store.clone(), RetryPolicy::from(&self.config.metrics.retry))
                .with_shutdown(self.shutdown_tx.subscribe()),
        );
        for class in AssetClass::ALL {
            let trigger = DailyTrigger::new(self.config.metrics.run_time_for(class)?);
            let schedule = MetricsSchedule::new(engine.clone(), class, trigger);
            self.batches
                .spawn(format!("metrics.{}", class), schedule.run(self.shutdown_tx.subscribe()));
        }
        Ok(())
    }

    async fn start_api(&mut self) -> Result<()> {
        let state = Arc::new(ApiState {
            service: self.config.service.name.clone(),
            publisher: self.broker.publisher()?,
            store: self.store.clone(),
        });
        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind(&self.config.http.bind).await?;
        let addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        tracing::info!(%addr, "HTTP API listening");
        self.server.spawn("http", async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "HTTP server error");
            }
        });
        self.server_stop = Some(stop_tx);
        self.local_addr = Some(addr);
        Ok(())
    }

    /// Log any supervised task that exited on its own.
    pub fn check_health(&mut self) {
        for group in [&mut self.timers, &mut self.batches, &mut self.workers, &mut self.server] {
            if let Err(e) = group.check_health() {
                tracing::error!(error = %e, "background task exited");
            }
        }
    }

    /// Ordered shutdown: fetch timers, then consumers and metrics batches
    /// (bounded by the grace period), then the HTTP server, then storage.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down");
        self.timers.shutdown_all();

        let _ = self.shutdown_tx.send(true);
        let grace = Duration::from_secs(self.config.etl.shutdown_grace_secs);
        let (aborted, batches_aborted) = tokio::join!(
            self.workers.shutdown_graceful(grace),
            self.batches.shutdown_graceful(grace),
        );
        if !aborted.is_empty() {
            tracing::warn!(?aborted, "consumers aborted; their unacked messages will be redelivered");
        }
        if !batches_aborted.is_empty() {
            tracing::warn!(aborted = ?batches_aborted, "metrics batches aborted before finishing");
        }

        if let Some(stop) = self.server_stop.take() {
            let _ = stop.send(());
        }
        self.server.shutdown_graceful(grace).await;

        drop(self.store);
        tracing::info!("shutdown complete");
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

/// Start everything the config enables and run until a shutdown signal.
pub async fn run(config: AppConfig) -> Result<()> {
    let mut runtime = Runtime::build(config).await?;
    runtime.start().await?;

    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => break,
            _ = health.tick() => runtime.check_health(),
        }
    }

    runtime.shutdown().await;
    Ok(())
}
