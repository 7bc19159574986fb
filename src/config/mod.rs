use serde::{Deserialize, Serialize};

pub mod loader;
pub mod providers;
pub mod schedule;

pub use loader::AppConfig;
pub use providers::ProvidersConfig;
pub use schedule::{MetricsConfig, RetryConfig, ScheduleConfig};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

/// `postgres://...` selects PostgreSQL; `sqlite://<path>` or `sqlite::memory:` selects SQLite.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub url: String,
    pub max_connections: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            url: "sqlite://marketflow.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Kafka,
    Memory,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub brokers: String,
    /// Topic prefix; dead letters go to `<exchange>.dead_letter`.
    pub exchange: String,
    pub publish_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            kind: BrokerKind::Memory,
            brokers: "localhost:9092".to_string(),
            exchange: "market_data".to_string(),
            publish_timeout_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EtlConfig {
    pub workers_per_class: usize,
    pub max_redeliveries: u32,
    pub requeue_backoff_ms: u64,
    pub max_requeue_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for EtlConfig {
    fn default() -> Self {
        EtlConfig {
            workers_per_class: 2,
            max_redeliveries: 5,
            requeue_backoff_ms: 1000,
            max_requeue_backoff_ms: 60_000,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Which parts of the pipeline this process runs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RolesConfig {
    pub ingestion: bool,
    pub etl: bool,
    pub metrics: bool,
    pub api: bool,
}

impl Default for RolesConfig {
    fn default() -> Self {
        RolesConfig {
            ingestion: true,
            etl: true,
            metrics: true,
            api: true,
        }
    }
}
