use crate::config::*;
use crate::error::{Error, Result};
use crate::types::AssetClass;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub schedule: ScheduleConfig,
    pub metrics: MetricsConfig,
    pub etl: EtlConfig,
    pub providers: ProvidersConfig,
    pub log: LogConfig,
    pub roles: RolesConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            name: "marketflow".to_string(),
        }
    }
}

impl AppConfig {
    /// Layers `config/default`, then `config/<env>`, then `MARKETFLOW__*` variables.
    pub fn load(env: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                Environment::with_prefix("MARKETFLOW")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let app: AppConfig = config.try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        for class in AssetClass::ALL {
            if self.schedule.interval_for(class).is_zero() {
                return Err(Error::ConfigError(format!("{} fetch interval must be positive", class)));
            }
            self.metrics.run_time_for(class)?;
        }
        if self.etl.workers_per_class == 0 {
            return Err(Error::ConfigError("etl.workers_per_class must be at least 1".to_string()));
        }
        if self.metrics.retry.max_attempts == 0 {
            return Err(Error::ConfigError("metrics.retry.max_attempts must be at least 1".to_string()));
        }
        if self.storage.max_connections == 0 {
            return Err(Error::ConfigError("storage.max_connections must be at least 1".to_string()));
        }
        Ok(())
    }
}
