pub mod postgres;
pub mod sqlite;

use std::sync::Arc;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::interfaces::PriceStore;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Open the backend selected by the configured URL scheme.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn PriceStore>> {
    let url = config.url.trim();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresStore::connect(url, config.max_connections).await?;
        return Ok(Arc::new(store));
    }
    if url == "sqlite::memory:" {
        return Ok(Arc::new(SqliteStore::in_memory()?));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        let path = path.to_string();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path))
            .await
            .map_err(|e| Error::TaskError(e.to_string()))??;
        return Ok(Arc::new(store));
    }
    Err(Error::ConfigError(format!("unsupported storage url {:?}", url)))
}
