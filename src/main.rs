use anyhow::Context;
use marketflow::config::AppConfig;
use marketflow::observability::{metrics, tracing::init_tracing};
use marketflow::{runtime, DEFAULT_ENV, ENV_VAR};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var(ENV_VAR).unwrap_or_else(|_| DEFAULT_ENV.to_string());
    let config = AppConfig::load(&env).with_context(|| format!("loading configuration for {}", env))?;

    init_tracing(&config.log);
    metrics::register_metrics();
    tracing::info!(%env, service = %config.service.name, "starting");

    runtime::run(config).await.context("runtime failed")?;
    Ok(())
}
