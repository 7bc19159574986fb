use tracing::Span;
use tracing_subscriber::EnvFilter;
use crate::config::LogConfig;
use crate::interfaces::Delivery;
use crate::types::AssetClass;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    // A second init (tests, embedding) keeps the first subscriber.
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

pub fn trace_message(queue: &str, delivery: &Delivery) -> Span {
    tracing::info_span!(
        "message",
        queue = %queue,
        routing_key = %delivery.routing_key,
        offset = delivery.tag.offset,
        message_id = delivery.message_id.as_deref().unwrap_or("-"),
        redelivered = delivery.redelivered,
    )
}

pub fn trace_batch(job: &str, asset_class: AssetClass) -> Span {
    tracing::info_span!(
        "batch",
        job = %job,
        asset_class = %asset_class,
    )
}
