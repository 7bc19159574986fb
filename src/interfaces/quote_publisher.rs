use crate::error::Result;
use crate::types::quote::Quote;
use async_trait::async_trait;

/// Durable, routable publication of quotes onto the broker.
///
/// `publish` returns only once the broker has accepted the message for
/// persistent delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotePublisher: Send + Sync {
    async fn publish(&self, routing_key: &str, quote: &Quote) -> Result<()>;
}
