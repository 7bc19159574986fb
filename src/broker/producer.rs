use crate::broker::{topic_name, MESSAGE_ID_HEADER};
use crate::error::{Error, Result};
use crate::interfaces::QuotePublisher;
use crate::types::Quote;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Publishes quotes to `<exchange>.<routing_key>` topics, keyed by symbol so one
/// instrument's quotes stay on one partition.
pub struct KafkaQuotePublisher {
    producer: FutureProducer,
    exchange: String,
    timeout: Duration,
}

impl KafkaQuotePublisher {
    pub fn new(brokers: &str, exchange: &str, timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("compression.type", "lz4")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| Error::Broker(e.to_string()))?;

        Ok(KafkaQuotePublisher {
            producer,
            exchange: exchange.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl QuotePublisher for KafkaQuotePublisher {
    async fn publish(&self, routing_key: &str, quote: &Quote) -> Result<()> {
        let payload = quote.encode()?;
        let topic = topic_name(&self.exchange, routing_key);
        let message_id = Uuid::new_v4().to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message_id.as_str()),
        });

        let record = FutureRecord::to(&topic)
            .payload(&payload)
            .key(&quote.symbol)
            .headers(headers);

        // Resolves once the full ISR has the message (acks=all).
        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| Error::Broker(e.to_string()))?;

        tracing::debug!(topic = %topic, symbol = %quote.symbol, message_id = %message_id, "quote published");
        Ok(())
    }
}
