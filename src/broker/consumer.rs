use crate::broker::{dead_letter_topic, subscription_regex, MESSAGE_ID_HEADER};
use crate::error::{Error, Result};
use crate::interfaces::{Delivery, DeliveryTag, MessageSource, Settlement};
use async_trait::async_trait;
use dashmap::DashSet;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// One worker's consumer on a queue's consumer group.
///
/// Offsets are committed only when a message is settled, so a crash before
/// settlement means redelivery from the last committed offset. `Requeue` seeks the
/// partition back to the message; `Reject` copies it to the dead-letter topic and
/// then commits past it.
pub struct KafkaQueueSource {
    consumer: StreamConsumer,
    dead_letter: FutureProducer,
    dead_letter_topic: String,
    topic_prefix: String,
    queue: String,
    requeued: DashSet<DeliveryTag>,
}

impl KafkaQueueSource {
    pub fn new(brokers: &str, exchange: &str, queue: &str, binding: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", queue)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| Error::Broker(e.to_string()))?;

        let subscription = subscription_regex(exchange, binding);
        consumer.subscribe(&[subscription.as_str()])
            .map_err(|e| Error::Broker(e.to_string()))?;

        let dead_letter: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| Error::Broker(e.to_string()))?;

        tracing::info!(queue, subscription = %subscription, "kafka queue consumer subscribed");
        Ok(KafkaQueueSource {
            consumer,
            dead_letter,
            dead_letter_topic: dead_letter_topic(exchange),
            topic_prefix: format!("{}.", exchange),
            queue: queue.to_string(),
            requeued: DashSet::new(),
        })
    }

    fn commit_past(&self, tag: &DeliveryTag) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&tag.channel, tag.partition, Offset::Offset(tag.offset + 1))
            .map_err(|e| Error::Broker(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| Error::Broker(e.to_string()))
    }
}

#[async_trait]
impl MessageSource for KafkaQueueSource {
    async fn receive(&self) -> Result<Delivery> {
        let message = self.consumer.recv().await
            .map_err(|e| Error::Broker(e.to_string()))?;

        let message_id = message.headers().and_then(|headers| {
            headers
                .iter()
                .find(|h| h.key == MESSAGE_ID_HEADER)
                .and_then(|h| h.value)
                .map(|v| String::from_utf8_lossy(v).into_owned())
        });
        let tag = DeliveryTag {
            channel: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        let redelivered = self.requeued.contains(&tag);
        let routing_key = message
            .topic()
            .strip_prefix(self.topic_prefix.as_str())
            .unwrap_or(message.topic())
            .to_string();

        Ok(Delivery {
            routing_key,
            payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            message_id,
            tag,
            redelivered,
        })
    }

    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<()> {
        let tag = &delivery.tag;
        match settlement {
            Settlement::Ack => {
                self.requeued.remove(tag);
                self.commit_past(tag)
            }
            Settlement::Requeue => {
                self.requeued.insert(tag.clone());
                self.consumer
                    .seek(&tag.channel, tag.partition, Offset::Offset(tag.offset), SEEK_TIMEOUT)
                    .map_err(|e| Error::Broker(e.to_string()))
            }
            Settlement::Reject => {
                let mut headers = OwnedHeaders::new();
                if let Some(id) = &delivery.message_id {
                    headers = headers.insert(Header {
                        key: MESSAGE_ID_HEADER,
                        value: Some(id.as_str()),
                    });
                }
                let record = FutureRecord::to(&self.dead_letter_topic)
                    .payload(&delivery.payload)
                    .key(&delivery.routing_key)
                    .headers(headers);
                self.dead_letter
                    .send(record, SEEK_TIMEOUT)
                    .await
                    .map_err(|(e, _)| Error::Broker(e.to_string()))?;

                tracing::warn!(
                    queue = %self.queue,
                    topic = %tag.channel,
                    offset = tag.offset,
                    "message dead-lettered"
                );
                self.requeued.remove(tag);
                self.commit_past(tag)
            }
        }
    }
}
