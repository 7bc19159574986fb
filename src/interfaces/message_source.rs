use crate::error::Result;
use async_trait::async_trait;

/// Broker-assigned position of a delivered message. Stable across redeliveries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub channel: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Clone, Debug)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub tag: DeliveryTag,
    pub redelivered: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Fully processed and committed.
    Ack,
    /// Hand the message back to the queue for another attempt.
    Requeue,
    /// Terminal rejection: dead-letter without requeue.
    Reject,
}

/// Consuming side of a queue with late, explicit settlement.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn receive(&self) -> Result<Delivery>;
    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<()>;
}
