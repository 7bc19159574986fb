use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;
use crate::broker::topic_matches;
use crate::error::{Error, Result};
use crate::interfaces::{Delivery, DeliveryTag, MessageSource, QuotePublisher, Settlement};
use crate::types::Quote;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<i64, Delivery>,
}

struct Queue {
    pattern: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::Broker("queue state poisoned".to_string()))
    }
}

/// In-process broker with the same settlement contract as the Kafka path.
///
/// A received message sits in the unacked set until settled. `Requeue` puts it
/// back flagged as redelivered, `Reject` moves it to the dead-letter list and
/// `recover` returns every unacked message to its queue.
pub struct InMemoryBroker {
    exchange: String,
    queues: DashMap<String, Arc<Queue>>,
    dead_letters: Mutex<Vec<Delivery>>,
    next_offset: AtomicI64,
}

impl InMemoryBroker {
    pub fn new(exchange: &str) -> Self {
        InMemoryBroker {
            exchange: exchange.to_string(),
            queues: DashMap::new(),
            dead_letters: Mutex::new(Vec::new()),
            next_offset: AtomicI64::new(0),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declare a queue bound to `pattern`. Redeclaring an existing queue is a no-op.
    pub fn declare_queue(&self, name: &str, pattern: &str) {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Queue {
                pattern: pattern.to_string(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            })
        });
    }

    /// A consumer handle on a declared queue.
    pub fn queue(self: &Arc<Self>, name: &str) -> Result<MemoryQueue> {
        let queue = self
            .queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| Error::Broker(format!("queue {} not declared", name)))?;
        Ok(MemoryQueue {
            broker: self.clone(),
            name: name.to_string(),
            queue,
        })
    }

    /// Route a raw payload to every bound queue. Returns how many queues took it.
    pub fn publish_raw(&self, routing_key: &str, payload: Vec<u8>) -> Result<usize> {
        let message_id = Uuid::new_v4().to_string();
        let mut routed = 0;
        for entry in self.queues.iter() {
            let queue = entry.value();
            if !topic_matches(&queue.pattern, routing_key) {
                continue;
            }
            let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                message_id: Some(message_id.clone()),
                tag: DeliveryTag {
                    channel: entry.key().clone(),
                    partition: 0,
                    offset,
                },
                redelivered: false,
            };
            queue.lock()?.ready.push_back(delivery);
            queue.notify.notify_waiters();
            routed += 1;
        }
        if routed == 0 {
            tracing::warn!(exchange = %self.exchange, routing_key, "message matched no queue binding, dropped");
        }
        Ok(routed)
    }

    /// Return every unacked message to its queue as a redelivery.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for entry in self.queues.iter() {
            let queue = entry.value();
            let mut state = queue.lock()?;
            let mut pending: Vec<Delivery> = state.unacked.drain().map(|(_, d)| d).collect();
            pending.sort_by_key(|d| d.tag.offset);
            for mut delivery in pending.into_iter().rev() {
                delivery.redelivered = true;
                state.ready.push_front(delivery);
                recovered += 1;
            }
            drop(state);
            queue.notify.notify_waiters();
        }
        Ok(recovered)
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.queue_counts(queue).0
    }

    pub fn unacked_len(&self, queue: &str) -> usize {
        self.queue_counts(queue).1
    }

    fn queue_counts(&self, name: &str) -> (usize, usize) {
        let Some(queue) = self.queues.get(name) else {
            return (0, 0);
        };
        let counts = match queue.lock() {
            Ok(state) => (state.ready.len(), state.unacked.len()),
            Err(_) => (0, 0),
        };
        counts
    }

    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.dead_letters
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotePublisher for InMemoryBroker {
    async fn publish(&self, routing_key: &str, quote: &Quote) -> Result<()> {
        self.publish_raw(routing_key, quote.encode()?)?;
        Ok(())
    }
}

/// One consumer's view of a queue.
pub struct MemoryQueue {
    broker: Arc<InMemoryBroker>,
    name: String,
    queue: Arc<Queue>,
}

impl MemoryQueue {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn receive(&self) -> Result<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.queue.lock()?;
                if let Some(delivery) = state.ready.pop_front() {
                    state.unacked.insert(delivery.tag.offset, delivery.clone());
                    return Ok(delivery);
                }
            }
            notified.await;
        }
    }

    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<()> {
        let mut state = self.queue.lock()?;
        let mut message = state.unacked.remove(&delivery.tag.offset).ok_or_else(|| {
            Error::Broker(format!(
                "unknown delivery tag {} on {}",
                delivery.tag.offset, self.name
            ))
        })?;

        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                message.redelivered = true;
                state.ready.push_back(message);
                drop(state);
                self.queue.notify.notify_waiters();
            }
            Settlement::Reject => {
                drop(state);
                self.broker
                    .dead_letters
                    .lock()
                    .map_err(|_| Error::Broker("dead letter list poisoned".to_string()))?
                    .push(message);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::types::AssetClass;

    fn broker() -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new("market_data"));
        for class in AssetClass::ALL {
            broker.declare_queue(&class.queue_name(), &class.binding_pattern());
        }
        broker
    }

    #[tokio::test]
    async fn routes_by_asset_class() {
        let broker = broker();
        let quote = Quote::new("BTCUSDT", AssetClass::Crypto, "binance", 43_000.0);
        broker.publish("crypto.ticker", &quote).await.unwrap();

        assert_eq!(broker.ready_len("etl.crypto.queue"), 1);
        assert_eq!(broker.ready_len("etl.equity.queue"), 0);

        let delivery = broker.queue("etl.crypto.queue").unwrap().receive().await.unwrap();
        assert_eq!(Quote::decode(&delivery.payload).unwrap(), quote);
        assert!(!delivery.redelivered);
    }

    #[tokio::test]
    async fn unmatched_routing_key_is_dropped() {
        let broker = broker();
        assert_eq!(broker.publish_raw("forex.ticker", b"{}".to_vec()).unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_redelivers_and_ack_removes() {
        let broker = broker();
        let queue = broker.queue("etl.bond.queue").unwrap();
        broker.publish_raw("bond.ticker", b"payload".to_vec()).unwrap();

        let first = queue.receive().await.unwrap();
        queue.settle(&first, Settlement::Requeue).await.unwrap();
        let second = queue.receive().await.unwrap();
        assert!(second.redelivered);
        assert_eq!(second.tag, first.tag);

        queue.settle(&second, Settlement::Ack).await.unwrap();
        assert_eq!(broker.ready_len("etl.bond.queue"), 0);
        assert_eq!(broker.unacked_len("etl.bond.queue"), 0);
        assert!(queue.settle(&second, Settlement::Ack).await.is_err());
    }

    #[tokio::test]
    async fn reject_dead_letters_without_requeue() {
        let broker = broker();
        let queue = broker.queue("etl.equity.queue").unwrap();
        broker.publish_raw("equity.ticker", b"not json".to_vec()).unwrap();

        let delivery = queue.receive().await.unwrap();
        queue.settle(&delivery, Settlement::Reject).await.unwrap();

        assert_eq!(broker.ready_len("etl.equity.queue"), 0);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"not json".to_vec());
    }

    #[tokio::test]
    async fn unsettled_messages_survive_a_crashed_consumer() {
        let broker = broker();
        let queue = broker.queue("etl.commodity.queue").unwrap();
        broker.publish_raw("commodity.ticker", b"a".to_vec()).unwrap();
        broker.publish_raw("commodity.ticker", b"b".to_vec()).unwrap();

        let _in_flight = queue.receive().await.unwrap();
        assert_eq!(broker.recover().unwrap(), 1);

        let redelivered = queue.receive().await.unwrap();
        assert_eq!(redelivered.payload, b"a".to_vec());
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn receive_waits_for_publish() {
        let broker = broker();
        let queue = broker.queue("etl.crypto.queue").unwrap();
        let waiter = tokio::spawn(async move { queue.receive().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish_raw("crypto.ticker", b"late".to_vec()).unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"late".to_vec());
    }

    #[test]
    fn undeclared_queue_is_an_error() {
        assert!(matches!(broker().queue("etl.forex.queue"), Err(Error::Broker(_))));
    }
}
