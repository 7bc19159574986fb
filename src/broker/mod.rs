pub mod consumer;
pub mod memory;
pub mod producer;

use std::sync::Arc;
use std::time::Duration;
use crate::config::{BrokerConfig, BrokerKind};
use crate::error::Result;
use crate::interfaces::{MessageSource, QuotePublisher};
use crate::types::AssetClass;

pub use consumer::KafkaQueueSource;
pub use memory::{InMemoryBroker, MemoryQueue};
pub use producer::KafkaQuotePublisher;

pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Whether `routing_key` is delivered to a queue bound with `pattern`. Keys are
/// dot-separated words; `*` matches exactly one word and `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && words_match(rest, tail),
            None => false,
        },
    }
}

/// Kafka topic carrying one routing key.
pub fn topic_name(exchange: &str, routing_key: &str) -> String {
    format!("{}.{}", exchange, routing_key)
}

pub fn dead_letter_topic(exchange: &str) -> String {
    format!("{}.dead_letter", exchange)
}

/// Regex subscription (librdkafka syntax, leading `^`) equivalent to a binding
/// pattern. Each queue subscribes with one consumer group.
pub fn subscription_regex(exchange: &str, pattern: &str) -> String {
    let mut words = vec![escape_word(exchange)];
    words.extend(pattern.split('.').map(|word| match word {
        "*" => "[^.]+".to_string(),
        "#" => "#".to_string(),
        literal => escape_word(literal),
    }));

    // `#` absorbs its neighbouring separator so it can also match zero words.
    let mut regex = String::from("^");
    for (i, word) in words.iter().enumerate() {
        if word == "#" {
            regex.push_str("(\\.[^.]+)*");
        } else {
            if i > 0 {
                regex.push_str("\\.");
            }
            regex.push_str(word);
        }
    }
    regex.push('$');
    regex
}

fn escape_word(word: &str) -> String {
    word.chars()
        .flat_map(|c| {
            let escaped = !c.is_ascii_alphanumeric() && c != '_' && c != '-';
            escaped.then_some('\\').into_iter().chain(std::iter::once(c))
        })
        .collect()
}

/// The configured bus, able to hand out publishers and per-class queue consumers.
#[derive(Clone)]
pub enum Broker {
    Kafka(BrokerConfig),
    Memory(Arc<InMemoryBroker>),
}

impl Broker {
    pub fn from_config(config: &BrokerConfig) -> Self {
        match config.kind {
            BrokerKind::Kafka => Broker::Kafka(config.clone()),
            BrokerKind::Memory => {
                let broker = InMemoryBroker::new(&config.exchange);
                for class in AssetClass::ALL {
                    broker.declare_queue(&class.queue_name(), &class.binding_pattern());
                }
                Broker::Memory(Arc::new(broker))
            }
        }
    }

    pub fn publisher(&self) -> Result<Arc<dyn QuotePublisher>> {
        match self {
            Broker::Kafka(config) => Ok(Arc::new(KafkaQuotePublisher::new(
                &config.brokers,
                &config.exchange,
                Duration::from_secs(config.publish_timeout_secs),
            )?)),
            Broker::Memory(broker) => Ok(broker.clone()),
        }
    }

    /// A consumer on the class's ETL queue. Each call yields an independent worker
    /// handle; workers of one queue share its messages.
    pub fn queue(&self, class: AssetClass) -> Result<Arc<dyn MessageSource>> {
        match self {
            Broker::Kafka(config) => Ok(Arc::new(KafkaQueueSource::new(
                &config.brokers,
                &config.exchange,
                &class.queue_name(),
                &class.binding_pattern(),
            )?)),
            Broker::Memory(broker) => Ok(Arc::new(broker.queue(&class.queue_name())?)),
        }
    }
}
