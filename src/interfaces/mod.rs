pub mod message_source;
pub mod price_store;
pub mod quote_publisher;

pub use message_source::{Delivery, DeliveryTag, MessageSource, Settlement};
pub use price_store::PriceStore;
pub use quote_publisher::QuotePublisher;
