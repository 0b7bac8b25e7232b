//! # Event Bus Adapter
//!
//! Ordered, at-least-once topic-based pub/sub with consumer groups.
//!
//! The core publishes and consumes through the [`EventBus`] trait; the
//! production adapter is Redis Streams ([`RedisEventBus`]) and tests run
//! against [`MemoryEventBus`]. Ordering guarantee: messages within a topic
//! are delivered to a consumer group in publish order, and a topic is
//! handled by at most one worker of a group at a time. Delivery is
//! at-least-once; consumers commit offsets after processing.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryEventBus;
pub use self::redis::RedisEventBus;

use crate::error::Result;
use crate::events::EventEnvelope;
use async_trait::async_trait;

/// Opaque per-topic message position. Memory bus uses a numeric offset,
/// the Redis adapter a stream entry id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A message delivered to a consumer group.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub id: MessageId,
    pub envelope: EventEnvelope,
}

/// Ordered stream of messages for one consumer-group subscription.
#[async_trait]
pub trait BusStream: Send {
    /// Next message, in per-topic publish order. Returns `None` when the
    /// bus is closed.
    async fn recv(&mut self) -> Result<Option<BusMessage>>;

    /// Acknowledge a processed message. Unacknowledged messages are
    /// redelivered to the group after a restart (at-least-once).
    async fn commit(&mut self, message: &BusMessage) -> Result<()>;
}

/// Topic-based pub/sub with consumer groups.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one envelope. Publishing is idempotent on the message key
    /// within a retry window, so a retried publish does not duplicate.
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> Result<MessageId>;

    /// Join `group` on the given topics. Each call creates one worker
    /// stream; within a group, a topic is served to one worker at a time.
    async fn subscribe(&self, group: &str, topics: &[String]) -> Result<Box<dyn BusStream>>;
}
