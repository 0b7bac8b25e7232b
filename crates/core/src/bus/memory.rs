//! In-memory event bus used by tests and single-process deployments.
//!
//! Per-topic append-only logs with per-`(group, topic)` cursors. A cursor
//! has a delivery position and a committed position; re-subscribing a group
//! resumes from the committed position, which gives the same at-least-once
//! contract as the Redis adapter.

use super::{BusMessage, BusStream, EventBus, MessageId};
use crate::error::{Error, Result};
use crate::events::EventEnvelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    key: String,
    envelope: EventEnvelope,
}

#[derive(Debug, Default)]
struct GroupCursor {
    /// Next offset to deliver.
    next: u64,
    /// First uncommitted offset.
    committed: u64,
}

#[derive(Default)]
struct BusState {
    logs: HashMap<String, Vec<StoredMessage>>,
    cursors: HashMap<(String, String), GroupCursor>,
    /// Last offset published per (topic, key); retried publishes of the
    /// same key at the log head are collapsed.
    last_key: HashMap<String, (String, u64)>,
    closed: bool,
}

/// Bounded-free in-memory bus; publish order per topic is delivery order.
#[derive(Clone)]
pub struct MemoryEventBus {
    state: Arc<RwLock<BusState>>,
    notify: Arc<Notify>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Stop delivery; pending `recv` calls return `None`.
    pub async fn close(&self) {
        self.state.write().await.closed = true;
        self.notify.notify_waiters();
    }

    /// All messages ever published to `topic`, in order. Test helper.
    pub async fn topic_log(&self, topic: &str) -> Vec<EventEnvelope> {
        self.state
            .read()
            .await
            .logs
            .get(topic)
            .map(|log| log.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages on `topic`. Test helper.
    pub async fn topic_len(&self, topic: &str) -> usize {
        self.state
            .read()
            .await
            .logs
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> Result<MessageId> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(Error::permanent("bus closed").in_operation("bus.publish"));
        }

        // Idempotent on key at the log head: a retried publish of the same
        // key lands on the existing offset instead of appending twice.
        if let Some((last_key, offset)) = state.last_key.get(topic) {
            if last_key == key {
                return Ok(MessageId(offset.to_string()));
            }
        }

        let log = state.logs.entry(topic.to_string()).or_default();
        let offset = log.len() as u64;
        log.push(StoredMessage {
            key: key.to_string(),
            envelope: envelope.clone(),
        });
        state
            .last_key
            .insert(topic.to_string(), (key.to_string(), offset));
        drop(state);

        self.notify.notify_waiters();
        debug!(topic, key, offset, "published");
        Ok(MessageId(offset.to_string()))
    }

    async fn subscribe(&self, group: &str, topics: &[String]) -> Result<Box<dyn BusStream>> {
        let mut state = self.state.write().await;
        for topic in topics {
            let cursor = state
                .cursors
                .entry((group.to_string(), topic.clone()))
                .or_default();
            // Resume delivery from the committed position.
            cursor.next = cursor.committed;
        }
        drop(state);

        Ok(Box::new(MemoryBusStream {
            state: self.state.clone(),
            notify: self.notify.clone(),
            group: group.to_string(),
            topics: topics.to_vec(),
        }))
    }
}

struct MemoryBusStream {
    state: Arc<RwLock<BusState>>,
    notify: Arc<Notify>,
    group: String,
    topics: Vec<String>,
}

impl MemoryBusStream {
    async fn poll_once(&self) -> Option<BusMessage> {
        let mut state = self.state.write().await;
        for topic in &self.topics {
            let position = state
                .cursors
                .get(&(self.group.clone(), topic.clone()))
                .map(|c| c.next)
                .unwrap_or(0);
            let Some(log) = state.logs.get(topic) else {
                continue;
            };
            if let Some(message) = log.get(position as usize) {
                let message = BusMessage {
                    topic: topic.clone(),
                    key: message.key.clone(),
                    id: MessageId(position.to_string()),
                    envelope: message.envelope.clone(),
                };
                if let Some(cursor) = state.cursors.get_mut(&(self.group.clone(), topic.clone())) {
                    cursor.next = position + 1;
                }
                return Some(message);
            }
        }
        None
    }
}

#[async_trait]
impl BusStream for MemoryBusStream {
    async fn recv(&mut self) -> Result<Option<BusMessage>> {
        loop {
            // Arm the notification before polling so a publish between the
            // poll and the await is not lost.
            let notified = self.notify.notified();
            if let Some(message) = self.poll_once().await {
                return Ok(Some(message));
            }
            if self.state.read().await.closed {
                return Ok(None);
            }
            notified.await;
        }
    }

    async fn commit(&mut self, message: &BusMessage) -> Result<()> {
        let offset: u64 = message
            .id
            .as_str()
            .parse()
            .map_err(|_| Error::invalid(format!("bad offset {}", message.id.as_str())))?;
        let mut state = self.state.write().await;
        if let Some(cursor) = state
            .cursors
            .get_mut(&(self.group.clone(), message.topic.clone()))
        {
            if offset + 1 > cursor.committed {
                cursor.committed = offset + 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AegisEvent, ValidationCompleted};
    use uuid::Uuid;

    fn envelope(n: u32) -> EventEnvelope {
        EventEnvelope::new(AegisEvent::ValidationCompleted(ValidationCompleted {
            transaction_id: Uuid::new_v4(),
            valid: true,
            errors: vec![],
            warnings: vec![format!("w{}", n)],
            quality_score: 1.0,
        }))
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = MemoryEventBus::new();
        let topic = "aegis.data.validation".to_string();
        for n in 0..5 {
            bus.publish(&topic, &format!("k{}", n), &envelope(n)).await.unwrap();
        }

        let mut stream = bus.subscribe("workers", &[topic]).await.unwrap();
        for n in 0..5u64 {
            let msg = stream.recv().await.unwrap().unwrap();
            assert_eq!(msg.id.as_str(), n.to_string());
        }
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_on_resubscribe() {
        let bus = MemoryEventBus::new();
        let topic = "aegis.data.validation".to_string();
        bus.publish(&topic, "a", &envelope(0)).await.unwrap();
        bus.publish(&topic, "b", &envelope(1)).await.unwrap();

        let mut stream = bus.subscribe("workers", std::slice::from_ref(&topic)).await.unwrap();
        let first = stream.recv().await.unwrap().unwrap();
        stream.commit(&first).await.unwrap();
        let _second_uncommitted = stream.recv().await.unwrap().unwrap();
        drop(stream);

        let mut resumed = bus.subscribe("workers", &[topic]).await.unwrap();
        let redelivered = resumed.recv().await.unwrap().unwrap();
        assert_eq!(redelivered.id.as_str(), "1");
    }

    #[tokio::test]
    async fn publish_is_idempotent_on_key_at_head() {
        let bus = MemoryEventBus::new();
        let topic = "aegis.data.transaction-flow".to_string();
        let env = envelope(0);
        let first = bus.publish(&topic, "batch:0", &env).await.unwrap();
        let retried = bus.publish(&topic, "batch:0", &env).await.unwrap();
        assert_eq!(first, retried);
        assert_eq!(bus.topic_len(&topic).await, 1);
    }

    #[tokio::test]
    async fn groups_consume_independently() {
        let bus = MemoryEventBus::new();
        let topic = "aegis.pattern.detected".to_string();
        bus.publish(&topic, "p1", &envelope(0)).await.unwrap();

        let mut alerts = bus.subscribe("alert-manager", std::slice::from_ref(&topic)).await.unwrap();
        let mut fanout = bus.subscribe("fanout", std::slice::from_ref(&topic)).await.unwrap();

        assert!(alerts.recv().await.unwrap().is_some());
        assert!(fanout.recv().await.unwrap().is_some());
    }
}
