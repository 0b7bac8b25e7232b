//! # Realtime Fan-out
//!
//! Topic-filtered push of bus events to subscribed observers. The hub owns
//! the observer set and publishes by iterating it under a shared read
//! lock; each observer has a bounded send buffer and a slow observer is
//! evicted when its buffer fills, releasing its resources.

use crate::bus::{BusStream, EventBus};
use crate::config::FanoutConfig;
use crate::error::Result;
use crate::events::EventEnvelope;
use crate::metrics::CoreMetrics;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ObserverHandle {
    topics: HashSet<String>,
    sender: mpsc::Sender<ObservedEvent>,
}

/// One message delivered to an observer.
#[derive(Debug, Clone)]
pub struct ObservedEvent {
    pub topic: String,
    pub envelope: EventEnvelope,
}

/// Receiving side of an observer registration. Dropped automatically when
/// the observer is evicted.
pub struct ObserverStream {
    pub id: Uuid,
    receiver: mpsc::Receiver<ObservedEvent>,
}

impl ObserverStream {
    pub async fn recv(&mut self) -> Option<ObservedEvent> {
        self.receiver.recv().await
    }
}

/// Fan-out hub: per-observer bounded queues with an eviction policy.
pub struct RealtimeHub {
    observers: RwLock<HashMap<Uuid, ObserverHandle>>,
    buffer_size: usize,
    metrics: Arc<CoreMetrics>,
}

impl RealtimeHub {
    pub fn new(config: &FanoutConfig, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            buffer_size: config.observer_buffer_size,
            metrics,
        }
    }

    /// Register an observer for the given topics. An empty filter means
    /// every forwarded topic.
    pub async fn register(&self, topics: impl IntoIterator<Item = String>) -> ObserverStream {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let handle = ObserverHandle {
            topics: topics.into_iter().collect(),
            sender,
        };
        self.observers.write().await.insert(id, handle);
        debug!(observer = %id, "observer registered");
        ObserverStream { id, receiver }
    }

    pub async fn unregister(&self, id: Uuid) {
        if self.observers.write().await.remove(&id).is_some() {
            debug!(observer = %id, "observer unregistered");
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Push one event to every interested observer. Observers whose
    /// buffers are full are evicted after the read pass.
    pub async fn publish(&self, topic: &str, envelope: &EventEnvelope) {
        let mut evict: Vec<Uuid> = Vec::new();
        {
            let observers = self.observers.read().await;
            for (id, handle) in observers.iter() {
                if !handle.topics.is_empty() && !handle.topics.contains(topic) {
                    continue;
                }
                let event = ObservedEvent {
                    topic: topic.to_string(),
                    envelope: envelope.clone(),
                };
                match handle.sender.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.metrics.fanout_dropped_total.inc();
                        evict.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => evict.push(*id),
                }
            }
        }
        if !evict.is_empty() {
            let mut observers = self.observers.write().await;
            for id in evict {
                if observers.remove(&id).is_some() {
                    self.metrics.fanout_evictions_total.inc();
                    warn!(observer = %id, "slow observer evicted");
                }
            }
        }
    }

    /// Forward the configured topics from the bus to live observers until
    /// cancelled.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<dyn EventBus>,
        config: FanoutConfig,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut stream: Box<dyn BusStream> =
            bus.subscribe("realtime-fanout", &config.topics).await?;
        info!(topics = ?config.topics, "realtime fan-out started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("realtime fan-out stopping");
                    return Ok(());
                }
                received = stream.recv() => {
                    match received? {
                        Some(message) => {
                            self.publish(&message.topic, &message.envelope).await;
                            stream.commit(&message).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AegisEvent, AlertCreated};
    use crate::types::Priority;

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(AegisEvent::AlertCreated(AlertCreated {
            alert_id: Uuid::new_v4(),
            rule_id: "smurfing/high".to_string(),
            priority: Priority::High,
            entity_ids: vec![],
            pattern_id: None,
        }))
    }

    fn hub(buffer: usize) -> RealtimeHub {
        RealtimeHub::new(
            &FanoutConfig {
                observer_buffer_size: buffer,
                topics: vec![],
            },
            CoreMetrics::new_unregistered(),
        )
    }

    #[tokio::test]
    async fn topic_filter_applies() {
        let hub = hub(8);
        let mut alerts = hub.register(["aegis.alert.created".to_string()]).await;
        let mut everything = hub.register([]).await;

        hub.publish("aegis.alert.created", &envelope()).await;
        hub.publish("aegis.pattern.detected", &envelope()).await;

        assert_eq!(alerts.recv().await.unwrap().topic, "aegis.alert.created");
        assert_eq!(everything.recv().await.unwrap().topic, "aegis.alert.created");
        assert_eq!(everything.recv().await.unwrap().topic, "aegis.pattern.detected");
    }

    #[tokio::test]
    async fn slow_observer_is_evicted() {
        let hub = hub(1);
        let _slow = hub.register([]).await; // never drained
        assert_eq!(hub.observer_count().await, 1);

        hub.publish("t", &envelope()).await; // fills the buffer
        hub.publish("t", &envelope()).await; // overflows; evicts

        assert_eq!(hub.observer_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_releases_observer() {
        let hub = hub(4);
        let stream = hub.register([]).await;
        hub.unregister(stream.id).await;
        assert_eq!(hub.observer_count().await, 0);
    }
}
