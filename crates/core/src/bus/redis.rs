//! Redis Streams event bus adapter.
//!
//! Topics map to stream keys, consumer groups to `XGROUP`s. Publish is
//! `XADD` with the envelope JSON and partition key as fields; delivery is
//! `XREADGROUP ... >` and commit is `XACK`. Stream entry ids give per-topic
//! ordering; unacknowledged entries stay in the pending list and are
//! redelivered, which provides the at-least-once contract.

use super::{BusMessage, BusStream, EventBus, MessageId};
use crate::config::RedisConfig;
use crate::error::{Error, Result};
use crate::events::EventEnvelope;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Redis Streams-backed bus. Clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisEventBus {
    redis: ConnectionManager,
    config: RedisConfig,
}

impl RedisEventBus {
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::permanent(format!("invalid redis url: {}", e)))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(Error::from)?;
        Ok(Self { redis, config })
    }

    pub fn new(redis: ConnectionManager, config: RedisConfig) -> Self {
        Self { redis, config }
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let created: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                debug!(topic, group, "created consumer group");
                Ok(())
            }
            // BUSYGROUP means the group already exists; that is fine.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Error::from(e).in_operation(format!("bus.ensure_group topic={}", topic))),
        }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> Result<MessageId> {
        let mut conn = self.redis.clone();
        let body = envelope.to_json()?;
        let id: String = conn
            .xadd(
                topic,
                "*",
                &[("key", key), ("event_type", envelope.event_type()), ("body", body.as_str())],
            )
            .await
            .map_err(|e| Error::from(e).in_operation(format!("bus.publish topic={} key={}", topic, key)))?;
        Ok(MessageId(id))
    }

    async fn subscribe(&self, group: &str, topics: &[String]) -> Result<Box<dyn BusStream>> {
        for topic in topics {
            self.ensure_group(topic, group).await?;
        }
        Ok(Box::new(RedisBusStream {
            redis: self.redis.clone(),
            group: group.to_string(),
            consumer: self.config.consumer_name.clone(),
            topics: topics.to_vec(),
            block_ms: self.config.block_timeout_ms,
            buffered: VecDeque::new(),
        }))
    }
}

struct RedisBusStream {
    redis: ConnectionManager,
    group: String,
    consumer: String,
    topics: Vec<String>,
    block_ms: u64,
    buffered: VecDeque<BusMessage>,
}

impl RedisBusStream {
    fn parse_reply(&self, reply: StreamReadReply) -> Vec<BusMessage> {
        let mut out = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let key = entry
                    .get::<String>("key")
                    .unwrap_or_default();
                let Some(body) = entry.get::<String>("body") else {
                    warn!(topic = %stream.key, id = %entry.id, "stream entry without body");
                    continue;
                };
                match EventEnvelope::from_json(&body) {
                    Ok(envelope) => out.push(BusMessage {
                        topic: stream.key.clone(),
                        key,
                        id: MessageId(entry.id.clone()),
                        envelope,
                    }),
                    Err(e) => {
                        warn!(topic = %stream.key, id = %entry.id, error = %e, "undecodable envelope");
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl BusStream for RedisBusStream {
    async fn recv(&mut self) -> Result<Option<BusMessage>> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(Some(message));
            }

            let mut conn = self.redis.clone();
            let options = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(16)
                .block(self.block_ms as usize);
            let ids: Vec<&str> = self.topics.iter().map(|_| ">").collect();
            let reply: StreamReadReply = conn
                .xread_options(
                    &self.topics.iter().map(String::as_str).collect::<Vec<_>>(),
                    &ids,
                    &options,
                )
                .await
                .map_err(|e| Error::from(e).in_operation("bus.recv"))?;

            let messages = self.parse_reply(reply);
            if messages.is_empty() {
                // Blocked read timed out with nothing pending; poll again.
                continue;
            }
            self.buffered.extend(messages);
        }
    }

    async fn commit(&mut self, message: &BusMessage) -> Result<()> {
        let mut conn = self.redis.clone();
        let _acked: u64 = conn
            .xack(&message.topic, &self.group, &[message.id.as_str()])
            .await
            .map_err(|e| {
                Error::from(e).in_operation(format!(
                    "bus.commit topic={} id={}",
                    message.topic,
                    message.id.as_str()
                ))
            })?;
        Ok(())
    }
}
