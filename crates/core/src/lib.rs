pub mod audit;
pub mod auth;
pub mod bus;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod fanout;
pub mod metrics;
pub mod object_store;
pub mod types;

pub use audit::{AuditCategory, AuditLog, AuditRecord, AuditResult};
pub use bus::{BusMessage, BusStream, EventBus, MemoryEventBus, RedisEventBus};
pub use self::config::AegisConfig;
pub use error::{Error, ErrorKind, Result};
pub use events::{AegisEvent, EventEnvelope};
pub use fanout::RealtimeHub;
pub use metrics::{CoreMetrics, MetricsRegistry};
pub use object_store::{MemoryObjectStore, ObjectStore};
pub use types::*;

// Re-export commonly used types from dependencies
pub use chrono::{DateTime, Utc};
pub use tokio_util::sync::CancellationToken;
pub use uuid::Uuid;
