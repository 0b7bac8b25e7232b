//! # Audit Log
//!
//! Append-only categorized event log with retention, optional encryption,
//! and external forwarding. Producers enqueue into a bounded channel and a
//! background flusher writes batches to durable storage; business
//! transitions that require audit synchronize with the *enqueue*, not the
//! durable flush. When the buffer is full, [`AuditLog::log_event`] fails
//! fast with `Overloaded` and the caller must abort the transition.

pub mod encryption;
pub mod logger;
pub mod record;
pub mod repository;
pub mod traits;

pub use encryption::RecordCipher;
pub use logger::{AuditFlusher, AuditLog};
pub use record::{
    AuditCategory, AuditRecord, AuditRecordBuilder, AuditResult, EncryptionLevel,
};
pub use repository::{MemoryAuditRepository, PostgresAuditRepository};
pub use traits::{AuditBackend, AuditFilter, AuditStatistics};
