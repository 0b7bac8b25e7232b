//! # Object Store Adapter
//!
//! Raw-bytes storage behind a capability trait: file uploads land here
//! before parsing, and evidence bytes are content-addressed into it. The
//! in-memory implementation backs tests; production deployments plug in a
//! bucket-backed adapter with the same surface.

pub mod memory;

pub use memory::MemoryObjectStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Metadata stored alongside an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub attributes: HashMap<String, String>,
}

/// Chunked object read.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: ObjectMetadata) -> Result<()>;
    async fn get(&self, key: &str) -> Result<ByteStream>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn metadata(&self, key: &str) -> Result<ObjectMetadata>;
}

/// Drain a [`ByteStream`] into one buffer. Convenience for small objects.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Vec<u8>> {
    use futures::StreamExt;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
