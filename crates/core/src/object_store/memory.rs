//! In-memory object store for tests and embedded deployments.

use super::{ByteStream, ObjectMetadata, ObjectStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use std::sync::Arc;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, (Vec<u8>, ObjectMetadata)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace stored bytes without touching metadata. Test helper for
    /// tamper scenarios.
    pub fn overwrite_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut entry = self
            .objects
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("object {}", key)))?;
        entry.value_mut().0 = bytes;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, mut metadata: ObjectMetadata) -> Result<()> {
        metadata.size_bytes = bytes.len() as u64;
        self.objects.insert(key.to_string(), (bytes, metadata));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let entry = self
            .objects
            .get(key)
            .ok_or_else(|| Error::not_found(format!("object {}", key)).in_operation("object_store.get"))?;
        let chunks: Vec<Result<Vec<u8>>> = entry
            .value()
            .0
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .remove(key)
            .ok_or_else(|| Error::not_found(format!("object {}", key)).in_operation("object_store.delete"))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn metadata(&self, key: &str) -> Result<ObjectMetadata> {
        self.objects
            .get(key)
            .map(|e| e.value().1.clone())
            .ok_or_else(|| Error::not_found(format!("object {}", key)).in_operation("object_store.metadata"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::collect_bytes;
    use chrono::Utc;
    use std::collections::HashMap;

    fn meta() -> ObjectMetadata {
        ObjectMetadata {
            content_type: "application/octet-stream".to_string(),
            size_bytes: 0,
            created_at: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryObjectStore::new();
        let payload = vec![7u8; 200_000];
        store.put("uploads/f1", payload.clone(), meta()).await.unwrap();

        let bytes = collect_bytes(store.get("uploads/f1").await.unwrap()).await.unwrap();
        assert_eq!(bytes, payload);
        assert_eq!(store.metadata("uploads/f1").await.unwrap().size_bytes, 200_000);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryObjectStore::new();
        store.put("evidence/a", vec![1], meta()).await.unwrap();
        store.put("evidence/b", vec![2], meta()).await.unwrap();
        store.put("uploads/c", vec![3], meta()).await.unwrap();

        let keys = store.list("evidence/").await.unwrap();
        assert_eq!(keys, vec!["evidence/a".to_string(), "evidence/b".to_string()]);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = MemoryObjectStore::new();
        match store.get("nope").await {
            Err(err) => assert_eq!(err.kind, crate::error::ErrorKind::NotFound),
            Ok(_) => panic!("expected not found error"),
        }
    }
}
