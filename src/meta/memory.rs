//! In-memory metadata service, used by tests and single-process deployments.

use crate::error::{Result, StoreError};
use crate::meta::{
    MetadataClient, ObjectDescriptor, ObjectId, ObjectStatus, SealState,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    next_id: ObjectId,
    buckets: HashSet<String>,
    objects: HashMap<(String, String), ObjectDescriptor>,
    ids: HashMap<ObjectId, (String, String)>,
}

/// HashMap-backed [`MetadataClient`]. All operations are linearized through a
/// single mutex, mirroring the single-writer semantics of the real service.
#[derive(Default)]
pub struct InMemoryMetaClient {
    inner: Mutex<Inner>,
}

impl InMemoryMetaClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn location_for(id: ObjectId) -> String {
        format!("obj-{id:016x}")
    }
}

#[async_trait]
impl MetadataClient for InMemoryMetaClient {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.buckets.insert(bucket.to_string()) {
            return Err(StoreError::AlreadyExists(bucket.to_string()));
        }
        Ok(())
    }

    async fn lookup_bucket(&self, bucket: &str) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if inner.buckets.contains(bucket) {
            Ok(())
        } else {
            Err(StoreError::NotFound(bucket.to_string()))
        }
    }

    async fn resolve(&self, bucket: &str, key: &str) -> Result<ObjectDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{bucket}/{key}")))
    }

    async fn create_descriptor(&self, bucket: &str, key: &str) -> Result<ObjectDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.buckets.contains(bucket) {
            return Err(StoreError::NotFound(format!("bucket {bucket}")));
        }
        let slot = (bucket.to_string(), key.to_string());
        if inner.objects.contains_key(&slot) {
            return Err(StoreError::AlreadyExists(format!("{bucket}/{key}")));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let desc = ObjectDescriptor {
            id,
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: 0,
            seal_state: SealState::Open,
            generation: 1,
            metadata: None,
            location: Self::location_for(id),
        };
        inner.objects.insert(slot.clone(), desc.clone());
        inner.ids.insert(id, slot);
        Ok(desc)
    }

    async fn refresh(&self, id: ObjectId) -> Result<ObjectDescriptor> {
        let inner = self.inner.lock().unwrap();
        let slot = inner
            .ids
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("object {id}")))?;
        Ok(inner.objects[slot].clone())
    }

    async fn commit_size(&self, id: ObjectId, size: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .ids
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("object {id}")))?;
        let desc = inner.objects.get_mut(&slot).unwrap();
        if desc.is_sealed() {
            return Err(StoreError::AlreadySealed);
        }
        desc.size = size;
        Ok(())
    }

    async fn set_metadata(&self, id: ObjectId, metadata: Option<Bytes>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .ids
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("object {id}")))?;
        let desc = inner.objects.get_mut(&slot).unwrap();
        if desc.is_sealed() {
            return Err(StoreError::AlreadySealed);
        }
        desc.metadata = metadata;
        Ok(())
    }

    async fn commit_seal(
        &self,
        id: ObjectId,
        size: u64,
        metadata: Option<Bytes>,
    ) -> Result<ObjectDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .ids
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::Conflict(format!("object {id} was deleted")))?;
        let desc = inner.objects.get_mut(&slot).unwrap();
        if desc.is_sealed() {
            return Err(StoreError::AlreadySealed);
        }
        desc.size = size;
        desc.metadata = metadata;
        desc.seal_state = SealState::Sealed;
        desc.generation += 1;
        Ok(desc.clone())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<ObjectDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        let slot = (bucket.to_string(), key.to_string());
        let desc = inner
            .objects
            .remove(&slot)
            .ok_or_else(|| StoreError::NotFound(format!("{bucket}/{key}")))?;
        inner.ids.remove(&desc.id);
        Ok(desc)
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
        let mut inner = self.inner.lock().unwrap();
        let victims: Vec<(String, String)> = inner
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .cloned()
            .collect();
        let mut deleted = Vec::with_capacity(victims.len());
        for slot in victims {
            let desc = inner.objects.remove(&slot).unwrap();
            inner.ids.remove(&desc.id);
            deleted.push(desc);
        }
        Ok(deleted)
    }

    async fn rename(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = (bucket.to_string(), src_key.to_string());
        let dst = (bucket.to_string(), dst_key.to_string());
        if inner.objects.contains_key(&dst) {
            return Err(StoreError::AlreadyExists(format!("{bucket}/{dst_key}")));
        }
        let mut desc = inner
            .objects
            .remove(&src)
            .ok_or_else(|| StoreError::NotFound(format!("{bucket}/{src_key}")))?;
        desc.key = dst_key.to_string();
        inner.ids.insert(desc.id, dst.clone());
        inner.objects.insert(dst, desc);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectStatus>> {
        let inner = self.inner.lock().unwrap();
        if !inner.buckets.contains(bucket) {
            return Err(StoreError::NotFound(bucket.to_string()));
        }
        let mut out: Vec<ObjectStatus> = inner
            .objects
            .values()
            .filter(|d| d.bucket == bucket && d.key.starts_with(prefix))
            .map(|d| ObjectStatus {
                bucket: d.bucket.clone(),
                key: d.key.clone(),
                size: d.size,
                sealed: d.is_sealed(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn status(&self, bucket: &str, key: &str) -> Result<ObjectStatus> {
        let desc = self.resolve(bucket, key).await?;
        Ok(ObjectStatus {
            bucket: desc.bucket,
            key: desc.key,
            size: desc.size,
            sealed: desc.seal_state == SealState::Sealed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_resolve_seal() {
        let meta = InMemoryMetaClient::new();
        meta.create_bucket("data").await.unwrap();
        let desc = meta.create_descriptor("data", "a.bin").await.unwrap();
        assert_eq!(desc.seal_state, SealState::Open);
        assert_eq!(desc.generation, 1);

        let err = meta.create_descriptor("data", "a.bin").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let sealed = meta
            .commit_seal(desc.id, 42, Some(Bytes::from_static(b"m")))
            .await
            .unwrap();
        assert!(sealed.is_sealed());
        assert_eq!(sealed.size, 42);
        assert_eq!(sealed.generation, 2);

        let err = meta.commit_seal(desc.id, 42, None).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadySealed));
    }

    #[tokio::test]
    async fn test_rename_keeps_identity() {
        let meta = InMemoryMetaClient::new();
        meta.create_bucket("data").await.unwrap();
        let desc = meta.create_descriptor("data", "old").await.unwrap();
        meta.rename("data", "old", "new").await.unwrap();

        let renamed = meta.resolve("data", "new").await.unwrap();
        assert_eq!(renamed.id, desc.id);
        assert_eq!(renamed.location, desc.location);
        assert!(matches!(
            meta.resolve("data", "old").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_seal_after_delete_conflicts() {
        let meta = InMemoryMetaClient::new();
        meta.create_bucket("data").await.unwrap();
        let desc = meta.create_descriptor("data", "gone").await.unwrap();
        meta.delete("data", "gone").await.unwrap();
        let err = meta.commit_seal(desc.id, 0, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let meta = InMemoryMetaClient::new();
        meta.create_bucket("data").await.unwrap();
        for key in ["logs/a", "logs/b", "other/c"] {
            meta.create_descriptor("data", key).await.unwrap();
        }
        let listed = meta.list("data", "logs/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "logs/a");
        assert_eq!(listed[1].key, "logs/b");
    }
}
