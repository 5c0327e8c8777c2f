//! Object store collaborator.
//!
//! The engine only needs paginated listing plus get/put/delete. Listings are
//! treated as eventually consistent: an object written a moment ago may be
//! missing from the next page.

use crate::error::{ArchiveError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// One entry of a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// A page of listing results
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    /// Token for the next page, `None` on the last page
    pub next_token: Option<String>,
}

/// Object store backend trait
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List one page of keys under `prefix`
    async fn list_objects(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> Result<ListPage>;

    /// Retrieve an object body
    async fn get_object(&self, key: &str) -> Result<Bytes>;

    /// Store an object, replacing any existing one
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;

    /// Delete an object; deleting a missing key succeeds
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Delete several objects, failing if any single delete fails
    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete_object(key).await?;
        }
        Ok(())
    }

    /// Time-limited download URL, if the backend supports it
    async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<Option<String>> {
        let _ = (key, expires_in);
        Ok(None)
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    last_modified: DateTime<Utc>,
}

/// Process-local object store.
///
/// Backs the `memory` storage backend and the test suite. Failure injection
/// hooks simulate an unreachable store.
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    page_size: usize,
    listing_unavailable: AtomicBool,
    failing_deletes: AtomicU32,
    get_delay: RwLock<Option<Duration>>,
    delete_delay: RwLock<Option<Duration>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    /// Store that returns at most `page_size` entries per listing page
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            listing_unavailable: AtomicBool::new(false),
            failing_deletes: AtomicU32::new(0),
            get_delay: RwLock::new(None),
            delete_delay: RwLock::new(None),
        }
    }

    /// Insert an object with an explicit modification time
    pub fn insert(&self, key: &str, body: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                body: body.into(),
                last_modified,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Make every listing call fail until reset
    pub fn set_listing_unavailable(&self, unavailable: bool) {
        self.listing_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` delete calls
    pub fn fail_next_deletes(&self, count: u32) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Delay every `get_object` call
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        *self.get_delay.write() = delay;
    }

    /// Delay every `delete_object` call
    pub fn set_delete_delay(&self, delay: Option<Duration>) {
        *self.delete_delay.write() = delay;
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        if self.listing_unavailable.load(Ordering::SeqCst) {
            return Err(ArchiveError::StorageUnavailable(
                "memory store listing disabled".to_string(),
            ));
        }

        let prefix = prefix.unwrap_or("");
        let start = match continuation_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let objects = self.objects.read();
        let mut entries: Vec<ObjectEntry> = objects
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(self.page_size + 1)
            .map(|(key, object)| ObjectEntry {
                key: key.clone(),
                size_bytes: object.body.len() as u64,
                last_modified: object.last_modified,
            })
            .collect();

        let next_token = if entries.len() > self.page_size {
            entries.truncate(self.page_size);
            entries.last().map(|e| e.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let delay = *self.get_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.objects
            .read()
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| ArchiveError::ObjectNotFound(key.to_string()))
    }

    async fn put_object(&self, key: &str, body: Bytes, _content_type: &str) -> Result<()> {
        self.insert(key, body, Utc::now());
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let delay = *self.delete_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ArchiveError::StorageUnavailable(format!(
                "injected delete failure for {}",
                key
            )));
        }

        self.objects.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_pages_with_prefix() {
        let store = MemoryObjectStore::with_page_size(2);
        let now = Utc::now();
        for key in ["a/1.json", "a/2.json", "a/3.json", "b/1.json"] {
            store.insert(key, "{}", now);
        }

        let first = store.list_objects(Some("a/"), None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        let token = first.next_token.expect("second page");

        let second = store.list_objects(Some("a/"), Some(&token)).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].key, "a/3.json");
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_noop() {
        let store = MemoryObjectStore::new();
        assert!(store.delete_object("missing.json").await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_delete_failures() {
        let store = MemoryObjectStore::new();
        store.insert("a.json", "x", Utc::now());
        store.fail_next_deletes(1);

        assert!(store.delete_object("a.json").await.is_err());
        assert!(store.contains("a.json"));
        assert!(store.delete_object("a.json").await.is_ok());
        assert!(!store.contains("a.json"));
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.get_object("nope").await,
            Err(ArchiveError::ObjectNotFound(_))
        ));
    }
}
