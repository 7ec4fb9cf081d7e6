//! The record store collaborator behind the records service.
//!
//! Modeled on a document database: ids are assigned by the store as 24
//! lowercase hex characters, and the scan is a cursor the service drains
//! lazily. The service treats the store as an injected capability and does
//! no validation on its behalf beyond id shape.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One stored record. `id` is assigned by the store on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub content: String,
}

/// Field content of a record, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFields {
    pub author_id: String,
    pub title: String,
    pub content: String,
}

/// Why a store operation failed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no record for id {0}")]
    NotFound(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Storage capability handed to the records service at construction.
pub trait RecordStore: Send + Sync + 'static {
    /// Insert a new record and return its assigned id.
    fn insert(&self, fields: RecordFields)
    -> impl Future<Output = Result<String, StoreError>> + Send;

    fn find_one(&self, id: &str) -> impl Future<Output = Result<Record, StoreError>> + Send;

    /// Replace the fields of an existing record.
    fn replace(
        &self,
        id: &str,
        fields: RecordFields,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Cursor over every record, in id order.
    fn scan_all(&self) -> impl Stream<Item = Result<Record, StoreError>> + Send;
}

/// In-memory store. Ids count up from 1, so scans come back in insertion
/// order.
#[derive(Debug, Default)]
pub struct MemStore {
    records: Mutex<BTreeMap<String, Record>>,
    next_id: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_id(&self) -> String {
        format!("{:024x}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl RecordStore for MemStore {
    async fn insert(&self, fields: RecordFields) -> Result<String, StoreError> {
        let id = self.make_id();
        let record = Record {
            id: id.clone(),
            author_id: fields.author_id,
            title: fields.title,
            content: fields.content,
        };
        self.records.lock().insert(id.clone(), record);
        tracing::debug!(id, "record inserted");
        Ok(id)
    }

    async fn find_one(&self, id: &str) -> Result<Record, StoreError> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn replace(&self, id: &str, fields: RecordFields) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(slot) => {
                slot.author_id = fields.author_id;
                slot.title = fields.title;
                slot.content = fields.content;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn scan_all(&self) -> impl Stream<Item = Result<Record, StoreError>> + Send {
        // Snapshot under the lock; the cursor itself never blocks writers.
        let snapshot: Vec<Record> = self.records.lock().values().cloned().collect();
        futures::stream::iter(snapshot.into_iter().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn fields(title: &str) -> RecordFields {
        RecordFields {
            author_id: "tester".into(),
            title: title.into(),
            content: "body".into(),
        }
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let store = MemStore::new();
        let id = store.insert(fields("first")).await.unwrap();
        assert_eq!(id.len(), 24);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));

        let record = store.find_one(&id).await.unwrap();
        assert_eq!(record.title, "first");

        store.replace(&id, fields("renamed")).await.unwrap();
        assert_eq!(store.find_one(&id).await.unwrap().title, "renamed");

        store.delete(&id).await.unwrap();
        assert!(matches!(
            store.find_one(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_ids_are_not_found_everywhere() {
        let store = MemStore::new();
        let id = "00000000000000000000feed";
        assert!(matches!(
            store.find_one(id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.replace(id, fields("x")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn scan_returns_records_in_insertion_order() {
        let store = MemStore::new();
        for title in ["a", "b", "c"] {
            store.insert(fields(title)).await.unwrap();
        }
        let all: Vec<Record> = store.scan_all().try_collect().await.unwrap();
        let titles: Vec<&str> = all.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["a", "b", "c"]);
    }
}
