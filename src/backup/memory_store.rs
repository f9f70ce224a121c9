//! In-memory object store with fault injection, for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::s3_upload::{ObjectStore, StoredObject};
use crate::errors::StorageError;

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    put_calls: AtomicUsize,
    put_failure: Mutex<Option<String>>,
    list_failure: Mutex<Option<String>>,
    delete_failures: Mutex<HashMap<String, String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object without counting it as an upload.
    pub fn insert(&self, object: StoredObject) {
        self.objects.lock().unwrap().insert(object.key.clone(), object);
    }

    pub fn put_count(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_puts(&self, message: &str) {
        *self.put_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_lists(&self, message: &str) {
        *self.list_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_delete_of(&self, key: &str, message: &str) {
        self.delete_failures.lock().unwrap().insert(key.to_string(), message.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn location(&self, key: &str) -> String {
        format!("memory://{}", key)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.put_failure.lock().unwrap().clone() {
            return Err(StorageError::new("put_object", key, message));
        }
        self.insert(StoredObject {
            key: key.to_string(),
            size_bytes: body.len() as u64,
            last_modified: Some(Utc::now()),
            metadata,
        });
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>, StorageError> {
        if let Some(message) = self.list_failure.lock().unwrap().clone() {
            return Err(StorageError::new("list_objects_v2", prefix, message));
        }
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.key.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        if let Some(message) = self.delete_failures.lock().unwrap().get(key).cloned() {
            return Err(StorageError::new("delete_object", key, message));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}
