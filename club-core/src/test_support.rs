//! In-memory fakes for tests.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::blob_store::{BlobHandle, BlobStore, BlobStoreError, ProgressCallback};

/// Blob store that keeps objects in a map and can be told to fail
/// the n-th `put` call (0-based, counted across the store's lifetime).
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    content_types: Mutex<HashMap<String, String>>,
    put_calls: Mutex<usize>,
    fail_on_calls: Mutex<HashSet<usize>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `call`-th put (0-based) fail with a storage error.
    pub fn fail_on_put(&self, call: usize) {
        self.fail_on_calls.lock().unwrap().insert(call);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.content_types.lock().unwrap().get(key).cloned()
    }

    pub fn put_calls(&self) -> usize {
        *self.put_calls.lock().unwrap()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        on_progress: ProgressCallback,
    ) -> Result<BlobHandle, BlobStoreError> {
        let call = {
            let mut calls = self.put_calls.lock().unwrap();
            let call = *calls;
            *calls += 1;
            call
        };

        let total = data.len() as u64;
        let half = total / 2;
        on_progress(0, total);
        on_progress(half, total);
        tokio::task::yield_now().await;

        if self.fail_on_calls.lock().unwrap().contains(&call) {
            return Err(BlobStoreError::Storage(format!("injected failure for {key}")));
        }

        on_progress(total, total);
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data);
        self.content_types
            .lock()
            .unwrap()
            .insert(key.to_string(), content_type.to_string());

        Ok(BlobHandle {
            key: key.to_string(),
        })
    }

    async fn download_url(&self, handle: &BlobHandle) -> Result<String, BlobStoreError> {
        Ok(format!("https://blobs.test/{}", handle.key))
    }
}
