use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use platform_backup::storage::ObjectStore;
use platform_backup::{BackupError, Result};

#[derive(Default)]
struct State {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Vec<u8>>,
    failing_buckets: HashSet<String>,
}

/// In-memory object store. Buckets must be created up front, as with the
/// real store.
#[derive(Default)]
pub struct MockObjectStore {
    state: Mutex<State>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.state.lock().unwrap().buckets.insert(bucket.to_string());
    }

    pub fn fail_uploads_to(&self, bucket: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_buckets
            .insert(bucket.to_string());
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.buckets.insert(bucket.to_string());
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), bytes);
    }

    fn error(bucket: &str, key: &str, reason: &str) -> BackupError {
        BackupError::ObjectStoreFailed {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        let bytes = std::fs::read(local_path)?;
        let mut state = self.state.lock().unwrap();
        if state.failing_buckets.contains(bucket) {
            return Err(Self::error(bucket, key, "service unavailable"));
        }
        if !state.buckets.contains(bucket) {
            return Err(Self::error(bucket, key, "NoSuchBucket"));
        }
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        let bytes = self
            .object(bucket, key)
            .ok_or_else(|| Self::error(bucket, key, "NoSuchKey"))?;
        std::fs::write(local_path, bytes)?;
        Ok(())
    }
}
