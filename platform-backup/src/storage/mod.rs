//! Durable object storage for archives.
//!
//! Buckets are per instance and must already exist; nothing here creates
//! them.

pub mod s3;

use crate::utils::errors::Result;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local_path` to `bucket/key`.
    async fn put_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()>;

    /// Download `bucket/key` into `local_path`, replacing any existing file.
    async fn get_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()>;
}
