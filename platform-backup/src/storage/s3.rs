//! [`ObjectStore`] for S3-compatible endpoints using the AWS SDK.

use super::ObjectStore;
use crate::config::StorageConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::{error, info};

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Build a client from the static key pair and endpoint in `config`.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let (Some(access_key), Some(secret_key), Some(endpoint)) = (
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.endpoint_url.clone(),
        ) else {
            return Err(BackupError::Config(
                "object store needs access key id, secret access key and endpoint url".to_string(),
            ));
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, "static");

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&endpoint)
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        info!(endpoint = %endpoint, "Object store client configured");

        Ok(Self {
            client: Client::from_conf(s3_config),
        })
    }
}

fn store_error(bucket: &str, key: &str, reason: impl std::fmt::Display) -> BackupError {
    BackupError::ObjectStoreFailed {
        bucket: bucket.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| store_error(bucket, key, e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|e| {
                error!(bucket, key, "Upload failed: {:?}", e);
                store_error(bucket, key, aws_sdk_s3::error::DisplayErrorContext(&e))
            })?;

        info!("Uploaded s3://{}/{}", bucket, key);
        Ok(())
    }

    async fn get_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                error!(bucket, key, "Download failed: {:?}", e);
                store_error(bucket, key, aws_sdk_s3::error::DisplayErrorContext(&e))
            })?;

        let mut reader = response.body.into_async_read();
        let mut file = tokio::fs::File::create(local_path).await?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| store_error(bucket, key, e))?;
        file.sync_all().await?;

        info!("Downloaded s3://{}/{} to {}", bucket, key, local_path.display());
        Ok(())
    }
}
