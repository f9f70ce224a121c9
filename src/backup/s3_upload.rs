// dbbackup-engine/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::collections::HashMap;

use super::artifact::BackupArtifact;
use crate::config::SpacesConfig;
use crate::errors::StorageError;

const CONTENT_TYPE_SQL: &str = "application/sql";

/// An object as seen by a listing pass, with its user metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

/// Durable sink for backup artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location of `key`, e.g. `s3://bucket/key`.
    fn location(&self, key: &str) -> String;

    /// Writes `body` under `key`; an existing object with the same key is
    /// overwritten.
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
}

/// Uploads a validated snapshot under the artifact's key with its metadata.
pub async fn upload_artifact(
    store: &dyn ObjectStore,
    body: Vec<u8>,
    artifact: &BackupArtifact,
) -> Result<(), StorageError> {
    tracing::info!(
        key = %artifact.key,
        bytes = artifact.size_bytes,
        location = %store.location(&artifact.key),
        "Uploading backup artifact"
    );
    store.put_object(&artifact.key, body, artifact.to_metadata()).await?;
    tracing::info!(key = %artifact.key, "Backup artifact uploaded");
    Ok(())
}

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO, ...).
pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: spaces_config.bucket_name.clone(),
        }
    }

    async fn head_metadata(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::new("head_object", key, DisplayErrorContext(&e).to_string()))?;
        Ok(head.metadata().cloned().unwrap_or_default())
    }
}

fn to_chrono(ts: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let length = body.len() as i64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE_SQL)
            .content_length(length)
            .set_metadata(Some(metadata))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::new("put_object", key, DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>, StorageError> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    StorageError::new("list_objects_v2", &prefix, DisplayErrorContext(&e).to_string())
                })?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(StoredObject {
                    key: key.to_string(),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                    metadata: HashMap::new(),
                });
            }

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        // Listing does not return user metadata; the trigger flag lives there.
        for object in &mut objects {
            object.metadata = self.head_metadata(&object.key).await?;
        }

        tracing::debug!(prefix = %prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::new("delete_object", key, DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}
