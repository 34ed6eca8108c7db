use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use futures::future::join_all;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors returned by the blob store gateway
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("Object storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Binary object storage used for originals and thumbnails.
///
/// Keys are opaque; callers must not parse them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `bytes` under a fresh key and return the key. Not retried.
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobStoreError>;

    /// Time-limited read URL for an existing key.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError>;

    /// Advisory delete. Returns `false` instead of failing.
    async fn delete(&self, key: &str) -> bool;
}

/// Sign every key concurrently, keeping input order. Failed keys map to `None`.
pub async fn presign_each(
    store: &dyn BlobStore,
    keys: &[String],
    ttl: Duration,
) -> Vec<Option<String>> {
    join_all(keys.iter().map(|key| async move {
        match store.presigned_url(key, ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, key = %key, "Skipping key in bulk presign");
                None
            }
        }
    }))
    .await
}

/// Best-effort bulk signing: keys that fail are omitted from the result.
pub async fn bulk_presigned_urls(
    store: &dyn BlobStore,
    keys: &[String],
    ttl: Duration,
) -> Vec<String> {
    presign_each(store, keys, ttl)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Generate a fresh object key from 128 random bits
pub fn generate_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// S3-backed blob store
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobStoreError::StorageUnavailable(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobStoreError::StorageUnavailable(DisplayErrorContext(&e).to_string()))?;

        let upload_id = create_response.upload_id().ok_or_else(|| {
            BlobStoreError::StorageUnavailable("No upload ID in response".to_string())
        })?;

        match self.upload_parts(key, upload_id, bytes).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| {
                        BlobStoreError::StorageUnavailable(DisplayErrorContext(&e).to_string())
                    })?;

                Ok(())
            }
            Err(e) => {
                // Release the parts already stored; failure here only leaks storage
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: &[u8],
    ) -> Result<Vec<CompletedPart>, BlobStoreError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| {
                    BlobStoreError::StorageUnavailable(DisplayErrorContext(&e).to_string())
                })?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }

    /// Check if an object exists
    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(BlobStoreError::StorageUnavailable(
                        DisplayErrorContext(&e).to_string(),
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobStoreError> {
        let key = generate_key();

        if bytes.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(&key, &bytes, content_type).await?;
        } else {
            self.simple_upload(&key, bytes, content_type).await?;
        }

        debug!(key = %key, content_type = %content_type, "Object uploaded");
        metrics::counter!("feedback.blobs.uploaded").increment(1);

        Ok(key)
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError> {
        if !self.exists(key).await? {
            return Err(BlobStoreError::NotFound(key.to_string()));
        }

        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| BlobStoreError::StorageUnavailable(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| BlobStoreError::StorageUnavailable(DisplayErrorContext(&e).to_string()))?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> bool {
        match self.exists(key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Object already absent");
                return false;
            }
            Err(e) => {
                warn!(error = %e, key = %key, "Failed to check object before delete");
                return false;
            }
        }

        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {
                debug!(key = %key, "Object deleted");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %DisplayErrorContext(&e), "Failed to delete object");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::collections::HashSet;

    #[test]
    fn test_generate_key_is_128_bit_hex() {
        let key = generate_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_key_unique() {
        let keys: HashSet<String> = (0..1000).map(|_| generate_key()).collect();
        assert_eq!(keys.len(), 1000);
    }

    #[tokio::test]
    async fn test_bulk_presign_omits_failures() {
        let mut store = MockBlobStore::new();
        store
            .expect_presigned_url()
            .with(eq("a"), eq(Duration::from_secs(60)))
            .returning(|_, _| Ok("https://signed/a".to_string()));
        store
            .expect_presigned_url()
            .with(eq("missing"), eq(Duration::from_secs(60)))
            .returning(|key, _| Err(BlobStoreError::NotFound(key.to_string())));
        store
            .expect_presigned_url()
            .with(eq("c"), eq(Duration::from_secs(60)))
            .returning(|_, _| Ok("https://signed/c".to_string()));

        let keys = vec!["a".to_string(), "missing".to_string(), "c".to_string()];
        let urls = bulk_presigned_urls(&store, &keys, Duration::from_secs(60)).await;

        assert_eq!(urls, vec!["https://signed/a", "https://signed/c"]);
    }

    #[tokio::test]
    async fn test_presign_each_keeps_positions() {
        let mut store = MockBlobStore::new();
        store.expect_presigned_url().returning(|key, _| {
            if key == "broken" {
                Err(BlobStoreError::StorageUnavailable("timeout".to_string()))
            } else {
                Ok(format!("https://signed/{}", key))
            }
        });

        let keys = vec!["broken".to_string(), "ok".to_string()];
        let urls = presign_each(&store, &keys, Duration::from_secs(60)).await;

        assert_eq!(urls, vec![None, Some("https://signed/ok".to_string())]);
    }

    #[tokio::test]
    async fn test_bulk_presign_empty_input() {
        let store = MockBlobStore::new();
        let urls = bulk_presigned_urls(&store, &[], Duration::from_secs(60)).await;
        assert!(urls.is_empty());
    }
}
