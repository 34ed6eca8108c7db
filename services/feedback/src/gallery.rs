//! Read and delete paths: image detail, gallery pages, cascade delete.

use crate::blob_store::{self, BlobStore};
use crate::error::ServiceError;
use crate::metadata_store::{ImageRecord, ItemRecord, MetadataRepository};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Image with signed URLs and its items
#[derive(Debug, Clone, Serialize)]
pub struct ImageDetail {
    pub image: ImageRecord,
    /// Signed URL of the full-resolution object
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub items: Vec<ItemRecord>,
}

/// One gallery page
#[derive(Debug, Clone, Serialize)]
pub struct GalleryPage {
    pub images: Vec<ImageRecord>,
    /// Thumbnail URLs. Keys that fail to sign are omitted.
    pub urls: Vec<String>,
    /// Total images owned by the user
    pub total: i64,
    /// Pass back to fetch the next (older) page
    pub cursor: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemList {
    pub items: Vec<ItemRecord>,
    pub total: usize,
}

/// Outcome of a delete. Blob cleanup is advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub message: String,
    pub s3_deleted: bool,
    pub db_deleted: bool,
}

/// Gallery queries over the metadata store and blob store
pub struct GalleryService {
    blob_store: Arc<dyn BlobStore>,
    repository: Arc<dyn MetadataRepository>,
    url_ttl: Duration,
    default_page_size: i64,
    max_page_size: i64,
}

impl GalleryService {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        repository: Arc<dyn MetadataRepository>,
        url_ttl: Duration,
        default_page_size: i64,
        max_page_size: i64,
    ) -> Self {
        Self {
            blob_store,
            repository,
            url_ttl,
            default_page_size,
            max_page_size,
        }
    }

    pub fn repository(&self) -> &Arc<dyn MetadataRepository> {
        &self.repository
    }

    /// Clamp a requested page size into 1..=max_page_size
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }

    async fn sign(&self, key: Option<&String>) -> Option<String> {
        let key = key?;
        match self.blob_store.presigned_url(key, self.url_ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to sign object URL");
                None
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn image_detail(&self, image_id: Uuid) -> Result<ImageDetail, ServiceError> {
        let image = self
            .repository
            .get_image(image_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("image {}", image_id)))?;

        let items = self.repository.list_items_for_image(image_id).await?;
        let (url, thumbnail_url) = tokio::join!(
            self.sign(image.storage_key.as_ref()),
            self.sign(image.thumbnail_key.as_ref())
        );

        Ok(ImageDetail {
            image,
            url,
            thumbnail_url,
            items,
        })
    }

    /// Newest-first page of a user's images created before `cursor`.
    #[instrument(skip(self))]
    pub async fn gallery(
        &self,
        user_id: Option<Uuid>,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<GalleryPage, ServiceError> {
        let limit = self.page_size(limit);

        let (page, total) = tokio::try_join!(
            self.repository.list_images_for_user(user_id, cursor, limit),
            self.repository.count_images_for_user(user_id)
        )?;

        let keys: Vec<String> = page
            .images
            .iter()
            .filter_map(|image| image.thumbnail_key.clone())
            .collect();
        let urls = blob_store::bulk_presigned_urls(self.blob_store.as_ref(), &keys, self.url_ttl).await;

        Ok(GalleryPage {
            images: page.images,
            urls,
            total,
            cursor: page.next_cursor,
        })
    }

    pub async fn get_item(&self, item_id: Uuid) -> Result<ItemRecord, ServiceError> {
        self.repository
            .get_item(item_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("item {}", item_id)))
    }

    pub async fn items_for_image(&self, image_id: Uuid) -> Result<ItemList, ServiceError> {
        let items = self.repository.list_items_for_image(image_id).await?;
        Ok(ItemList {
            total: items.len(),
            items,
        })
    }

    /// Delete an image's rows (cascading to items), then its blobs (best effort).
    ///
    /// Blobs are only touched once the rows are gone.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, image_id: Uuid) -> Result<DeleteOutcome, ServiceError> {
        let image = self
            .repository
            .get_image(image_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("image {}", image_id)))?;

        let db_deleted = self.repository.delete_image(image_id).await?;
        if !db_deleted {
            // Removed by a concurrent request after the lookup
            return Err(ServiceError::NotFound(format!("image {}", image_id)));
        }

        let keys: Vec<&String> = [image.storage_key.as_ref(), image.thumbnail_key.as_ref()]
            .into_iter()
            .flatten()
            .collect();

        let s3_deleted = if keys.is_empty() {
            false
        } else {
            futures::future::join_all(keys.iter().map(|key| self.blob_store.delete(key)))
                .await
                .into_iter()
                .all(|deleted| deleted)
        };

        info!(
            image_id = %image_id,
            s3_deleted = s3_deleted,
            "Image deleted"
        );
        metrics::counter!("feedback.images.deleted").increment(1);

        Ok(DeleteOutcome {
            message: "Image deleted successfully".to_string(),
            s3_deleted,
            db_deleted,
        })
    }
}
