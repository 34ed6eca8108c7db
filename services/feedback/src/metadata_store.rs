use crate::analysis::CategoryScores;
use crate::config::DatabaseConfig;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const IMAGE_COLUMNS: &str = r#"
    image_id, user_id, bucket, storage_key, thumbnail_key,
    original_name, mime_type, size_bytes, width_px, height_px,
    thumbnail_width_px, thumbnail_height_px, is_analysis_complete,
    analysis, score, status, created_at, updated_at
"#;

const ITEM_COLUMNS: &str = r#"
    item_id, image_id, name, bounding_box, analysis, is_positive, created_at
"#;

/// Errors returned by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// Workflow status of an image row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Uploading,
    Pending,
    Complete,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Uploading => "uploading",
            ImageStatus::Pending => "pending",
            ImageStatus::Complete => "complete",
            ImageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(ImageStatus::Uploading),
            "pending" => Ok(ImageStatus::Pending),
            "complete" => Ok(ImageStatus::Complete),
            "failed" => Ok(ImageStatus::Failed),
            other => Err(format!("unknown image status: {}", other)),
        }
    }
}

/// Stored bounding box, normalized to 0..=1000 on both axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub y_min: u16,
    pub y_max: u16,
    pub x_min: u16,
    pub x_max: u16,
}

impl BoundingBox {
    /// Horizontal extent
    pub fn width(&self) -> u16 {
        self.x_max.saturating_sub(self.x_min)
    }

    /// Vertical extent
    pub fn height(&self) -> u16 {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn center_x(&self) -> f64 {
        (self.x_min as f64 + self.x_max as f64) / 2.0
    }

    pub fn center_y(&self) -> f64 {
        (self.y_min as f64 + self.y_max as f64) / 2.0
    }
}

/// Stored image metadata
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    /// Server-generated image ID
    pub image_id: Uuid,
    /// Owner, absent in single-tenant mode
    pub user_id: Option<Uuid>,
    /// Bucket holding both assets
    pub bucket: String,
    /// Key of the full-resolution object
    pub storage_key: Option<String>,
    /// Key of the thumbnail object
    pub thumbnail_key: Option<String>,
    /// File name supplied by the client
    pub original_name: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    pub width_px: i32,
    pub height_px: i32,
    pub thumbnail_width_px: i32,
    pub thumbnail_height_px: i32,
    pub is_analysis_complete: bool,
    /// Overall critique, set once analysis completes
    pub analysis: Option<String>,
    /// Category scores, set once analysis completes
    pub score: Option<Json<CategoryScores>>,
    /// One of uploading, pending, complete, failed
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn status(&self) -> Option<ImageStatus> {
        self.status.parse().ok()
    }
}

/// Stored detected object
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ItemRecord {
    pub item_id: Uuid,
    /// Owning image
    pub image_id: Uuid,
    pub name: String,
    pub bounding_box: Json<BoundingBox>,
    pub analysis: String,
    /// Exemplary rather than needing improvement
    pub is_positive: bool,
    pub created_at: DateTime<Utc>,
}

/// Keys of the two uploaded assets. They are always written together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAssets {
    pub storage_key: String,
    pub thumbnail_key: String,
}

/// Completed analysis attached to an image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnalysis {
    pub analysis: String,
    pub score: CategoryScores,
}

/// Values for a new image row
#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
    pub user_id: Option<Uuid>,
    pub bucket: String,
    pub assets: Option<StoredAssets>,
    pub original_name: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    pub width_px: i32,
    pub height_px: i32,
    pub thumbnail_width_px: i32,
    pub thumbnail_height_px: i32,
    pub status: ImageStatus,
    pub analysis: Option<ImageAnalysis>,
}

/// Values for a new item row
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub image_id: Uuid,
    pub name: String,
    pub bounding_box: BoundingBox,
    pub analysis: String,
    pub is_positive: bool,
}

/// One page of a keyset-paginated image listing
#[derive(Debug, Clone)]
pub struct ImagePage {
    /// Newest first
    pub images: Vec<ImageRecord>,
    /// Pass back as `cursor` to fetch the next page
    pub next_cursor: DateTime<Utc>,
}

/// Cursor for the page after `images`: the oldest row returned, or `now` if empty.
pub fn next_cursor(images: &[ImageRecord], now: DateTime<Utc>) -> DateTime<Utc> {
    images.last().map(|image| image.created_at).unwrap_or(now)
}

/// Typed CRUD over images and items
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    async fn create_image(&self, image: NewImage) -> Result<ImageRecord, StoreError>;

    async fn get_image(&self, image_id: Uuid) -> Result<Option<ImageRecord>, StoreError>;

    /// Images created strictly before `cursor`, newest first. `None` user lists every image.
    async fn list_images_for_user(
        &self,
        user_id: Option<Uuid>,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<ImagePage, StoreError>;

    async fn count_images_for_user(&self, user_id: Option<Uuid>) -> Result<i64, StoreError>;

    async fn update_image_analysis(
        &self,
        image_id: Uuid,
        analysis: ImageAnalysis,
    ) -> Result<ImageRecord, StoreError>;

    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
    ) -> Result<ImageRecord, StoreError>;

    /// Delete an image and all of its items. Returns `false` if the image did not exist.
    async fn delete_image(&self, image_id: Uuid) -> Result<bool, StoreError>;

    /// Fails with `NotFound` if the parent image does not exist.
    async fn create_item(&self, item: NewItem) -> Result<ItemRecord, StoreError>;

    async fn get_item(&self, item_id: Uuid) -> Result<Option<ItemRecord>, StoreError>;

    async fn list_items_for_image(&self, image_id: Uuid) -> Result<Vec<ItemRecord>, StoreError>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed metadata store
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataRepository for PgMetadataStore {
    #[instrument(skip(self, image), fields(user_id = ?image.user_id))]
    async fn create_image(&self, image: NewImage) -> Result<ImageRecord, StoreError> {
        let image_id = Uuid::new_v4();
        let (storage_key, thumbnail_key) = match image.assets {
            Some(assets) => (Some(assets.storage_key), Some(assets.thumbnail_key)),
            None => (None, None),
        };
        let (analysis, score) = match image.analysis {
            Some(done) => (Some(done.analysis), Some(Json(done.score))),
            None => (None, None),
        };
        let is_analysis_complete = analysis.is_some();

        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, ImageRecord>(&format!(
            r#"
            INSERT INTO images (
                image_id, user_id, bucket, storage_key, thumbnail_key,
                original_name, mime_type, size_bytes, width_px, height_px,
                thumbnail_width_px, thumbnail_height_px, is_analysis_complete,
                analysis, score, status, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                $11, $12, $13,
                $14, $15, $16, NOW(), NOW()
            )
            RETURNING {}
            "#,
            IMAGE_COLUMNS
        ))
        .bind(image_id)
        .bind(image.user_id)
        .bind(&image.bucket)
        .bind(storage_key)
        .bind(thumbnail_key)
        .bind(&image.original_name)
        .bind(&image.mime_type)
        .bind(image.size_bytes)
        .bind(image.width_px)
        .bind(image.height_px)
        .bind(image.thumbnail_width_px)
        .bind(image.thumbnail_height_px)
        .bind(is_analysis_complete)
        .bind(analysis)
        .bind(score)
        .bind(image.status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(image_id = %record.image_id, status = %record.status, "Image row created");
        metrics::counter!("feedback.images.created").increment(1);

        Ok(record)
    }

    async fn get_image(&self, image_id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let image = sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {} FROM images WHERE image_id = $1",
            IMAGE_COLUMNS
        ))
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    #[instrument(skip(self))]
    async fn list_images_for_user(
        &self,
        user_id: Option<Uuid>,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<ImagePage, StoreError> {
        let images = sqlx::query_as::<_, ImageRecord>(&format!(
            r#"
            SELECT {}
            FROM images
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY created_at DESC, image_id DESC
            LIMIT $3
            "#,
            IMAGE_COLUMNS
        ))
        .bind(user_id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let next_cursor = next_cursor(&images, Utc::now());

        Ok(ImagePage {
            images,
            next_cursor,
        })
    }

    async fn count_images_for_user(&self, user_id: Option<Uuid>) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM images
            WHERE ($1::uuid IS NULL OR user_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    #[instrument(skip(self, analysis))]
    async fn update_image_analysis(
        &self,
        image_id: Uuid,
        analysis: ImageAnalysis,
    ) -> Result<ImageRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, ImageRecord>(&format!(
            r#"
            UPDATE images
            SET analysis = $2,
                score = $3,
                is_analysis_complete = TRUE,
                status = $4,
                updated_at = NOW()
            WHERE image_id = $1
            RETURNING {}
            "#,
            IMAGE_COLUMNS
        ))
        .bind(image_id)
        .bind(&analysis.analysis)
        .bind(Json(analysis.score))
        .bind(ImageStatus::Complete.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("image {}", image_id)))?;

        tx.commit().await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn update_image_status(
        &self,
        image_id: Uuid,
        status: ImageStatus,
    ) -> Result<ImageRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, ImageRecord>(&format!(
            r#"
            UPDATE images
            SET status = $2, updated_at = NOW()
            WHERE image_id = $1
            RETURNING {}
            "#,
            IMAGE_COLUMNS
        ))
        .bind(image_id)
        .bind(status.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("image {}", image_id)))?;

        tx.commit().await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn delete_image(&self, image_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Children first, in the same transaction as the parent
        let items = sqlx::query("DELETE FROM items WHERE image_id = $1")
            .bind(image_id)
            .execute(&mut *tx)
            .await?;

        let images = sqlx::query("DELETE FROM images WHERE image_id = $1")
            .bind(image_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let deleted = images.rows_affected() > 0;
        info!(
            image_id = %image_id,
            deleted = deleted,
            items_deleted = items.rows_affected(),
            "Image delete committed"
        );

        Ok(deleted)
    }

    #[instrument(skip(self, item), fields(image_id = %item.image_id, name = %item.name))]
    async fn create_item(&self, item: NewItem) -> Result<ItemRecord, StoreError> {
        let item_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, ItemRecord>(&format!(
            r#"
            INSERT INTO items (
                item_id, image_id, name, bounding_box, analysis, is_positive, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, NOW()
            )
            RETURNING {}
            "#,
            ITEM_COLUMNS
        ))
        .bind(item_id)
        .bind(item.image_id)
        .bind(&item.name)
        .bind(Json(item.bounding_box))
        .bind(&item.analysis)
        .bind(item.is_positive)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                StoreError::NotFound(format!("image {}", item.image_id))
            }
            other => StoreError::Persistence(other),
        })?;

        tx.commit().await?;

        metrics::counter!("feedback.items.created").increment(1);

        Ok(record)
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<ItemRecord>, StoreError> {
        let item = sqlx::query_as::<_, ItemRecord>(&format!(
            "SELECT {} FROM items WHERE item_id = $1",
            ITEM_COLUMNS
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn list_items_for_image(&self, image_id: Uuid) -> Result<Vec<ItemRecord>, StoreError> {
        let items = sqlx::query_as::<_, ItemRecord>(&format!(
            r#"
            SELECT {}
            FROM items
            WHERE image_id = $1
            ORDER BY created_at ASC, item_id ASC
            "#,
            ITEM_COLUMNS
        ))
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
