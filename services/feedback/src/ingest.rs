//! Upload pipeline: validate, decode, thumbnail, store, analyze, persist.
//!
//! Steps run strictly in order. Blobs are uploaded before any row is
//! written, so a storage failure never leaves a row pointing at a missing
//! object. Blobs uploaded before a later failure are left in place.

use crate::analysis::{DetectedObject, ImageAnalyzer};
use crate::blob_store::BlobStore;
use crate::codec::{self, CodecError, EncodeFormat};
use crate::error::ServiceError;
use crate::config::IngestConfig;
use crate::metadata_store::{
    BoundingBox, ImageAnalysis, ImageRecord, ImageStatus, ItemRecord, MetadataRepository,
    NewImage, NewItem, StoredAssets,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Pipeline progress of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Validated,
    Decoded,
    Thumbnailed,
    UploadedToStore,
    Analyzed,
    Persisted,
    Failed,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Received => "received",
            IngestStage::Validated => "validated",
            IngestStage::Decoded => "decoded",
            IngestStage::Thumbnailed => "thumbnailed",
            IngestStage::UploadedToStore => "uploaded_to_store",
            IngestStage::Analyzed => "analyzed",
            IngestStage::Persisted => "persisted",
            IngestStage::Failed => "failed",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded file
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    /// Content type declared by the client
    pub content_type: String,
    pub original_name: Option<String>,
    pub user_id: Option<Uuid>,
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub image: ImageRecord,
    pub items: Vec<ItemRecord>,
    /// Objects whose item row could not be written
    pub items_failed: usize,
}

/// Map one detected object to an item row, field for field.
pub fn object_to_item(image_id: Uuid, object: &DetectedObject) -> NewItem {
    let model_box = object.bounding_box;

    NewItem {
        image_id,
        name: object.name.clone(),
        bounding_box: BoundingBox {
            y_min: model_box.y_min,
            y_max: model_box.y_max,
            x_min: model_box.x_min,
            x_max: model_box.x_max,
        },
        analysis: object.analysis.clone(),
        is_positive: object.is_perfect,
    }
}

/// Upload pipeline coordinator
pub struct IngestPipeline {
    blob_store: Arc<dyn BlobStore>,
    analyzer: Arc<dyn ImageAnalyzer>,
    repository: Arc<dyn MetadataRepository>,
    bucket: String,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        analyzer: Arc<dyn ImageAnalyzer>,
        repository: Arc<dyn MetadataRepository>,
        bucket: impl Into<String>,
        config: IngestConfig,
    ) -> Self {
        Self {
            blob_store,
            analyzer,
            repository,
            bucket: bucket.into(),
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Reject uploads that fail the content-type or size limits. Performs no I/O.
    pub fn validate(&self, request: &UploadRequest) -> Result<(), ServiceError> {
        let content_type = request.content_type.trim().to_ascii_lowercase();
        if !content_type.starts_with(&self.config.allowed_mime_prefix) {
            return Err(ServiceError::InvalidInput(format!(
                "content type {:?} is not an accepted image type",
                request.content_type
            )));
        }

        if request.bytes.is_empty() {
            return Err(ServiceError::InvalidInput("uploaded file is empty".to_string()));
        }

        if request.bytes.len() > self.config.max_upload_bytes {
            return Err(ServiceError::InvalidInput(format!(
                "file is {} bytes, limit is {}",
                request.bytes.len(),
                self.config.max_upload_bytes
            )));
        }

        Ok(())
    }

    /// Run the full pipeline for one upload.
    #[instrument(
        skip(self, request),
        fields(
            content_type = %request.content_type,
            size_bytes = request.bytes.len(),
            user_id = ?request.user_id
        )
    )]
    pub async fn ingest(&self, request: UploadRequest) -> Result<IngestOutcome, ServiceError> {
        let started = Instant::now();
        let mut stage = IngestStage::Received;

        let result = self.run(request, &mut stage).await;

        match &result {
            Ok(outcome) => {
                info!(
                    image_id = %outcome.image.image_id,
                    item_count = outcome.items.len(),
                    items_failed = outcome.items_failed,
                    "Upload persisted"
                );
                metrics::counter!("feedback.uploads.succeeded").increment(1);
                metrics::histogram!("feedback.uploads.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
            }
            Err(e) => {
                error!(
                    failed_after = %stage,
                    kind = e.kind(),
                    error = %e,
                    "Upload failed"
                );
                metrics::counter!("feedback.uploads.failed", "kind" => e.kind()).increment(1);
                advance(&mut stage, IngestStage::Failed);
            }
        }

        result
    }

    async fn run(
        &self,
        request: UploadRequest,
        stage: &mut IngestStage,
    ) -> Result<IngestOutcome, ServiceError> {
        self.validate(&request)?;
        advance(stage, IngestStage::Validated);

        let UploadRequest {
            bytes,
            content_type,
            original_name,
            user_id,
        } = request;
        let size_bytes = bytes.len() as i64;

        let (bytes, decoded) = tokio::task::spawn_blocking(move || {
            let decoded = codec::decode(&bytes);
            (bytes, decoded)
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("Decode task failed: {}", e)))?;
        let decoded = Arc::new(decoded?);
        advance(stage, IngestStage::Decoded);

        let mime_type = decoded
            .source_format()
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or(content_type);

        let thumbnail_format = EncodeFormat::Jpeg {
            quality: self.config.thumbnail_quality,
        };
        let (thumbnail_width, thumbnail_height, thumbnail_bytes) = {
            let source = Arc::clone(&decoded);
            let edge = self.config.thumbnail_edge_px;
            tokio::task::spawn_blocking(move || -> Result<_, CodecError> {
                let thumb = codec::thumbnail(&source, edge);
                let encoded = codec::encode(&thumb, thumbnail_format)?;
                Ok((thumb.width(), thumb.height(), encoded))
            })
            .await
            .map_err(|e| ServiceError::Internal(format!("Thumbnail task failed: {}", e)))??
        };
        advance(stage, IngestStage::Thumbnailed);

        let storage_key = self.blob_store.put(bytes, &mime_type).await?;
        let thumbnail_key = self
            .blob_store
            .put(thumbnail_bytes, thumbnail_format.content_type())
            .await?;
        advance(stage, IngestStage::UploadedToStore);

        // The original, not the thumbnail
        let analysis = self.analyzer.analyze(Arc::clone(&decoded)).await?;
        advance(stage, IngestStage::Analyzed);

        let image = self
            .repository
            .create_image(NewImage {
                user_id,
                bucket: self.bucket.clone(),
                assets: Some(StoredAssets {
                    storage_key,
                    thumbnail_key,
                }),
                original_name,
                mime_type,
                size_bytes,
                width_px: decoded.width() as i32,
                height_px: decoded.height() as i32,
                thumbnail_width_px: thumbnail_width as i32,
                thumbnail_height_px: thumbnail_height as i32,
                status: ImageStatus::Complete,
                analysis: Some(ImageAnalysis {
                    analysis: analysis.analysis.clone(),
                    score: analysis.scores,
                }),
            })
            .await?;
        advance(stage, IngestStage::Persisted);

        let (items, items_failed) = self.persist_items(image.image_id, &analysis.objects).await;

        Ok(IngestOutcome {
            image,
            items,
            items_failed,
        })
    }

    /// Write one item per object. Failures are logged and skipped.
    async fn persist_items(
        &self,
        image_id: Uuid,
        objects: &[DetectedObject],
    ) -> (Vec<ItemRecord>, usize) {
        let mut items = Vec::with_capacity(objects.len());
        let mut failed = 0;

        for object in objects {
            match self
                .repository
                .create_item(object_to_item(image_id, object))
                .await
            {
                Ok(item) => items.push(item),
                Err(e) => {
                    failed += 1;
                    warn!(
                        image_id = %image_id,
                        name = %object.name,
                        error = %e,
                        "Failed to persist item, continuing"
                    );
                    metrics::counter!("feedback.items.failed").increment(1);
                }
            }
        }

        (items, failed)
    }
}

fn advance(stage: &mut IngestStage, next: IngestStage) {
    debug!(from = %stage, to = %next, "Upload stage");
    *stage = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        AnalysisError, AnalysisResult, CategoryScores, MockImageAnalyzer, ObjectBox,
    };
    use crate::blob_store::{BlobStoreError, MockBlobStore};
    use crate::codec::DecodedImage;
    use crate::metadata_store::{MockMetadataRepository, StoreError};
    use chrono::Utc;
    use image::{DynamicImage, Rgb, RgbImage};
    use mockall::Sequence;
    use sqlx::types::Json;
    use std::sync::Mutex;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        codec::encode(
            &DecodedImage::from_dynamic(DynamicImage::ImageRgb8(img)),
            EncodeFormat::Jpeg { quality: 80 },
        )
        .unwrap()
    }

    fn upload(bytes: Vec<u8>, content_type: &str) -> UploadRequest {
        UploadRequest {
            bytes,
            content_type: content_type.to_string(),
            original_name: Some("street.jpg".to_string()),
            user_id: Some(Uuid::new_v4()),
        }
    }

    fn object(name: &str, object_box: ObjectBox, is_perfect: bool) -> DetectedObject {
        DetectedObject {
            name: name.to_string(),
            bounding_box: object_box,
            analysis: format!("{} notes", name),
            is_perfect,
        }
    }

    fn analysis_with(objects: Vec<DetectedObject>) -> AnalysisResult {
        AnalysisResult {
            analysis: "Strong diagonal lines.".to_string(),
            scores: CategoryScores {
                composition: 80,
                lighting: 70,
                color: 60,
            },
            objects,
        }
    }

    fn two_objects() -> Vec<DetectedObject> {
        vec![
            object(
                "Bench",
                ObjectBox {
                    y_min: 600,
                    y_max: 700,
                    x_min: 100,
                    x_max: 900,
                },
                false,
            ),
            object(
                "Tree",
                ObjectBox {
                    y_min: 50,
                    y_max: 950,
                    x_min: 400,
                    x_max: 500,
                },
                true,
            ),
        ]
    }

    fn image_record(new: NewImage) -> ImageRecord {
        let now = Utc::now();
        let (storage_key, thumbnail_key) = match new.assets {
            Some(assets) => (Some(assets.storage_key), Some(assets.thumbnail_key)),
            None => (None, None),
        };
        ImageRecord {
            image_id: Uuid::new_v4(),
            user_id: new.user_id,
            bucket: new.bucket,
            storage_key,
            thumbnail_key,
            original_name: new.original_name,
            mime_type: new.mime_type,
            size_bytes: new.size_bytes,
            width_px: new.width_px,
            height_px: new.height_px,
            thumbnail_width_px: new.thumbnail_width_px,
            thumbnail_height_px: new.thumbnail_height_px,
            is_analysis_complete: new.analysis.is_some(),
            analysis: new.analysis.as_ref().map(|a| a.analysis.clone()),
            score: new.analysis.map(|a| Json(a.score)),
            status: new.status.as_str().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn item_record(new: NewItem) -> ItemRecord {
        ItemRecord {
            item_id: Uuid::new_v4(),
            image_id: new.image_id,
            name: new.name,
            bounding_box: Json(new.bounding_box),
            analysis: new.analysis,
            is_positive: new.is_positive,
            created_at: Utc::now(),
        }
    }

    fn pipeline(
        blob_store: MockBlobStore,
        analyzer: MockImageAnalyzer,
        repository: MockMetadataRepository,
    ) -> IngestPipeline {
        IngestPipeline::new(
            Arc::new(blob_store),
            Arc::new(analyzer),
            Arc::new(repository),
            "photos",
            IngestConfig::default(),
        )
    }

    fn counting_blob_store() -> MockBlobStore {
        let mut blob_store = MockBlobStore::new();
        let mut counter = 0;
        blob_store.expect_put().times(2).returning(move |_, _| {
            counter += 1;
            Ok(format!("key-{}", counter))
        });
        blob_store
    }

    #[tokio::test]
    async fn test_upload_1200x800_jpeg() {
        let blob_store = counting_blob_store();

        let mut analyzer = MockImageAnalyzer::new();
        analyzer
            .expect_analyze()
            .withf(|image| image.width() == 1200 && image.height() == 800)
            .times(1)
            .returning(|_| Ok(analysis_with(two_objects())));

        let created: Arc<Mutex<Option<NewImage>>> = Arc::new(Mutex::new(None));
        let mut repository = MockMetadataRepository::new();
        let capture = Arc::clone(&created);
        repository
            .expect_create_image()
            .times(1)
            .returning(move |new| {
                *capture.lock().unwrap() = Some(new.clone());
                Ok(image_record(new))
            });
        repository
            .expect_create_item()
            .times(2)
            .returning(|new| Ok(item_record(new)));

        let outcome = pipeline(blob_store, analyzer, repository)
            .ingest(upload(jpeg(1200, 800), "image/jpeg"))
            .await
            .unwrap();

        let image = &outcome.image;
        assert_eq!((image.width_px, image.height_px), (1200, 800));
        assert_eq!((image.thumbnail_width_px, image.thumbnail_height_px), (750, 500));
        assert_eq!(image.status(), Some(ImageStatus::Complete));
        assert!(image.is_analysis_complete);
        assert_eq!(image.storage_key.as_deref(), Some("key-1"));
        assert_eq!(image.thumbnail_key.as_deref(), Some("key-2"));
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.bucket, "photos");
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.items_failed, 0);

        let new = created.lock().unwrap().clone().unwrap();
        assert_eq!(new.analysis.unwrap().score.composition, 80);
    }

    #[tokio::test]
    async fn test_text_upload_rejected_without_io() {
        // Mocks without expectations panic on any call
        let outcome = pipeline(
            MockBlobStore::new(),
            MockImageAnalyzer::new(),
            MockMetadataRepository::new(),
        )
        .ingest(upload(b"hello".to_vec(), "text/plain"))
        .await;

        assert!(matches!(outcome, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let mut config = IngestConfig::default();
        config.max_upload_bytes = 100;
        let pipeline = IngestPipeline::new(
            Arc::new(MockBlobStore::new()),
            Arc::new(MockImageAnalyzer::new()),
            Arc::new(MockMetadataRepository::new()),
            "photos",
            config,
        );

        let result = pipeline.ingest(upload(jpeg(64, 64), "image/jpeg")).await;
        assert!(matches!(result, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_undecodable_image_rejected_before_upload() {
        let result = pipeline(
            MockBlobStore::new(),
            MockImageAnalyzer::new(),
            MockMetadataRepository::new(),
        )
        .ingest(upload(b"not really a png".to_vec(), "image/png"))
        .await;

        assert!(matches!(result, Err(ServiceError::UnsupportedFormat(_))));
    }

    #[tokio::test]
    async fn test_thumbnail_upload_failure_creates_no_row() {
        let mut seq = Sequence::new();
        let mut blob_store = MockBlobStore::new();
        blob_store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("full".to_string()));
        blob_store
            .expect_put()
            .withf(|_, content_type| content_type.starts_with("image/jpeg"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(BlobStoreError::StorageUnavailable("bucket down".to_string())));
        // The full-image blob stays in place
        blob_store.expect_delete().never();

        let mut analyzer = MockImageAnalyzer::new();
        analyzer.expect_analyze().never();
        let mut repository = MockMetadataRepository::new();
        repository.expect_create_image().never();

        let result = pipeline(blob_store, analyzer, repository)
            .ingest(upload(jpeg(320, 240), "image/jpeg"))
            .await;

        assert!(matches!(result, Err(ServiceError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_analysis_unavailable_leaves_blobs() {
        let mut blob_store = counting_blob_store();
        blob_store.expect_delete().never();

        let mut analyzer = MockImageAnalyzer::new();
        analyzer.expect_analyze().times(1).returning(|_| {
            Err(AnalysisError::AnalysisUnavailable("429 Too Many Requests".to_string()))
        });
        let mut repository = MockMetadataRepository::new();
        repository.expect_create_image().never();

        let result = pipeline(blob_store, analyzer, repository)
            .ingest(upload(jpeg(320, 240), "image/jpeg"))
            .await;

        let err = tokio_test::assert_err!(result);
        assert_eq!(err.kind(), "analysis_unavailable");
    }

    #[tokio::test]
    async fn test_malformed_analysis_creates_no_row() {
        let blob_store = counting_blob_store();

        let mut analyzer = MockImageAnalyzer::new();
        analyzer.expect_analyze().times(1).returning(|_| {
            Err(AnalysisError::MalformedAnalysis(
                "missing field `objects`".to_string(),
            ))
        });
        let mut repository = MockMetadataRepository::new();
        repository.expect_create_image().never();
        repository.expect_create_item().never();

        let result = pipeline(blob_store, analyzer, repository)
            .ingest(upload(jpeg(320, 240), "image/jpeg"))
            .await;

        assert!(matches!(result, Err(ServiceError::MalformedAnalysis(_))));
    }

    #[tokio::test]
    async fn test_item_failure_keeps_image() {
        let blob_store = counting_blob_store();

        let mut analyzer = MockImageAnalyzer::new();
        analyzer
            .expect_analyze()
            .returning(|_| Ok(analysis_with(two_objects())));

        let mut repository = MockMetadataRepository::new();
        repository
            .expect_create_image()
            .returning(|new| Ok(image_record(new)));
        repository
            .expect_create_item()
            .withf(|item| item.name == "Bench")
            .returning(|_| {
                Err(StoreError::Persistence(sqlx::Error::PoolTimedOut))
            });
        repository
            .expect_create_item()
            .withf(|item| item.name == "Tree")
            .returning(|new| Ok(item_record(new)));

        let outcome = pipeline(blob_store, analyzer, repository)
            .ingest(upload(jpeg(320, 240), "image/jpeg"))
            .await
            .unwrap();

        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].name, "Tree");
        assert_eq!(outcome.items_failed, 1);
    }

    #[tokio::test]
    async fn test_image_persistence_failure_is_reported() {
        let blob_store = counting_blob_store();

        let mut analyzer = MockImageAnalyzer::new();
        analyzer
            .expect_analyze()
            .returning(|_| Ok(analysis_with(two_objects())));

        let mut repository = MockMetadataRepository::new();
        repository
            .expect_create_image()
            .returning(|_| Err(StoreError::Persistence(sqlx::Error::PoolTimedOut)));
        repository.expect_create_item().never();

        let result = pipeline(blob_store, analyzer, repository)
            .ingest(upload(jpeg(320, 240), "image/jpeg"))
            .await;

        assert!(matches!(result, Err(ServiceError::Persistence(_))));
    }

    #[test]
    fn test_object_to_item_keeps_orientation() {
        // A wide, short object must stay wide after mapping
        let wide = object(
            "Bench",
            ObjectBox {
                y_min: 600,
                y_max: 700,
                x_min: 100,
                x_max: 900,
            },
            true,
        );

        let image_id = Uuid::new_v4();
        let item = object_to_item(image_id, &wide);

        assert_eq!(item.image_id, image_id);
        assert_eq!(item.bounding_box.width(), 800);
        assert_eq!(item.bounding_box.height(), 100);
        assert_eq!(
            item.bounding_box,
            BoundingBox {
                y_min: 600,
                y_max: 700,
                x_min: 100,
                x_max: 900,
            }
        );
        assert!(item.is_positive);
    }

    #[test]
    fn test_validate_accepts_mixed_case_mime() {
        let pipeline = pipeline(
            MockBlobStore::new(),
            MockImageAnalyzer::new(),
            MockMetadataRepository::new(),
        );
        assert!(pipeline.validate(&upload(vec![1, 2, 3], "Image/PNG")).is_ok());
        assert!(pipeline.validate(&upload(Vec::new(), "image/png")).is_err());
    }
}
