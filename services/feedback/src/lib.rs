//! Ansel Feedback Service
//!
//! Photo-composition feedback backend. Users upload a photograph; the service
//! stores it with a thumbnail in S3, asks a vision-language model for a
//! structured critique, and records the image and the objects the model
//! called out in PostgreSQL so a gallery can be rendered later.
//!
//! ## Architecture
//!
//! ```text
//!  POST /images
//!       │
//!       ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Ingest       │───▶│ Codec        │    │ S3           │
//! │ Pipeline     │───────────────────────▶│ Blob Store   │
//! │              │    ┌──────────────┐    └──────────────┘
//! │              │───▶│ Gemini       │           ▲
//! │              │    │ Analyzer     │           │ signed URLs
//! │              │    └──────────────┘    ┌──────────────┐
//! │              │───────────────────────▶│ PostgreSQL   │
//! └──────────────┘                        │ images/items │
//!                                         └──────────────┘
//!                                                ▲
//!  GET /gallery, /images, DELETE /images ────────┘ (Gallery Service)
//! ```

pub mod analysis;
pub mod api;
pub mod blob_store;
pub mod codec;
pub mod config;
pub mod error;
pub mod gallery;
pub mod ingest;
pub mod metadata_store;

pub use analysis::{AnalysisResult, GeminiAnalyzer, ImageAnalyzer};
pub use api::{start_api_server, AppState};
pub use blob_store::{BlobStore, S3BlobStore};
pub use config::Config;
pub use gallery::GalleryService;
pub use error::ServiceError;
pub use ingest::{IngestPipeline, UploadRequest};
pub use metadata_store::{MetadataRepository, PgMetadataStore};
