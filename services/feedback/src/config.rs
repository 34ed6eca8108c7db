use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`Config::validate`]
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the feedback service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Vision model configuration
    pub analysis: AnalysisConfig,
    /// Upload pipeline limits
    #[serde(default)]
    pub ingest: IngestConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket holding originals and thumbnails
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Vision model (Gemini) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Base URL of the generative language API
    #[serde(default = "default_analysis_api_base")]
    pub api_base: String,
    /// API key sent as `x-goog-api-key`
    pub api_key: String,
    /// Model name
    #[serde(default = "default_analysis_model")]
    pub model: String,
    /// Long edge the image is downscaled to before it is sent
    #[serde(default = "default_analysis_max_edge")]
    pub max_edge_px: u32,
    /// Request timeout in seconds
    #[serde(default = "default_analysis_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum number of objects accepted from one response
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,
}

/// Upload validation and thumbnail settings
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Largest accepted upload in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Content types must start with this prefix
    #[serde(default = "default_allowed_mime_prefix")]
    pub allowed_mime_prefix: String,
    /// Long edge of the gallery thumbnail
    #[serde(default = "default_thumbnail_edge")]
    pub thumbnail_edge_px: u32,
    /// JPEG quality for thumbnails
    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: u8,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Shared secret expected in the `x-api-key` header (disabled when unset)
    pub api_key: Option<String>,
    /// Gallery page size when the client does not send one
    #[serde(default = "default_page_size")]
    pub default_page_size: i64,
    /// Upper bound on the gallery page size
    #[serde(default = "default_max_page_size")]
    pub max_page_size: i64,
}

// Default value functions
fn default_service_name() -> String {
    "feedback-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

/// Smallest part S3 accepts for any but the last part of a multipart upload
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_analysis_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_analysis_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_analysis_max_edge() -> u32 {
    384
}

fn default_analysis_timeout_secs() -> u64 {
    120
}

fn default_max_objects() -> usize {
    4
}

fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024 // 25MB
}

fn default_allowed_mime_prefix() -> String {
    "image/".to_string()
}

fn default_thumbnail_edge() -> u32 {
    750
}

fn default_thumbnail_quality() -> u8 {
    85
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_page_size() -> i64 {
    50
}

fn default_max_page_size() -> i64 {
    200
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "feedback-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/feedback").required(false))
            .add_source(config::File::with_name("/etc/ansel/feedback").required(false))
            // Override with environment variables
            // FEEDBACK__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("FEEDBACK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "database.url".to_string(),
            ));
        }

        if self.analysis.api_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "analysis.api_key".to_string(),
            ));
        }

        if self.s3.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.part_size_bytes".to_string(),
                message: format!("Part size must be at least {} bytes", MIN_PART_SIZE_BYTES),
            });
        }

        if self.analysis.max_edge_px == 0 || self.ingest.thumbnail_edge_px == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "analysis.max_edge_px/ingest.thumbnail_edge_px".to_string(),
                message: "Edge lengths must be greater than 0".to_string(),
            });
        }

        if self.ingest.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.max_upload_bytes".to_string(),
                message: "Upload limit must be greater than 0".to_string(),
            });
        }

        if self.ingest.thumbnail_quality == 0 || self.ingest.thumbnail_quality > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.thumbnail_quality".to_string(),
                message: "JPEG quality must be within 1-100".to_string(),
            });
        }

        if self.api.default_page_size <= 0 || self.api.max_page_size < self.api.default_page_size
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.default_page_size".to_string(),
                message: "Page size must be positive and not exceed api.max_page_size"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Get vision model request timeout as Duration
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            allowed_mime_prefix: default_allowed_mime_prefix(),
            thumbnail_edge_px: default_thumbnail_edge(),
            thumbnail_quality: default_thumbnail_quality(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            api_key: None,
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}
