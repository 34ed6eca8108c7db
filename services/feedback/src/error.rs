//! Error taxonomy shared by the upload, read and delete paths.

use crate::analysis::AnalysisError;
use crate::blob_store::BlobStoreError;
use crate::codec::CodecError;
use crate::metadata_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the upload pipeline and the gallery operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported image: {0}")]
    UnsupportedFormat(String),

    #[error("Object storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Analysis service unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error("Malformed analysis: {0}")]
    MalformedAnalysis(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable error code
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "invalid_input",
            ServiceError::UnsupportedFormat(_) => "unsupported_format",
            ServiceError::StorageUnavailable(_) => "storage_unavailable",
            ServiceError::AnalysisUnavailable(_) => "analysis_unavailable",
            ServiceError::MalformedAnalysis(_) => "malformed_analysis",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Persistence(_) => "persistence_failure",
            ServiceError::Internal(_) => "internal",
        }
    }
}

impl From<CodecError> for ServiceError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::UnsupportedFormat(msg) => ServiceError::UnsupportedFormat(msg),
            CodecError::Encode(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<BlobStoreError> for ServiceError {
    fn from(e: BlobStoreError) -> Self {
        match e {
            BlobStoreError::StorageUnavailable(msg) => ServiceError::StorageUnavailable(msg),
            BlobStoreError::NotFound(key) => ServiceError::NotFound(format!("object {}", key)),
        }
    }
}

impl From<AnalysisError> for ServiceError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::AnalysisUnavailable(msg) => ServiceError::AnalysisUnavailable(msg),
            AnalysisError::MalformedAnalysis(msg) => ServiceError::MalformedAnalysis(msg),
            AnalysisError::Codec(e) => e.into(),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::Persistence(e) => ServiceError::Persistence(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(
            ServiceError::from(BlobStoreError::NotFound("k".to_string())).kind(),
            "not_found"
        );
        assert_eq!(
            ServiceError::from(AnalysisError::Codec(CodecError::UnsupportedFormat(
                "x".to_string()
            )))
            .kind(),
            "unsupported_format"
        );
        assert_eq!(
            ServiceError::from(StoreError::NotFound("image".to_string())).kind(),
            "not_found"
        );
    }
}
