//! Error types for kbsync-sync.

use std::path::PathBuf;

use thiserror::Error;

use kbsync_core::error::StoreError;
use kbsync_renderer::RenderError;

/// Failure of one call against the vendor assistant API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The vendor answered with a non-success status.
    #[error("{method} {path} returned HTTP {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    /// The request never produced a response (DNS, TLS, timeout, ...).
    #[error("{method} {path} failed: {message}")]
    Transport {
        method: &'static str,
        path: String,
        message: String,
    },

    /// The response body was not the expected JSON shape.
    #[error("unexpected response from {path}: {message}")]
    InvalidResponse { path: String, message: String },

    #[error("vendor API key is not configured")]
    MissingApiKey,
}

impl ApiError {
    /// Whether the vendor rejected the submitted field shape itself.
    ///
    /// Such rejections never succeed on retry.
    pub fn is_schema_rejection(&self) -> bool {
        self.to_string().to_lowercase().contains("should not exist")
    }

    /// Raw response body, when the vendor sent one.
    pub fn body(&self) -> Option<&str> {
        match self {
            ApiError::Status { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

/// Failure of one object-store operation.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object store {op} {key} returned HTTP {status}")]
    Status {
        op: &'static str,
        key: String,
        status: u16,
    },

    #[error("object store {op} {key} failed: {message}")]
    Transport {
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("invalid object key {0:?}")]
    InvalidKey(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the document generator.
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// An error from the configuration or file-record store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("vendor API error: {0}")]
    Api(#[from] ApiError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
}

pub(crate) fn store_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_rejection_is_detected_in_body() {
        let err = ApiError::Status {
            method: "PATCH",
            path: "/assistant/a1".to_string(),
            status: 400,
            body: r#"{"message":["model.property toolIds should not exist"]}"#.to_string(),
        };
        assert!(err.is_schema_rejection());
    }

    #[test]
    fn transient_errors_are_not_schema_rejections() {
        let err = ApiError::Status {
            method: "PATCH",
            path: "/assistant/a1".to_string(),
            status: 503,
            body: "upstream unavailable".to_string(),
        };
        assert!(!err.is_schema_rejection());
        assert_eq!(err.body(), Some("upstream unavailable"));
    }
}
