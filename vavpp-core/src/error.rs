//! Error types shared by the post-processing pipeline and its backends.

use thiserror::Error;

use crate::config::DeintMode;

/// A single failed backend call.
///
/// `status` carries the raw backend status code where one exists (VA-API
/// `VAStatus`), `message` the human readable form.
#[derive(Debug, Clone, Error)]
#[error("{call}() failed: {message} (status {status})")]
pub struct BackendError {
    pub call: &'static str,
    pub status: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(call: &'static str, status: i32, message: impl Into<String>) -> Self {
        Self {
            call,
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum VppError {
    /// Capability or filter-capability query failed. Absorbed by the
    /// negotiator, which falls back to pass-through.
    #[error("Backend query failed: {0}")]
    BackendQueryFailed(#[source] BackendError),

    /// The configured deinterlacing algorithm is not offered by the backend.
    #[error("Deinterlacing algorithm {0} not supported by backend")]
    UnsupportedAlgorithm(DeintMode),

    /// Pool exhausted, no pool configured, or software upload failed.
    #[error("Surface allocation failed: {0}")]
    SurfaceAllocationFailed(String),

    /// Any backend call while assembling or submitting a render request.
    #[error("Render submission failed: {0}")]
    SubmissionFailed(#[source] BackendError),

    /// Format change could not be applied. The filter instance is unusable.
    #[error("Reconfiguration failed: {0}")]
    ReconfigurationFailed(String),

    /// Config, context or filter-list creation failed at open time.
    #[error("Initialization failed: {0}")]
    InitializationFailed(#[source] BackendError),

    /// Library or device could not be opened.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

impl VppError {
    /// True for errors that leave the filter instance unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReconfigurationFailed(_) | Self::InitializationFailed(_) | Self::BackendUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_frame_errors_are_not_fatal() {
        let err = VppError::SubmissionFailed(BackendError::new("vaRenderPicture", 18, "decoding error"));
        assert!(!err.is_fatal());
        assert!(!VppError::SurfaceAllocationFailed("pool exhausted".into()).is_fatal());
        assert!(VppError::ReconfigurationFailed("no frames context".into()).is_fatal());
    }

    #[test]
    fn backend_error_message_names_call() {
        let err = BackendError::new("vaBeginPicture", 3, "invalid context");
        assert_eq!(err.to_string(), "vaBeginPicture() failed: invalid context (status 3)");
    }
}
