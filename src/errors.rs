//! Metadata error types.
//!
//! Every variant maps to a well-known wire error code via
//! [`MetaError::code`].  The API layer turns these into protocol
//! responses; inside the crate, backend failures travel as
//! [`MetaError::Backend`] with their source untouched.

use thiserror::Error;

/// Typed errors surfaced by the metadata engine.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The resource you requested does not exist")]
    NoSuchKey { key: String },

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A stored versioning mode was unrecognized.
    #[error("The versioning configuration is invalid: {mode}")]
    InvalidVersioning { mode: String },

    /// A stored or cached record failed to decode as the expected entity.
    #[error("We encountered an internal error, please try again.")]
    InternalError { message: String },

    /// The metadata backend failed (transport or transaction error).
    #[error("Metadata backend error")]
    Backend(#[from] anyhow::Error),
}

impl MetaError {
    /// Return the wire error code string.
    pub fn code(&self) -> &'static str {
        match self {
            MetaError::NoSuchBucket { .. } => "NoSuchBucket",
            MetaError::NoSuchKey { .. } => "NoSuchKey",
            MetaError::NoSuchUpload { .. } => "NoSuchUpload",
            MetaError::InvalidVersioning { .. } => "InvalidVersioning",
            MetaError::InternalError { .. } => "InternalError",
            MetaError::Backend(_) => "InternalError",
        }
    }
}
