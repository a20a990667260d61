use serde_json::json;

use revstore_types::{Revision, Tid, TypeError};

use crate::request::{BucketResponse, Headers, ResponseBody};

/// Errors surfaced by bucket operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BucketError {
    /// No row (or metadata row) matched the request.
    #[error("not found: {key} ({detail})")]
    NotFound { key: String, detail: String },

    /// The revision was not a non-negative integer literal.
    #[error("invalid revision: {0}")]
    InvalidRevision(String),

    /// The render id was not a canonical time-ordered identifier.
    #[error("invalid render id: {0}")]
    InvalidRenderId(String),

    /// The write names an older revision than the one stored, or would
    /// overwrite a chunk set in place.
    #[error("conflict on {key}: revision {rev} cannot replace stored revision {stored_rev}")]
    Conflict {
        key: String,
        rev: Revision,
        stored_rev: Revision,
    },

    /// The metadata row declares more chunks than could be read.
    #[error("incomplete chunk set for {key} at {tid}: expected {expected} chunks, found {found}")]
    IncompleteChunkSet {
        key: String,
        tid: Tid,
        expected: u64,
        found: u64,
    },

    /// A required table-store write failed.
    ///
    /// `client_facing` marks failures the single-content put reports as a
    /// rejected update rather than a server fault.
    #[error("write to {table} failed for {key}: {reason}")]
    StorageWriteFailed {
        table: String,
        key: String,
        reason: String,
        client_facing: bool,
    },

    /// A required table-store read failed.
    #[error("read from {table} failed for {key}: {reason}")]
    StorageReadFailed {
        table: String,
        key: String,
        reason: String,
    },

    /// The request body or parameters do not fit the bucket.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The bucket options were rejected.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BucketError {
    /// HTTP-style status code for the error.
    pub fn status(&self) -> u16 {
        match self {
            BucketError::NotFound { .. } => 404,
            BucketError::InvalidRevision(_)
            | BucketError::InvalidRenderId(_)
            | BucketError::InvalidRequest(_) => 400,
            BucketError::Conflict { .. } => 409,
            BucketError::StorageWriteFailed {
                client_facing: true,
                ..
            } => 400,
            BucketError::IncompleteChunkSet { .. }
            | BucketError::StorageWriteFailed { .. }
            | BucketError::StorageReadFailed { .. }
            | BucketError::Config(_) => 500,
        }
    }

    /// Machine-readable problem type.
    pub fn problem_type(&self) -> &'static str {
        match self {
            BucketError::NotFound { .. } => "not_found",
            BucketError::InvalidRevision(_) => "invalid_revision",
            BucketError::InvalidRenderId(_) => "invalid_render_id",
            BucketError::Conflict { .. } => "conflict",
            BucketError::IncompleteChunkSet { .. } => "incomplete_chunk_set",
            BucketError::StorageWriteFailed {
                client_facing: true,
                ..
            } => "update_error",
            BucketError::StorageWriteFailed { .. } => "storage_write_failed",
            BucketError::StorageReadFailed { .. } => "storage_read_failed",
            BucketError::InvalidRequest(_) => "invalid_request",
            BucketError::Config(_) => "configuration_error",
        }
    }

    /// Render the error as a problem+json response.
    pub fn to_response(&self) -> BucketResponse {
        let title = match self {
            BucketError::StorageWriteFailed { .. } | BucketError::StorageReadFailed { .. } => {
                "Internal error in table storage backend".to_string()
            }
            other => other.to_string(),
        };
        let mut headers = Headers::new();
        headers.insert(
            "content-type".to_string(),
            "application/problem+json".to_string(),
        );
        BucketResponse {
            status: self.status(),
            headers,
            body: ResponseBody::Json(json!({
                "type": self.problem_type(),
                "title": title,
                "detail": self.to_string(),
            })),
        }
    }
}

impl From<TypeError> for BucketError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::InvalidRevision(input) => BucketError::InvalidRevision(input),
            TypeError::InvalidRenderId(input) => BucketError::InvalidRenderId(input),
        }
    }
}

/// Result alias for bucket operations.
pub type BucketResult<T> = Result<T, BucketError>;
