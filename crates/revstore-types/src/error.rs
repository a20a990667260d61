use thiserror::Error;

/// Errors produced when validating caller-supplied identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid revision: {0}")]
    InvalidRevision(String),

    #[error("invalid render id: {0}")]
    InvalidRenderId(String),
}
