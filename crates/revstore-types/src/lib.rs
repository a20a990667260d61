//! Foundation types for revstore.
//!
//! This crate provides the identity and payload types shared by the table
//! store interface and the bucket layer. Every other revstore crate depends
//! on `revstore-types`.
//!
//! # Key Types
//!
//! - [`Tid`] — Time-ordered render identifier (version-1 UUID)
//! - [`Revision`] — Caller-supplied content-source version
//! - [`ETag`] — Externally visible `(rev, tid[, suffix])` version token
//! - [`Content`] / [`ValueKind`] — Stored payloads and their declared kinds
//! - [`Clock`] — Injectable wall clock ([`SystemClock`], [`ManualClock`])

pub mod clock;
pub mod content;
pub mod error;
pub mod etag;
pub mod revision;
pub mod tid;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use content::{Content, ValueKind};
pub use error::TypeError;
pub use etag::ETag;
pub use revision::{validate_revision, Revision};
pub use tid::{validate_render_id, Tid};
