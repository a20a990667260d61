//! Revisioned content buckets for revstore.
//!
//! A bucket stores values addressed by `(key, rev, tid)` on top of a
//! [`TableStore`](revstore_table::TableStore) that offers nothing beyond
//! single-row atomic get, put and delete. This crate adds ETag identity,
//! conflict detection against the stored revision, chunking of large
//! values, coupled content groups, and grace-period deletion of superseded
//! data.
//!
//! # Bucket types
//!
//! - [`KeyRevValueBucket`] -- one value per key, revision and render
//! - [`MultiContentBucket`] -- a main content type plus dependents, written
//!   dependents first and gated on the main row
//! - [`ChunkedBucket`] -- values split across chunk rows, gated on a
//!   metadata row
//!
//! All three implement [`Bucket`], the request-level operation set consumed
//! by a routing layer, and are built from [`BucketConfig`] by
//! [`open_buckets`].
//!
//! # Consistency
//!
//! There are no locks and no compare-and-swap. Each write reads the current
//! main (or metadata) row and classifies itself against it; older revisions
//! are rejected with [`BucketError::Conflict`]. Nothing is overwritten in
//! place: superseded content is recorded in a timeline and purged by a
//! sampled background sweep once the grace period has passed.

pub mod bucket;
pub mod chunk;
pub mod chunked;
pub mod config;
pub mod error;
pub mod key_rev_value;
pub mod multi_content;
pub mod request;
pub mod retention;
mod rows;

#[cfg(test)]
mod testing;

pub use bucket::{build_bucket, open_buckets, Bucket};
pub use chunk::{join, join_content, split, split_content, Chunk};
pub use chunked::ChunkedBucket;
pub use config::{
    BucketConfig, BucketOptions, ChunkedOptions, ContentTypeSpec, GcOptions, KeyRevValueOptions,
    MultiContentOptions, RetentionPolicy,
};
pub use error::{BucketError, BucketResult};
pub use key_rev_value::KeyRevValueBucket;
pub use multi_content::MultiContentBucket;
pub use request::{
    BucketRequest, BucketResponse, ContentPart, Headers, ListForm, RequestBody, ResponseBody,
};
pub use retention::{GcSampler, MaintenanceHandle, MaintenanceReport, PutOutcome};
pub use rows::StoredContent;
