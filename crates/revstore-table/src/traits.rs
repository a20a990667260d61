use async_trait::async_trait;

use crate::error::TableResult;
use crate::query::{Filter, PutRequest, PutStatus, Query, QueryResult};
use crate::schema::{Schema, SchemaStatus};

/// Attribute-table store.
///
/// All implementations must satisfy these invariants:
/// - A single `put` is atomic. Nothing spans rows.
/// - `get` returns rows in the table's declared index order, newest first
///   for descending range attributes.
/// - `get` fails with `NotFound` when the filter matches no rows at all.
/// - Rows whose TTL elapsed are invisible to `get` and `delete`.
/// - `create_schema` with an identical version is a no-op.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create (or confirm) a table.
    async fn create_schema(&self, schema: &Schema) -> TableResult<SchemaStatus>;

    /// Read rows matching `query.filter`.
    ///
    /// Every hash attribute of the table must be pinned with equality.
    async fn get(&self, table: &str, query: &Query) -> TableResult<QueryResult>;

    /// Insert or replace the row with the same primary key.
    async fn put(&self, table: &str, request: PutRequest) -> TableResult<PutStatus>;

    /// Remove every row matching `filter`; returns how many were removed.
    ///
    /// Every hash attribute of the table must be pinned with equality.
    async fn delete(&self, table: &str, filter: &Filter) -> TableResult<usize>;
}
