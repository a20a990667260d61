//! Shared test fixture: an in-memory store on a manual clock, wrapped so
//! writes to chosen tables can be made to fail.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use revstore_table::{
    Filter, InMemoryTableStore, PutRequest, PutStatus, Query, QueryResult, Schema, SchemaStatus,
    TableError, TableResult, TableStore,
};
use revstore_types::{ManualClock, SharedClock};

use crate::request::{BucketResponse, ResponseBody};

/// Delegates to an inner store, failing puts to tables marked as broken.
pub(crate) struct FaultyStore {
    inner: InMemoryTableStore,
    broken: Mutex<HashSet<String>>,
}

#[async_trait]
impl TableStore for FaultyStore {
    async fn create_schema(&self, schema: &Schema) -> TableResult<SchemaStatus> {
        self.inner.create_schema(schema).await
    }

    async fn get(&self, table: &str, query: &Query) -> TableResult<QueryResult> {
        self.inner.get(table, query).await
    }

    async fn put(&self, table: &str, request: PutRequest) -> TableResult<PutStatus> {
        if self.broken.lock().unwrap().contains(table) {
            return Err(TableError::Unavailable(format!("injected failure on {table}")));
        }
        self.inner.put(table, request).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> TableResult<usize> {
        self.inner.delete(table, filter).await
    }
}

pub(crate) struct Fixture {
    clock: Arc<ManualClock>,
    store: Arc<FaultyStore>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(FaultyStore {
            inner: InMemoryTableStore::with_clock(clock.clone()),
            broken: Mutex::new(HashSet::new()),
        });
        Self { clock, store }
    }

    pub(crate) fn store(&self) -> Arc<dyn TableStore> {
        self.store.clone()
    }

    pub(crate) fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    pub(crate) fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    pub(crate) fn fail_puts_to(&self, table: &str) {
        self.store.broken.lock().unwrap().insert(table.to_string());
    }

    pub(crate) fn live_rows(&self, table: &str) -> usize {
        self.store.inner.live_rows(table)
    }

    fn body(response: &BucketResponse) -> &serde_json::Value {
        match &response.body {
            ResponseBody::Json(body) => body,
            other => panic!("expected json body, got {other:?}"),
        }
    }

    /// The `items` array of a listing response.
    pub(crate) fn items(&self, response: &BucketResponse) -> Vec<serde_json::Value> {
        assert_eq!(response.status, 200, "{response:?}");
        Self::body(response)["items"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    /// The continuation token of a listing response.
    pub(crate) fn next_page(&self, response: &BucketResponse) -> Option<String> {
        Self::body(response)["_links"]["next"]["href"]
            .as_str()
            .and_then(|href| href.strip_prefix("?page="))
            .map(str::to_string)
    }
}
