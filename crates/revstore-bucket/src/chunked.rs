//! Chunked bucket: values larger than a row, stored as a metadata row plus
//! ordered chunk rows.
//!
//! Chunk rows are written first, concurrently, and the metadata row last.
//! The metadata row is the linearization point: a reader that cannot find it
//! sees nothing, and a reader that finds it refuses to return anything short
//! of the full chunk set. A stored render is never rewritten in place.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::debug;

use revstore_table::{
    AttributeType, Order, PutRequest, Query, Schema, SchemaStatus, SchemaVersion, TableResult,
    TableStore, Value,
};
use revstore_types::{Content, Revision, SharedClock, SystemClock, Tid};

use crate::bucket::{get_response, put_response, single_part, Bucket};
use crate::chunk::{join_content, split_content};
use crate::config::ChunkedOptions;
use crate::error::{BucketError, BucketResult};
use crate::request::{BucketRequest, BucketResponse, ContentPart, ListForm};
use crate::retention::{
    classify, GcSampler, Maintenance, PutOutcome, Purge, PurgeScope, Timelines, WriteClass,
};
use crate::rows::{self, StoredContent, DOMAIN, HEADERS, KEY, REV, TID, VALUE};

const CHUNKS: &str = "chunks";
const CHUNK_ID: &str = "chunk_id";
const SIZE: &str = "size";

/// Page size used when collecting doomed metadata rows.
const PURGE_PAGE: usize = 100;

fn int(value: usize) -> Value {
    Value::Int(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Deletes metadata rows first, then the chunk rows they referenced.
#[derive(Debug)]
struct ChunkPurge {
    meta: String,
    chunks: String,
}

#[async_trait]
impl Purge for ChunkPurge {
    async fn purge(
        &self,
        store: &dyn TableStore,
        domain: &str,
        key: &str,
        scope: PurgeScope,
    ) -> TableResult<usize> {
        let filter = scope.filter(domain, key);
        let mut doomed = Vec::new();
        let mut page = None;
        loop {
            let query = Query::new(filter.clone())
                .limit(PURGE_PAGE)
                .project([TID, CHUNKS])
                .page(page);
            let result = match store.get(&self.meta, &query).await {
                Ok(result) => result,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            };
            for row in &result.items {
                let tid = row.get(TID).and_then(Value::as_tid).copied();
                let count = row.get(CHUNKS).and_then(Value::as_int);
                if let (Some(tid), Some(count)) = (tid, count) {
                    doomed.push((tid, count));
                }
            }
            match result.next {
                Some(next) => page = Some(next),
                None => break,
            }
        }

        let mut purged = store.delete(&self.meta, &filter).await?;
        for (tid, count) in doomed {
            let chunks = rows::key_filter(domain, key)
                .eq(TID, tid)
                .lt(CHUNK_ID, count);
            purged += store.delete(&self.chunks, &chunks).await?;
        }
        Ok(purged)
    }
}

/// A bucket that splits values across chunk rows.
pub struct ChunkedBucket {
    store: Arc<dyn TableStore>,
    options: ChunkedOptions,
    clock: SharedClock,
    chunk_size: NonZeroUsize,
    meta_table: String,
    chunk_table: String,
    timelines: Arc<Timelines>,
    purge: Arc<ChunkPurge>,
    sampler: GcSampler,
}

impl ChunkedBucket {
    /// Build a chunked bucket; the options are validated.
    pub fn new(store: Arc<dyn TableStore>, options: ChunkedOptions) -> BucketResult<Self> {
        options.validate()?;
        let gc = options.gc()?;
        let chunk_size = NonZeroUsize::new(options.chunk_size)
            .ok_or_else(|| BucketError::Config("chunk_size must be positive".into()))?;
        let prefix = options.table_prefix.as_str();
        let meta_table = format!("{prefix}.meta");
        let chunk_table = format!("{prefix}.chunks");
        let version = SchemaVersion::new(1, options.schema_minor_version);
        Ok(Self {
            timelines: Arc::new(Timelines::new(prefix, gc, version)),
            purge: Arc::new(ChunkPurge {
                meta: meta_table.clone(),
                chunks: chunk_table.clone(),
            }),
            sampler: GcSampler::new(gc.delete_probability),
            store,
            clock: SystemClock::shared(),
            chunk_size,
            meta_table,
            chunk_table,
            options,
        })
    }

    /// Use `clock` for render ids, timeline stamps and grace checks.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The options this bucket was built with.
    pub fn options(&self) -> &ChunkedOptions {
        &self.options
    }

    /// Table holding one metadata row per render.
    pub fn meta_table(&self) -> &str {
        &self.meta_table
    }

    /// Table holding the chunk rows.
    pub fn chunk_table(&self) -> &str {
        &self.chunk_table
    }

    fn schemas(&self) -> Vec<Schema> {
        let version = SchemaVersion::new(1, self.options.schema_minor_version);
        let chunks = Schema::new(&self.chunk_table, version)
            .attribute(DOMAIN, AttributeType::Text)
            .attribute(KEY, AttributeType::Text)
            .attribute(TID, AttributeType::Tid)
            .attribute(CHUNK_ID, AttributeType::Int)
            .attribute(VALUE, rows::attribute_type(self.options.value_kind))
            .hash(DOMAIN)
            .hash(KEY)
            .range(TID, Order::Desc)
            .range(CHUNK_ID, Order::Asc);
        let meta = Schema::new(&self.meta_table, version)
            .attribute(DOMAIN, AttributeType::Text)
            .attribute(KEY, AttributeType::Text)
            .attribute(REV, AttributeType::Int)
            .attribute(TID, AttributeType::Tid)
            .attribute(CHUNKS, AttributeType::Int)
            .attribute(SIZE, AttributeType::Int)
            .attribute(HEADERS, AttributeType::Json)
            .hash(DOMAIN)
            .hash(KEY)
            .range(REV, Order::Desc)
            .range(TID, Order::Desc);
        let [revisions, renders] = self.timelines.schemas();
        vec![chunks, revisions, renders, meta]
    }

    /// Create the chunk, timeline and metadata tables.
    pub async fn create_bucket(&self) -> BucketResult<SchemaStatus> {
        let mut status = SchemaStatus::Unchanged;
        for schema in self.schemas() {
            status = self
                .store
                .create_schema(&schema)
                .await
                .map_err(|e| BucketError::StorageWriteFailed {
                    table: schema.table.clone(),
                    key: String::new(),
                    reason: e.to_string(),
                    client_facing: false,
                })?;
        }
        Ok(status)
    }

    async fn current(&self, domain: &str, key: &str) -> BucketResult<Option<(Revision, Tid)>> {
        let table = self.meta_table.as_str();
        let row = rows::read_first(
            self.store.as_ref(),
            table,
            key,
            rows::key_filter(domain, key),
            Some(&[REV, TID][..]),
        )
        .await?;
        match row {
            Some(row) => Ok(Some((
                rows::row_rev(&row, table, key)?,
                rows::row_tid(&row, table, key)?,
            ))),
            None => Ok(None),
        }
    }

    /// Returns `true` if a metadata row for exactly `(rev, tid)` exists.
    async fn has_render(
        &self,
        domain: &str,
        key: &str,
        rev: Revision,
        tid: &Tid,
    ) -> BucketResult<bool> {
        let filter = rows::revision_filter(domain, key, Some(rev), Some(tid))?;
        let row = rows::read_first(
            self.store.as_ref(),
            &self.meta_table,
            key,
            filter,
            Some(&[TID][..]),
        )
        .await?;
        Ok(row.is_some())
    }

    /// Write all chunk rows for `tid`, concurrently.
    async fn write_chunks(
        &self,
        domain: &str,
        key: &str,
        tid: Tid,
        fragments: Vec<Content>,
    ) -> BucketResult<()> {
        let mut writes = JoinSet::new();
        for (chunk_id, fragment) in fragments.iter().enumerate() {
            let mut row = rows::base_row(domain, key);
            row.insert(TID.into(), Value::Tid(tid));
            row.insert(CHUNK_ID.into(), int(chunk_id));
            row.insert(VALUE.into(), rows::content_value(fragment));
            let store = self.store.clone();
            let table = self.chunk_table.clone();
            writes.spawn(async move { store.put(&table, PutRequest::new(row)).await });
        }

        let mut failure = None;
        while let Some(joined) = writes.join_next().await {
            let reason = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            failure.get_or_insert(reason);
        }
        match failure {
            None => Ok(()),
            Some(reason) => {
                tracing::error!(table = %self.chunk_table, key, tid = %tid, %reason, "chunk write failed");
                Err(BucketError::StorageWriteFailed {
                    table: self.chunk_table.clone(),
                    key: key.to_string(),
                    reason,
                    client_facing: false,
                })
            }
        }
    }

    /// Split and store `part` as render `tid` (or a fresh one) of `rev`.
    pub async fn put_revision(
        &self,
        domain: &str,
        key: &str,
        rev: Revision,
        tid: Option<Tid>,
        part: ContentPart,
    ) -> BucketResult<PutOutcome> {
        rows::check_kind(self.options.value_kind, &part.body, &self.options.table_prefix)?;
        let rev_value = rows::rev_value(rev)?;
        let fragments = split_content(&part.body, self.chunk_size)?;
        let tid = tid.unwrap_or_else(|| Tid::issue(self.clock.now()));

        let prev = self.current(domain, key).await?;
        let class = classify(key, rev, &tid, prev)?;
        // Chunk rows are keyed by tid alone, so rewriting a stored render
        // would let readers join new chunks against the old count.
        let overwrites = match class {
            WriteClass::Rewrite => true,
            WriteClass::LateRender => self.has_render(domain, key, rev, &tid).await?,
            _ => false,
        };
        if overwrites {
            return Err(BucketError::Conflict {
                key: key.to_string(),
                rev,
                stored_rev: rev,
            });
        }

        let count = fragments.len();
        self.write_chunks(domain, key, tid, fragments).await?;

        let mut meta = rows::base_row(domain, key);
        meta.insert(REV.into(), rev_value);
        meta.insert(TID.into(), Value::Tid(tid));
        meta.insert(CHUNKS.into(), int(count));
        meta.insert(SIZE.into(), int(part.body.len()));
        meta.insert(HEADERS.into(), rows::headers_value(&part.headers));
        rows::write_row(
            self.store.as_ref(),
            &self.meta_table,
            key,
            PutRequest::new(meta),
            false,
        )
        .await?;
        debug!(key, rev, tid = %tid, chunks = count, "chunk set stored");

        let mut outcome = PutOutcome::new(rev, tid, true);
        if let Some(what) = class.supersession() {
            let job = Maintenance {
                store: self.store.clone(),
                timelines: self.timelines.clone(),
                purge: self.purge.clone(),
                clock: self.clock.clone(),
                domain: domain.to_string(),
                key: key.to_string(),
                what,
                sweep: self.sampler.should_sweep(&tid),
            };
            outcome.maintenance = Some(job.spawn(rev, tid));
        }
        Ok(outcome)
    }

    /// Read and reassemble the newest chunk set for `key`, optionally pinned
    /// to `rev` and `tid`.
    pub async fn get_revision(
        &self,
        domain: &str,
        key: &str,
        rev: Option<Revision>,
        tid: Option<Tid>,
    ) -> BucketResult<StoredContent> {
        let meta_table = self.meta_table.as_str();
        let filter = rows::revision_filter(domain, key, rev, tid.as_ref())?;
        let meta = rows::read_first(self.store.as_ref(), meta_table, key, filter, None)
            .await?
            .ok_or_else(|| BucketError::NotFound {
                key: key.to_string(),
                detail: format!("no row in {meta_table}"),
            })?;
        let found_rev = rows::row_rev(&meta, meta_table, key)?;
        let found_tid = rows::row_tid(&meta, meta_table, key)?;
        let expected = rows::row_int(&meta, CHUNKS, meta_table, key)?;

        let fragments = self.read_chunks(domain, key, found_tid, expected).await?;
        Ok(StoredContent {
            rev: found_rev,
            tid: found_tid,
            headers: rows::row_headers(&meta),
            body: join_content(self.options.value_kind, fragments)?,
        })
    }

    async fn read_chunks(
        &self,
        domain: &str,
        key: &str,
        tid: Tid,
        expected: u64,
    ) -> BucketResult<Vec<Content>> {
        if expected == 0 {
            return Ok(Vec::new());
        }
        let limit = usize::try_from(expected).unwrap_or(usize::MAX);
        let filter = rows::key_filter(domain, key)
            .eq(TID, tid)
            .lt(CHUNK_ID, Value::Int(i64::try_from(expected).unwrap_or(i64::MAX)));
        let query = Query::new(filter).limit(limit);
        let items = rows::read_page(self.store.as_ref(), &self.chunk_table, key, &query)
            .await?
            .map(|page| page.items)
            .unwrap_or_default();

        let mut fragments = Vec::with_capacity(items.len());
        for (index, row) in items.iter().enumerate() {
            let chunk_id = rows::row_int(row, CHUNK_ID, &self.chunk_table, key)?;
            if chunk_id != index as u64 {
                break;
            }
            fragments.push(rows::row_content(
                row,
                self.options.value_kind,
                &self.chunk_table,
                key,
            )?);
        }
        let found = fragments.len() as u64;
        if found < expected {
            tracing::error!(key, tid = %tid, expected, found, "incomplete chunk set");
            return Err(BucketError::IncompleteChunkSet {
                key: key.to_string(),
                tid,
                expected,
                found,
            });
        }
        Ok(fragments)
    }

    /// List `(rev, tid)` pairs from the metadata table, newest first.
    pub async fn list_revisions(
        &self,
        domain: &str,
        key: &str,
        form: ListForm,
        limit: usize,
        page: Option<String>,
    ) -> BucketResponse {
        rows::list_revisions(
            self.store.as_ref(),
            &self.meta_table,
            domain,
            key,
            form,
            limit,
            page,
        )
        .await
    }
}

impl std::fmt::Debug for ChunkedBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedBucket")
            .field("meta_table", &self.meta_table)
            .field("chunk_table", &self.chunk_table)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl ChunkedBucket {
    async fn get_request(&self, request: &BucketRequest) -> BucketResult<StoredContent> {
        let rev = request.parsed_revision()?;
        let tid = request.parsed_tid()?;
        ChunkedBucket::get_revision(self, &request.domain, &request.key, rev, tid).await
    }

    async fn put_request(&self, mut request: BucketRequest) -> BucketResult<PutOutcome> {
        let rev = request.required_revision()?;
        let tid = request.parsed_tid()?;
        let part = single_part(&mut request)?;
        if request.is_no_store() {
            let tid = tid.unwrap_or_else(|| Tid::issue(self.clock.now()));
            return Ok(PutOutcome::new(rev, tid, false));
        }
        ChunkedBucket::put_revision(self, &request.domain, &request.key, rev, tid, part).await
    }
}

#[async_trait]
impl Bucket for ChunkedBucket {
    async fn create_bucket(&self) -> BucketResult<SchemaStatus> {
        ChunkedBucket::create_bucket(self).await
    }

    async fn get_revision(&self, request: &BucketRequest) -> BucketResponse {
        get_response(self.get_request(request).await)
    }

    async fn put_revision(&self, request: BucketRequest) -> BucketResponse {
        put_response(self.put_request(request).await)
    }

    async fn list_revisions(&self, request: &BucketRequest) -> BucketResponse {
        ChunkedBucket::list_revisions(
            self,
            &request.domain,
            &request.key,
            request.list_form,
            request.list_limit(),
            request.page.clone(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use revstore_table::Filter;
    use revstore_types::ValueKind;

    async fn bucket(fx: &Fixture, kind: ValueKind, chunk_size: usize) -> ChunkedBucket {
        let mut options = ChunkedOptions::new("media", kind);
        options.chunk_size = chunk_size;
        options.grace_ms = 1000;
        let bucket = ChunkedBucket::new(fx.store(), options)
            .unwrap()
            .with_clock(fx.clock());
        bucket.create_bucket().await.unwrap();
        bucket
    }

    #[tokio::test]
    async fn large_value_round_trips() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::Blob, 4).await;
        let value: Vec<u8> = (0..=41).collect();
        let outcome = bucket
            .put_revision(
                "d",
                "k",
                1,
                None,
                ContentPart::new(value.clone()).header("content-type", "image/png"),
            )
            .await
            .unwrap();
        assert_eq!(fx.live_rows("media.chunks"), 11);

        let got = bucket.get_revision("d", "k", None, None).await.unwrap();
        assert_eq!(got.body, Content::from(value));
        assert_eq!(got.tid, outcome.tid);
        assert_eq!(got.headers["content-type"], "image/png");
    }

    #[tokio::test]
    async fn text_chunks_stay_valid_utf8() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::String, 3).await;
        let text = "naïve café ☕ résumé";
        bucket
            .put_revision("d", "k", 1, None, ContentPart::new(text))
            .await
            .unwrap();
        let got = bucket.get_revision("d", "k", Some(1), None).await.unwrap();
        assert_eq!(got.body, Content::from(text));
    }

    #[tokio::test]
    async fn empty_value_has_no_chunks() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::Blob, 4).await;
        bucket
            .put_revision("d", "k", 1, None, ContentPart::new(Vec::<u8>::new()))
            .await
            .unwrap();
        assert_eq!(fx.live_rows("media.chunks"), 0);
        let got = bucket.get_revision("d", "k", None, None).await.unwrap();
        assert!(got.body.is_empty());
    }

    #[tokio::test]
    async fn missing_chunk_is_never_truncated() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::Blob, 2).await;
        let outcome = bucket
            .put_revision("d", "k", 1, None, ContentPart::new(vec![1u8, 2, 3, 4, 5, 6]))
            .await
            .unwrap();

        let last_chunk = Filter::new()
            .eq(DOMAIN, "d")
            .eq(KEY, "k")
            .eq(TID, outcome.tid)
            .eq(CHUNK_ID, 2i64);
        assert_eq!(fx.store().delete("media.chunks", &last_chunk).await.unwrap(), 1);

        let err = bucket.get_revision("d", "k", None, None).await.unwrap_err();
        assert_eq!(
            err,
            BucketError::IncompleteChunkSet {
                key: "k".into(),
                tid: outcome.tid,
                expected: 3,
                found: 2,
            }
        );
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn failed_chunk_write_hides_the_set() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::Blob, 2).await;
        fx.fail_puts_to("media.chunks");
        let err = bucket
            .put_revision("d", "k", 1, None, ContentPart::new(vec![0u8; 5]))
            .await
            .unwrap_err();
        assert!(matches!(err, BucketError::StorageWriteFailed { .. }));
        assert_eq!(fx.live_rows("media.meta"), 0);
        assert_eq!(
            bucket.get_revision("d", "k", None, None).await.unwrap_err().status(),
            404
        );
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::Blob, 2).await;
        bucket
            .put_revision("d", "k", 6, None, ContentPart::new(vec![1u8]))
            .await
            .unwrap();
        let err = bucket
            .put_revision("d", "k", 4, None, ContentPart::new(vec![2u8]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 409);
        assert_eq!(fx.live_rows("media.chunks"), 1);
    }

    #[tokio::test]
    async fn stored_render_is_not_rewritten() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::Blob, 2).await;
        let older = Tid::issue(fx.clock().now());
        bucket
            .put_revision("d", "k", 1, Some(older), ContentPart::new(vec![1u8; 4]))
            .await
            .unwrap();
        let current = bucket
            .put_revision("d", "k", 1, None, ContentPart::new(vec![2u8; 4]))
            .await
            .unwrap();

        let same = bucket
            .put_revision("d", "k", 1, Some(current.tid), ContentPart::new(vec![3u8; 6]))
            .await
            .unwrap_err();
        assert_eq!(same.status(), 409);
        let late = bucket
            .put_revision("d", "k", 1, Some(older), ContentPart::new(vec![4u8; 6]))
            .await
            .unwrap_err();
        assert_eq!(late.status(), 409);

        let got = bucket
            .get_revision("d", "k", Some(1), Some(older))
            .await
            .unwrap();
        assert_eq!(got.body, Content::from(vec![1u8; 4]));
        assert_eq!(fx.live_rows("media.chunks"), 4);

        // A late render that was never stored is still accepted.
        let unseen = Tid::at(older.date() - chrono::TimeDelta::milliseconds(1));
        assert!(unseen < current.tid);
        assert!(bucket
            .put_revision("d", "k", 1, Some(unseen), ContentPart::new(vec![5u8; 2]))
            .await
            .unwrap()
            .written);
    }

    #[tokio::test]
    async fn purge_removes_metadata_and_chunks() {
        let fx = Fixture::new();
        let bucket = bucket(&fx, ValueKind::Blob, 2).await;
        for rev in 1..=2 {
            bucket
                .put_revision("d", "k", rev, None, ContentPart::new(vec![rev as u8; 4]))
                .await
                .unwrap()
                .settle()
                .await;
        }
        fx.advance_ms(2000);
        let report = bucket
            .put_revision("d", "k", 3, None, ContentPart::new(vec![3u8; 4]))
            .await
            .unwrap()
            .settle()
            .await
            .unwrap();
        // One metadata row and its two chunks.
        assert_eq!(report.purged, 3);
        assert_eq!(fx.live_rows("media.meta"), 2);
        assert_eq!(fx.live_rows("media.chunks"), 4);
        assert_eq!(
            bucket.get_revision("d", "k", Some(1), None).await.unwrap_err().status(),
            404
        );
    }

    #[test]
    fn json_values_are_rejected_by_config() {
        let fx = Fixture::new();
        let options = ChunkedOptions::new("media", ValueKind::Json);
        assert!(matches!(
            ChunkedBucket::new(fx.store(), options),
            Err(BucketError::Config(_))
        ));
    }
}
