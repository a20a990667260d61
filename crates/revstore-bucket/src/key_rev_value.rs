//! Single-content bucket: one value per `(key, rev, tid)`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use revstore_table::{
    AttributeType, Order, PutRequest, Query, Row, Schema, SchemaStatus, SchemaVersion,
    TableStore, Value, TTL_ATTRIBUTE,
};
use revstore_types::{Revision, SharedClock, SystemClock, Tid};

use crate::bucket::{get_response, put_response, single_part, Bucket};
use crate::config::{KeyRevValueOptions, RetentionPolicy};
use crate::error::{BucketError, BucketResult};
use crate::request::{BucketRequest, BucketResponse, ContentPart, ListForm};
use crate::retention::{MaintenanceHandle, MaintenanceReport, PutOutcome};
use crate::rows::{self, StoredContent, DOMAIN, HEADERS, KEY, REV, TID, VALUE};

const CONTENT_HASH: &str = "content-hash";

/// Page size used when scanning a key's history for retention.
const RETENTION_SCAN_PAGE: usize = 1000;

/// A key-revision-value bucket backed by a single table.
pub struct KeyRevValueBucket {
    store: Arc<dyn TableStore>,
    options: KeyRevValueOptions,
    clock: SharedClock,
}

impl KeyRevValueBucket {
    /// Build a bucket over `store`; the options are validated.
    pub fn new(store: Arc<dyn TableStore>, options: KeyRevValueOptions) -> BucketResult<Self> {
        options.validate()?;
        Ok(Self {
            store,
            options,
            clock: SystemClock::shared(),
        })
    }

    /// Use `clock` for render-id generation and retention.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Name of the backing table.
    pub fn table(&self) -> &str {
        &self.options.table
    }

    /// The options this bucket was built with.
    pub fn options(&self) -> &KeyRevValueOptions {
        &self.options
    }

    fn schema(&self) -> Schema {
        Schema::new(
            &self.options.table,
            SchemaVersion::new(1, self.options.schema_minor_version),
        )
        .attribute(DOMAIN, AttributeType::Text)
        .attribute(KEY, AttributeType::Text)
        .attribute(REV, AttributeType::Int)
        .attribute(TID, AttributeType::Tid)
        .attribute(VALUE, rows::attribute_type(self.options.value_kind))
        .attribute(HEADERS, AttributeType::Json)
        .attribute(CONTENT_HASH, AttributeType::Text)
        .hash(DOMAIN)
        .hash(KEY)
        .range(REV, Order::Desc)
        .range(TID, Order::Desc)
    }

    /// Create the bucket's table. Idempotent.
    pub async fn create_bucket(&self) -> BucketResult<SchemaStatus> {
        let schema = self.schema();
        self.store
            .create_schema(&schema)
            .await
            .map_err(|e| BucketError::StorageWriteFailed {
                table: schema.table.clone(),
                key: String::new(),
                reason: e.to_string(),
                client_facing: false,
            })
    }

    /// Store `part` as render `tid` (or a fresh one) of `rev`.
    pub async fn put_revision(
        &self,
        domain: &str,
        key: &str,
        rev: Revision,
        tid: Option<Tid>,
        part: ContentPart,
    ) -> BucketResult<PutOutcome> {
        rows::check_kind(self.options.value_kind, &part.body, &self.options.table)?;
        let rev_value = rows::rev_value(rev)?;
        let table = self.options.table.as_str();
        let hash = part.body.digest();

        if let RetentionPolicy::LatestHash { .. } = self.options.retention {
            if let Some(existing) = self.unchanged_render(domain, key, rev, &hash).await? {
                debug!(table, key, rev, tid = %existing, "content unchanged, write skipped");
                return Ok(PutOutcome::new(rev, existing, false));
            }
        }

        let tid = tid.unwrap_or_else(|| Tid::issue(self.clock.now()));
        let mut row = rows::base_row(domain, key);
        row.insert(REV.into(), rev_value);
        row.insert(TID.into(), Value::Tid(tid));
        row.insert(VALUE.into(), rows::content_value(&part.body));
        row.insert(HEADERS.into(), rows::headers_value(&part.headers));
        row.insert(CONTENT_HASH.into(), Value::Text(hash));
        rows::write_row(self.store.as_ref(), table, key, PutRequest::new(row), true).await?;
        debug!(table, key, rev, tid = %tid, "revision stored");

        let mut outcome = PutOutcome::new(rev, tid, true);
        outcome.maintenance = self.spawn_retention(domain, key, rev, tid);
        Ok(outcome)
    }

    /// The stored render of `rev` whose content hash is `hash`, if it is the
    /// newest row for the key.
    async fn unchanged_render(
        &self,
        domain: &str,
        key: &str,
        rev: Revision,
        hash: &str,
    ) -> BucketResult<Option<Tid>> {
        let table = self.options.table.as_str();
        let Some(latest) = rows::read_first(
            self.store.as_ref(),
            table,
            key,
            rows::key_filter(domain, key),
            Some(&[REV, TID, CONTENT_HASH][..]),
        )
        .await?
        else {
            return Ok(None);
        };
        let same_rev = rows::row_rev(&latest, table, key)? == rev;
        let same_hash = latest.get(CONTENT_HASH).and_then(Value::as_text) == Some(hash);
        if same_rev && same_hash {
            return rows::row_tid(&latest, table, key).map(Some);
        }
        Ok(None)
    }

    fn spawn_retention(
        &self,
        domain: &str,
        key: &str,
        rev: Revision,
        tid: Tid,
    ) -> Option<MaintenanceHandle> {
        let (keep, grace_ms) = match self.options.retention {
            RetentionPolicy::All => return None,
            RetentionPolicy::Latest { count, grace_ms } => (count, grace_ms),
            RetentionPolicy::LatestHash { grace_ms } => (1, grace_ms),
        };
        let job = RetentionJob {
            store: self.store.clone(),
            table: self.options.table.clone(),
            domain: domain.to_string(),
            key: key.to_string(),
            keep,
            grace: Duration::from_millis(grace_ms),
            page_size: RETENTION_SCAN_PAGE,
        };
        let span = tracing::debug_span!("retention", key, rev, tid = %tid.short_id());
        Some(MaintenanceHandle::spawn(job.run(), span))
    }

    /// Read the newest row for `key`, optionally pinned to `rev` and `tid`.
    pub async fn get_revision(
        &self,
        domain: &str,
        key: &str,
        rev: Option<Revision>,
        tid: Option<Tid>,
    ) -> BucketResult<StoredContent> {
        let table = self.options.table.as_str();
        let filter = rows::revision_filter(domain, key, rev, tid.as_ref())?;
        let row = rows::read_first(self.store.as_ref(), table, key, filter, None)
            .await?
            .ok_or_else(|| BucketError::NotFound {
                key: key.to_string(),
                detail: format!("no row in {table}"),
            })?;
        Ok(StoredContent {
            rev: rows::row_rev(&row, table, key)?,
            tid: rows::row_tid(&row, table, key)?,
            headers: rows::row_headers(&row),
            body: rows::row_content(&row, self.options.value_kind, table, key)?,
        })
    }

    /// List stored `(rev, tid)` pairs, newest first.
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
            &self.options.table,
            domain,
            key,
            form,
            limit,
            page,
        )
        .await
    }
}

impl std::fmt::Debug for KeyRevValueBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRevValueBucket")
            .field("options", &self.options)
            .finish()
    }
}

/// Marks rows outside the retained window to expire after the grace period.
struct RetentionJob {
    store: Arc<dyn TableStore>,
    table: String,
    domain: String,
    key: String,
    keep: usize,
    grace: Duration,
    page_size: usize,
}

impl RetentionJob {
    /// Every row of the key, newest first.
    async fn scan(&self) -> BucketResult<Vec<Row>> {
        let mut history = Vec::new();
        let mut page = None;
        loop {
            let query = Query::new(rows::key_filter(&self.domain, &self.key))
                .limit(self.page_size)
                .with_ttl()
                .page(page);
            let Some(result) =
                rows::read_page(self.store.as_ref(), &self.table, &self.key, &query).await?
            else {
                break;
            };
            history.extend(result.items);
            match result.next {
                Some(next) => page = Some(next),
                None => break,
            }
        }
        Ok(history)
    }

    async fn run(self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            swept: true,
            ..MaintenanceReport::default()
        };
        let history = match self.scan().await {
            Ok(history) => history,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "retention scan failed");
                return report;
            }
        };

        let mut kept_revs = BTreeSet::new();
        for row in history {
            let Some(rev) = row.get(REV).and_then(Value::as_int) else {
                continue;
            };
            // Newest render of each of the newest `keep` revisions survives.
            if !kept_revs.contains(&rev) && kept_revs.len() < self.keep {
                kept_revs.insert(rev);
                continue;
            }
            if row.contains_key(TTL_ATTRIBUTE) {
                continue;
            }
            let request = PutRequest::new(row).ttl(self.grace);
            match self.store.put(&self.table, request).await {
                Ok(_) => report.purged += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(error = %e, rev, "marking superseded row failed");
                }
            }
        }
        if report.purged > 0 {
            debug!(marked = report.purged, "superseded rows marked for expiry");
        }
        report
    }
}

impl KeyRevValueBucket {
    async fn get_request(&self, request: &BucketRequest) -> BucketResult<StoredContent> {
        let rev = request.parsed_revision()?;
        let tid = request.parsed_tid()?;
        KeyRevValueBucket::get_revision(self, &request.domain, &request.key, rev, tid).await
    }

    async fn put_request(&self, mut request: BucketRequest) -> BucketResult<PutOutcome> {
        let rev = request.required_revision()?;
        let tid = request.parsed_tid()?;
        let part = single_part(&mut request)?;
        if request.is_no_store() {
            let tid = tid.unwrap_or_else(|| Tid::issue(self.clock.now()));
            return Ok(PutOutcome::new(rev, tid, false));
        }
        KeyRevValueBucket::put_revision(self, &request.domain, &request.key, rev, tid, part).await
    }
}

#[async_trait]
impl Bucket for KeyRevValueBucket {
    async fn create_bucket(&self) -> BucketResult<SchemaStatus> {
        KeyRevValueBucket::create_bucket(self).await
    }

    async fn get_revision(&self, request: &BucketRequest) -> BucketResponse {
        get_response(self.get_request(request).await)
    }

    async fn put_revision(&self, request: BucketRequest) -> BucketResponse {
        put_response(self.put_request(request).await)
    }

    async fn list_revisions(&self, request: &BucketRequest) -> BucketResponse {
        KeyRevValueBucket::list_revisions(
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
