//! Multi-content bucket: a main content type plus dependent types stored
//! under one `(key, rev, tid)` identity.
//!
//! Dependents are written first and the main row last, so a reader that
//! finds the main row may assume the whole group is durable. Every read
//! resolves the main row first and reads dependents at exactly its
//! `(rev, tid)`, so a group whose main write never happened is invisible for
//! all content types.
//!
//! Superseded revisions and renders are purged by the timeline protocol in
//! [`crate::retention`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use revstore_table::{
    AttributeType, Order, PutRequest, Schema, SchemaStatus, SchemaVersion, TableResult,
    TableStore, Value,
};
use revstore_types::{Revision, SharedClock, SystemClock, Tid};

use crate::bucket::{get_response, put_response, Bucket};
use crate::config::{ContentTypeSpec, MultiContentOptions};
use crate::error::{BucketError, BucketResult};
use crate::request::{BucketRequest, BucketResponse, ContentPart, ListForm};
use crate::retention::{
    classify, GcSampler, Maintenance, PutOutcome, Purge, PurgeScope, Timelines,
};
use crate::rows::{self, StoredContent, DOMAIN, HEADERS, KEY, REV, TID, VALUE};

#[derive(Clone, Debug)]
struct ContentTable {
    spec: ContentTypeSpec,
    table: String,
}

/// Deletes purged rows from every content table, main first.
#[derive(Debug)]
struct ContentPurge {
    tables: Vec<String>,
}

#[async_trait]
impl Purge for ContentPurge {
    async fn purge(
        &self,
        store: &dyn TableStore,
        domain: &str,
        key: &str,
        scope: PurgeScope,
    ) -> TableResult<usize> {
        let filter = scope.filter(domain, key);
        let mut purged = 0;
        for table in &self.tables {
            purged += store.delete(table, &filter).await?;
        }
        Ok(purged)
    }
}

/// A bucket of coupled content types.
pub struct MultiContentBucket {
    store: Arc<dyn TableStore>,
    options: MultiContentOptions,
    clock: SharedClock,
    main: ContentTable,
    dependents: Vec<ContentTable>,
    timelines: Arc<Timelines>,
    purge: Arc<ContentPurge>,
    sampler: GcSampler,
}

impl MultiContentBucket {
    /// Build a bucket over `store`; the options are validated.
    pub fn new(store: Arc<dyn TableStore>, options: MultiContentOptions) -> BucketResult<Self> {
        options.validate()?;
        let gc = options.gc()?;
        let prefix = options.table_prefix.as_str();
        let table_for = |spec: &ContentTypeSpec| ContentTable {
            spec: spec.clone(),
            table: format!("{prefix}.{}", spec.name),
        };
        let main = table_for(&options.main_content_type);
        let dependents: Vec<ContentTable> =
            options.dependent_content_types.iter().map(table_for).collect();
        let purge = ContentPurge {
            tables: std::iter::once(&main)
                .chain(&dependents)
                .map(|t| t.table.clone())
                .collect(),
        };
        let version = SchemaVersion::new(1, options.schema_minor_version);
        Ok(Self {
            timelines: Arc::new(Timelines::new(prefix, gc, version)),
            sampler: GcSampler::new(gc.delete_probability),
            purge: Arc::new(purge),
            store,
            clock: SystemClock::shared(),
            main,
            dependents,
            options,
        })
    }

    /// Use `clock` for render ids, timeline stamps and grace checks.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The options this bucket was built with.
    pub fn options(&self) -> &MultiContentOptions {
        &self.options
    }

    /// Table storing `content_type`.
    pub fn table_for(&self, content_type: &str) -> Option<&str> {
        self.content_tables()
            .find(|t| t.spec.name == content_type)
            .map(|t| t.table.as_str())
    }

    fn content_tables(&self) -> impl Iterator<Item = &ContentTable> {
        std::iter::once(&self.main).chain(&self.dependents)
    }

    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, self.options.schema_minor_version)
    }

    fn content_schema(&self, content: &ContentTable) -> Schema {
        Schema::new(&content.table, self.version())
            .attribute(DOMAIN, AttributeType::Text)
            .attribute(KEY, AttributeType::Text)
            .attribute(REV, AttributeType::Int)
            .attribute(TID, AttributeType::Tid)
            .attribute(VALUE, rows::attribute_type(content.spec.value_kind))
            .attribute(HEADERS, AttributeType::Json)
            .hash(DOMAIN)
            .hash(KEY)
            .range(REV, Order::Desc)
            .range(TID, Order::Desc)
    }

    /// Create every content table and both timeline tables.
    ///
    /// Returns the status of the main table.
    pub async fn create_bucket(&self) -> BucketResult<SchemaStatus> {
        let mut schemas: Vec<Schema> = self.dependents.iter().map(|c| self.content_schema(c)).collect();
        schemas.extend(self.timelines.schemas());
        schemas.push(self.content_schema(&self.main));

        let mut status = SchemaStatus::Unchanged;
        for schema in &schemas {
            status = self
                .store
                .create_schema(schema)
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

    /// Check that `parts` carries exactly the configured content types, each
    /// of the configured kind.
    fn check_parts(&self, parts: &BTreeMap<String, ContentPart>) -> BucketResult<()> {
        for content in self.content_tables() {
            let part = parts.get(&content.spec.name).ok_or_else(|| {
                BucketError::InvalidRequest(format!("missing content type {}", content.spec.name))
            })?;
            rows::check_kind(content.spec.value_kind, &part.body, &content.spec.name)?;
        }
        if let Some(unknown) = parts.keys().find(|name| self.table_for(name).is_none()) {
            return Err(BucketError::InvalidRequest(format!(
                "unknown content type {unknown}"
            )));
        }
        Ok(())
    }

    /// The `(rev, tid)` of the newest main row.
    async fn current(&self, domain: &str, key: &str) -> BucketResult<Option<(Revision, Tid)>> {
        let table = self.main.table.as_str();
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

    /// Store one render of `rev` for every content type.
    pub async fn put_revision(
        &self,
        domain: &str,
        key: &str,
        rev: Revision,
        tid: Option<Tid>,
        mut parts: BTreeMap<String, ContentPart>,
    ) -> BucketResult<PutOutcome> {
        self.check_parts(&parts)?;
        let rev_value = rows::rev_value(rev)?;
        let tid = tid.unwrap_or_else(|| Tid::issue(self.clock.now()));

        let prev = self.current(domain, key).await?;
        let class = classify(key, rev, &tid, prev)?;
        debug!(key, rev, tid = %tid, ?class, "write classified");

        for content in self.dependents.iter().chain(std::iter::once(&self.main)) {
            let Some(part) = parts.remove(&content.spec.name) else {
                continue;
            };
            let mut row = rows::base_row(domain, key);
            row.insert(REV.into(), rev_value.clone());
            row.insert(TID.into(), Value::Tid(tid));
            row.insert(VALUE.into(), rows::content_value(&part.body));
            row.insert(HEADERS.into(), rows::headers_value(&part.headers));
            rows::write_row(
                self.store.as_ref(),
                &content.table,
                key,
                PutRequest::new(row),
                false,
            )
            .await?;
        }
        debug!(key, rev, tid = %tid, "content group stored");

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

    /// Read one content type. `content_type` defaults to the main type.
    pub async fn get_revision(
        &self,
        domain: &str,
        key: &str,
        content_type: Option<&str>,
        rev: Option<Revision>,
        tid: Option<Tid>,
    ) -> BucketResult<StoredContent> {
        let content = match content_type {
            None => &self.main,
            Some(name) => self
                .content_tables()
                .find(|t| t.spec.name == name)
                .ok_or_else(|| BucketError::NotFound {
                    key: key.to_string(),
                    detail: format!("unknown content type {name}"),
                })?,
        };
        let is_main = content.spec.name == self.main.spec.name;
        let not_found = |detail: String| BucketError::NotFound {
            key: key.to_string(),
            detail,
        };

        let main_table = self.main.table.as_str();
        let filter = rows::revision_filter(domain, key, rev, tid.as_ref())?;
        let proj = if is_main { None } else { Some(&[REV, TID][..]) };
        let main_row = rows::read_first(self.store.as_ref(), main_table, key, filter, proj)
            .await?
            .ok_or_else(|| not_found(format!("no row in {main_table}")))?;
        let found_rev = rows::row_rev(&main_row, main_table, key)?;
        let found_tid = rows::row_tid(&main_row, main_table, key)?;

        if let (true, true, Some(rev), None) = (is_main, self.options.renew_expiring, rev, tid) {
            if self.is_expiring(domain, key, rev).await {
                return Err(not_found(format!("revision {rev} is about to be purged")));
            }
        }

        let row = if is_main {
            main_row
        } else {
            let filter = rows::revision_filter(domain, key, Some(found_rev), Some(&found_tid))?;
            rows::read_first(self.store.as_ref(), &content.table, key, filter, None)
                .await?
                .ok_or_else(|| not_found(format!("no row in {}", content.table)))?
        };
        Ok(StoredContent {
            rev: found_rev,
            tid: found_tid,
            headers: rows::row_headers(&row),
            body: rows::row_content(&row, content.spec.value_kind, &content.table, key)?,
        })
    }

    /// Returns `true` if `rev` was superseded at least half a grace period
    /// ago. A failed check is logged and treated as not expiring.
    async fn is_expiring(&self, domain: &str, key: &str, rev: Revision) -> bool {
        match self
            .timelines
            .superseded_since_half_grace(self.store.as_ref(), domain, key, self.clock.now())
            .await
        {
            Ok(Some(superseded)) => superseded >= rev,
            Ok(None) => false,
            Err(e) => {
                warn!(key, rev, error = %e, "expiry check failed");
                false
            }
        }
    }

    /// List `(rev, tid)` pairs of the main content type, newest first.
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
            &self.main.table,
            domain,
            key,
            form,
            limit,
            page,
        )
        .await
    }
}

impl std::fmt::Debug for MultiContentBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiContentBucket")
            .field("main", &self.main.table)
            .field(
                "dependents",
                &self.dependents.iter().map(|d| &d.table).collect::<Vec<_>>(),
            )
            .field("sampler", &self.sampler)
            .finish()
    }
}

impl MultiContentBucket {
    async fn get_request(&self, request: &BucketRequest) -> BucketResult<StoredContent> {
        let rev = request.parsed_revision()?;
        let tid = request.parsed_tid()?;
        MultiContentBucket::get_revision(
            self,
            &request.domain,
            &request.key,
            request.content_type.as_deref(),
            rev,
            tid,
        )
        .await
    }

    async fn put_request(&self, mut request: BucketRequest) -> BucketResult<PutOutcome> {
        let rev = request.required_revision()?;
        let tid = request.parsed_tid()?;
        let parts = request.take_parts()?;
        if request.is_no_store() {
            self.check_parts(&parts)?;
            let tid = tid.unwrap_or_else(|| Tid::issue(self.clock.now()));
            return Ok(PutOutcome::new(rev, tid, false));
        }
        MultiContentBucket::put_revision(self, &request.domain, &request.key, rev, tid, parts).await
    }
}

#[async_trait]
impl Bucket for MultiContentBucket {
    async fn create_bucket(&self) -> BucketResult<SchemaStatus> {
        MultiContentBucket::create_bucket(self).await
    }

    async fn get_revision(&self, request: &BucketRequest) -> BucketResponse {
        get_response(self.get_request(request).await)
    }

    async fn put_revision(&self, request: BucketRequest) -> BucketResponse {
        put_response(self.put_request(request).await)
    }

    async fn list_revisions(&self, request: &BucketRequest) -> BucketResponse {
        MultiContentBucket::list_revisions(
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
