//! Deferred deletion of superseded revisions and renders.
//!
//! A write that supersedes earlier state never deletes anything inline. It
//! appends a timeline entry recording what was superseded and when, and
//! (sampled by [`GcSampler`]) sweeps: the newest timeline entry older than
//! the grace period names the content that may now be purged.
//!
//! Both steps run in a spawned task after the required write has
//! succeeded. Failures there are logged and counted in the
//! [`MaintenanceReport`], never returned to the writer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use revstore_table::{
    AttributeType, Filter, Order, PutRequest, Query, Row, Schema, SchemaVersion, TableError,
    TableResult, TableStore, Value,
};
use revstore_types::{ETag, Revision, SharedClock, Tid};

use crate::config::GcOptions;
use crate::error::{BucketError, BucketResult};
use crate::rows::{key_filter, DOMAIN, KEY, REV, TID};

const TS: &str = "ts";

/// Decides whether a write also runs a sweep.
///
/// Sampling bounds the extra read and delete traffic under heavy write
/// load. The draw is seeded from the write's render id, so the decision for
/// a given write is reproducible.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GcSampler {
    probability: f64,
}

impl GcSampler {
    /// Create a sampler; `probability` is clamped to `[0, 1]`.
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// The effective sweep probability.
    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Returns `true` if the write with render id `tid` should sweep.
    pub fn should_sweep(&self, tid: &Tid) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        if self.probability >= 1.0 {
            return true;
        }
        let bytes = tid.as_uuid().as_bytes();
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&bytes[8..]);
        let seed = tid.ticks() ^ u64::from_be_bytes(tail);
        StdRng::seed_from_u64(seed).gen_bool(self.probability)
    }
}

/// How a write relates to the currently stored `(rev, tid)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteClass {
    /// Nothing stored yet.
    Initial,
    /// `rev > prev_rev`.
    NewRevision { prev_rev: Revision },
    /// Same revision, newer render.
    NewRender { rev: Revision, prev_tid: Tid },
    /// Same revision and render: rewrite in place.
    Rewrite,
    /// Same revision, older render than the stored one.
    LateRender,
}

impl WriteClass {
    /// The timeline entry this write appends, if any.
    pub(crate) fn supersession(&self) -> Option<Supersession> {
        match *self {
            WriteClass::NewRevision { prev_rev } => Some(Supersession::Revision { prev_rev }),
            WriteClass::NewRender { rev, prev_tid } => Some(Supersession::Render { rev, prev_tid }),
            _ => None,
        }
    }
}

/// Compare a write against the stored main row.
pub(crate) fn classify(
    key: &str,
    rev: Revision,
    tid: &Tid,
    prev: Option<(Revision, Tid)>,
) -> BucketResult<WriteClass> {
    let Some((prev_rev, prev_tid)) = prev else {
        return Ok(WriteClass::Initial);
    };
    if rev < prev_rev {
        return Err(BucketError::Conflict {
            key: key.to_string(),
            rev,
            stored_rev: prev_rev,
        });
    }
    if rev > prev_rev {
        return Ok(WriteClass::NewRevision { prev_rev });
    }
    Ok(match tid.cmp(&prev_tid) {
        std::cmp::Ordering::Greater => WriteClass::NewRender { rev, prev_tid },
        std::cmp::Ordering::Equal => WriteClass::Rewrite,
        std::cmp::Ordering::Less => WriteClass::LateRender,
    })
}

/// What a write superseded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Supersession {
    Revision { prev_rev: Revision },
    Render { rev: Revision, prev_tid: Tid },
}

/// Content that a sweep may purge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PurgeScope {
    /// Every row with `rev <= upto`.
    RevisionsUpTo(Revision),
    /// Rows of `rev` with `tid <= upto`.
    RendersUpTo { rev: Revision, upto: Tid },
}

impl PurgeScope {
    /// Content-table filter selecting the doomed rows.
    pub(crate) fn filter(&self, domain: &str, key: &str) -> Filter {
        match *self {
            PurgeScope::RevisionsUpTo(upto) => key_filter(domain, key).le(REV, int(upto)),
            PurgeScope::RendersUpTo { rev, upto } => {
                key_filter(domain, key).eq(REV, int(rev)).le(TID, upto)
            }
        }
    }
}

/// A timeline entry old enough to act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Expired {
    ts: DateTime<Utc>,
    pub(crate) scope: PurgeScope,
}

/// Removes content rows covered by a [`PurgeScope`].
#[async_trait]
pub(crate) trait Purge: Send + Sync {
    async fn purge(
        &self,
        store: &dyn TableStore,
        domain: &str,
        key: &str,
        scope: PurgeScope,
    ) -> TableResult<usize>;
}

fn int(value: Revision) -> Value {
    Value::Int(i64::try_from(value).unwrap_or(i64::MAX))
}

fn earlier(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn first_row(store: &dyn TableStore, table: &str, query: &Query) -> TableResult<Option<Row>> {
    match store.get(table, query).await {
        Ok(result) => Ok(result.items.into_iter().next()),
        Err(TableError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn malformed(table: &str, reason: &str) -> TableError {
    TableError::SchemaViolation {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}

/// The revision and render timeline tables of one bucket.
#[derive(Clone, Debug)]
pub(crate) struct Timelines {
    revision_table: String,
    render_table: String,
    gc: GcOptions,
    version: SchemaVersion,
}

impl Timelines {
    pub(crate) fn new(prefix: &str, gc: GcOptions, version: SchemaVersion) -> Self {
        Self {
            revision_table: format!("{prefix}.revision-timeline"),
            render_table: format!("{prefix}.render-timeline"),
            gc,
            version,
        }
    }

    pub(crate) fn gc(&self) -> &GcOptions {
        &self.gc
    }

    pub(crate) fn revision_table(&self) -> &str {
        &self.revision_table
    }

    pub(crate) fn render_table(&self) -> &str {
        &self.render_table
    }

    pub(crate) fn schemas(&self) -> [Schema; 2] {
        let revisions = Schema::new(&self.revision_table, self.version)
            .attribute(DOMAIN, AttributeType::Text)
            .attribute(KEY, AttributeType::Text)
            .attribute(TS, AttributeType::Timestamp)
            .attribute(REV, AttributeType::Int)
            .hash(DOMAIN)
            .hash(KEY)
            .range(TS, Order::Desc)
            .range(REV, Order::Desc)
            .default_ttl(self.gc.timeline_ttl());
        let renders = Schema::new(&self.render_table, self.version)
            .attribute(DOMAIN, AttributeType::Text)
            .attribute(KEY, AttributeType::Text)
            .attribute(REV, AttributeType::Int)
            .attribute(TS, AttributeType::Timestamp)
            .attribute(TID, AttributeType::Tid)
            .hash(DOMAIN)
            .hash(KEY)
            .range(REV, Order::Desc)
            .range(TS, Order::Desc)
            .range(TID, Order::Desc)
            .default_ttl(self.gc.timeline_ttl());
        [revisions, renders]
    }

    /// Append the entry for `what`, stamped `now`.
    pub(crate) async fn record(
        &self,
        store: &dyn TableStore,
        domain: &str,
        key: &str,
        what: Supersession,
        now: DateTime<Utc>,
    ) -> TableResult<()> {
        let mut row = crate::rows::base_row(domain, key);
        row.insert(TS.into(), Value::Timestamp(now));
        let table = match what {
            Supersession::Revision { prev_rev } => {
                row.insert(REV.into(), int(prev_rev));
                &self.revision_table
            }
            Supersession::Render { rev, prev_tid } => {
                row.insert(REV.into(), int(rev));
                row.insert(TID.into(), Value::Tid(prev_tid));
                &self.render_table
            }
        };
        store.put(table, PutRequest::new(row)).await?;
        Ok(())
    }

    /// The newest entry of the matching timeline that is older than the
    /// grace period.
    pub(crate) async fn expired(
        &self,
        store: &dyn TableStore,
        domain: &str,
        key: &str,
        what: Supersession,
        now: DateTime<Utc>,
    ) -> TableResult<Option<Expired>> {
        let cutoff = earlier(now, self.gc.grace);
        match what {
            Supersession::Revision { .. } => {
                let query = Query::new(key_filter(domain, key).le(TS, cutoff)).limit(1);
                let Some(row) = first_row(store, &self.revision_table, &query).await? else {
                    return Ok(None);
                };
                let ts = row.get(TS).and_then(Value::as_timestamp);
                let rev = row.get(REV).and_then(Value::as_int).and_then(|r| u64::try_from(r).ok());
                match (ts, rev) {
                    (Some(ts), Some(rev)) => Ok(Some(Expired {
                        ts,
                        scope: PurgeScope::RevisionsUpTo(rev),
                    })),
                    _ => Err(malformed(&self.revision_table, "malformed timeline entry")),
                }
            }
            Supersession::Render { rev, .. } => {
                let filter = key_filter(domain, key).eq(REV, int(rev)).le(TS, cutoff);
                let query = Query::new(filter).limit(1);
                let Some(row) = first_row(store, &self.render_table, &query).await? else {
                    return Ok(None);
                };
                let ts = row.get(TS).and_then(Value::as_timestamp);
                let tid = row.get(TID).and_then(Value::as_tid).copied();
                match (ts, tid) {
                    (Some(ts), Some(upto)) => Ok(Some(Expired {
                        ts,
                        scope: PurgeScope::RendersUpTo { rev, upto },
                    })),
                    _ => Err(malformed(&self.render_table, "malformed timeline entry")),
                }
            }
        }
    }

    /// Delete the entries a sweep has consumed.
    pub(crate) async fn forget(
        &self,
        store: &dyn TableStore,
        domain: &str,
        key: &str,
        expired: &Expired,
    ) -> TableResult<usize> {
        match expired.scope {
            PurgeScope::RevisionsUpTo(_) => {
                let filter = key_filter(domain, key).le(TS, expired.ts);
                store.delete(&self.revision_table, &filter).await
            }
            PurgeScope::RendersUpTo { rev, .. } => {
                let filter = key_filter(domain, key).eq(REV, int(rev)).le(TS, expired.ts);
                store.delete(&self.render_table, &filter).await
            }
        }
    }

    /// The newest revision superseded at least half a grace period ago.
    ///
    /// Content at or below it is due to be purged soon.
    pub(crate) async fn superseded_since_half_grace(
        &self,
        store: &dyn TableStore,
        domain: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> TableResult<Option<Revision>> {
        let cutoff = earlier(now, self.gc.grace / 2);
        let query = Query::new(key_filter(domain, key).le(TS, cutoff))
            .limit(1)
            .project([REV]);
        Ok(first_row(store, &self.revision_table, &query)
            .await?
            .and_then(|row| row.get(REV).and_then(Value::as_int))
            .and_then(|rev| u64::try_from(rev).ok()))
    }
}

/// What a maintenance task did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// A timeline entry was appended.
    pub timeline_recorded: bool,
    /// A sweep ran.
    pub swept: bool,
    /// Content rows deleted by the sweep.
    pub purged: usize,
    /// Failed steps (logged, not surfaced).
    pub errors: usize,
}

/// Handle to the background maintenance of one write.
///
/// Dropping the handle detaches the task; it still runs to completion and
/// logs its own failures.
#[derive(Debug)]
pub struct MaintenanceHandle(JoinHandle<MaintenanceReport>);

impl MaintenanceHandle {
    pub(crate) fn spawn<F>(work: F, span: tracing::Span) -> Self
    where
        F: std::future::Future<Output = MaintenanceReport> + Send + 'static,
    {
        Self(tokio::spawn(work.instrument(span)))
    }

    /// Wait for the task and return its report.
    pub async fn join(self) -> MaintenanceReport {
        match self.0.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "maintenance task did not complete");
                MaintenanceReport {
                    errors: 1,
                    ..MaintenanceReport::default()
                }
            }
        }
    }
}

/// Timeline bookkeeping and sweep for one superseding write.
pub(crate) struct Maintenance {
    pub(crate) store: Arc<dyn TableStore>,
    pub(crate) timelines: Arc<Timelines>,
    pub(crate) purge: Arc<dyn Purge>,
    pub(crate) clock: SharedClock,
    pub(crate) domain: String,
    pub(crate) key: String,
    pub(crate) what: Supersession,
    pub(crate) sweep: bool,
}

impl Maintenance {
    pub(crate) fn spawn(self, rev: Revision, tid: Tid) -> MaintenanceHandle {
        let span = tracing::debug_span!(
            "maintenance",
            key = %self.key,
            rev,
            tid = %tid.short_id(),
        );
        MaintenanceHandle::spawn(self.run(), span)
    }

    async fn run(self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let store = self.store.as_ref();
        let now = self.clock.now();

        match self
            .timelines
            .record(store, &self.domain, &self.key, self.what, now)
            .await
        {
            Ok(()) => report.timeline_recorded = true,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, what = ?self.what, "timeline append failed");
            }
        }

        if !self.sweep {
            return report;
        }
        report.swept = true;
        let expired = match self
            .timelines
            .expired(store, &self.domain, &self.key, self.what, now)
            .await
        {
            Ok(Some(expired)) => expired,
            Ok(None) => return report,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "timeline scan failed");
                return report;
            }
        };
        match self
            .purge
            .purge(store, &self.domain, &self.key, expired.scope)
            .await
        {
            Ok(purged) => {
                report.purged = purged;
                debug!(scope = ?expired.scope, purged, "superseded content purged");
            }
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, scope = ?expired.scope, "purge failed");
                return report;
            }
        }
        if let Err(e) = self
            .timelines
            .forget(store, &self.domain, &self.key, &expired)
            .await
        {
            report.errors += 1;
            warn!(error = %e, "timeline cleanup failed");
        }
        report
    }
}

/// Result of a successful `put_revision`.
#[derive(Debug)]
pub struct PutOutcome {
    /// Quoted ETag of the stored (or would-be stored) render.
    pub etag: String,
    pub rev: Revision,
    pub tid: Tid,
    /// `false` when nothing was written (no-store, unchanged content).
    pub written: bool,
    /// Background timeline and sweep work, when the write superseded
    /// earlier content.
    pub maintenance: Option<MaintenanceHandle>,
}

impl PutOutcome {
    pub(crate) fn new(rev: Revision, tid: Tid, written: bool) -> Self {
        Self {
            etag: ETag::encode(rev, &tid, None),
            rev,
            tid,
            written,
            maintenance: None,
        }
    }

    /// Wait for maintenance, if any.
    pub async fn settle(self) -> Option<MaintenanceReport> {
        match self.maintenance {
            Some(handle) => Some(handle.join().await),
            None => None,
        }
    }
}
