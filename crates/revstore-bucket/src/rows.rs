//! Row encoding and table-store call wrappers shared by the bucket types.

use serde_json::json;
use tracing::error;

use revstore_table::{Filter, PutRequest, Query, Row, TableError, TableStore, Value};
use revstore_types::{Content, ETag, Revision, Tid, ValueKind};

use crate::error::{BucketError, BucketResult};
use crate::request::{http_date, BucketResponse, Headers, ListForm};

pub(crate) const DOMAIN: &str = "domain";
pub(crate) const KEY: &str = "key";
pub(crate) const REV: &str = "rev";
pub(crate) const TID: &str = "tid";
pub(crate) const VALUE: &str = "value";
pub(crate) const HEADERS: &str = "headers";

/// Filter pinning the partition of one logical key.
pub(crate) fn key_filter(domain: &str, key: &str) -> Filter {
    Filter::new().eq(DOMAIN, domain).eq(KEY, key)
}

/// Filter for `(key[, rev[, tid]])`.
pub(crate) fn revision_filter(
    domain: &str,
    key: &str,
    rev: Option<Revision>,
    tid: Option<&Tid>,
) -> BucketResult<Filter> {
    let mut filter = key_filter(domain, key);
    if let Some(rev) = rev {
        filter = filter.eq(REV, rev_value(rev)?);
        if let Some(tid) = tid {
            filter = filter.eq(TID, *tid);
        }
    }
    Ok(filter)
}

pub(crate) fn rev_value(rev: Revision) -> BucketResult<Value> {
    i64::try_from(rev)
        .map(Value::Int)
        .map_err(|_| BucketError::InvalidRevision(rev.to_string()))
}

/// Start a row with the partition attributes set.
pub(crate) fn base_row(domain: &str, key: &str) -> Row {
    let mut row = Row::new();
    row.insert(DOMAIN.into(), Value::from(domain));
    row.insert(KEY.into(), Value::from(key));
    row
}

pub(crate) fn content_value(content: &Content) -> Value {
    match content {
        Content::Blob(b) => Value::Blob(b.clone()),
        Content::Text(s) => Value::Text(s.clone()),
        Content::Json(v) => Value::Json(v.clone()),
    }
}

pub(crate) fn attribute_type(kind: ValueKind) -> revstore_table::AttributeType {
    match kind {
        ValueKind::Blob => revstore_table::AttributeType::Blob,
        ValueKind::String => revstore_table::AttributeType::Text,
        ValueKind::Json => revstore_table::AttributeType::Json,
    }
}

pub(crate) fn headers_value(headers: &Headers) -> Value {
    Value::Json(json!(headers))
}

/// Reject payloads whose kind differs from the configured one.
pub(crate) fn check_kind(expected: ValueKind, content: &Content, what: &str) -> BucketResult<()> {
    if content.kind() != expected {
        return Err(BucketError::InvalidRequest(format!(
            "{what} expects a {expected} value, got {}",
            content.kind()
        )));
    }
    Ok(())
}

fn malformed(table: &str, key: &str, reason: impl Into<String>) -> BucketError {
    BucketError::StorageReadFailed {
        table: table.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn row_rev(row: &Row, table: &str, key: &str) -> BucketResult<Revision> {
    row.get(REV)
        .and_then(Value::as_int)
        .and_then(|r| u64::try_from(r).ok())
        .ok_or_else(|| malformed(table, key, "row has no valid rev"))
}

pub(crate) fn row_tid(row: &Row, table: &str, key: &str) -> BucketResult<Tid> {
    row.get(TID)
        .and_then(Value::as_tid)
        .copied()
        .ok_or_else(|| malformed(table, key, "row has no valid tid"))
}

pub(crate) fn row_int(row: &Row, attribute: &str, table: &str, key: &str) -> BucketResult<u64> {
    row.get(attribute)
        .and_then(Value::as_int)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| malformed(table, key, format!("row has no valid {attribute}")))
}

pub(crate) fn row_content(
    row: &Row,
    kind: ValueKind,
    table: &str,
    key: &str,
) -> BucketResult<Content> {
    match (kind, row.get(VALUE)) {
        (ValueKind::Blob, Some(Value::Blob(b))) => Ok(Content::Blob(b.clone())),
        (ValueKind::String, Some(Value::Text(s))) => Ok(Content::Text(s.clone())),
        (ValueKind::Json, Some(Value::Json(v))) => Ok(Content::Json(v.clone())),
        (_, None | Some(Value::Null)) => Err(malformed(table, key, "row has no value")),
        (_, Some(other)) => Err(malformed(
            table,
            key,
            format!("value has type {:?}, expected {kind}", other.attribute_type()),
        )),
    }
}

pub(crate) fn row_headers(row: &Row) -> Headers {
    row.get(HEADERS)
        .and_then(Value::as_json)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Read one page; a miss is `Ok(None)`, any other failure is a read error.
pub(crate) async fn read_page(
    store: &dyn TableStore,
    table: &str,
    key: &str,
    query: &Query,
) -> BucketResult<Option<revstore_table::QueryResult>> {
    match store.get(table, query).await {
        Ok(result) => Ok(Some(result)),
        Err(TableError::NotFound { .. }) => Ok(None),
        Err(e) => {
            error!(table, key, error = %e, "table read failed");
            Err(malformed(table, key, e.to_string()))
        }
    }
}

/// Read the first row matching `filter`.
pub(crate) async fn read_first(
    store: &dyn TableStore,
    table: &str,
    key: &str,
    filter: Filter,
    proj: Option<&[&str]>,
) -> BucketResult<Option<Row>> {
    let mut query = Query::new(filter).limit(1);
    if let Some(proj) = proj {
        query = query.project(proj.iter().copied());
    }
    Ok(read_page(store, table, key, &query)
        .await?
        .and_then(|r| r.items.into_iter().next()))
}

/// Write one row of a required write path.
pub(crate) async fn write_row(
    store: &dyn TableStore,
    table: &str,
    key: &str,
    request: PutRequest,
    client_facing: bool,
) -> BucketResult<()> {
    let rev = request.attributes.get(REV).and_then(Value::as_int);
    let tid = request.attributes.get(TID).and_then(Value::as_tid).copied();
    store.put(table, request).await.map(|_| ()).map_err(|e| {
        error!(table, key, ?rev, tid = ?tid, error = %e, "required write failed");
        BucketError::StorageWriteFailed {
            table: table.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
            client_facing,
        }
    })
}

/// A value read back from a bucket, with its identity.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredContent {
    pub rev: Revision,
    pub tid: Tid,
    pub headers: Headers,
    pub body: Content,
}

impl StoredContent {
    /// Quoted ETag of this render.
    pub fn etag(&self) -> String {
        ETag::encode(self.rev, &self.tid, None)
    }

    /// A 200 response carrying the value, its ETag and `last-modified`.
    pub fn into_response(self) -> BucketResponse {
        let etag = self.etag();
        let mut response = BucketResponse::new(200);
        response.headers = self.headers;
        response
            .headers
            .entry("content-type".into())
            .or_insert_with(|| self.body.default_media_type().into());
        response
            .header("etag", etag)
            .header("last-modified", http_date(self.tid.date()))
            .content(self.body)
    }
}

/// Build the success response for a write.
pub(crate) fn created_response(rev: Revision, tid: &Tid) -> BucketResponse {
    BucketResponse::new(201)
        .header("etag", ETag::encode(rev, tid, None))
        .json(json!({ "message": "Created.", "tid": tid.to_string() }))
}

/// List `(rev, tid)` pairs from `table`, newest first.
pub(crate) async fn list_revisions(
    store: &dyn TableStore,
    table: &str,
    domain: &str,
    key: &str,
    form: ListForm,
    limit: usize,
    page: Option<String>,
) -> BucketResponse {
    let query = Query::new(key_filter(domain, key))
        .limit(limit)
        .project([REV, TID])
        .page(page);
    match store.get(table, &query).await {
        Ok(result) => listing_response(result, form, table, key),
        Err(TableError::NotFound { .. }) => BucketResponse::new(200).json(json!({ "items": [] })),
        // The token came from the caller.
        Err(TableError::InvalidQuery { reason, .. }) if query.page.is_some() => {
            BucketError::InvalidRequest(format!("invalid page token: {reason}")).to_response()
        }
        Err(e) => {
            error!(table, key, error = %e, "table read failed");
            malformed(table, key, e.to_string()).to_response()
        }
    }
}

fn listing_response(
    result: revstore_table::QueryResult,
    form: ListForm,
    table: &str,
    key: &str,
) -> BucketResponse {
    let mut items = Vec::with_capacity(result.items.len());
    let mut last_rev = None;
    for row in &result.items {
        let (rev, tid) = match (row_rev(row, table, key), row_tid(row, table, key)) {
            (Ok(rev), Ok(tid)) => (rev, tid),
            (Err(e), _) | (_, Err(e)) => return e.to_response(),
        };
        match form {
            ListForm::Renders => items.push(json!({ "revision": rev, "tid": tid.to_string() })),
            ListForm::Revisions => {
                if last_rev != Some(rev) {
                    items.push(json!({ "revision": rev }));
                }
            }
        }
        last_rev = Some(rev);
    }
    let mut body = json!({ "items": items });
    if let Some(next) = result.next {
        body["_links"] = json!({ "next": { "href": format!("?page={next}") } });
    }
    BucketResponse::new(200).json(body)
}
