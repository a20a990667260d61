use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use revstore_table::{SchemaStatus, TableStore};
use revstore_types::SharedClock;

use crate::chunked::ChunkedBucket;
use crate::config::{BucketConfig, BucketOptions};
use crate::error::BucketResult;
use crate::key_rev_value::KeyRevValueBucket;
use crate::multi_content::MultiContentBucket;
use crate::request::{BucketRequest, BucketResponse, ContentPart};
use crate::retention::PutOutcome;
use crate::rows::{created_response, StoredContent};

/// The operation set every bucket type exposes to the routing layer.
///
/// Request-level methods never fail: errors are rendered as problem
/// responses with the status of the error kind.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Create the bucket's tables. Idempotent.
    async fn create_bucket(&self) -> BucketResult<SchemaStatus>;

    /// Read the newest stored value matching the request's key, revision
    /// and render id.
    async fn get_revision(&self, request: &BucketRequest) -> BucketResponse;

    /// Store the request body as a new revision or render.
    ///
    /// Background maintenance triggered by the write is detached.
    async fn put_revision(&self, request: BucketRequest) -> BucketResponse;

    /// List stored revisions, newest first.
    async fn list_revisions(&self, request: &BucketRequest) -> BucketResponse;
}

/// Take a single-value body, carrying over the request's content type.
pub(crate) fn single_part(request: &mut BucketRequest) -> BucketResult<ContentPart> {
    let mut part = ContentPart::new(request.take_single()?);
    if let Some(content_type) = request.headers.get("content-type") {
        part.headers
            .insert("content-type".into(), content_type.clone());
    }
    Ok(part)
}

pub(crate) fn get_response(result: BucketResult<StoredContent>) -> BucketResponse {
    match result {
        Ok(stored) => stored.into_response(),
        Err(e) => e.to_response(),
    }
}

pub(crate) fn put_response(result: BucketResult<PutOutcome>) -> BucketResponse {
    match result {
        Ok(outcome) if outcome.written => created_response(outcome.rev, &outcome.tid),
        Ok(outcome) => BucketResponse::new(200)
            .header("etag", outcome.etag)
            .json(json!({ "message": "Not stored.", "tid": outcome.tid.to_string() })),
        Err(e) => e.to_response(),
    }
}

/// Build the bucket described by `options`.
pub fn build_bucket(
    store: Arc<dyn TableStore>,
    options: BucketOptions,
    clock: SharedClock,
) -> BucketResult<Arc<dyn Bucket>> {
    let bucket: Arc<dyn Bucket> = match options {
        BucketOptions::KeyRevValue(o) => {
            Arc::new(KeyRevValueBucket::new(store, o)?.with_clock(clock))
        }
        BucketOptions::MultiContent(o) => {
            Arc::new(MultiContentBucket::new(store, o)?.with_clock(clock))
        }
        BucketOptions::Chunked(o) => Arc::new(ChunkedBucket::new(store, o)?.with_clock(clock)),
    };
    Ok(bucket)
}

/// Build and create every bucket in `config`, keyed by bucket name.
pub async fn open_buckets(
    store: Arc<dyn TableStore>,
    config: &BucketConfig,
    clock: SharedClock,
) -> BucketResult<BTreeMap<String, Arc<dyn Bucket>>> {
    config.validate()?;
    let mut buckets = BTreeMap::new();
    for (name, options) in &config.buckets {
        let bucket = build_bucket(store.clone(), options.clone(), clock.clone())?;
        let status = bucket.create_bucket().await?;
        info!(bucket = %name, ?status, "bucket ready");
        buckets.insert(name.clone(), bucket);
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ListForm, ResponseBody};
    use crate::testing::Fixture;
    use revstore_types::{Content, ETag, Tid};

    const CONFIG: &str = r#"
        [buckets.meta]
        type = "key_rev_value"
        table = "page-meta"
        value_kind = "json"

        [buckets.parsoid]
        type = "multi_content"
        table_prefix = "parsoid"
        main_content_type = { name = "html", value_kind = "string" }
        dependent_content_types = [{ name = "data-parsoid", value_kind = "json" }]

        [buckets.media]
        type = "chunked"
        table_prefix = "media"
        chunk_size = 8
    "#;

    async fn open(fx: &Fixture) -> BTreeMap<String, Arc<dyn Bucket>> {
        let config = BucketConfig::from_toml_str(CONFIG).unwrap();
        open_buckets(fx.store(), &config, fx.clock()).await.unwrap()
    }

    #[tokio::test]
    async fn opens_every_configured_bucket() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        assert_eq!(buckets.len(), 3);
        assert_eq!(fx.live_rows("page-meta"), 0);
        // Creating again is a no-op.
        for bucket in buckets.values() {
            assert_eq!(bucket.create_bucket().await.unwrap(), SchemaStatus::Unchanged);
        }
    }

    #[tokio::test]
    async fn put_and_get_through_requests() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        let media = &buckets["media"];

        let put = media
            .put_revision(
                BucketRequest::new("d", "logo")
                    .revision(3)
                    .header("Content-Type", "image/svg+xml")
                    .body(vec![7u8; 20]),
            )
            .await;
        assert_eq!(put.status, 201);
        let etag = ETag::parse(put.etag().unwrap()).unwrap();
        assert_eq!(etag.rev, 3);

        let got = media.get_revision(&BucketRequest::new("d", "logo")).await;
        assert_eq!(got.status, 200);
        assert_eq!(got.etag(), put.etag());
        assert_eq!(got.headers["content-type"], "image/svg+xml");
        assert!(got.headers.contains_key("last-modified"));
        assert_eq!(got.body, ResponseBody::Content(Content::from(vec![7u8; 20])));
    }

    #[tokio::test]
    async fn multi_content_requests_select_content_type() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        let parsoid = &buckets["parsoid"];
        let put = parsoid
            .put_revision(
                BucketRequest::new("d", "Page_X")
                    .revision(1)
                    .part("html", ContentPart::new("<p>A</p>"))
                    .part("data-parsoid", ContentPart::new(json!({"ids": {}}))),
            )
            .await;
        assert_eq!(put.status, 201);

        let html = parsoid.get_revision(&BucketRequest::new("d", "Page_X")).await;
        assert_eq!(html.headers["content-type"], "text/plain; charset=utf-8");
        let data = parsoid
            .get_revision(&BucketRequest::new("d", "Page_X").content_type("data-parsoid"))
            .await;
        assert_eq!(data.status, 200);
        assert_eq!(data.etag(), put.etag());
    }

    #[tokio::test]
    async fn invalid_identifiers_fail_before_io() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        let meta = &buckets["meta"];

        let bad_rev = meta
            .get_revision(&BucketRequest::new("d", "k").revision("abc"))
            .await;
        assert_eq!(bad_rev.status, 400);

        let bad_tid = meta
            .get_revision(&BucketRequest::new("d", "k").revision(1).tid("not-a-tid"))
            .await;
        assert_eq!(bad_tid.status, 400);

        let missing = meta.get_revision(&BucketRequest::new("d", "k")).await;
        assert_eq!(missing.status, 404);
        assert_eq!(
            missing.headers["content-type"],
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn no_store_returns_etag_without_writing() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        let tid = Tid::now();
        let response = buckets["meta"]
            .put_revision(
                BucketRequest::new("d", "k")
                    .revision(9)
                    .tid(tid)
                    .header("cache-control", "no-store")
                    .body(json!({"a": 1})),
            )
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.etag(), Some(ETag::encode(9, &tid, None).as_str()));
        assert_eq!(fx.live_rows("page-meta"), 0);
    }

    #[tokio::test]
    async fn stale_write_conflicts_through_requests() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        let media = &buckets["media"];
        let first = media
            .put_revision(BucketRequest::new("d", "k").revision(6).body(vec![1u8]))
            .await;
        assert_eq!(first.status, 201);
        let stale = media
            .put_revision(BucketRequest::new("d", "k").revision(4).body(vec![2u8]))
            .await;
        assert_eq!(stale.status, 409);
    }

    #[tokio::test]
    async fn listing_through_requests() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        let meta = &buckets["meta"];
        for rev in 1..=3 {
            let response = meta
                .put_revision(BucketRequest::new("d", "k").revision(rev).body(json!(rev)))
                .await;
            assert_eq!(response.status, 201);
        }
        let listing = meta
            .list_revisions(
                &BucketRequest::new("d", "k")
                    .limit(2)
                    .list_form(ListForm::Revisions),
            )
            .await;
        assert_eq!(fx.items(&listing).len(), 2);
        assert!(fx.next_page(&listing).is_some());
    }

    #[tokio::test]
    async fn malformed_page_token_is_a_client_error() {
        let fx = Fixture::new();
        let buckets = open(&fx).await;
        let meta = &buckets["meta"];
        let response = meta
            .put_revision(BucketRequest::new("d", "k").revision(1).body(json!(1)))
            .await;
        assert_eq!(response.status, 201);

        let listing = meta
            .list_revisions(&BucketRequest::new("d", "k").page("not-a-token"))
            .await;
        assert_eq!(listing.status, 400);
        match &listing.body {
            ResponseBody::Json(body) => assert_eq!(body["type"], "invalid_request"),
            other => panic!("unexpected body {other:?}"),
        }
    }
}
