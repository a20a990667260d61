//! Structured requests and responses exchanged with the routing layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use revstore_types::{validate_render_id, validate_revision, Content, Revision, Tid};

use crate::error::{BucketError, BucketResult};

/// Header map with lower-case names.
pub type Headers = BTreeMap<String, String>;

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// Upper bound on a caller-requested page size.
pub const MAX_LIST_LIMIT: usize = 10_000;

/// One content type's payload in a multi-content write.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentPart {
    pub headers: Headers,
    pub body: Content,
}

impl ContentPart {
    /// Create a part with no headers.
    pub fn new(body: impl Into<Content>) -> Self {
        Self {
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Set a header; the name is lower-cased.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// Request payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    /// A single value (key-revision-value and chunked buckets).
    Single(Content),
    /// One part per content type (multi-content buckets).
    Multi(BTreeMap<String, ContentPart>),
}

/// Shape of listing items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListForm {
    /// Every stored `(rev, tid)` pair.
    #[default]
    Renders,
    /// Revisions only, consecutive duplicates collapsed.
    Revisions,
}

/// A bucket operation as received from the routing layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BucketRequest {
    pub domain: String,
    pub key: String,
    /// Raw revision path parameter.
    pub revision: Option<String>,
    /// Raw render id path parameter.
    pub tid: Option<String>,
    /// Content type to read from a multi-content bucket; the main type when
    /// absent.
    pub content_type: Option<String>,
    pub headers: Headers,
    pub body: RequestBody,
    pub limit: Option<usize>,
    pub page: Option<String>,
    pub list_form: ListForm,
}

impl BucketRequest {
    /// Create a request for `key` in `domain` with no body.
    pub fn new(domain: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            key: key.into(),
            ..Self::default()
        }
    }

    /// Set the raw revision parameter. Validated when the request is served.
    pub fn revision(mut self, revision: impl ToString) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    /// Set the raw render id parameter.
    pub fn tid(mut self, tid: impl ToString) -> Self {
        self.tid = Some(tid.to_string());
        self
    }

    /// Select the content type to read.
    pub fn content_type(mut self, name: impl Into<String>) -> Self {
        self.content_type = Some(name.into());
        self
    }

    /// Set a request header; the name is lower-cased.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set a single-value body.
    pub fn body(mut self, body: impl Into<Content>) -> Self {
        self.body = RequestBody::Single(body.into());
        self
    }

    /// Add one content part, turning the body into a multi-part body.
    pub fn part(mut self, content_type: impl Into<String>, part: ContentPart) -> Self {
        let mut parts = match std::mem::take(&mut self.body) {
            RequestBody::Multi(parts) => parts,
            _ => BTreeMap::new(),
        };
        parts.insert(content_type.into(), part);
        self.body = RequestBody::Multi(parts);
        self
    }

    /// Requested listing page size.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continue a listing from a previous response's page token.
    pub fn page(mut self, token: impl Into<String>) -> Self {
        self.page = Some(token.into());
        self
    }

    /// Choose the listing item shape.
    pub fn list_form(mut self, form: ListForm) -> Self {
        self.list_form = form;
        self
    }

    /// The validated revision, if one was given.
    pub fn parsed_revision(&self) -> BucketResult<Option<Revision>> {
        self.revision
            .as_deref()
            .map(validate_revision)
            .transpose()
            .map_err(Into::into)
    }

    /// The revision, which must be present.
    pub fn required_revision(&self) -> BucketResult<Revision> {
        self.parsed_revision()?
            .ok_or_else(|| BucketError::InvalidRevision("missing revision".into()))
    }

    /// The validated render id, if one was given.
    ///
    /// A render id without a revision is rejected: renders are only
    /// addressable within a revision.
    pub fn parsed_tid(&self) -> BucketResult<Option<Tid>> {
        let tid = self
            .tid
            .as_deref()
            .map(validate_render_id)
            .transpose()?;
        if tid.is_some() && self.revision.is_none() {
            return Err(BucketError::InvalidRequest(
                "a render id requires a revision".into(),
            ));
        }
        Ok(tid)
    }

    /// Page size, clamped to [`MAX_LIST_LIMIT`].
    pub fn list_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    /// Returns `true` if the caller asked not to persist the write.
    pub fn is_no_store(&self) -> bool {
        self.headers
            .get("cache-control")
            .is_some_and(|v| v.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-store")))
    }

    /// Take the single-value body.
    pub fn take_single(&mut self) -> BucketResult<Content> {
        match std::mem::take(&mut self.body) {
            RequestBody::Single(content) => Ok(content),
            RequestBody::Empty => Err(BucketError::InvalidRequest("missing body".into())),
            RequestBody::Multi(_) => Err(BucketError::InvalidRequest(
                "expected a single value, got content parts".into(),
            )),
        }
    }

    /// Take the multi-part body.
    pub fn take_parts(&mut self) -> BucketResult<BTreeMap<String, ContentPart>> {
        match std::mem::take(&mut self.body) {
            RequestBody::Multi(parts) => Ok(parts),
            RequestBody::Empty => Err(BucketError::InvalidRequest("missing body".into())),
            RequestBody::Single(_) => Err(BucketError::InvalidRequest(
                "expected content parts, got a single value".into(),
            )),
        }
    }
}

/// Response payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Empty,
    Content(Content),
    Json(serde_json::Value),
}

/// A bucket operation's result in routing-layer terms.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseBody,
}

impl BucketResponse {
    /// An empty response with `status`.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: ResponseBody::Empty,
        }
    }

    /// Set a response header; the name is lower-cased.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set a JSON body, defaulting the content type to `application/json`.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.headers
            .entry("content-type".into())
            .or_insert_with(|| "application/json".into());
        self.body = ResponseBody::Json(body);
        self
    }

    /// Set a stored-content body.
    pub fn content(mut self, body: Content) -> Self {
        self.body = ResponseBody::Content(body);
        self
    }

    /// The `etag` header, if set.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag").map(String::as_str)
    }
}

/// Format an instant as an HTTP date.
pub fn http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn revision_parsing() {
        assert_eq!(BucketRequest::new("d", "k").parsed_revision().unwrap(), None);
        assert_eq!(
            BucketRequest::new("d", "k").revision(5).parsed_revision().unwrap(),
            Some(5)
        );
        assert!(matches!(
            BucketRequest::new("d", "k").revision("-5").parsed_revision(),
            Err(BucketError::InvalidRevision(_))
        ));
        assert!(matches!(
            BucketRequest::new("d", "k").required_revision(),
            Err(BucketError::InvalidRevision(_))
        ));
    }

    #[test]
    fn tid_requires_revision() {
        let tid = Tid::now();
        assert!(matches!(
            BucketRequest::new("d", "k").tid(tid).parsed_tid(),
            Err(BucketError::InvalidRequest(_))
        ));
        assert_eq!(
            BucketRequest::new("d", "k").revision(1).tid(tid).parsed_tid().unwrap(),
            Some(tid)
        );
        assert!(matches!(
            BucketRequest::new("d", "k").revision(1).tid("nope").parsed_tid(),
            Err(BucketError::InvalidRenderId(_))
        ));
    }

    #[test]
    fn no_store_detection() {
        let req = BucketRequest::new("d", "k").header("Cache-Control", "max-age=0, no-store");
        assert!(req.is_no_store());
        assert!(!BucketRequest::new("d", "k").is_no_store());
    }

    #[test]
    fn parts_accumulate() {
        let mut req = BucketRequest::new("d", "k")
            .part("html", ContentPart::new("<p>"))
            .part("meta", ContentPart::new(serde_json::json!({})));
        assert_eq!(req.take_parts().unwrap().len(), 2);
        assert!(req.take_parts().is_err());
    }

    #[test]
    fn list_limit_is_clamped() {
        assert_eq!(BucketRequest::new("d", "k").list_limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(BucketRequest::new("d", "k").limit(0).list_limit(), 1);
        assert_eq!(
            BucketRequest::new("d", "k").limit(usize::MAX).list_limit(),
            MAX_LIST_LIMIT
        );
    }

    #[test]
    fn http_date_format() {
        let instant = Utc.with_ymd_and_hms(2015, 6, 25, 19, 37, 27).unwrap();
        assert_eq!(http_date(instant), "Thu, 25 Jun 2015 19:37:27 GMT");
    }
}
