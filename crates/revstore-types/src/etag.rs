use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::revision::Revision;
use crate::tid::{has_uuid_shape, validate_render_id, Tid, TID_LEN};

/// The externally visible version token: `"<rev>/<tid>[/<suffix>]"`.
///
/// `tid` is kept as the raw string found in the header because parsing is
/// deliberately lenient (see [`ETag::parse`]); use [`ETag::render_id`] to
/// obtain a validated [`Tid`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ETag {
    /// The content-source revision.
    pub rev: Revision,
    /// The render id, without any trailing tid suffix.
    pub tid: String,
    /// Optional third path segment. Never part of content identity.
    pub suffix: Option<String>,
    /// Characters that followed the canonical 36-character tid.
    pub tid_suffix: Option<String>,
}

impl ETag {
    /// Build the ETag for a stored `(rev, tid)` pair.
    pub fn new(rev: Revision, tid: &Tid) -> Self {
        Self {
            rev,
            tid: tid.to_string(),
            suffix: None,
            tid_suffix: None,
        }
    }

    /// Attach a suffix segment.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Encode `(rev, tid[, suffix])` as a quoted header value.
    pub fn encode(rev: Revision, tid: &Tid, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("\"{rev}/{tid}/{suffix}\""),
            None => format!("\"{rev}/{tid}\""),
        }
    }

    /// Parse a header value produced by [`ETag::encode`].
    ///
    /// Accepts an optional `W/` weak prefix and optional surrounding quotes.
    /// Returns `None` unless the value has two or three `/`-separated
    /// segments with a decimal revision first.
    ///
    /// A tid segment longer than 36 characters whose first 36 characters
    /// form a UUID is split into `tid` and `tid_suffix`. Any other tid
    /// segment is passed through unmodified, even when it is not a valid
    /// render id; callers that need one go through [`ETag::render_id`].
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.strip_prefix("W/").unwrap_or(value);
        let value = value.strip_prefix('"').unwrap_or(value);
        let value = value.strip_suffix('"').unwrap_or(value);
        if value.contains('"') {
            return None;
        }

        let mut segments = value.splitn(3, '/');
        let rev = segments.next().filter(|s| !s.is_empty())?;
        let tid = segments.next().filter(|s| !s.is_empty())?;
        let suffix = match segments.next() {
            Some("") => return None,
            Some(s) => Some(s.to_string()),
            None => None,
        };

        if !rev.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let rev = rev.parse().ok()?;

        let (tid, tid_suffix) = if tid.len() > TID_LEN
            && tid.is_char_boundary(TID_LEN)
            && has_uuid_shape(&tid[..TID_LEN])
        {
            (tid[..TID_LEN].to_string(), Some(tid[TID_LEN..].to_string()))
        } else {
            (tid.to_string(), None)
        };

        Some(Self {
            rev,
            tid,
            suffix,
            tid_suffix,
        })
    }

    /// Validate the tid segment as a render id.
    pub fn render_id(&self) -> Result<Tid, TypeError> {
        validate_render_id(&self.tid)
    }

    /// Returns `true` if both tokens name the same stored content.
    ///
    /// Suffixes are ignored.
    pub fn same_content(&self, other: &Self) -> bool {
        self.rev == other.rev && self.tid.eq_ignore_ascii_case(&other.tid)
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}/{}", self.rev, self.tid)?;
        if let Some(tid_suffix) = &self.tid_suffix {
            write!(f, "{tid_suffix}")?;
        }
        if let Some(suffix) = &self.suffix {
            write!(f, "/{suffix}")?;
        }
        write!(f, "\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TID: &str = "fc7a4b20-1c06-11e5-8d44-25e8a62b0e8b";

    fn tid() -> Tid {
        TID.parse().unwrap()
    }

    #[test]
    fn encode_is_quoted() {
        assert_eq!(ETag::encode(5, &tid(), None), format!("\"5/{TID}\""));
        assert_eq!(
            ETag::encode(5, &tid(), Some("mobile")),
            format!("\"5/{TID}/mobile\"")
        );
    }

    #[test]
    fn display_matches_encode() {
        let etag = ETag::new(7, &tid()).with_suffix("x");
        assert_eq!(etag.to_string(), ETag::encode(7, &tid(), Some("x")));
    }

    #[test]
    fn parse_inverts_encode() {
        let parsed = ETag::parse(&ETag::encode(42, &tid(), Some("s"))).unwrap();
        assert_eq!(parsed.rev, 42);
        assert_eq!(parsed.tid, TID);
        assert_eq!(parsed.suffix.as_deref(), Some("s"));
        assert!(parsed.tid_suffix.is_none());
        assert_eq!(parsed.render_id().unwrap(), tid());
    }

    #[test]
    fn parse_accepts_weak_and_unquoted() {
        let weak = ETag::parse(&format!("W/\"3/{TID}\"")).unwrap();
        let bare = ETag::parse(&format!("3/{TID}")).unwrap();
        assert_eq!(weak, bare);
    }

    #[test]
    fn parse_splits_tid_suffix() {
        let parsed = ETag::parse(&format!("\"3/{TID}-mobile\"")).unwrap();
        assert_eq!(parsed.tid, TID);
        assert_eq!(parsed.tid_suffix.as_deref(), Some("-mobile"));
        assert_eq!(parsed.to_string(), format!("\"3/{TID}-mobile\""));
    }

    #[test]
    fn parse_passes_non_uuid_tid_through() {
        let parsed = ETag::parse("\"3/legacy-render-token-that-is-quite-long\"").unwrap();
        assert_eq!(parsed.tid, "legacy-render-token-that-is-quite-long");
        assert!(parsed.tid_suffix.is_none());
        assert!(parsed.render_id().is_err());
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "",
            "\"\"",
            "\"5\"",
            "\"/abc\"",
            "\"5/\"",
            "\"5/abc/\"",
            "\"x/abc\"",
            "\"-1/abc\"",
            "\"5/a\"b\"",
        ] {
            assert!(ETag::parse(bad).is_none(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn suffix_does_not_affect_identity() {
        let a = ETag::new(1, &tid());
        let b = ETag::new(1, &tid()).with_suffix("other");
        assert!(a.same_content(&b));
        assert!(!a.same_content(&ETag::new(2, &tid())));
    }

    proptest! {
        #[test]
        fn decode_encode_round_trip(rev in any::<u64>(), millis in 0i64..4_000_000_000_000) {
            let instant = chrono::DateTime::from_timestamp_millis(millis).unwrap();
            let tid = Tid::at(instant);
            let parsed = ETag::parse(&ETag::encode(rev, &tid, None)).unwrap();
            prop_assert_eq!(parsed.rev, rev);
            prop_assert_eq!(parsed.render_id().unwrap(), tid);
            prop_assert!(parsed.suffix.is_none());
        }
    }
}
