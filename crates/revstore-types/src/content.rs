use std::fmt;

use serde::{Deserialize, Serialize};

/// The declared kind of a stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Blob,
    String,
    Json,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Blob => "blob",
            ValueKind::String => "string",
            ValueKind::Json => "json",
        };
        f.write_str(name)
    }
}

/// A stored payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Blob(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Content {
    /// The value kind this payload satisfies.
    pub fn kind(&self) -> ValueKind {
        match self {
            Content::Blob(_) => ValueKind::Blob,
            Content::Text(_) => ValueKind::String,
            Content::Json(_) => ValueKind::Json,
        }
    }

    /// Size of the payload in bytes (JSON is measured in its compact form).
    pub fn len(&self) -> usize {
        match self {
            Content::Blob(b) => b.len(),
            Content::Text(s) => s.len(),
            Content::Json(v) => v.to_string().len(),
        }
    }

    /// Returns `true` if the payload has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hex-encoded BLAKE3 digest of the payload bytes.
    pub fn digest(&self) -> String {
        let hash = match self {
            Content::Blob(b) => blake3::hash(b),
            Content::Text(s) => blake3::hash(s.as_bytes()),
            Content::Json(v) => blake3::hash(v.to_string().as_bytes()),
        };
        hex::encode(hash.as_bytes())
    }

    /// Default media type for the payload kind.
    pub fn default_media_type(&self) -> &'static str {
        match self {
            Content::Blob(_) => "application/octet-stream",
            Content::Text(_) => "text/plain; charset=utf-8",
            Content::Json(_) => "application/json",
        }
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Blob(bytes)
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Content::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(Content::from(vec![1u8]).kind(), ValueKind::Blob);
        assert_eq!(Content::from("a").kind(), ValueKind::String);
        assert_eq!(Content::from(serde_json::json!({"a": 1})).kind(), ValueKind::Json);
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = Content::from("hello");
        assert_eq!(a.digest(), Content::from("hello").digest());
        assert_ne!(a.digest(), Content::from("hello!").digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn text_and_blob_with_same_bytes_share_digest() {
        assert_eq!(
            Content::from("abc").digest(),
            Content::from(b"abc".to_vec()).digest()
        );
    }

    #[test]
    fn value_kind_serde_names() {
        let kinds: Vec<ValueKind> =
            serde_json::from_str(r#"["blob", "string", "json"]"#).unwrap();
        assert_eq!(kinds, vec![ValueKind::Blob, ValueKind::String, ValueKind::Json]);
        assert_eq!(ValueKind::String.to_string(), "string");
    }
}
