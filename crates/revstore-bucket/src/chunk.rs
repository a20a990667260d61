//! Splitting large values into ordered fragments and joining them back.
//!
//! The codec is uniform over byte and text payloads. Text is cut on `char`
//! boundaries so every fragment is valid UTF-8 on its own; a fragment is at
//! most `chunk_size` bytes unless a single character is wider than that.

use std::num::NonZeroUsize;

use revstore_types::{Content, ValueKind};

use crate::error::{BucketError, BucketResult};

/// A value that can be cut into fragments and reassembled.
pub trait Chunk: Sized {
    /// Cut `self` into ordered fragments of at most `size` bytes.
    fn split(&self, size: NonZeroUsize) -> Vec<Self>;

    /// Concatenate fragments in order.
    fn join(parts: Vec<Self>) -> Self;
}

impl Chunk for Vec<u8> {
    fn split(&self, size: NonZeroUsize) -> Vec<Self> {
        self.chunks(size.get()).map(<[u8]>::to_vec).collect()
    }

    fn join(parts: Vec<Self>) -> Self {
        parts.concat()
    }
}

impl Chunk for String {
    fn split(&self, size: NonZeroUsize) -> Vec<Self> {
        let mut parts = Vec::new();
        let mut rest = self.as_str();
        while !rest.is_empty() {
            let mut end = size.get().min(rest.len());
            while !rest.is_char_boundary(end) {
                end -= 1;
            }
            if end == 0 {
                // One character wider than the chunk size.
                end = rest.chars().next().map_or(rest.len(), char::len_utf8);
            }
            let (head, tail) = rest.split_at(end);
            parts.push(head.to_string());
            rest = tail;
        }
        parts
    }

    fn join(parts: Vec<Self>) -> Self {
        parts.concat()
    }
}

/// Split `value` into fragments of at most `chunk_size` bytes.
pub fn split<T: Chunk>(value: &T, chunk_size: NonZeroUsize) -> Vec<T> {
    value.split(chunk_size)
}

/// Reassemble fragments produced by [`split`].
pub fn join<T: Chunk>(fragments: Vec<T>) -> T {
    T::join(fragments)
}

/// Split a stored payload. JSON payloads cannot be chunked.
pub fn split_content(value: &Content, chunk_size: NonZeroUsize) -> BucketResult<Vec<Content>> {
    match value {
        Content::Blob(bytes) => Ok(split(bytes, chunk_size).into_iter().map(Content::Blob).collect()),
        Content::Text(text) => Ok(split(text, chunk_size).into_iter().map(Content::Text).collect()),
        Content::Json(_) => Err(BucketError::InvalidRequest(
            "json values cannot be chunked".into(),
        )),
    }
}

/// Reassemble payload fragments of the given kind.
pub fn join_content(kind: ValueKind, fragments: Vec<Content>) -> BucketResult<Content> {
    match kind {
        ValueKind::Blob => {
            let parts = fragments
                .into_iter()
                .map(|c| match c {
                    Content::Blob(b) => Ok(b),
                    other => Err(mixed(kind, &other)),
                })
                .collect::<BucketResult<Vec<_>>>()?;
            Ok(Content::Blob(join(parts)))
        }
        ValueKind::String => {
            let parts = fragments
                .into_iter()
                .map(|c| match c {
                    Content::Text(s) => Ok(s),
                    other => Err(mixed(kind, &other)),
                })
                .collect::<BucketResult<Vec<_>>>()?;
            Ok(Content::Text(join(parts)))
        }
        ValueKind::Json => Err(BucketError::InvalidRequest(
            "json values cannot be chunked".into(),
        )),
    }
}

fn mixed(kind: ValueKind, found: &Content) -> BucketError {
    BucketError::InvalidRequest(format!(
        "cannot join {} fragment into {kind} value",
        found.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn n(size: usize) -> NonZeroUsize {
        NonZeroUsize::new(size).unwrap()
    }

    #[test]
    fn bytes_split_into_fixed_pieces() {
        let parts = split(&b"abcdefg".to_vec(), n(3));
        assert_eq!(parts, vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]);
    }

    #[test]
    fn empty_value_has_no_fragments() {
        assert!(split(&Vec::<u8>::new(), n(4)).is_empty());
        assert!(split(&String::new(), n(4)).is_empty());
        assert_eq!(join(Vec::<String>::new()), "");
    }

    #[test]
    fn text_respects_char_boundaries() {
        // "é" is two bytes.
        let parts = split(&"aéé".to_string(), n(2));
        assert_eq!(parts, vec!["a", "é", "é"]);
        assert!(parts.iter().all(|p| p.len() <= 2));
    }

    #[test]
    fn wide_char_gets_its_own_fragment() {
        let parts = split(&"a😀b".to_string(), n(2));
        assert_eq!(parts, vec!["a", "😀", "b"]);
    }

    #[test]
    fn content_round_trip_preserves_kind() {
        let text = Content::from("hello world");
        let parts = split_content(&text, n(4)).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(join_content(ValueKind::String, parts).unwrap(), text);

        let blob = Content::from(vec![0u8, 1, 2, 3, 4]);
        let parts = split_content(&blob, n(2)).unwrap();
        assert_eq!(join_content(ValueKind::Blob, parts).unwrap(), blob);
    }

    #[test]
    fn json_is_not_chunkable() {
        let json = Content::from(serde_json::json!({"a": 1}));
        assert!(split_content(&json, n(2)).is_err());
    }

    #[test]
    fn mixed_fragments_are_rejected() {
        let parts = vec![Content::from("a"), Content::from(vec![1u8])];
        assert!(join_content(ValueKind::String, parts).is_err());
    }

    proptest! {
        #[test]
        fn bytes_round_trip(value in proptest::collection::vec(any::<u8>(), 0..2048), size in 1usize..300) {
            let parts = split(&value, n(size));
            prop_assert!(parts.iter().all(|p| p.len() <= size && !p.is_empty()));
            prop_assert_eq!(join(parts), value);
        }

        #[test]
        fn text_round_trip(value in ".{0,400}", size in 1usize..64) {
            let parts = split(&value, n(size));
            prop_assert!(parts.iter().all(|p| !p.is_empty()));
            prop_assert_eq!(join(parts), value);
        }
    }
}
