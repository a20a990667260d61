use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use revstore_types::ValueKind;

use crate::error::{BucketError, BucketResult};

/// One day.
pub const DEFAULT_GRACE_MS: u64 = 86_400_000;

/// Chunk size for chunked buckets, below the practical row-size ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Timeline tables keep entries this many grace periods as a backstop.
pub const TIMELINE_TTL_FACTOR: u32 = 10;

fn default_grace_ms() -> u64 {
    DEFAULT_GRACE_MS
}

fn default_delete_probability() -> f64 {
    1.0
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_blob() -> ValueKind {
    ValueKind::Blob
}

/// A named content type and the kind of value it stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTypeSpec {
    pub name: String,
    #[serde(default = "default_blob")]
    pub value_kind: ValueKind,
}

impl ContentTypeSpec {
    /// A content type with the given value kind.
    pub fn new(name: impl Into<String>, value_kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            value_kind,
        }
    }
}

/// How a key-revision-value bucket retains superseded revisions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep every revision and render.
    #[default]
    All,
    /// Keep the newest render of the newest `count` revisions; mark the rest
    /// to expire after the grace period.
    Latest { count: usize, grace_ms: u64 },
    /// Like `Latest { count: 1 }`, and skip writes whose content matches the
    /// newest stored render of the same revision.
    LatestHash { grace_ms: u64 },
}

impl RetentionPolicy {
    fn validate(&self) -> BucketResult<()> {
        match self {
            RetentionPolicy::All => Ok(()),
            RetentionPolicy::Latest { count: 0, .. } => Err(BucketError::Config(
                "retention count must be at least 1".into(),
            )),
            RetentionPolicy::Latest { grace_ms: 0, .. } | RetentionPolicy::LatestHash { grace_ms: 0 } => {
                Err(BucketError::Config("retention grace_ms must be positive".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Options for a key-revision-value bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyRevValueOptions {
    /// Full table name.
    pub table: String,
    #[serde(default = "default_blob")]
    pub value_kind: ValueKind,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub schema_minor_version: u32,
}

impl KeyRevValueOptions {
    /// Options for `table`, keeping every revision.
    pub fn new(table: impl Into<String>, value_kind: ValueKind) -> Self {
        Self {
            table: table.into(),
            value_kind,
            retention: RetentionPolicy::All,
            schema_minor_version: 0,
        }
    }

    /// Reject an empty table name or an invalid retention policy.
    pub fn validate(&self) -> BucketResult<()> {
        if self.table.is_empty() {
            return Err(BucketError::Config("table name must not be empty".into()));
        }
        self.retention.validate()
    }
}

/// Grace-period deletion settings shared by multi-content and chunked buckets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GcOptions {
    pub grace: Duration,
    pub delete_probability: f64,
}

impl GcOptions {
    fn new(grace_ms: u64, delete_probability: f64) -> BucketResult<Self> {
        if grace_ms == 0 {
            return Err(BucketError::Config("grace_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&delete_probability) {
            return Err(BucketError::Config(format!(
                "delete_probability must be within [0, 1], got {delete_probability}"
            )));
        }
        Ok(Self {
            grace: Duration::from_millis(grace_ms),
            delete_probability,
        })
    }

    /// TTL of timeline entries.
    pub fn timeline_ttl(&self) -> Duration {
        self.grace * TIMELINE_TTL_FACTOR
    }
}

fn validate_prefix(prefix: &str) -> BucketResult<()> {
    if prefix.is_empty() {
        return Err(BucketError::Config("table_prefix must not be empty".into()));
    }
    Ok(())
}

/// Options for a multi-content bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiContentOptions {
    pub table_prefix: String,
    pub main_content_type: ContentTypeSpec,
    #[serde(default)]
    pub dependent_content_types: Vec<ContentTypeSpec>,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_delete_probability")]
    pub delete_probability: f64,
    /// Treat reads of a revision that is about to be purged as misses.
    #[serde(default)]
    pub renew_expiring: bool,
    #[serde(default)]
    pub schema_minor_version: u32,
}

impl MultiContentOptions {
    /// Options with a main content type and no dependents.
    pub fn new(table_prefix: impl Into<String>, main_content_type: ContentTypeSpec) -> Self {
        Self {
            table_prefix: table_prefix.into(),
            main_content_type,
            dependent_content_types: Vec::new(),
            grace_ms: DEFAULT_GRACE_MS,
            delete_probability: 1.0,
            renew_expiring: false,
            schema_minor_version: 0,
        }
    }

    /// Add a dependent content type.
    pub fn dependent(mut self, spec: ContentTypeSpec) -> Self {
        self.dependent_content_types.push(spec);
        self
    }

    /// The grace and sampling settings, validated.
    pub fn gc(&self) -> BucketResult<GcOptions> {
        GcOptions::new(self.grace_ms, self.delete_probability)
    }

    /// Reject invalid prefixes, duplicate content types and GC settings.
    pub fn validate(&self) -> BucketResult<()> {
        validate_prefix(&self.table_prefix)?;
        self.gc()?;
        let mut seen = HashSet::new();
        for spec in std::iter::once(&self.main_content_type).chain(&self.dependent_content_types) {
            if spec.name.is_empty() {
                return Err(BucketError::Config("content type name must not be empty".into()));
            }
            if spec.name.ends_with("-timeline") {
                return Err(BucketError::Config(format!(
                    "content type name {} collides with timeline tables",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(BucketError::Config(format!(
                    "duplicate content type {}",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// Options for a chunked bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkedOptions {
    pub table_prefix: String,
    #[serde(default = "default_blob")]
    pub value_kind: ValueKind,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_delete_probability")]
    pub delete_probability: f64,
    #[serde(default)]
    pub schema_minor_version: u32,
}

impl ChunkedOptions {
    /// Options for chunked values stored under `table_prefix`.
    pub fn new(table_prefix: impl Into<String>, value_kind: ValueKind) -> Self {
        Self {
            table_prefix: table_prefix.into(),
            value_kind,
            chunk_size: DEFAULT_CHUNK_SIZE,
            grace_ms: DEFAULT_GRACE_MS,
            delete_probability: 1.0,
            schema_minor_version: 0,
        }
    }

    /// The grace and sampling settings, validated.
    pub fn gc(&self) -> BucketResult<GcOptions> {
        GcOptions::new(self.grace_ms, self.delete_probability)
    }

    /// Reject invalid prefixes, chunk sizes, value kinds and GC settings.
    pub fn validate(&self) -> BucketResult<()> {
        validate_prefix(&self.table_prefix)?;
        self.gc()?;
        if self.chunk_size == 0 {
            return Err(BucketError::Config("chunk_size must be positive".into()));
        }
        if self.value_kind == ValueKind::Json {
            return Err(BucketError::Config(
                "chunked buckets store blob or string values".into(),
            ));
        }
        Ok(())
    }
}

/// Options for one bucket, tagged by bucket type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BucketOptions {
    KeyRevValue(KeyRevValueOptions),
    MultiContent(MultiContentOptions),
    Chunked(ChunkedOptions),
}

impl BucketOptions {
    /// Validate the options of whichever bucket type this is.
    pub fn validate(&self) -> BucketResult<()> {
        match self {
            BucketOptions::KeyRevValue(o) => o.validate(),
            BucketOptions::MultiContent(o) => o.validate(),
            BucketOptions::Chunked(o) => o.validate(),
        }
    }
}

/// All configured buckets, keyed by bucket name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketOptions>,
}

impl BucketConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> BucketResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| BucketError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every bucket, naming the offending one on failure.
    pub fn validate(&self) -> BucketResult<()> {
        for (name, options) in &self.buckets {
            options
                .validate()
                .map_err(|e| BucketError::Config(format!("bucket {name}: {e}")))?;
        }
        Ok(())
    }
}
