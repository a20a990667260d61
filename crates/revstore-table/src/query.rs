use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::value::{Row, Value};

/// Attribute carrying the remaining TTL in seconds when a query sets
/// [`Query::with_ttl`].
pub const TTL_ATTRIBUTE: &str = "_ttl";

/// A condition on one attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
}

impl Predicate {
    /// Returns `true` if `value` satisfies the predicate.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::Eq(want) => value == want,
            Predicate::Lt(bound) => value.compare(bound) == Some(Ordering::Less),
            Predicate::Le(bound) => matches!(
                value.compare(bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Predicate::Gt(bound) => value.compare(bound) == Some(Ordering::Greater),
            Predicate::Ge(bound) => matches!(
                value.compare(bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }

    /// Returns `true` for equality predicates.
    pub fn is_eq(&self) -> bool {
        matches!(self, Predicate::Eq(_))
    }
}

/// Conjunction of per-attribute predicates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<String, Predicate>,
}

impl Filter {
    /// A filter matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `attribute == value`.
    pub fn eq(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Predicate::Eq(value.into()))
    }

    /// Require `attribute < value`.
    pub fn lt(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Predicate::Lt(value.into()))
    }

    /// Require `attribute <= value`.
    pub fn le(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Predicate::Le(value.into()))
    }

    /// Require `attribute > value`.
    pub fn gt(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Predicate::Gt(value.into()))
    }

    /// Require `attribute >= value`.
    pub fn ge(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(attribute, Predicate::Ge(value.into()))
    }

    /// Set the predicate for `attribute`, replacing any previous one.
    pub fn with(mut self, attribute: impl Into<String>, predicate: Predicate) -> Self {
        self.conditions.insert(attribute.into(), predicate);
        self
    }

    /// The predicate on `attribute`, if any.
    pub fn get(&self, attribute: &str) -> Option<&Predicate> {
        self.conditions.get(attribute)
    }

    /// Iterate over all conditions.
    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Predicate)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns `true` if `row` satisfies every condition. A missing
    /// attribute never matches.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|(attribute, predicate)| {
            row.get(attribute)
                .is_some_and(|value| predicate.matches(value))
        })
    }
}

/// A read request.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub filter: Filter,
    /// Maximum rows per page.
    pub limit: Option<usize>,
    /// Attributes to return; all when `None`.
    pub proj: Option<Vec<String>>,
    /// Include [`TTL_ATTRIBUTE`] on rows that carry an expiry.
    pub with_ttl: bool,
    /// Continuation token from a previous [`QueryResult::next`].
    pub page: Option<String>,
}

impl Query {
    /// Query rows matching `filter`, unlimited.
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Return at most `limit` rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return only the named attributes.
    pub fn project<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proj = Some(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Include the remaining time to live of expiring rows.
    pub fn with_ttl(mut self) -> Self {
        self.with_ttl = true;
        self
    }

    /// Resume from a continuation token.
    pub fn page(mut self, token: Option<String>) -> Self {
        self.page = token;
        self
    }
}

/// One page of rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub items: Vec<Row>,
    /// Opaque token for the next page; `None` when exhausted.
    pub next: Option<String>,
}

/// A single-row write.
#[derive(Clone, Debug, PartialEq)]
pub struct PutRequest {
    pub attributes: Row,
    /// Expire the row after this long. Overrides the schema default.
    pub ttl: Option<Duration>,
}

impl PutRequest {
    /// Write `attributes` with the table's default TTL.
    pub fn new(attributes: Row) -> Self {
        Self {
            attributes,
            ttl: None,
        }
    }

    /// Expire the row `ttl` from now.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Whether a put inserted a new row or replaced one with the same primary key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutStatus {
    Created,
    Updated,
}
