use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TableError, TableResult};
use crate::value::{Row, Value};

/// Declared type of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Int,
    Text,
    Blob,
    Tid,
    Timestamp,
    Json,
}

/// Role of an attribute in the primary index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Partition attribute; reads and deletes must pin it with equality.
    Hash,
    /// Clustering attribute; rows are ordered by it.
    Range,
}

/// Sort direction of a range attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    Asc,
    Desc,
}

/// One element of the primary index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexElement {
    pub attribute: String,
    pub kind: IndexKind,
    pub order: Order,
}

/// Schema version: a fixed major component owned by the table's module and
/// a minor component derived from caller options.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of a schema-create call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaStatus {
    /// The table did not exist.
    Created,
    /// The table existed with the same version; nothing changed.
    Unchanged,
    /// The table existed with a different version and was migrated.
    Migrated { from: SchemaVersion },
}

/// Table descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub table: String,
    pub version: SchemaVersion,
    pub attributes: BTreeMap<String, AttributeType>,
    pub index: Vec<IndexElement>,
    /// TTL applied to rows written without an explicit one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<Duration>,
}

impl Schema {
    /// Start a schema with no attributes.
    pub fn new(table: impl Into<String>, version: SchemaVersion) -> Self {
        Self {
            table: table.into(),
            version,
            attributes: BTreeMap::new(),
            index: Vec::new(),
            default_ttl: None,
        }
    }

    /// Declare an attribute.
    pub fn attribute(mut self, name: impl Into<String>, ty: AttributeType) -> Self {
        self.attributes.insert(name.into(), ty);
        self
    }

    /// Add a hash (partition) index element.
    pub fn hash(mut self, name: impl Into<String>) -> Self {
        self.index.push(IndexElement {
            attribute: name.into(),
            kind: IndexKind::Hash,
            order: Order::Asc,
        });
        self
    }

    /// Add a range (clustering) index element.
    pub fn range(mut self, name: impl Into<String>, order: Order) -> Self {
        self.index.push(IndexElement {
            attribute: name.into(),
            kind: IndexKind::Range,
            order,
        });
        self
    }

    /// Expire rows after `ttl` unless the write says otherwise.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Names of the hash index attributes.
    pub fn hash_attributes(&self) -> impl Iterator<Item = &str> {
        self.index
            .iter()
            .filter(|e| e.kind == IndexKind::Hash)
            .map(|e| e.attribute.as_str())
    }

    /// Check the descriptor itself is coherent.
    pub fn validate(&self) -> TableResult<()> {
        if self.table.is_empty() {
            return Err(self.violation("empty table name"));
        }
        if self.hash_attributes().next().is_none() {
            return Err(self.violation("index declares no hash attribute"));
        }
        for element in &self.index {
            match self.attributes.get(&element.attribute) {
                None => {
                    return Err(self.violation(format!(
                        "index attribute {} is not declared",
                        element.attribute
                    )))
                }
                Some(AttributeType::Json) => {
                    return Err(self.violation(format!(
                        "index attribute {} cannot be json",
                        element.attribute
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Check a row before it is written.
    pub fn validate_row(&self, row: &Row) -> TableResult<()> {
        for (name, value) in row {
            let declared = self
                .attributes
                .get(name)
                .ok_or_else(|| self.violation(format!("unknown attribute {name}")))?;
            if let Some(actual) = value.attribute_type() {
                if actual != *declared {
                    return Err(self.violation(format!(
                        "attribute {name} expects {declared:?}, got {actual:?}"
                    )));
                }
            }
        }
        for element in &self.index {
            match row.get(&element.attribute) {
                Some(v) if !v.is_null() => {}
                _ => {
                    return Err(self.violation(format!(
                        "missing index attribute {}",
                        element.attribute
                    )))
                }
            }
        }
        Ok(())
    }

    /// Returns `true` if both rows share every index attribute value.
    pub fn same_primary_key(&self, a: &Row, b: &Row) -> bool {
        self.index
            .iter()
            .all(|e| a.get(&e.attribute) == b.get(&e.attribute))
    }

    /// Order rows by the hash attributes, then by the range attributes in
    /// their declared directions.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for element in &self.index {
            let left = a.get(&element.attribute).unwrap_or(&Value::Null);
            let right = b.get(&element.attribute).unwrap_or(&Value::Null);
            let ord = left.compare(right).unwrap_or(Ordering::Equal);
            let ord = match element.order {
                Order::Asc => ord,
                Order::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn violation(&self, reason: impl Into<String>) -> TableError {
        TableError::SchemaViolation {
            table: self.table.clone(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new("t", SchemaVersion::new(1, 0))
            .attribute("key", AttributeType::Text)
            .attribute("rev", AttributeType::Int)
            .attribute("value", AttributeType::Blob)
            .hash("key")
            .range("rev", Order::Desc)
    }

    fn row(key: &str, rev: i64) -> Row {
        let mut row = Row::new();
        row.insert("key".into(), Value::from(key));
        row.insert("rev".into(), Value::Int(rev));
        row
    }

    #[test]
    fn valid_schema_passes() {
        schema().validate().unwrap();
    }

    #[test]
    fn schema_without_hash_is_rejected() {
        let s = Schema::new("t", SchemaVersion::new(1, 0))
            .attribute("rev", AttributeType::Int)
            .range("rev", Order::Desc);
        assert!(s.validate().is_err());
    }

    #[test]
    fn undeclared_index_attribute_is_rejected() {
        let s = Schema::new("t", SchemaVersion::new(1, 0)).hash("key");
        assert!(s.validate().is_err());
    }

    #[test]
    fn row_validation() {
        let s = schema();
        s.validate_row(&row("a", 1)).unwrap();

        let mut wrong_type = row("a", 1);
        wrong_type.insert("value".into(), Value::from("text"));
        assert!(s.validate_row(&wrong_type).is_err());

        let mut unknown = row("a", 1);
        unknown.insert("extra".into(), Value::Int(1));
        assert!(s.validate_row(&unknown).is_err());

        let mut missing = Row::new();
        missing.insert("key".into(), Value::from("a"));
        assert!(s.validate_row(&missing).is_err());
    }

    #[test]
    fn descending_range_orders_newest_first() {
        let s = schema();
        assert_eq!(s.compare_rows(&row("a", 5), &row("a", 3)), Ordering::Less);
        assert_eq!(s.compare_rows(&row("a", 3), &row("a", 3)), Ordering::Equal);
    }

    #[test]
    fn version_display_and_order() {
        assert_eq!(SchemaVersion::new(2, 7).to_string(), "2.7");
        assert!(SchemaVersion::new(1, 9) < SchemaVersion::new(2, 0));
    }
}
