use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use revstore_types::{SharedClock, SystemClock};

use crate::error::{TableError, TableResult};
use crate::query::{Filter, PutRequest, PutStatus, Query, QueryResult, TTL_ATTRIBUTE};
use crate::schema::{Schema, SchemaStatus};
use crate::traits::TableStore;
use crate::value::{Row, Value};

struct StoredRow {
    attributes: Row,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct MemTable {
    schema: Schema,
    rows: Vec<StoredRow>,
}

/// In-memory table store.
///
/// Intended for tests and embedding. Tables live in a `HashMap` behind a
/// `RwLock`; rows are kept sorted in index order so reads are a filter over
/// a slice. Expired rows are hidden on read and dropped on the next write to
/// the same table.
pub struct InMemoryTableStore {
    tables: RwLock<HashMap<String, MemTable>>,
    clock: SharedClock,
}

impl InMemoryTableStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create an empty store that expires rows against `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Names of all created tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// The schema a table was created with.
    pub fn schema(&self, table: &str) -> Option<Schema> {
        let tables = self.tables.read().expect("lock poisoned");
        tables.get(table).map(|t| t.schema.clone())
    }

    /// Number of live rows in `table` (0 for unknown tables).
    pub fn live_rows(&self, table: &str) -> usize {
        let now = self.clock.now();
        let tables = self.tables.read().expect("lock poisoned");
        tables
            .get(table)
            .map(|t| t.rows.iter().filter(|r| r.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Drop expired rows from every table; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut tables = self.tables.write().expect("lock poisoned");
        tables
            .values_mut()
            .map(|t| {
                let before = t.rows.len();
                t.rows.retain(|r| r.is_live(now));
                before - t.rows.len()
            })
            .sum()
    }
}

impl Default for InMemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

fn require_hash_keys(schema: &Schema, filter: &Filter) -> TableResult<()> {
    for attribute in schema.hash_attributes() {
        if !filter.get(attribute).is_some_and(|p| p.is_eq()) {
            return Err(TableError::InvalidQuery {
                table: schema.table.clone(),
                reason: format!("hash attribute {attribute} must be pinned with equality"),
            });
        }
    }
    Ok(())
}

fn encode_page(offset: usize) -> String {
    hex::encode((offset as u64).to_be_bytes())
}

fn decode_page(table: &str, token: &str) -> TableResult<usize> {
    let invalid = || TableError::InvalidQuery {
        table: table.to_string(),
        reason: format!("malformed page token {token:?}"),
    };
    let bytes: [u8; 8] = hex::decode(token)
        .map_err(|_| invalid())?
        .try_into()
        .map_err(|_| invalid())?;
    usize::try_from(u64::from_be_bytes(bytes)).map_err(|_| invalid())
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn project(row: &StoredRow, query: &Query, now: DateTime<Utc>) -> Row {
    let mut out = match &query.proj {
        Some(attributes) => attributes
            .iter()
            .filter_map(|a| row.attributes.get(a).map(|v| (a.clone(), v.clone())))
            .collect(),
        None => row.attributes.clone(),
    };
    if query.with_ttl {
        if let Some(at) = row.expires_at {
            let remaining = (at - now).num_seconds().max(0);
            out.insert(TTL_ATTRIBUTE.to_string(), Value::Int(remaining));
        }
    }
    out
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn create_schema(&self, schema: &Schema) -> TableResult<SchemaStatus> {
        schema.validate()?;
        let mut tables = self.tables.write().expect("lock poisoned");
        let status = match tables.get_mut(&schema.table) {
            None => {
                tables.insert(
                    schema.table.clone(),
                    MemTable {
                        schema: schema.clone(),
                        rows: Vec::new(),
                    },
                );
                SchemaStatus::Created
            }
            Some(existing) if existing.schema == *schema => SchemaStatus::Unchanged,
            Some(existing) => {
                let from = existing.schema.version;
                existing.schema = schema.clone();
                let s = &existing.schema;
                existing.rows.sort_by(|a, b| s.compare_rows(&a.attributes, &b.attributes));
                SchemaStatus::Migrated { from }
            }
        };
        match status {
            SchemaStatus::Unchanged => {}
            _ => info!(table = %schema.table, version = %schema.version, ?status, "schema applied"),
        }
        Ok(status)
    }

    async fn get(&self, table: &str, query: &Query) -> TableResult<QueryResult> {
        let now = self.clock.now();
        let tables = self.tables.read().expect("lock poisoned");
        let mem = tables
            .get(table)
            .ok_or_else(|| TableError::NoSuchTable(table.to_string()))?;
        require_hash_keys(&mem.schema, &query.filter)?;

        let offset = match &query.page {
            Some(token) => decode_page(table, token)?,
            None => 0,
        };
        let matching: Vec<&StoredRow> = mem
            .rows
            .iter()
            .filter(|r| r.is_live(now) && query.filter.matches(&r.attributes))
            .collect();

        if matching.is_empty() && query.page.is_none() {
            return Err(TableError::NotFound {
                table: table.to_string(),
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        let items: Vec<Row> = matching
            .iter()
            .skip(offset)
            .take(limit)
            .map(|r| project(r, query, now))
            .collect();
        let consumed = offset.saturating_add(items.len());
        let next = (consumed < matching.len()).then(|| encode_page(consumed));

        Ok(QueryResult { items, next })
    }

    async fn put(&self, table: &str, request: PutRequest) -> TableResult<PutStatus> {
        let now = self.clock.now();
        let mut tables = self.tables.write().expect("lock poisoned");
        let mem = tables
            .get_mut(table)
            .ok_or_else(|| TableError::NoSuchTable(table.to_string()))?;
        mem.schema.validate_row(&request.attributes)?;

        let ttl = request.ttl.or(mem.schema.default_ttl);
        let row = StoredRow {
            attributes: request.attributes,
            expires_at: ttl.map(|ttl| expiry(now, ttl)),
        };

        mem.rows.retain(|r| r.is_live(now));
        let schema = &mem.schema;
        let status = match mem
            .rows
            .iter()
            .position(|r| schema.same_primary_key(&r.attributes, &row.attributes))
        {
            Some(index) => {
                mem.rows[index] = row;
                PutStatus::Updated
            }
            None => {
                let index = mem
                    .rows
                    .partition_point(|r| schema.compare_rows(&r.attributes, &row.attributes).is_lt());
                mem.rows.insert(index, row);
                PutStatus::Created
            }
        };
        debug!(table, ?status, "row written");
        Ok(status)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> TableResult<usize> {
        let now = self.clock.now();
        let mut tables = self.tables.write().expect("lock poisoned");
        let mem = tables
            .get_mut(table)
            .ok_or_else(|| TableError::NoSuchTable(table.to_string()))?;
        require_hash_keys(&mem.schema, filter)?;

        mem.rows.retain(|r| r.is_live(now));
        let before = mem.rows.len();
        mem.rows.retain(|r| !filter.matches(&r.attributes));
        let removed = before - mem.rows.len();
        debug!(table, removed, "rows deleted");
        Ok(removed)
    }
}

impl std::fmt::Debug for InMemoryTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.table_names();
        f.debug_struct("InMemoryTableStore")
            .field("tables", &names)
            .finish()
    }
}
