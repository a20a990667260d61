//! Attribute-table store interface for revstore.
//!
//! The bucket layer never talks to a database directly. It issues four
//! primitive calls against named tables: create a schema, get rows by
//! attribute filter, put a single row, delete rows by filter. This crate
//! defines that boundary and a reference backend.
//!
//! # Guarantees assumed of every backend
//!
//! 1. A single row write is atomic.
//! 2. There is no cross-row atomicity, no transactions, no compare-and-swap.
//! 3. Reads return rows ordered by the table's declared range index.
//! 4. Rows written with a TTL become invisible once it elapses.
//!
//! # Backends
//!
//! - [`InMemoryTableStore`] -- lock-protected maps, for tests and embedding

pub mod error;
pub mod memory;
pub mod query;
pub mod schema;
pub mod traits;
pub mod value;

pub use error::{TableError, TableResult};
pub use memory::InMemoryTableStore;
pub use query::{Filter, Predicate, PutRequest, PutStatus, Query, QueryResult, TTL_ATTRIBUTE};
pub use schema::{AttributeType, IndexElement, IndexKind, Order, Schema, SchemaStatus, SchemaVersion};
pub use traits::TableStore;
pub use value::{Row, Value};
