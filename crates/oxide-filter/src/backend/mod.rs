//! Record stores: the relational store and the remote catalog.

mod catalog;
mod memory;
mod relational;

use serde::{Deserialize, Serialize};

pub use catalog::{CatalogClient, CatalogError, CatalogRow, CatalogStore, ClientPool, PooledClient};
pub use memory::InMemoryCatalog;
pub use relational::{RelationalStore, StoreSession};

use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::query::QueryBuilder;
use crate::record::Record;
use crate::schema::SchemaRegistry;
use crate::value::Value;

/// The kind of store a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// A SQL database.
    Relational,
    /// The remote catalog.
    Catalog,
}

/// The result of executing a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// Whole records, with included relationships attached.
    Records(Vec<Record>),
    /// Distinct tuples, positionally matching the projected fields.
    Rows(Vec<Vec<Value>>),
    /// A count.
    Count(u64),
}

/// A store that executes filtered queries and single-record writes.
///
/// Every operation carries the caller's session id; the relational store
/// only logs it.
#[allow(async_fn_in_trait)]
pub trait RecordStore {
    /// The query builder for this store.
    type Query<'s>: QueryBuilder
    where
        Self: 's;

    /// Returns the store's backend kind.
    fn backend(&self) -> Backend;

    /// Returns the schema registry.
    fn schema(&self) -> &SchemaRegistry;

    /// Returns the configuration.
    fn config(&self) -> &FilterConfig;

    /// Starts a query over `entity`.
    fn query(&self, entity: &str) -> std::result::Result<Self::Query<'_>, FilterError>;

    /// Runs a query.
    async fn execute<'q>(
        &'q self,
        session_id: &str,
        query: Self::Query<'q>,
    ) -> Result<QueryOutput>;

    /// Inserts a record and returns it as stored.
    async fn insert(&self, session_id: &str, record: Record) -> Result<Record>;

    /// Updates the attributes present in `record`, located by primary key.
    async fn update(&self, session_id: &str, record: Record) -> Result<Record>;

    /// Deletes the record with primary key `id`.
    async fn delete(&self, session_id: &str, entity: &str, id: &Value) -> Result<()>;
}
