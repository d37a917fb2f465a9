//! # oxide-filter
//!
//! A query-filter language (`where`, `order`, `skip`, `limit`, `include`,
//! `distinct`) that runs unchanged over two kinds of store:
//!
//! - a relational store (SQLite through `sqlx`), where filters become joins,
//!   `WHERE`/`ORDER BY`/`LIMIT` clauses, `SELECT DISTINCT` and subqueries;
//! - a remote catalog reached through a [`CatalogClient`](backend::CatalogClient),
//!   where filters become condition maps, complete ordering lists, join
//!   specifications and a coupled `(skip, limit)` pair.
//!
//! Results are serialized into JSON-ready [`SerializedRecord`]s, with related
//! records nested as the include tree asks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use oxide_filter::prelude::*;
//! use serde_json::json;
//!
//! # async fn example(schema: SchemaRegistry) -> oxide_filter::Result<()> {
//! let store = RelationalStore::connect(
//!     "sqlite:library.db",
//!     Arc::new(schema),
//!     FilterConfig::default(),
//! )
//! .await?;
//!
//! let books = get_with_filters(
//!     &store,
//!     "session",
//!     "Book",
//!     &[
//!         json!({"where": {"title": {"like": "Test"}}}),
//!         json!({"order": "id ASC"}),
//!         json!({"skip": 1}),
//!         json!({"limit": 2}),
//!         json!({"include": "author"}),
//!     ],
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

#![allow(
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::future_not_send,
    clippy::missing_const_for_fn
)]

pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod query;
pub mod record;
pub mod schema;
pub mod serialize;
pub mod service;
pub mod value;

pub use error::{ApiError, ConfigError, FilterError, Result};
pub use serialize::SerializedRecord;

/// Common imports.
pub mod prelude {
    pub use crate::backend::{
        Backend, CatalogClient, CatalogStore, InMemoryCatalog, QueryOutput, RecordStore,
        RelationalStore,
    };
    pub use crate::config::FilterConfig;
    pub use crate::error::{ApiError, ConfigError, FilterError, Result};
    pub use crate::filter::{FilterFactory, FilterHandler, FilterSpec, IncludeTree};
    pub use crate::record::{Record, Related};
    pub use crate::schema::{AttributeType, EntityDef, RelationshipDef, SchemaRegistry};
    pub use crate::serialize::{SerializedRecord, Serializer};
    pub use crate::service::{
        count_with_filters, create, delete_by_id, get_by_id, get_one_with_filters,
        get_with_filters, update,
    };
    pub use crate::value::Value;
}
