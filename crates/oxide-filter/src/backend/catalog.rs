//! Remote catalog store: client trait, client pool and store adapter.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

use super::{Backend, QueryOutput, RecordStore};
use crate::config::FilterConfig;
use crate::error::{ApiError, FilterError, Result};
use crate::query::{AggregateMode, CatalogQuery, QueryBuilder};
use crate::record::Record;
use crate::schema::SchemaRegistry;
use crate::value::Value;

/// Errors reported by a catalog client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The session id is missing, expired or rejected.
    #[error("session error: {0}")]
    Session(String),

    /// The addressed object does not exist.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The catalog rejected the request's content.
    #[error("validation error: {0}")]
    Validation(String),

    /// Any other catalog failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Session(message) => {
                warn!(error = %message, "catalog rejected the session");
                Self::Authentication(message)
            }
            CatalogError::NoSuchObject(message) => {
                warn!(error = %message, "catalog object not found");
                Self::MissingRecord(message)
            }
            other => {
                error!(error = %other, "catalog error");
                Self::BadRequest("the catalog rejected the request".to_string())
            }
        }
    }
}

/// One result row of a catalog search.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogRow {
    /// A whole entity, with included relationships attached.
    Entity(Record),
    /// A single value: a count or a one-attribute distinct row.
    Scalar(Value),
    /// A multi-attribute distinct row.
    Tuple(Vec<Value>),
}

/// A handle on the remote catalog.
///
/// Handles are not shared between concurrent requests; the pool hands
/// each request its own.
#[allow(async_fn_in_trait)]
pub trait CatalogClient {
    /// Returns the session id the handle currently acts under.
    fn session_id(&self) -> &str;

    /// Sets the session id used by subsequent calls.
    fn set_session_id(&mut self, session_id: &str);

    /// Runs a search.
    async fn search(
        &self,
        query: &CatalogQuery<'_>,
    ) -> std::result::Result<Vec<CatalogRow>, CatalogError>;

    /// Creates an entity and returns it as stored.
    async fn create(&self, record: Record) -> std::result::Result<Record, CatalogError>;

    /// Updates the attributes present in `record`.
    async fn update(&self, record: Record) -> std::result::Result<Record, CatalogError>;

    /// Deletes an entity by primary key.
    async fn delete(&self, entity: &str, id: &Value) -> std::result::Result<(), CatalogError>;
}

type ClientFactory<C> = Box<dyn Fn() -> C + Send + Sync>;

/// A bounded pool of catalog client handles.
///
/// Handles are created lazily, at most `size` of them. An acquire waits
/// for a free handle up to the configured timeout.
pub struct ClientPool<C> {
    permits: Semaphore,
    idle: Mutex<Vec<C>>,
    factory: ClientFactory<C>,
    size: usize,
    timeout: Duration,
}

impl<C> ClientPool<C> {
    /// Creates an empty pool.
    pub fn new(
        size: usize,
        timeout: Duration,
        factory: impl Fn() -> C + Send + Sync + 'static,
    ) -> Self {
        Self {
            permits: Semaphore::new(size),
            idle: Mutex::new(Vec::with_capacity(size)),
            factory: Box::new(factory),
            size,
            timeout,
        }
    }

    /// Borrows a handle; the guard returns it when dropped.
    pub async fn acquire(&self) -> Result<PooledClient<'_, C>> {
        let permit = tokio::time::timeout(self.timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                warn!(size = self.size, timeout = ?self.timeout, "client pool exhausted");
                ApiError::BadRequest("client pool exhausted".to_string())
            })?
            .map_err(|_| ApiError::BadRequest("client pool closed".to_string()))?;

        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let client = match reused {
            Some(client) => client,
            None => {
                debug!(size = self.size, "creating catalog client");
                (self.factory)()
            }
        };
        debug!(available = self.permits.available_permits(), "client acquired");
        Ok(PooledClient {
            pool: self,
            client: Some(client),
            _permit: permit,
        })
    }

    /// Returns the maximum number of handles.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns how many handles could be acquired right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Returns how many created handles are waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A handle borrowed from a [`ClientPool`].
pub struct PooledClient<'p, C> {
    pool: &'p ClientPool<C>,
    client: Option<C>,
    _permit: SemaphorePermit<'p>,
}

impl<C> Deref for PooledClient<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.client {
            Some(client) => client,
            None => unreachable!("client is only taken on drop"),
        }
    }
}

impl<C> DerefMut for PooledClient<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.client {
            Some(client) => client,
            None => unreachable!("client is only taken on drop"),
        }
    }
}

impl<C> Drop for PooledClient<'_, C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(client);
            debug!("client released");
        }
    }
}

/// Record store backed by the remote catalog.
pub struct CatalogStore<C> {
    pool: ClientPool<C>,
    schema: Arc<SchemaRegistry>,
    config: FilterConfig,
}

impl<C: CatalogClient> CatalogStore<C> {
    /// Creates a store whose pool builds handles with `factory`.
    pub fn new(
        schema: Arc<SchemaRegistry>,
        config: FilterConfig,
        factory: impl Fn() -> C + Send + Sync + 'static,
    ) -> Self {
        let pool = ClientPool::new(
            config.client_pool_size.max(1),
            config.pool_acquire_timeout(),
            factory,
        );
        Self {
            pool,
            schema,
            config,
        }
    }

    /// Returns the client pool.
    pub fn pool(&self) -> &ClientPool<C> {
        &self.pool
    }

    /// Borrows a handle stamped with the caller's session.
    async fn client(&self, session_id: &str) -> Result<PooledClient<'_, C>> {
        if session_id.is_empty() {
            return Err(ApiError::Authentication("missing session id".to_string()));
        }
        let mut client = self.pool.acquire().await?;
        client.set_session_id(session_id);
        Ok(client)
    }
}

impl<C: CatalogClient> RecordStore for CatalogStore<C> {
    type Query<'s>
        = CatalogQuery<'s>
    where
        Self: 's;

    fn backend(&self) -> Backend {
        Backend::Catalog
    }

    fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn query(&self, entity: &str) -> std::result::Result<CatalogQuery<'_>, FilterError> {
        CatalogQuery::new(&self.schema, entity, self.config.max_entities)
    }

    async fn execute<'q>(
        &'q self,
        session_id: &str,
        mut query: CatalogQuery<'q>,
    ) -> Result<QueryOutput> {
        let client = self.client(session_id).await?;

        // The catalog cannot count distinct tuples of several attributes.
        let manual_count = query.aggregate() == AggregateMode::CountDistinct
            && query.attributes().len() > 1;
        if manual_count {
            query.set_aggregate(AggregateMode::Distinct);
        }
        debug!(query = %query, "catalog search");
        let rows = client.search(&query).await?;

        if manual_count {
            return Ok(QueryOutput::Count(u64::try_from(rows.len()).unwrap_or(u64::MAX)));
        }

        match query.aggregate() {
            AggregateMode::Count | AggregateMode::CountDistinct => match rows.as_slice() {
                [CatalogRow::Scalar(Value::Int(n))] => {
                    Ok(QueryOutput::Count(u64::try_from(*n).unwrap_or(0)))
                }
                [] => Ok(QueryOutput::Count(0)),
                other => Err(unexpected("count", other)),
            },
            AggregateMode::Distinct => rows
                .into_iter()
                .map(|row| match row {
                    CatalogRow::Scalar(value) => Ok(vec![value]),
                    CatalogRow::Tuple(values) => Ok(values),
                    other => Err(unexpected("distinct", &[other])),
                })
                .collect::<Result<Vec<_>>>()
                .map(QueryOutput::Rows),
            AggregateMode::None => rows
                .into_iter()
                .map(|row| match row {
                    CatalogRow::Entity(record) => Ok(record),
                    other => Err(unexpected("entity", &[other])),
                })
                .collect::<Result<Vec<_>>>()
                .map(QueryOutput::Records),
        }
    }

    async fn insert(&self, session_id: &str, record: Record) -> Result<Record> {
        let client = self.client(session_id).await?;
        let created = client.create(record).await?;
        info!(entity = %created.entity(), "catalog entity created");
        Ok(created)
    }

    async fn update(&self, session_id: &str, record: Record) -> Result<Record> {
        let entity = self.schema.entity(record.entity())?;
        if !matches!(record.get(&entity.primary_key), Some(id) if !id.is_null()) {
            return Err(ApiError::BadRequest(format!(
                "update of {} needs '{}'",
                entity.name, entity.primary_key
            )));
        }
        let client = self.client(session_id).await?;
        let updated = client.update(record).await?;
        info!(entity = %updated.entity(), "catalog entity updated");
        Ok(updated)
    }

    async fn delete(&self, session_id: &str, entity: &str, id: &Value) -> Result<()> {
        let client = self.client(session_id).await?;
        client.delete(entity, id).await?;
        info!(entity = %entity, "catalog entity deleted");
        Ok(())
    }
}

fn unexpected(expected: &str, rows: &[CatalogRow]) -> ApiError {
    error!(expected = %expected, rows = ?rows, "unexpected catalog result");
    ApiError::BadRequest("unexpected catalog result".to_string())
}
