//! Relational store over SQLite.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::NaiveDateTime;
use futures::future::BoxFuture;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, error, info, warn};

use super::{Backend, QueryOutput, RecordStore};
use crate::config::FilterConfig;
use crate::error::{ApiError, FilterError, Result};
use crate::filter::IncludeTree;
use crate::query::{AggregateMode, QueryBuilder, RelationalQuery};
use crate::record::{Record, Related};
use crate::schema::{AttributeType, EntityDef, SchemaRegistry};
use crate::value::Value;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// One unit of work against the relational store.
///
/// Wraps a transaction: [`StoreSession::close`] commits on success and
/// rolls back on failure. A session dropped without closing rolls back.
pub struct StoreSession {
    tx: Transaction<'static, Sqlite>,
    id: String,
}

impl StoreSession {
    /// Opens a session on a pooled connection.
    pub async fn begin(pool: &SqlitePool, session_id: &str) -> Result<Self> {
        let tx = pool.begin().await?;
        debug!(session = %session_id, "store session opened");
        Ok(Self {
            tx,
            id: session_id.to_string(),
        })
    }

    /// Returns the session's connection.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Ends the session according to `outcome` and passes it through.
    pub async fn close<T>(self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.tx.commit().await?;
                debug!(session = %self.id, "store session committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.tx.rollback().await {
                    error!(session = %self.id, error = %rollback, "rollback failed");
                }
                warn!(session = %self.id, error = %err, "store session rolled back");
                Err(err)
            }
        }
    }
}

/// Relational record store backed by a SQLite pool.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: SqlitePool,
    schema: Arc<SchemaRegistry>,
    config: FilterConfig,
}

impl RelationalStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: SqlitePool, schema: Arc<SchemaRegistry>, config: FilterConfig) -> Self {
        Self {
            pool,
            schema,
            config,
        }
    }

    /// Connects to `url` with a pool sized and timed by `config`.
    pub async fn connect(
        url: &str,
        schema: Arc<SchemaRegistry>,
        config: FilterConfig,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(u32::try_from(config.client_pool_size).unwrap_or(u32::MAX).max(1))
            .acquire_timeout(config.pool_acquire_timeout())
            .connect(url)
            .await?;
        info!(url = %url, "connected to relational store");
        Ok(Self::new(pool, schema, config))
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run(&self, session: &mut StoreSession, query: &RelationalQuery<'_>) -> Result<QueryOutput> {
        match query.aggregate() {
            AggregateMode::Count | AggregateMode::CountDistinct => {
                let (sql, params) = query.to_count();
                debug!(sql = %sql, "Executing SQL");
                let row = bind_all(sqlx::query(&sql), params)
                    .fetch_one(session.conn())
                    .await?;
                let count: i64 = row.try_get(0)?;
                Ok(QueryOutput::Count(u64::try_from(count).unwrap_or(0)))
            }
            AggregateMode::Distinct => {
                let (sql, params) = query.to_select();
                debug!(sql = %sql, "Executing SQL");
                let types = query.projection_types();
                let rows = bind_all(sqlx::query(&sql), params)
                    .fetch_all(session.conn())
                    .await?;
                let tuples = rows
                    .iter()
                    .map(|row| {
                        types
                            .iter()
                            .enumerate()
                            .map(|(i, ty)| decode_value(row, i, *ty))
                            .collect::<std::result::Result<Vec<_>, _>>()
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(QueryOutput::Rows(tuples))
            }
            AggregateMode::None => {
                let (sql, params) = query.to_select();
                debug!(sql = %sql, "Executing SQL");
                let entity = query.entity_def();
                let rows = bind_all(sqlx::query(&sql), params)
                    .fetch_all(session.conn())
                    .await?;
                let mut records = rows
                    .iter()
                    .map(|row| decode_record(entity, row))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                self.load_includes(session, entity, &mut records, query.includes())
                    .await?;
                Ok(QueryOutput::Records(records))
            }
        }
    }

    /// Attaches the relationships named by `tree`, one query per relationship.
    fn load_includes<'a>(
        &'a self,
        session: &'a mut StoreSession,
        entity: &'a EntityDef,
        records: &'a mut [Record],
        tree: &'a IncludeTree,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(());
            }
            for (name, subtree) in tree.children() {
                let rel = entity.relationship_def(name)?;
                let target = self.schema.entity(&rel.target)?;

                let mut keys: Vec<Value> = Vec::new();
                for record in records.iter() {
                    let key = record.value(&rel.local_key);
                    if !key.is_null() && !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }

                let mut related = if keys.is_empty() {
                    Vec::new()
                } else {
                    let placeholders = vec!["?"; keys.len()].join(", ");
                    let sql = format!(
                        "SELECT {} FROM {} WHERE {} IN ({placeholders}) ORDER BY {}",
                        target.column_names().join(", "),
                        target.table_name(),
                        rel.remote_key,
                        target.primary_key,
                    );
                    debug!(sql = %sql, relationship = %name, "Executing SQL");
                    let rows = bind_all(sqlx::query(&sql), keys)
                        .fetch_all(session.conn())
                        .await?;
                    rows.iter()
                        .map(|row| decode_record(target, row))
                        .collect::<std::result::Result<Vec<_>, _>>()?
                };

                self.load_includes(session, target, &mut related, subtree)
                    .await?;

                for record in records.iter_mut() {
                    let key = record.value(&rel.local_key).clone();
                    let mut matches = related
                        .iter()
                        .filter(|r| r.value(&rel.remote_key).compare(&key) == Some(Ordering::Equal))
                        .cloned();
                    let value = if rel.is_many() {
                        Related::Many(matches.collect())
                    } else {
                        Related::One(matches.next().map(Box::new))
                    };
                    record.set_relation(name, value);
                }
            }
            Ok(())
        })
    }

    async fn fetch_by_pk(
        &self,
        session: &mut StoreSession,
        entity: &EntityDef,
        id: &Value,
    ) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            entity.column_names().join(", "),
            entity.table_name(),
            entity.primary_key
        );
        debug!(sql = %sql, "Executing SQL");
        let row = bind_value(sqlx::query(&sql), id.clone())
            .fetch_optional(session.conn())
            .await?;
        row.map(|row| decode_record(entity, &row))
            .transpose()
            .map_err(ApiError::from)
    }

    async fn insert_in(&self, session: &mut StoreSession, record: &Record) -> Result<Record> {
        let entity = self.schema.entity(record.entity())?;
        let (columns, values): (Vec<&str>, Vec<Value>) = record
            .values()
            .filter(|(name, _)| entity.attr(name).is_some())
            .map(|(name, value)| (name, value.clone()))
            .unzip();

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", entity.table_name())
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                entity.table_name(),
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };
        debug!(sql = %sql, "Executing SQL");
        let result = bind_all(sqlx::query(&sql), values)
            .execute(session.conn())
            .await?;

        let id = match record.get(&entity.primary_key) {
            Some(id) if !id.is_null() => id.clone(),
            _ => Value::Int(result.last_insert_rowid()),
        };
        self.fetch_by_pk(session, entity, &id)
            .await?
            .ok_or_else(|| ApiError::MissingRecord(format!("{} {id:?}", entity.name)))
    }

    async fn update_in(&self, session: &mut StoreSession, record: &Record) -> Result<Record> {
        let entity = self.schema.entity(record.entity())?;
        let id = match record.get(&entity.primary_key) {
            Some(id) if !id.is_null() => id.clone(),
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "update of {} needs '{}'",
                    entity.name, entity.primary_key
                )))
            }
        };

        let (columns, mut values): (Vec<&str>, Vec<Value>) = record
            .values()
            .filter(|(name, _)| *name != entity.primary_key && entity.attr(name).is_some())
            .map(|(name, value)| (name, value.clone()))
            .unzip();

        if !columns.is_empty() {
            let assignments: Vec<String> = columns.iter().map(|c| format!("{c} = ?")).collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                entity.table_name(),
                assignments.join(", "),
                entity.primary_key
            );
            debug!(sql = %sql, "Executing SQL");
            values.push(id.clone());
            let result = bind_all(sqlx::query(&sql), values)
                .execute(session.conn())
                .await?;
            if result.rows_affected() == 0 {
                return Err(ApiError::MissingRecord(format!("{} {id:?}", entity.name)));
            }
        }

        self.fetch_by_pk(session, entity, &id)
            .await?
            .ok_or_else(|| ApiError::MissingRecord(format!("{} {id:?}", entity.name)))
    }

    async fn delete_in(&self, session: &mut StoreSession, entity: &str, id: &Value) -> Result<()> {
        let entity = self.schema.entity(entity)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            entity.table_name(),
            entity.primary_key
        );
        debug!(sql = %sql, "Executing SQL");
        let result = bind_value(sqlx::query(&sql), id.clone())
            .execute(session.conn())
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::MissingRecord(format!("{} {id:?}", entity.name)));
        }
        Ok(())
    }
}

impl RecordStore for RelationalStore {
    type Query<'s>
        = RelationalQuery<'s>
    where
        Self: 's;

    fn backend(&self) -> Backend {
        Backend::Relational
    }

    fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn query(&self, entity: &str) -> std::result::Result<RelationalQuery<'_>, FilterError> {
        RelationalQuery::new(&self.schema, entity, self.config.max_join_hops)
    }

    async fn execute<'q>(
        &'q self,
        session_id: &str,
        query: RelationalQuery<'q>,
    ) -> Result<QueryOutput> {
        query.check_pagination()?;
        let mut session = StoreSession::begin(&self.pool, session_id).await?;
        let outcome = self.run(&mut session, &query).await;
        session.close(outcome).await
    }

    async fn insert(&self, session_id: &str, record: Record) -> Result<Record> {
        let mut session = StoreSession::begin(&self.pool, session_id).await?;
        let outcome = self.insert_in(&mut session, &record).await;
        let created = session.close(outcome).await?;
        info!(entity = %created.entity(), "record created");
        Ok(created)
    }

    async fn update(&self, session_id: &str, record: Record) -> Result<Record> {
        let mut session = StoreSession::begin(&self.pool, session_id).await?;
        let outcome = self.update_in(&mut session, &record).await;
        let updated = session.close(outcome).await?;
        info!(entity = %updated.entity(), "record updated");
        Ok(updated)
    }

    async fn delete(&self, session_id: &str, entity: &str, id: &Value) -> Result<()> {
        let mut session = StoreSession::begin(&self.pool, session_id).await?;
        let outcome = self.delete_in(&mut session, entity, id).await;
        session.close(outcome).await?;
        info!(entity = %entity, "record deleted");
        Ok(())
    }
}

fn bind_all(query: SqliteQuery<'_>, values: Vec<Value>) -> SqliteQuery<'_> {
    values.into_iter().fold(query, bind_value)
}

/// Binds a value to a raw query.
fn bind_value(query: SqliteQuery<'_>, value: Value) -> SqliteQuery<'_> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Decimal(d) => query.bind(d.to_f64()),
        Value::Text(s) => query.bind(s),
        Value::Timestamp(ts) => query.bind(ts),
    }
}

fn decode_record(entity: &EntityDef, row: &SqliteRow) -> std::result::Result<Record, sqlx::Error> {
    let mut record = Record::new(&entity.name);
    for (i, attr) in entity.attributes.iter().enumerate() {
        record.set(&attr.name, decode_value(row, i, attr.ty)?);
    }
    Ok(record)
}

/// Decodes a column by its declared type. SQLite columns carry no strict
/// type, so decoding is unchecked.
fn decode_value(
    row: &SqliteRow,
    index: usize,
    ty: AttributeType,
) -> std::result::Result<Value, sqlx::Error> {
    Ok(match ty {
        AttributeType::Integer => row.try_get_unchecked::<Option<i64>, _>(index)?.into(),
        AttributeType::Float => row.try_get_unchecked::<Option<f64>, _>(index)?.into(),
        AttributeType::Decimal => row
            .try_get_unchecked::<Option<f64>, _>(index)?
            .and_then(Decimal::from_f64)
            .into(),
        AttributeType::Text => row.try_get_unchecked::<Option<String>, _>(index)?.into(),
        AttributeType::Boolean => row.try_get_unchecked::<Option<bool>, _>(index)?.into(),
        AttributeType::Timestamp => row
            .try_get_unchecked::<Option<NaiveDateTime>, _>(index)?
            .into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterHandler, FilterSpec, WhereClause};

    async fn setup_store(config: FilterConfig) -> RelationalStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.pool_acquire_timeout())
            .connect(":memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT NOT NULL, \
             weight REAL, pinned INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let schema = SchemaRegistry::new().register(
            EntityDef::new("Tag")
                .table("tags")
                .attribute("id", AttributeType::Integer)
                .attribute("label", AttributeType::Text)
                .attribute("weight", AttributeType::Decimal)
                .attribute("pinned", AttributeType::Boolean),
        );
        RelationalStore::new(pool, Arc::new(schema), config)
    }

    async fn count_tags(store: &RelationalStore) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tags")
            .fetch_one(store.pool())
            .await
            .unwrap();
        row.0
    }

    #[tokio::test]
    async fn test_session_commits_on_success() {
        let store = setup_store(FilterConfig::default()).await;
        let mut session = StoreSession::begin(store.pool(), "s1").await.unwrap();
        sqlx::query("INSERT INTO tags (label) VALUES ('kept')")
            .execute(session.conn())
            .await
            .unwrap();
        session.close(Ok(())).await.unwrap();
        assert_eq!(count_tags(&store).await, 1);
    }

    #[tokio::test]
    async fn test_session_rolls_back_on_error() {
        let store = setup_store(FilterConfig::default()).await;
        let mut session = StoreSession::begin(store.pool(), "s1").await.unwrap();
        sqlx::query("INSERT INTO tags (label) VALUES ('lost')")
            .execute(session.conn())
            .await
            .unwrap();
        let outcome: Result<()> = Err(ApiError::BadRequest("boom".into()));
        assert!(session.close(outcome).await.is_err());
        assert_eq!(count_tags(&store).await, 0);
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back() {
        let store = setup_store(FilterConfig::default()).await;
        {
            let mut session = StoreSession::begin(store.pool(), "s1").await.unwrap();
            sqlx::query("INSERT INTO tags (label) VALUES ('lost')")
                .execute(session.conn())
                .await
                .unwrap();
        }
        assert_eq!(count_tags(&store).await, 0);
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let store = setup_store(FilterConfig::default()).await;
        let created = store
            .insert(
                "s1",
                Record::new("Tag")
                    .with("label", "rust")
                    .with("weight", Decimal::new(125, 1))
                    .with("pinned", true),
            )
            .await
            .unwrap();
        assert_eq!(created.get("id"), Some(&Value::Int(1)));
        assert_eq!(created.get("weight"), Some(&Value::Decimal(Decimal::new(125, 1))));
        assert_eq!(created.get("pinned"), Some(&Value::Bool(true)));

        let updated = store
            .update("s1", Record::new("Tag").with("id", 1).with("label", "sql"))
            .await
            .unwrap();
        assert_eq!(updated.value("label"), &Value::from("sql"));
        assert_eq!(updated.value("pinned"), &Value::Bool(true));

        store.delete("s1", "Tag", &Value::Int(1)).await.unwrap();
        assert!(matches!(
            store.delete("s1", "Tag", &Value::Int(1)).await,
            Err(ApiError::MissingRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_update_needs_primary_key() {
        let store = setup_store(FilterConfig::default()).await;
        let err = store
            .update("s1", Record::new("Tag").with("label", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = store
            .update("s1", Record::new("Tag").with("id", 9).with("label", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MissingRecord(_)));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_trace() {
        let store = setup_store(FilterConfig::default()).await;
        let err = store
            .insert("s1", Record::new("Tag").with("weight", 1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(count_tags(&store).await, 0);
    }

    #[tokio::test]
    async fn test_execute_with_filters() {
        let store = setup_store(FilterConfig::default()).await;
        for label in ["a", "b", "c"] {
            store
                .insert("s1", Record::new("Tag").with("label", label))
                .await
                .unwrap();
        }
        let mut handler = FilterHandler::new();
        handler
            .add(FilterSpec::Where(WhereClause::eq("label", "b")))
            .unwrap();
        let mut query = store.query("Tag").unwrap();
        handler.apply(&mut query).unwrap();
        let QueryOutput::Records(records) = store.execute("s1", query).await.unwrap() else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value("id"), &Value::Int(2));
    }

    #[tokio::test]
    async fn test_negative_limit_is_bad_request() {
        let store = setup_store(FilterConfig::default()).await;
        let mut query = store.query("Tag").unwrap();
        query.set_limit(-2).unwrap();
        assert!(matches!(
            store.execute("s1", query).await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let config = FilterConfig {
            pool_acquire_timeout_ms: 50,
            ..FilterConfig::default()
        };
        let store = setup_store(config).await;
        let _held = StoreSession::begin(store.pool(), "holder").await.unwrap();
        let query = store.query("Tag").unwrap();
        assert!(matches!(
            store.execute("s2", query).await,
            Err(ApiError::BadRequest(_))
        ));
    }
}
