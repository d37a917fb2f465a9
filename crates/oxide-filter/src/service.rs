//! Request-level operations over any [`RecordStore`].
//!
//! Each operation parses the request's JSON filters, applies them to a
//! fresh query, runs it and serializes the result.

use serde_json::Value as Json;
use tracing::{debug, info};

use crate::backend::{QueryOutput, RecordStore};
use crate::error::{ApiError, FilterError, Result};
use crate::filter::{FilterFactory, FilterHandler, FilterSpec, IncludeTree, WhereClause};
use crate::query::QueryBuilder;
use crate::record::Record;
use crate::schema::EntityDef;
use crate::serialize::{map_distinct, SerializedRecord, Serializer};
use crate::value::Value;

fn handler_for<S: RecordStore>(store: &S, entity: &str, filters: &[Json]) -> Result<FilterHandler> {
    let factory = FilterFactory::new(store.schema(), entity, store.backend())?
        .max_include_depth(store.config().max_include_depth);
    let mut handler = FilterHandler::new();
    handler.add_all(factory.parse_all(filters)?)?;
    Ok(handler)
}

async fn fetch<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    handler: &FilterHandler,
) -> Result<Vec<SerializedRecord>> {
    let mut query = store.query(entity)?;
    handler.apply(&mut query)?;

    match store.execute(session_id, query).await? {
        QueryOutput::Records(records) => {
            let empty = IncludeTree::default();
            let includes = handler.include_tree().unwrap_or(&empty);
            Ok(Serializer::new(store.schema())
                .max_depth(store.config().max_include_depth)
                .serialize_all(&records, includes)?)
        }
        QueryOutput::Rows(rows) => {
            let fields = handler.distinct_fields().unwrap_or_default();
            Ok(rows.iter().map(|row| map_distinct(fields, row)).collect())
        }
        QueryOutput::Count(_) => Err(ApiError::BadRequest(
            "a record query returned a count".to_string(),
        )),
    }
}

/// Returns every record of `entity` matching `filters`.
pub async fn get_with_filters<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    filters: &[Json],
) -> Result<Vec<SerializedRecord>> {
    let handler = handler_for(store, entity, filters)?;
    let records = fetch(store, session_id, entity, &handler).await?;
    info!(entity = %entity, filters = filters.len(), results = records.len(), "fetched records");
    Ok(records)
}

/// Returns the first record of `entity` matching `filters`.
pub async fn get_one_with_filters<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    filters: &[Json],
) -> Result<SerializedRecord> {
    let handler = handler_for(store, entity, filters)?;
    fetch(store, session_id, entity, &handler)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::MissingRecord(format!("no {entity} matches the filters")))
}

/// Counts the records of `entity` matching `filters`.
///
/// Only `where` and `distinct` filters are accepted.
pub async fn count_with_filters<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    filters: &[Json],
) -> Result<u64> {
    let handler = handler_for(store, entity, filters)?;
    if let Some(other) = handler
        .filters()
        .iter()
        .find(|f| !matches!(f, FilterSpec::Where(_) | FilterSpec::Distinct(_)))
    {
        return Err(FilterError::Malformed(format!(
            "count does not accept '{}' filters",
            other.name()
        ))
        .into());
    }

    let mut query = store.query(entity)?;
    handler.apply(&mut query)?;
    query.set_count()?;
    match store.execute(session_id, query).await? {
        QueryOutput::Count(n) => {
            info!(entity = %entity, count = n, "counted records");
            Ok(n)
        }
        _ => Err(ApiError::BadRequest(
            "a count query returned records".to_string(),
        )),
    }
}

fn primary_key_value<S: RecordStore>(store: &S, entity: &str, id: &Json) -> Result<(EntityDef, Value)> {
    let def = store.schema().entity(entity)?;
    let ty = def.attribute_def(&def.primary_key)?.ty;
    let value = Value::from_json(id, ty)
        .map_err(|message| ApiError::BadRequest(format!("{}: {message}", def.primary_key)))?;
    if value.is_null() {
        return Err(ApiError::BadRequest(format!("{entity} needs a {}", def.primary_key)));
    }
    Ok((def.clone(), value))
}

/// Returns the record of `entity` whose primary key is `id`.
pub async fn get_by_id<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    id: &Json,
) -> Result<SerializedRecord> {
    let (def, id) = primary_key_value(store, entity, id)?;
    let mut handler = FilterHandler::new();
    handler.add(FilterSpec::Where(WhereClause::eq(&def.primary_key, id.clone())))?;
    fetch(store, session_id, entity, &handler)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::MissingRecord(format!("{entity} {id:?}")))
}

/// Checks that every to-one key set in `record` refers to a stored record.
async fn check_references<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &EntityDef,
    record: &Record,
) -> Result<()> {
    for rel in entity.relationships.iter().filter(|r| !r.is_many()) {
        if rel.local_key == entity.primary_key {
            continue;
        }
        let key = match record.get(&rel.local_key) {
            Some(key) if !key.is_null() => key,
            _ => continue,
        };
        let mut query = store.query(&rel.target)?;
        query.add_where(&WhereClause::eq(&rel.remote_key, key.clone()))?;
        query.set_count()?;
        debug!(relationship = %rel.name, "checking reference");
        if let QueryOutput::Count(0) = store.execute(session_id, query).await? {
            return Err(ApiError::BadRequest(format!(
                "{} {key:?} referenced by '{}' does not exist",
                rel.target, rel.local_key
            )));
        }
    }
    Ok(())
}

fn payload_record(entity: &EntityDef, payload: &Json) -> Result<Record> {
    let object = payload.as_object().ok_or_else(|| {
        ApiError::BadRequest(format!("{} payload must be an object", entity.name))
    })?;
    Record::from_payload(entity, object)
}

/// Creates a record of `entity` from a JSON object.
pub async fn create<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    payload: &Json,
) -> Result<SerializedRecord> {
    let def = store.schema().entity(entity)?.clone();
    let record = payload_record(&def, payload)?;
    check_references(store, session_id, &def, &record).await?;
    let created = store.insert(session_id, record).await?;
    Ok(Serializer::new(store.schema()).serialize(&created, &IncludeTree::default())?)
}

/// Updates a record of `entity`; the payload must carry the primary key.
pub async fn update<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    payload: &Json,
) -> Result<SerializedRecord> {
    let def = store.schema().entity(entity)?.clone();
    let record = payload_record(&def, payload)?;
    if !matches!(record.get(&def.primary_key), Some(id) if !id.is_null()) {
        return Err(ApiError::BadRequest(format!(
            "update of {entity} needs '{}'",
            def.primary_key
        )));
    }
    check_references(store, session_id, &def, &record).await?;
    let updated = store.update(session_id, record).await?;
    Ok(Serializer::new(store.schema()).serialize(&updated, &IncludeTree::default())?)
}

/// Deletes the record of `entity` whose primary key is `id`.
pub async fn delete_by_id<S: RecordStore>(
    store: &S,
    session_id: &str,
    entity: &str,
    id: &Json,
) -> Result<()> {
    let (_, id) = primary_key_value(store, entity, id)?;
    store.delete(session_id, entity, &id).await
}
