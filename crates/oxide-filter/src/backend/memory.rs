//! In-memory catalog client.
//!
//! Evaluates catalog queries over records held in memory, with the same
//! join semantics as the relational store: a relationship prefix is joined
//! once, so every condition on a prefix sees the same related record.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::catalog::{CatalogClient, CatalogError, CatalogRow};
use crate::filter::{Direction, IncludeTree, JoinKind};
use crate::query::{AggregateMode, CatalogQuery, QueryBuilder};
use crate::record::{Record, Related};
use crate::schema::{EntityDef, RelationshipDef, SchemaRegistry};
use crate::value::Value;

type Tables = BTreeMap<String, Vec<Record>>;

/// The related record joined for each relationship prefix, `None` when the
/// outer join found nothing.
type Binding = BTreeMap<String, Option<Record>>;

/// A catalog client over an in-memory record set.
///
/// Clones share the same records, so a pool of clients sees one catalog.
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    tables: Arc<RwLock<Tables>>,
    schema: Arc<SchemaRegistry>,
    sessions: Option<Arc<BTreeSet<String>>>,
    session_id: String,
}

impl InMemoryCatalog {
    /// Creates an empty catalog accepting any non-empty session id.
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::new())),
            schema,
            sessions: None,
            session_id: String::new(),
        }
    }

    /// Accepts only the given session ids.
    #[must_use]
    pub fn with_sessions<'a>(mut self, sessions: impl IntoIterator<Item = &'a str>) -> Self {
        self.sessions = Some(Arc::new(
            sessions.into_iter().map(str::to_string).collect(),
        ));
        self
    }

    /// Stores records as given, bypassing validation.
    pub async fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut tables = self.tables.write().await;
        for record in records {
            tables
                .entry(record.entity().to_string())
                .or_default()
                .push(record);
        }
        for (name, rows) in tables.iter_mut() {
            if let Ok(entity) = self.schema.entity(name) {
                sort_by_pk(entity, rows);
            }
        }
    }

    /// Returns how many records of `entity` are stored.
    pub async fn len(&self, entity: &str) -> usize {
        self.tables.read().await.get(entity).map_or(0, Vec::len)
    }

    fn check_session(&self) -> Result<(), CatalogError> {
        if self.session_id.is_empty() {
            return Err(CatalogError::Session("no session".to_string()));
        }
        match &self.sessions {
            Some(sessions) if !sessions.contains(&self.session_id) => Err(CatalogError::Session(
                format!("session '{}' is not valid", self.session_id),
            )),
            _ => Ok(()),
        }
    }

    fn entity(&self, name: &str) -> Result<&EntityDef, CatalogError> {
        self.schema
            .entity(name)
            .map_err(|err| CatalogError::Validation(err.to_string()))
    }

    fn related<'t>(tables: &'t Tables, owner: &Record, rel: &RelationshipDef) -> Vec<&'t Record> {
        let key = owner.value(&rel.local_key);
        tables
            .get(&rel.target)
            .into_iter()
            .flatten()
            .filter(|r| r.value(&rel.remote_key).compare(key) == Some(Ordering::Equal))
            .collect()
    }

    /// Joins every prefix onto `record`, one binding per combination.
    fn expand(
        tables: &Tables,
        record: &Record,
        prefixes: &[(String, &RelationshipDef)],
    ) -> Vec<Binding> {
        let mut bindings = vec![Binding::new()];
        for (prefix, rel) in prefixes {
            let parent = prefix.rsplit_once('.').map(|(p, _)| p);
            let mut next = Vec::with_capacity(bindings.len());
            for binding in bindings {
                let owner = match parent {
                    None => Some(record),
                    Some(parent) => binding.get(parent).and_then(Option::as_ref),
                };
                let related = owner.map(|o| Self::related(tables, o, rel)).unwrap_or_default();
                if related.is_empty() {
                    let mut binding = binding;
                    binding.insert(prefix.clone(), None);
                    next.push(binding);
                } else {
                    for r in related {
                        let mut binding = binding.clone();
                        binding.insert(prefix.clone(), Some(r.clone()));
                        next.push(binding);
                    }
                }
            }
            bindings = next;
        }
        bindings
    }

    fn attach(
        &self,
        tables: &Tables,
        entity: &EntityDef,
        record: &mut Record,
        tree: &IncludeTree,
    ) -> Result<(), CatalogError> {
        for (name, subtree) in tree.children() {
            let rel = entity
                .relationship_def(name)
                .map_err(|err| CatalogError::Validation(err.to_string()))?;
            let target = self.entity(&rel.target)?;
            let mut related: Vec<Record> = Self::related(tables, record, rel)
                .into_iter()
                .cloned()
                .collect();
            for r in &mut related {
                self.attach(tables, target, r, subtree)?;
            }
            let value = if rel.is_many() {
                Related::Many(related)
            } else {
                Related::One(related.into_iter().next().map(Box::new))
            };
            record.set_relation(name, value);
        }
        Ok(())
    }
}

fn sort_by_pk(entity: &EntityDef, rows: &mut [Record]) {
    rows.sort_by(|a, b| {
        a.value(&entity.primary_key)
            .sort_cmp(b.value(&entity.primary_key))
    });
}

/// Reads a dotted path from a record and its joined relations.
fn path_value(record: &Record, binding: &Binding, path: &str) -> Value {
    match path.rsplit_once('.') {
        None => record.value(path).clone(),
        Some((prefix, attribute)) => binding
            .get(prefix)
            .and_then(Option::as_ref)
            .map_or(Value::Null, |r| r.value(attribute).clone()),
    }
}

/// Returns every relationship prefix of `path`, shortest first.
fn prefixes_of(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('.').map(move |(i, _)| &path[..i])
}

fn paginate<T>(rows: Vec<T>, limit: Option<(u64, u64)>) -> Vec<T> {
    match limit {
        Some((skip, limit)) => rows
            .into_iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect(),
        None => rows,
    }
}

fn to_count(n: usize) -> CatalogRow {
    CatalogRow::Scalar(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
}

impl CatalogClient for InMemoryCatalog {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn set_session_id(&mut self, session_id: &str) {
        self.session_id = session_id.to_string();
    }

    async fn search(&self, query: &CatalogQuery<'_>) -> Result<Vec<CatalogRow>, CatalogError> {
        self.check_session()?;
        let tables = self.tables.read().await;
        let entity = query.entity_def();
        debug!(session = %self.session_id, query = %query, "in-memory search");

        // Every relationship prefix named anywhere in the query is joined.
        let paths = query
            .conditions()
            .keys()
            .chain(query.order().iter().map(|(field, _)| field))
            .chain(query.attributes());
        let names: BTreeSet<&str> = paths.flat_map(|p| prefixes_of(p)).collect();
        let mut prefixes = Vec::with_capacity(names.len());
        for prefix in names {
            let segments: Vec<&str> = prefix.split('.').collect();
            let chain = self
                .schema
                .resolve_relationships(entity, &segments)
                .map_err(|err| CatalogError::Validation(err.to_string()))?;
            if let Some((_, rel)) = chain.last() {
                prefixes.push((prefix.to_string(), *rel));
            }
        }

        // Ordering through a to-many prefix is an inner join unless the
        // query asks for an outer one.
        let inner: Vec<&str> = prefixes
            .iter()
            .filter(|(prefix, rel)| {
                rel.is_many()
                    && query.join_specs().get(prefix) != Some(&JoinKind::LeftOuter)
                    && query
                        .order()
                        .iter()
                        .any(|(field, _)| prefixes_of(field).any(|p| p == prefix.as_str()))
            })
            .map(|(prefix, _)| prefix.as_str())
            .collect();

        let mut matched: Vec<(&Record, Binding)> = Vec::new();
        for record in tables.get(&entity.name).into_iter().flatten() {
            for binding in Self::expand(&tables, record, &prefixes) {
                let joined = inner
                    .iter()
                    .all(|p| binding.get(*p).is_some_and(Option::is_some));
                let selected = query.conditions().iter().all(|(path, conditions)| {
                    let value = path_value(record, &binding, path);
                    conditions.iter().all(|c| c.matches(&value))
                });
                if joined && selected {
                    matched.push((record, binding));
                }
            }
        }

        matched.sort_by(|(ra, ba), (rb, bb)| {
            for (field, direction) in query.order() {
                let ord = path_value(ra, ba, field).sort_cmp(&path_value(rb, bb, field));
                let ord = match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        match query.aggregate() {
            AggregateMode::None | AggregateMode::Count => {
                let mut seen: Vec<&Value> = Vec::new();
                let mut records = Vec::new();
                for (record, _) in &matched {
                    let id = record.value(&entity.primary_key);
                    if !seen.contains(&id) {
                        seen.push(id);
                        records.push(*record);
                    }
                }
                if query.aggregate() == AggregateMode::Count {
                    return Ok(vec![to_count(records.len())]);
                }
                paginate(records, query.limit())
                    .into_iter()
                    .map(|record| -> Result<CatalogRow, CatalogError> {
                        let mut record = record.clone();
                        self.attach(&tables, entity, &mut record, query.includes())?;
                        Ok(CatalogRow::Entity(record))
                    })
                    .collect()
            }
            mode @ (AggregateMode::Distinct | AggregateMode::CountDistinct) => {
                let attributes = query.attributes();
                if mode == AggregateMode::CountDistinct && attributes.len() > 1 {
                    return Err(CatalogError::Internal("aggregation error".to_string()));
                }
                let mut tuples: Vec<Vec<Value>> = Vec::new();
                for (record, binding) in &matched {
                    let tuple: Vec<Value> = attributes
                        .iter()
                        .map(|a| path_value(record, binding, a))
                        .collect();
                    if !tuples.contains(&tuple) {
                        tuples.push(tuple);
                    }
                }
                if mode == AggregateMode::CountDistinct {
                    return Ok(vec![to_count(tuples.len())]);
                }
                Ok(paginate(tuples, query.limit())
                    .into_iter()
                    .map(|mut tuple| {
                        if tuple.len() == 1 {
                            CatalogRow::Scalar(tuple.remove(0))
                        } else {
                            CatalogRow::Tuple(tuple)
                        }
                    })
                    .collect())
            }
        }
    }

    async fn create(&self, record: Record) -> Result<Record, CatalogError> {
        self.check_session()?;
        let entity = self.entity(record.entity())?;
        let mut record = record;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(entity.name.clone()).or_default();

        let pk = &entity.primary_key;
        if record.value(pk).is_null() {
            let next = rows
                .iter()
                .filter_map(|r| match r.value(pk) {
                    Value::Int(n) => Some(*n),
                    _ => None,
                })
                .max()
                .unwrap_or(0)
                + 1;
            record.set(pk, next);
        } else if rows.iter().any(|r| r.value(pk) == record.value(pk)) {
            return Err(CatalogError::Validation(format!(
                "{} {:?} already exists",
                entity.name,
                record.value(pk)
            )));
        }

        record.complete(entity);
        rows.push(record.clone());
        sort_by_pk(entity, rows);
        Ok(record)
    }

    async fn update(&self, record: Record) -> Result<Record, CatalogError> {
        self.check_session()?;
        let entity = self.entity(record.entity())?;
        let pk = &entity.primary_key;
        let mut tables = self.tables.write().await;
        let stored = tables
            .get_mut(&entity.name)
            .and_then(|rows| rows.iter_mut().find(|r| r.value(pk) == record.value(pk)))
            .ok_or_else(|| {
                CatalogError::NoSuchObject(format!("{} {:?}", entity.name, record.value(pk)))
            })?;
        for (name, value) in record.values() {
            stored.set(name, value.clone());
        }
        Ok(stored.clone())
    }

    async fn delete(&self, entity: &str, id: &Value) -> Result<(), CatalogError> {
        self.check_session()?;
        let entity = self.entity(entity)?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(entity.name.clone()).or_default();
        let before = rows.len();
        rows.retain(|r| r.value(&entity.primary_key) != id);
        if rows.len() == before {
            return Err(CatalogError::NoSuchObject(format!("{} {id:?}", entity.name)));
        }
        Ok(())
    }
}
