//! Records returned by the stores.

use std::collections::BTreeMap;

use crate::error::{ApiError, Result};
use crate::schema::EntityDef;
use crate::value::Value;

/// Records on the far side of a loaded relationship.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// A to-one relationship; `None` when no record is related.
    One(Option<Box<Record>>),
    /// A to-many relationship.
    Many(Vec<Record>),
}

/// A store entity instance: scalar attributes plus loaded relationships.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    entity: String,
    values: BTreeMap<String, Value>,
    relations: BTreeMap<String, Related>,
}

impl Record {
    /// Creates an empty record of the given entity.
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Sets an attribute, builder style.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Returns the entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Returns an attribute value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Returns an attribute value, treating an absent attribute as NULL.
    pub fn value(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&Value::Null)
    }

    /// Sets an attribute.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.values.insert(name.to_string(), value.into());
    }

    /// Iterates over the attributes.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns a loaded relationship.
    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    /// Stores a loaded relationship.
    pub fn set_relation(&mut self, name: &str, related: Related) {
        self.relations.insert(name.to_string(), related);
    }

    /// Fills every declared attribute that is absent with NULL.
    pub fn complete(&mut self, entity: &EntityDef) {
        for attr in &entity.attributes {
            self.values.entry(attr.name.clone()).or_insert(Value::Null);
        }
    }

    /// Builds a record from a JSON write payload.
    ///
    /// Every key must be a declared attribute and every value must coerce
    /// to the attribute's type.
    pub fn from_payload(
        entity: &EntityDef,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let mut record = Self::new(&entity.name);
        for (key, json) in payload {
            let attr = entity.attr(key).ok_or_else(|| {
                ApiError::BadRequest(format!("'{key}' is not an attribute of {}", entity.name))
            })?;
            let value = Value::from_json(json, attr.ty)
                .map_err(|message| ApiError::BadRequest(format!("{key}: {message}")))?;
            record.set(key, value);
        }
        Ok(record)
    }
}
