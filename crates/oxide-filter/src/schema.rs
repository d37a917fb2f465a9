//! Schema registry: entities, their attributes and relationships.
//!
//! Dotted filter paths such as `author.country.name` are resolved against
//! the registry when a filter is built, so unknown names fail before any
//! store access.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, FilterError};

/// The declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// 64-bit integer.
    Integer,
    /// Double precision float.
    Float,
    /// Arbitrary-precision decimal.
    Decimal,
    /// Text.
    Text,
    /// Boolean.
    Boolean,
    /// Timestamp without time zone.
    Timestamp,
}

impl AttributeType {
    /// Returns the lowercase name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }
}

/// How many records sit on the far side of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// At most one related record.
    One,
    /// An ordered collection of related records.
    Many,
}

/// A scalar attribute of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    /// Attribute (and column) name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub ty: AttributeType,
}

/// A named relationship from one entity to another.
///
/// Related records are those where `target.remote_key = owner.local_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
    /// Relationship name used in filters.
    pub name: String,
    /// Target entity name.
    pub target: String,
    /// Cardinality of the far side.
    pub cardinality: Cardinality,
    /// Key attribute on the owning entity.
    pub local_key: String,
    /// Key attribute on the target entity.
    pub remote_key: String,
    /// Name used for the nested value when serializing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
}

impl RelationshipDef {
    /// Creates a to-one relationship through a foreign key on the owner.
    pub fn one(name: &str, target: &str, local_key: &str, remote_key: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::One,
            local_key: local_key.to_string(),
            remote_key: remote_key.to_string(),
            external_name: None,
        }
    }

    /// Creates a to-many relationship through a foreign key on the target.
    pub fn many(name: &str, target: &str, local_key: &str, remote_key: &str) -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::one(name, target, local_key, remote_key)
        }
    }

    /// Sets the name used when serializing.
    #[must_use]
    pub fn external_name(mut self, name: &str) -> Self {
        self.external_name = Some(name.to_string());
        self
    }

    /// Returns the name used when serializing.
    pub fn serialized_name(&self) -> &str {
        self.external_name.as_deref().unwrap_or(&self.name)
    }

    /// Returns whether this relationship leads to many records.
    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }
}

/// An entity definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDef {
    /// Entity name.
    pub name: String,
    /// Table name in the relational store (defaults to the entity name).
    #[serde(default)]
    pub table: Option<String>,
    /// Primary key attribute.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Attributes in declaration order.
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    /// Relationships in declaration order.
    #[serde(default)]
    pub relationships: Vec<RelationshipDef>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl EntityDef {
    /// Creates an entity with an `id` primary key and no attributes.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            primary_key: default_primary_key(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Sets the table name.
    #[must_use]
    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Sets the primary key attribute.
    #[must_use]
    pub fn primary_key(mut self, name: &str) -> Self {
        self.primary_key = name.to_string();
        self
    }

    /// Adds an attribute.
    #[must_use]
    pub fn attribute(mut self, name: &str, ty: AttributeType) -> Self {
        self.attributes.push(AttributeDef {
            name: name.to_string(),
            ty,
        });
        self
    }

    /// Adds a relationship.
    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipDef) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Returns the table name.
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    /// Looks up an attribute.
    pub fn attr(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Looks up a relationship.
    pub fn rel(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Looks up an attribute, failing with a filter error.
    pub fn attribute_def(&self, name: &str) -> Result<&AttributeDef, FilterError> {
        self.attr(name).ok_or_else(|| FilterError::UnknownField {
            entity: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Looks up a relationship, failing with a filter error.
    pub fn relationship_def(&self, name: &str) -> Result<&RelationshipDef, FilterError> {
        self.rel(name).ok_or_else(|| FilterError::UnknownRelationship {
            entity: self.name.clone(),
            relationship: name.to_string(),
        })
    }

    /// Returns the attribute names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }
}

/// A dotted attribute path resolved against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedPath<'s> {
    /// Relationships traversed, in order, with their owning entities.
    pub hops: Vec<(&'s EntityDef, &'s RelationshipDef)>,
    /// Entity owning the terminal attribute.
    pub owner: &'s EntityDef,
    /// The terminal attribute.
    pub attribute: &'s AttributeDef,
}

impl ResolvedPath<'_> {
    /// Returns whether any traversed relationship leads to many records.
    pub fn crosses_many(&self) -> bool {
        self.hops.iter().any(|(_, rel)| rel.is_many())
    }
}

/// Registry mapping entity names to their definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, EntityDef>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity.
    #[must_use]
    pub fn register(mut self, entity: EntityDef) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Parses a registry from JSON and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let registry: Self = serde_json::from_str(json)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Loads a registry from a JSON file and validates it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Checks that every relationship and key refers to something declared.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, entity) in &self.entities {
            if name != &entity.name {
                return Err(ConfigError::InvalidSchema(format!(
                    "entity registered as '{name}' is named '{}'",
                    entity.name
                )));
            }
            if entity.attr(&entity.primary_key).is_none() {
                return Err(ConfigError::InvalidSchema(format!(
                    "primary key '{}' is not an attribute of '{name}'",
                    entity.primary_key
                )));
            }
            for rel in &entity.relationships {
                let target = self.entities.get(&rel.target).ok_or_else(|| {
                    ConfigError::InvalidSchema(format!(
                        "relationship '{name}.{}' targets unknown entity '{}'",
                        rel.name, rel.target
                    ))
                })?;
                if entity.attr(&rel.local_key).is_none() || target.attr(&rel.remote_key).is_none() {
                    return Err(ConfigError::InvalidSchema(format!(
                        "relationship '{name}.{}' uses undeclared keys",
                        rel.name
                    )));
                }
                if entity.attr(&rel.name).is_some() {
                    return Err(ConfigError::InvalidSchema(format!(
                        "'{name}.{}' is both an attribute and a relationship",
                        rel.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Looks up an entity.
    pub fn entity(&self, name: &str) -> Result<&EntityDef, FilterError> {
        self.entities
            .get(name)
            .ok_or_else(|| FilterError::UnknownEntity(name.to_string()))
    }

    /// Returns the registered entity names.
    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Resolves a dotted attribute path starting at `entity`.
    pub fn resolve_path<'s>(
        &'s self,
        entity: &'s EntityDef,
        path: &str,
    ) -> Result<ResolvedPath<'s>, FilterError> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(FilterError::Malformed(format!("invalid field path '{path}'")));
        }
        let (attribute, relationships) = segments
            .split_last()
            .ok_or_else(|| FilterError::Malformed("empty field path".to_string()))?;

        let mut owner = entity;
        let mut hops = Vec::with_capacity(relationships.len());
        for name in relationships {
            let rel = owner.relationship_def(name)?;
            hops.push((owner, rel));
            owner = self.entity(&rel.target)?;
        }

        Ok(ResolvedPath {
            hops,
            owner,
            attribute: owner.attribute_def(attribute)?,
        })
    }

    /// Resolves a chain of relationship names starting at `entity`.
    pub fn resolve_relationships<'s>(
        &'s self,
        entity: &'s EntityDef,
        names: &[&str],
    ) -> Result<Vec<(&'s EntityDef, &'s RelationshipDef)>, FilterError> {
        let mut owner = entity;
        let mut chain = Vec::with_capacity(names.len());
        for name in names {
            let rel = owner.relationship_def(name)?;
            chain.push((owner, rel));
            owner = self.entity(&rel.target)?;
        }
        Ok(chain)
    }
}
