//! Serialization of records and distinct rows into JSON-ready maps.

use serde::Serialize;
use serde_json::{Map, Value as Json};

use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::filter::IncludeTree;
use crate::record::{Record, Related};
use crate::schema::SchemaRegistry;
use crate::value::Value;

/// A serialized record: attribute and relationship names mapped to JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct SerializedRecord(Map<String, Json>);

impl SerializedRecord {
    /// Returns the value under `name`.
    pub fn get(&self, name: &str) -> Option<&Json> {
        self.0.get(name)
    }

    /// Returns the names in the record.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Converts into a JSON object.
    pub fn into_value(self) -> Json {
        Json::Object(self.0)
    }
}

impl From<SerializedRecord> for Json {
    fn from(record: SerializedRecord) -> Self {
        record.into_value()
    }
}

/// Turns records into [`SerializedRecord`]s, walking an include tree.
#[derive(Debug, Clone, Copy)]
pub struct Serializer<'s> {
    schema: &'s SchemaRegistry,
    max_depth: usize,
}

impl<'s> Serializer<'s> {
    /// Creates a serializer with the default include depth cap.
    pub fn new(schema: &'s SchemaRegistry) -> Self {
        Self {
            schema,
            max_depth: FilterConfig::default().max_include_depth,
        }
    }

    /// Sets the include depth cap.
    #[must_use]
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Serializes a record and the relationships named by `includes`.
    ///
    /// A missing to-one relationship serializes as `null`, a missing
    /// to-many one as `[]`.
    pub fn serialize(
        &self,
        record: &Record,
        includes: &IncludeTree,
    ) -> Result<SerializedRecord, FilterError> {
        self.serialize_at(record, includes, 0, record.entity())
    }

    /// Serializes a batch of records.
    pub fn serialize_all(
        &self,
        records: &[Record],
        includes: &IncludeTree,
    ) -> Result<Vec<SerializedRecord>, FilterError> {
        records
            .iter()
            .map(|r| self.serialize(r, includes))
            .collect()
    }

    fn serialize_at(
        &self,
        record: &Record,
        includes: &IncludeTree,
        depth: usize,
        path: &str,
    ) -> Result<SerializedRecord, FilterError> {
        let mut map: Map<String, Json> = record
            .values()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();

        if includes.is_empty() {
            return Ok(SerializedRecord(map));
        }
        if depth >= self.max_depth {
            return Err(FilterError::DepthExceeded {
                path: path.to_string(),
                max: self.max_depth,
            });
        }

        let entity = self.schema.entity(record.entity())?;
        for (name, subtree) in includes.children() {
            let rel = entity.relationship_def(name)?;
            let child_path = format!("{path}.{name}");
            let json = match record.relation(name) {
                Some(Related::One(Some(related))) => self
                    .serialize_at(related, subtree, depth + 1, &child_path)?
                    .into_value(),
                Some(Related::Many(related)) => Json::Array(
                    related
                        .iter()
                        .map(|r| {
                            self.serialize_at(r, subtree, depth + 1, &child_path)
                                .map(SerializedRecord::into_value)
                        })
                        .collect::<Result<_, _>>()?,
                ),
                Some(Related::One(None)) => Json::Null,
                None if rel.is_many() => Json::Array(Vec::new()),
                None => Json::Null,
            };
            map.insert(rel.serialized_name().to_string(), json);
        }
        Ok(SerializedRecord(map))
    }
}

/// Maps a positional distinct row back onto its field names.
///
/// A dotted name `a.b` nests as `{"a": {"b": value}}`.
pub fn map_distinct(fields: &[String], row: &[Value]) -> SerializedRecord {
    let mut map = Map::new();
    for (field, value) in fields.iter().zip(row) {
        let mut segments: Vec<&str> = field.split('.').collect();
        let Some(last) = segments.pop() else {
            continue;
        };
        let mut node = &mut map;
        for segment in segments {
            let entry = node
                .entry(segment.to_string())
                .or_insert_with(|| Json::Object(Map::new()));
            if !entry.is_object() {
                *entry = Json::Object(Map::new());
            }
            node = match entry {
                Json::Object(inner) => inner,
                _ => unreachable!("entry was just made an object"),
            };
        }
        node.insert(last.to_string(), value.to_json());
    }
    SerializedRecord(map)
}
