//! Parses JSON filter clauses into typed filter specs.

use serde_json::Value as Json;
use tracing::debug;

use super::{Direction, FilterSpec, IncludeTree, Operand, Operator, OrderClause, WhereClause};
use crate::backend::Backend;
use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::schema::{AttributeType, EntityDef, SchemaRegistry};
use crate::value::Value;

const FILTER_KEYS: [&str; 6] = ["where", "order", "skip", "limit", "include", "distinct"];

/// Builds filter specs for one entity on one backend.
///
/// Field names, relationships and operands are checked against the schema
/// registry here, so an invalid request fails before any store access.
#[derive(Debug, Clone)]
pub struct FilterFactory<'s> {
    schema: &'s SchemaRegistry,
    entity: &'s EntityDef,
    backend: Backend,
    max_include_depth: usize,
}

impl<'s> FilterFactory<'s> {
    /// Creates a factory for `entity`.
    pub fn new(
        schema: &'s SchemaRegistry,
        entity: &str,
        backend: Backend,
    ) -> Result<Self, FilterError> {
        Ok(Self {
            schema,
            entity: schema.entity(entity)?,
            backend,
            max_include_depth: FilterConfig::default().max_include_depth,
        })
    }

    /// Sets the deepest include tree accepted.
    #[must_use]
    pub fn max_include_depth(mut self, depth: usize) -> Self {
        self.max_include_depth = depth;
        self
    }

    /// Parses one filter object such as `{"where": {"id": {"eq": 1}}}`.
    ///
    /// A `where` object naming several fields yields one spec per field.
    pub fn parse(&self, clause: &Json) -> Result<Vec<FilterSpec>, FilterError> {
        let object = clause
            .as_object()
            .ok_or_else(|| FilterError::Malformed(format!("filter must be an object: {clause}")))?;
        let mut entries = object.iter();
        let (key, value) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(FilterError::Malformed(format!(
                    "filter must have exactly one of {FILTER_KEYS:?}: {clause}"
                )))
            }
        };

        let specs = match key.as_str() {
            "where" => self.parse_where(value)?,
            "order" => vec![self.parse_order(value)?],
            "skip" => vec![FilterSpec::Skip(self.parse_count("skip", value)?)],
            "limit" => vec![FilterSpec::Limit(self.parse_count("limit", value)?)],
            "include" => vec![self.parse_include(value)?],
            "distinct" => vec![self.parse_distinct(value)?],
            other => {
                return Err(FilterError::Malformed(format!(
                    "unknown filter '{other}', expected one of {FILTER_KEYS:?}"
                )))
            }
        };
        debug!(entity = %self.entity.name, filter = %key, "parsed filter");
        Ok(specs)
    }

    /// Parses a list of filter objects.
    pub fn parse_all<'j>(
        &self,
        clauses: impl IntoIterator<Item = &'j Json>,
    ) -> Result<Vec<FilterSpec>, FilterError> {
        let mut specs = Vec::new();
        for clause in clauses {
            specs.extend(self.parse(clause)?);
        }
        Ok(specs)
    }

    /// Parses query-string pairs such as `("where", r#"{"id":{"eq":1}}"#)`.
    ///
    /// Each value is JSON; `order`, `distinct` and `include` also accept a
    /// bare unquoted string.
    pub fn parse_query_params<'p>(
        &self,
        params: impl IntoIterator<Item = (&'p str, &'p str)>,
    ) -> Result<Vec<FilterSpec>, FilterError> {
        let mut specs = Vec::new();
        for (key, raw) in params {
            let value = match serde_json::from_str::<Json>(raw) {
                Ok(value) => value,
                Err(_) if matches!(key, "order" | "distinct" | "include") => {
                    Json::String(raw.to_string())
                }
                Err(err) => {
                    return Err(FilterError::Malformed(format!(
                        "'{key}' is not valid JSON: {err}"
                    )))
                }
            };
            let mut clause = serde_json::Map::new();
            clause.insert(key.to_string(), value);
            specs.extend(self.parse(&Json::Object(clause))?);
        }
        Ok(specs)
    }

    fn parse_where(&self, value: &Json) -> Result<Vec<FilterSpec>, FilterError> {
        let fields = value.as_object().ok_or_else(|| {
            FilterError::Malformed(format!("where must map fields to conditions: {value}"))
        })?;
        if fields.is_empty() {
            return Err(FilterError::Malformed("where names no field".to_string()));
        }

        let mut specs = Vec::with_capacity(fields.len());
        for (field, condition) in fields {
            let condition = condition.as_object().ok_or_else(|| {
                FilterError::Malformed(format!("condition for '{field}' must be an object"))
            })?;
            let mut ops = condition.iter();
            let (op, operand) = match (ops.next(), ops.next()) {
                (Some(entry), None) => entry,
                _ => {
                    return Err(FilterError::Malformed(format!(
                        "condition for '{field}' must have exactly one operator"
                    )))
                }
            };
            let operator: Operator = op.parse()?;
            let operand = self.parse_operand(field, operator, operand)?;
            specs.push(FilterSpec::Where(WhereClause {
                field: field.clone(),
                operator,
                operand,
            }));
        }
        Ok(specs)
    }

    fn parse_operand(
        &self,
        field: &str,
        operator: Operator,
        operand: &Json,
    ) -> Result<Operand, FilterError> {
        let path = self.schema.resolve_path(self.entity, field)?;
        let ty = path.attribute.ty;
        let invalid = |message: String| FilterError::InvalidValue {
            field: field.to_string(),
            message,
        };

        match operator {
            Operator::In => {
                let items = operand
                    .as_array()
                    .ok_or_else(|| invalid(format!("'in' needs a list, got {operand}")))?;
                let values = items
                    .iter()
                    .map(|item| Value::from_json(item, ty).map_err(invalid))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Operand::List(values))
            }
            Operator::Like | Operator::Nlike if ty != AttributeType::Text => Err(invalid(format!(
                "'{operator}' needs a text attribute, '{field}' is {ty:?}"
            ))),
            Operator::Like | Operator::Nlike => match operand {
                Json::String(s) => Ok(Operand::Value(Value::Text(s.clone()))),
                other => Err(invalid(format!("'{operator}' needs a string, got {other}"))),
            },
            Operator::Eq | Operator::Ne => Value::from_json(operand, ty)
                .map(Operand::Value)
                .map_err(invalid),
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
                if operand.is_null() {
                    return Err(invalid(format!("'{operator}' cannot compare with null")));
                }
                Value::from_json(operand, ty)
                    .map(Operand::Value)
                    .map_err(invalid)
            }
        }
    }

    fn parse_order(&self, value: &Json) -> Result<FilterSpec, FilterError> {
        let text = value.as_str().ok_or_else(|| {
            FilterError::Malformed(format!("order must be \"field DIRECTION\", got {value}"))
        })?;
        let parts: Vec<&str> = text.split_whitespace().collect();
        let [field, direction] = parts.as_slice() else {
            return Err(FilterError::Malformed(format!(
                "order must be \"field DIRECTION\", got \"{text}\""
            )));
        };
        self.schema.resolve_path(self.entity, field)?;
        Ok(FilterSpec::Order(OrderClause {
            field: (*field).to_string(),
            direction: Direction::parse(direction)?,
        }))
    }

    fn parse_count(&self, name: &str, value: &Json) -> Result<i64, FilterError> {
        let n = value
            .as_i64()
            .ok_or_else(|| FilterError::Malformed(format!("{name} must be an integer, got {value}")))?;
        // The relational store reports negative values when the query runs.
        if n < 0 && self.backend == Backend::Catalog {
            return Err(FilterError::InvalidValue {
                field: name.to_string(),
                message: "must not be negative".to_string(),
            });
        }
        Ok(n)
    }

    fn parse_include(&self, value: &Json) -> Result<FilterSpec, FilterError> {
        let tree = IncludeTree::parse(value)?;
        tree.validate(self.schema, self.entity, self.max_include_depth)?;
        Ok(FilterSpec::Include(tree))
    }

    fn parse_distinct(&self, value: &Json) -> Result<FilterSpec, FilterError> {
        let fields: Vec<String> = match value {
            Json::String(field) => vec![field.clone()],
            Json::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        FilterError::Malformed(format!("distinct fields must be strings: {item}"))
                    })
                })
                .collect::<Result<_, _>>()?,
            other => {
                return Err(FilterError::Malformed(format!(
                    "distinct must be a string or list, got {other}"
                )))
            }
        };
        if fields.is_empty() {
            return Err(FilterError::Malformed("distinct names no field".to_string()));
        }
        for field in &fields {
            self.schema.resolve_path(self.entity, field)?;
        }
        Ok(FilterSpec::Distinct(fields))
    }
}
