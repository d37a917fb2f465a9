//! Query builder for the remote catalog.
//!
//! The catalog takes conditions as a map from attribute path to condition
//! strings, a complete ordering list that replaces any previous one, join
//! specifications per relationship prefix and a single `(skip, limit)` pair.

use std::collections::BTreeMap;
use std::fmt;

use crate::backend::Backend;
use crate::error::FilterError;
use crate::filter::{
    Direction, IncludeTree, JoinKind, Operand, Operator, OrderClause, QueryBuildContext,
    WhereClause,
};
use crate::schema::{EntityDef, SchemaRegistry};
use crate::value::{Value, TIMESTAMP_FORMAT};

use super::{AggregateMode, QueryBuilder};

/// One condition on an attribute path.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Comparison operator.
    pub operator: Operator,
    /// Operand; `like` patterns already carry their `%` wildcards.
    pub operand: Operand,
}

impl Condition {
    /// Returns whether `value` satisfies this condition.
    ///
    /// Comparisons with NULL are false, as in SQL.
    pub fn matches(&self, value: &Value) -> bool {
        match (self.operator, &self.operand) {
            (Operator::Eq, Operand::Value(Value::Null)) => value.is_null(),
            (Operator::Ne, Operand::Value(Value::Null)) => !value.is_null(),
            (Operator::In, Operand::List(items)) => items
                .iter()
                .any(|item| value.compare(item) == Some(std::cmp::Ordering::Equal)),
            (Operator::Like, Operand::Value(Value::Text(pattern))) => {
                !value.is_null() && value.matches_like(pattern)
            }
            (Operator::Nlike, Operand::Value(Value::Text(pattern))) => {
                !value.is_null() && !value.matches_like(pattern)
            }
            (op, Operand::Value(operand)) => {
                use std::cmp::Ordering::{Equal, Greater, Less};
                match (op, value.compare(operand)) {
                    (_, None) => false,
                    (Operator::Eq, Some(ord)) => ord == Equal,
                    (Operator::Ne, Some(ord)) => ord != Equal,
                    (Operator::Lt, Some(ord)) => ord == Less,
                    (Operator::Lte, Some(ord)) => ord != Greater,
                    (Operator::Gt, Some(ord)) => ord == Greater,
                    (Operator::Gte, Some(ord)) => ord != Less,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.operator, &self.operand) {
            (Operator::Eq, Operand::Value(Value::Null)) => f.write_str("IS NULL"),
            (Operator::Ne, Operand::Value(Value::Null)) => f.write_str("IS NOT NULL"),
            (Operator::In, Operand::List(items)) if items.is_empty() => f.write_str("IN (NULL)"),
            (op, Operand::List(items)) => {
                let items: Vec<String> = items.iter().map(format_value).collect();
                write!(f, "{} ({})", op.sql_comparison(), items.join(", "))
            }
            (op, Operand::Value(value)) => {
                write!(f, "{} {}", op.sql_comparison(), format_value(value))
            }
        }
    }
}

/// Formats a value as a catalog literal.
pub(crate) fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Timestamp(ts) => format!("{{ts '{}'}}", ts.format(TIMESTAMP_FORMAT)),
    }
}

/// A catalog query under construction for one entity.
#[derive(Debug, Clone)]
pub struct CatalogQuery<'s> {
    schema: &'s SchemaRegistry,
    entity: &'s EntityDef,
    conditions: BTreeMap<String, Vec<Condition>>,
    order: Vec<(String, Direction)>,
    join_specs: BTreeMap<String, JoinKind>,
    limit: Option<(u64, u64)>,
    aggregate: AggregateMode,
    attributes: Vec<String>,
    includes: IncludeTree,
    max_entities: u64,
}

impl<'s> CatalogQuery<'s> {
    /// Creates a query over every entity of the given type.
    ///
    /// `max_entities` is the limit used when only a skip is given.
    pub fn new(
        schema: &'s SchemaRegistry,
        entity: &str,
        max_entities: u64,
    ) -> Result<Self, FilterError> {
        Ok(Self {
            schema,
            entity: schema.entity(entity)?,
            conditions: BTreeMap::new(),
            order: Vec::new(),
            join_specs: BTreeMap::new(),
            limit: None,
            aggregate: AggregateMode::None,
            attributes: Vec::new(),
            includes: IncludeTree::default(),
            max_entities,
        })
    }

    /// Returns the queried entity's definition.
    pub fn entity_def(&self) -> &'s EntityDef {
        self.entity
    }

    /// Returns the schema registry the query was built against.
    pub fn schema(&self) -> &'s SchemaRegistry {
        self.schema
    }

    /// Returns the conditions keyed by attribute path.
    pub fn conditions(&self) -> &BTreeMap<String, Vec<Condition>> {
        &self.conditions
    }

    /// Returns the ordering.
    pub fn order(&self) -> &[(String, Direction)] {
        &self.order
    }

    /// Returns the join specifications keyed by relationship prefix.
    pub fn join_specs(&self) -> &BTreeMap<String, JoinKind> {
        &self.join_specs
    }

    /// Returns the `(skip, limit)` pair.
    pub fn limit(&self) -> Option<(u64, u64)> {
        self.limit
    }

    /// Returns the projected attributes of a distinct query.
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Returns the include tree.
    pub fn includes(&self) -> &IncludeTree {
        &self.includes
    }

    /// Overrides the aggregate mode.
    pub fn set_aggregate(&mut self, mode: AggregateMode) {
        self.aggregate = mode;
    }

    fn non_negative(name: &str, n: i64) -> Result<u64, FilterError> {
        u64::try_from(n).map_err(|_| FilterError::InvalidValue {
            field: name.to_string(),
            message: "must not be negative".to_string(),
        })
    }
}

impl QueryBuilder for CatalogQuery<'_> {
    fn backend(&self) -> Backend {
        Backend::Catalog
    }

    fn entity(&self) -> &str {
        &self.entity.name
    }

    fn add_where(&mut self, clause: &WhereClause) -> Result<(), FilterError> {
        self.schema.resolve_path(self.entity, &clause.field)?;
        let operand = match clause.like_pattern() {
            Some(pattern) => Operand::Value(Value::Text(pattern)),
            None => clause.operand.clone(),
        };
        self.conditions
            .entry(clause.field.clone())
            .or_default()
            .push(Condition {
                operator: clause.operator,
                operand,
            });
        Ok(())
    }

    fn add_order(
        &mut self,
        clause: &OrderClause,
        ctx: &mut QueryBuildContext,
    ) -> Result<(), FilterError> {
        let path = self.schema.resolve_path(self.entity, &clause.field)?;
        ctx.push_order(&clause.field, clause.direction);

        let segments: Vec<&str> = clause.field.split('.').collect();
        for (i, (_, rel)) in path.hops.iter().enumerate() {
            if rel.is_many() {
                ctx.add_join(&segments[..=i].join("."), JoinKind::LeftOuter);
            }
        }

        self.order = ctx.order().to_vec();
        self.join_specs = ctx.join_specs().clone();
        Ok(())
    }

    fn set_distinct(&mut self, fields: &[String]) -> Result<(), FilterError> {
        for field in fields {
            self.schema.resolve_path(self.entity, field)?;
        }
        self.attributes = fields.to_vec();
        self.aggregate = self.aggregate.with_distinct();
        Ok(())
    }

    fn set_skip(&mut self, skip: i64) -> Result<(), FilterError> {
        self.limit = Some((Self::non_negative("skip", skip)?, self.max_entities));
        Ok(())
    }

    fn set_limit(&mut self, limit: i64) -> Result<(), FilterError> {
        self.limit = Some((0, Self::non_negative("limit", limit)?));
        Ok(())
    }

    fn set_page(&mut self, skip: i64, limit: i64) -> Result<(), FilterError> {
        self.limit = Some((
            Self::non_negative("skip", skip)?,
            Self::non_negative("limit", limit)?,
        ));
        Ok(())
    }

    fn couples_pagination(&self) -> bool {
        true
    }

    fn set_include(&mut self, tree: &IncludeTree) -> Result<(), FilterError> {
        self.includes.merge(tree.clone());
        Ok(())
    }

    fn set_count(&mut self) -> Result<(), FilterError> {
        self.aggregate = self.aggregate.with_count();
        Ok(())
    }

    fn aggregate(&self) -> AggregateMode {
        self.aggregate
    }
}

impl fmt::Display for CatalogQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attributes = self
            .attributes
            .iter()
            .map(|a| format!("o.{a}"))
            .collect::<Vec<_>>()
            .join(", ");
        match self.aggregate {
            AggregateMode::None => f.write_str("SELECT o")?,
            AggregateMode::Count => f.write_str("SELECT COUNT(o)")?,
            AggregateMode::Distinct => write!(f, "SELECT DISTINCT {attributes}")?,
            AggregateMode::CountDistinct => write!(f, "SELECT COUNT(DISTINCT {attributes})")?,
        }
        write!(f, " FROM {} o", self.entity.name)?;

        for (prefix, kind) in &self.join_specs {
            write!(f, " {kind} o.{prefix}")?;
        }

        let mut first = true;
        for (path, conditions) in &self.conditions {
            for condition in conditions {
                f.write_str(if first { " WHERE " } else { " AND " })?;
                write!(f, "o.{path} {condition}")?;
                first = false;
            }
        }

        if !self.order.is_empty() {
            let terms: Vec<String> = self
                .order
                .iter()
                .map(|(field, dir)| format!("o.{field} {dir}"))
                .collect();
            write!(f, " ORDER BY {}", terms.join(", "))?;
        }

        let includes = self.includes.paths();
        if !includes.is_empty() {
            let paths: Vec<String> = includes.iter().map(|p| format!("o.{p}")).collect();
            write!(f, " INCLUDE {}", paths.join(", "))?;
        }

        if let Some((skip, limit)) = self.limit {
            write!(f, " LIMIT {skip}, {limit}")?;
        }
        Ok(())
    }
}
