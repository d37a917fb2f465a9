//! SQL query builder for the relational store.

use crate::backend::Backend;
use crate::error::{ApiError, FilterError};
use crate::filter::{
    Direction, IncludeTree, Operand, Operator, OrderClause, QueryBuildContext, WhereClause,
};
use crate::schema::{AttributeType, EntityDef, SchemaRegistry};
use crate::value::Value;

use super::{AggregateMode, QueryBuilder};

/// Where a SELECT level reads its rows from.
#[derive(Debug, Clone)]
enum Source {
    Table(String),
    Subquery(Box<Select>),
}

/// A LEFT JOIN added for a relationship path prefix.
#[derive(Debug, Clone)]
struct Join {
    path: String,
    table: String,
    alias: String,
    on: String,
    to_many: bool,
}

/// An ORDER BY term.
#[derive(Debug, Clone)]
struct OrderTerm {
    column: String,
    direction: Direction,
    /// The column sits behind a to-many join.
    to_many: bool,
}

impl OrderTerm {
    /// In a grouped select a to-many column is folded per record: the
    /// smallest value sorts ascending, the largest descending.
    fn render(&self, grouped: bool) -> String {
        match (grouped && self.to_many, self.direction) {
            (true, Direction::Asc) => format!("MIN({}) ASC", self.column),
            (true, Direction::Desc) => format!("MAX({}) DESC", self.column),
            (false, direction) => format!("{} {direction}", self.column),
        }
    }
}

/// One SELECT level. Ordering after pagination nests the current level
/// inside a new one.
#[derive(Debug, Clone)]
struct Select {
    source: Source,
    alias: String,
    joins: Vec<Join>,
    conditions: Vec<(String, Vec<Value>)>,
    order_by: Vec<OrderTerm>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Select {
    fn new(source: Source, alias: String) -> Self {
        Self {
            source,
            alias,
            joins: Vec::new(),
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    fn is_paginated(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    fn entity_columns(&self, entity: &EntityDef) -> String {
        entity
            .attributes
            .iter()
            .map(|a| format!("{}.{}", self.alias, a.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Renders this level. `columns` is `None` for a plain record fetch.
    fn render(
        &self,
        entity: &EntityDef,
        columns: Option<&str>,
        distinct: bool,
        params: &mut Vec<Value>,
    ) -> String {
        let mut sql = String::from("SELECT ");
        if distinct {
            sql.push_str("DISTINCT ");
        }
        match columns {
            Some(cols) => sql.push_str(cols),
            None => sql.push_str(&self.entity_columns(entity)),
        }

        sql.push_str(" FROM ");
        match &self.source {
            Source::Table(table) => sql.push_str(table),
            Source::Subquery(inner) => {
                let inner_sql = inner.render(entity, None, false, params);
                sql.push('(');
                sql.push_str(&inner_sql);
                sql.push(')');
            }
        }
        sql.push_str(" AS ");
        sql.push_str(&self.alias);

        for join in &self.joins {
            sql.push_str(&format!(" LEFT JOIN {} AS {} ON {}", join.table, join.alias, join.on));
        }

        if !self.conditions.is_empty() {
            let parts: Vec<&str> = self.conditions.iter().map(|(c, _)| c.as_str()).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&parts.join(" AND "));
            for (_, values) in &self.conditions {
                params.extend(values.iter().cloned());
            }
        }

        // Records repeat once per row of a to-many join.
        let grouped = columns.is_none() && self.joins.iter().any(|j| j.to_many);
        if grouped {
            sql.push_str(&format!(" GROUP BY {}.{}", self.alias, entity.primary_key));
        }

        if !self.order_by.is_empty() {
            let terms: Vec<String> = self.order_by.iter().map(|t| t.render(grouped)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        sql
    }

    fn check_pagination(&self) -> Result<(), ApiError> {
        for (name, value) in [("limit", self.limit), ("skip", self.offset)] {
            if let Some(n) = value.filter(|n| *n < 0) {
                return Err(ApiError::BadRequest(format!("{name} must not be negative, got {n}")));
            }
        }
        match &self.source {
            Source::Subquery(inner) => inner.check_pagination(),
            Source::Table(_) => Ok(()),
        }
    }
}

/// A SELECT statement under construction for one entity.
///
/// Dotted paths become LEFT JOINs, one per distinct path prefix. Values are
/// bound as `?` parameters in the order they appear in the SQL.
#[derive(Debug, Clone)]
pub struct RelationalQuery<'s> {
    schema: &'s SchemaRegistry,
    entity: &'s EntityDef,
    max_join_hops: usize,
    select: Select,
    aggregate: AggregateMode,
    projection_fields: Vec<String>,
    projection: Vec<(String, AttributeType)>,
    includes: IncludeTree,
    next_alias: usize,
}

impl<'s> RelationalQuery<'s> {
    /// Creates a query selecting every record of `entity`.
    pub fn new(
        schema: &'s SchemaRegistry,
        entity: &str,
        max_join_hops: usize,
    ) -> Result<Self, FilterError> {
        let entity = schema.entity(entity)?;
        Ok(Self {
            schema,
            entity,
            max_join_hops,
            select: Select::new(Source::Table(entity.table_name().to_string()), "t0".to_string()),
            aggregate: AggregateMode::None,
            projection_fields: Vec::new(),
            projection: Vec::new(),
            includes: IncludeTree::default(),
            next_alias: 1,
        })
    }

    /// Returns the queried entity's definition.
    pub fn entity_def(&self) -> &'s EntityDef {
        self.entity
    }

    /// Returns the distinct fields, in request order.
    pub fn projection_fields(&self) -> &[String] {
        &self.projection_fields
    }

    /// Returns the types of the distinct columns.
    pub fn projection_types(&self) -> Vec<AttributeType> {
        self.projection.iter().map(|(_, ty)| *ty).collect()
    }

    /// Returns the include tree.
    pub fn includes(&self) -> &IncludeTree {
        &self.includes
    }

    /// Rejects negative pagination values.
    pub fn check_pagination(&self) -> Result<(), ApiError> {
        self.select.check_pagination()
    }

    /// Builds the SELECT statement and its parameters.
    pub fn to_select(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = if self.aggregate.is_distinct() {
            let columns = self
                .projection
                .iter()
                .map(|(c, _)| c.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            self.select.render(self.entity, Some(&columns), true, &mut params)
        } else {
            self.select.render(self.entity, None, false, &mut params)
        };
        (sql, params)
    }

    /// Builds a statement counting the rows of [`Self::to_select`].
    pub fn to_count(&self) -> (String, Vec<Value>) {
        let (select, params) = self.to_select();
        (format!("SELECT COUNT(*) FROM ({select}) AS counted"), params)
    }

    fn fresh_alias(&mut self, prefix: &str) -> String {
        let alias = format!("{prefix}{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    /// Resolves a field to a column expression, joining as needed.
    fn column(&mut self, field: &str) -> Result<(String, AttributeType), FilterError> {
        let schema = self.schema;
        let path = schema.resolve_path(self.entity, field)?;
        if path.hops.len() > self.max_join_hops {
            return Err(FilterError::DepthExceeded {
                path: field.to_string(),
                max: self.max_join_hops,
            });
        }

        let segments: Vec<&str> = field.split('.').collect();
        let mut owner_alias = self.select.alias.clone();
        for (i, (_, rel)) in path.hops.iter().enumerate() {
            let prefix = segments[..=i].join(".");
            let existing = self
                .select
                .joins
                .iter()
                .find(|j| j.path == prefix)
                .map(|j| j.alias.clone());
            owner_alias = match existing {
                Some(alias) => alias,
                None => {
                    let target = schema.entity(&rel.target)?;
                    let alias = self.fresh_alias("j");
                    self.select.joins.push(Join {
                        path: prefix,
                        table: target.table_name().to_string(),
                        on: format!(
                            "{alias}.{} = {owner_alias}.{}",
                            rel.remote_key, rel.local_key
                        ),
                        alias: alias.clone(),
                        to_many: rel.is_many(),
                    });
                    alias
                }
            };
        }
        Ok((format!("{owner_alias}.{}", path.attribute.name), path.attribute.ty))
    }

    /// Returns whether a joined field's path passes a to-many relationship.
    fn crosses_many(&self, field: &str) -> bool {
        let segments: Vec<&str> = field.split('.').collect();
        (1..segments.len()).any(|n| {
            let prefix = segments[..n].join(".");
            self.select
                .joins
                .iter()
                .any(|j| j.path == prefix && j.to_many)
        })
    }

    /// Nests the current statement in a subquery so that new ordering
    /// applies to its already paginated rows.
    fn wrap(&mut self) -> Result<(), FilterError> {
        let alias = self.fresh_alias("sq");
        let inner = std::mem::replace(
            &mut self.select,
            Select::new(Source::Table(String::new()), alias),
        );
        self.select.source = Source::Subquery(Box::new(inner));

        let fields = self.projection_fields.clone();
        let projection = fields
            .iter()
            .map(|f| self.column(f))
            .collect::<Result<Vec<_>, _>>()?;
        self.projection = projection;
        Ok(())
    }
}

impl QueryBuilder for RelationalQuery<'_> {
    fn backend(&self) -> Backend {
        Backend::Relational
    }

    fn entity(&self) -> &str {
        &self.entity.name
    }

    fn add_where(&mut self, clause: &WhereClause) -> Result<(), FilterError> {
        let (column, _) = self.column(&clause.field)?;
        let condition = match (clause.operator, &clause.operand) {
            (Operator::In, Operand::List(values)) if values.is_empty() => {
                ("1 = 0".to_string(), Vec::new())
            }
            (Operator::In, Operand::List(values)) => {
                let placeholders = vec!["?"; values.len()].join(", ");
                (format!("{column} IN ({placeholders})"), values.clone())
            }
            (Operator::Eq, Operand::Value(Value::Null)) => {
                (format!("{column} IS NULL"), Vec::new())
            }
            (Operator::Ne, Operand::Value(Value::Null)) => {
                (format!("{column} IS NOT NULL"), Vec::new())
            }
            (op @ (Operator::Like | Operator::Nlike), _) => {
                let pattern = clause.like_pattern().ok_or_else(|| FilterError::InvalidValue {
                    field: clause.field.clone(),
                    message: format!("'{op}' needs a string"),
                })?;
                (
                    format!("{column} {} ?", op.sql_comparison()),
                    vec![Value::Text(pattern)],
                )
            }
            (op, Operand::Value(value)) if op != Operator::In => (
                format!("{column} {} ?", op.sql_comparison()),
                vec![value.clone()],
            ),
            (op, _) => {
                return Err(FilterError::InvalidValue {
                    field: clause.field.clone(),
                    message: format!("operand does not fit '{op}'"),
                })
            }
        };
        self.select.conditions.push(condition);
        Ok(())
    }

    fn add_order(
        &mut self,
        clause: &OrderClause,
        ctx: &mut QueryBuildContext,
    ) -> Result<(), FilterError> {
        if self.select.is_paginated() {
            self.wrap()?;
        }
        let (column, _) = self.column(&clause.field)?;
        let to_many = self.crosses_many(&clause.field);
        self.select.order_by.push(OrderTerm {
            column,
            direction: clause.direction,
            to_many,
        });
        ctx.push_order(&clause.field, clause.direction);
        Ok(())
    }

    fn set_distinct(&mut self, fields: &[String]) -> Result<(), FilterError> {
        let projection = fields
            .iter()
            .map(|f| self.column(f))
            .collect::<Result<Vec<_>, _>>()?;
        self.projection_fields = fields.to_vec();
        self.projection = projection;
        self.aggregate = self.aggregate.with_distinct();
        Ok(())
    }

    fn set_skip(&mut self, skip: i64) -> Result<(), FilterError> {
        self.select.offset = Some(skip);
        Ok(())
    }

    fn set_limit(&mut self, limit: i64) -> Result<(), FilterError> {
        self.select.limit = Some(limit);
        Ok(())
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
