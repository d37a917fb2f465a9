//! Typed filter clauses and their application to a query.
//!
//! A request's JSON filters are parsed by [`FilterFactory`] into
//! [`FilterSpec`]s, collected by a [`FilterHandler`] and applied in a fixed
//! order to a [`QueryBuilder`](crate::query::QueryBuilder). The backend is
//! chosen by the query builder the handler is given, so each clause has a
//! single implementation.

mod factory;
mod handler;
mod include;

use std::fmt;
use std::str::FromStr;

pub use factory::FilterFactory;
pub use handler::{FilterHandler, JoinKind, QueryBuildContext};
pub use include::IncludeTree;

use crate::error::FilterError;
use crate::query::QueryBuilder;
use crate::value::Value;

/// Comparison operators accepted in `where` clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Substring match.
    Like,
    /// Negated substring match.
    Nlike,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Membership in a list.
    In,
}

impl Operator {
    /// Returns the operator's name in the filter grammar.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Like => "like",
            Self::Nlike => "nlike",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::In => "in",
        }
    }

    /// Returns the SQL comparison for scalar operators.
    pub fn sql_comparison(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Like => "LIKE",
            Self::Nlike => "NOT LIKE",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::In => "IN",
        }
    }
}

impl FromStr for Operator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "like" => Ok(Self::Like),
            "nlike" => Ok(Self::Nlike),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "in" => Ok(Self::In),
            other => Err(FilterError::UnsupportedOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending (ASC).
    Asc,
    /// Descending (DESC).
    Desc,
}

impl Direction {
    /// Parses a direction, ignoring case.
    pub fn parse(s: &str) -> Result<Self, FilterError> {
        match s.to_ascii_uppercase().as_str() {
            "ASC" => Ok(Self::Asc),
            "DESC" => Ok(Self::Desc),
            _ => Err(FilterError::Malformed(format!(
                "order direction must be ASC or DESC, got '{s}'"
            ))),
        }
    }

    /// Returns the upper-case SQL keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The right-hand side of a `where` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A single value.
    Value(Value),
    /// The list given to `in`; may be empty.
    List(Vec<Value>),
}

/// A `where` clause: `field operator operand`.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClause {
    /// Attribute name or dotted relationship path.
    pub field: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Operand, already coerced to the attribute type.
    pub operand: Operand,
}

impl WhereClause {
    /// Creates an equality clause.
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            operator: Operator::Eq,
            operand: Operand::Value(value.into()),
        }
    }

    /// Returns the `LIKE` pattern for `like`/`nlike` clauses.
    pub fn like_pattern(&self) -> Option<String> {
        match (&self.operator, &self.operand) {
            (Operator::Like | Operator::Nlike, Operand::Value(Value::Text(s))) => {
                Some(format!("%{s}%"))
            }
            _ => None,
        }
    }
}

/// An `order` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderClause {
    /// Attribute name or dotted relationship path.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
}

/// One parsed filter clause.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    /// Restrict matched records.
    Where(WhereClause),
    /// Sort matched records.
    Order(OrderClause),
    /// Skip the first `n` records.
    Skip(i64),
    /// Return at most `n` records.
    Limit(i64),
    /// Attach related records.
    Include(IncludeTree),
    /// Project onto distinct attribute tuples.
    Distinct(Vec<String>),
}

impl FilterSpec {
    /// Returns the application rank: lower ranks are applied first.
    ///
    /// Where, then Order/Distinct, then Skip/Limit, then Include.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Where(_) => 0,
            Self::Order(_) | Self::Distinct(_) => 1,
            Self::Skip(_) | Self::Limit(_) => 2,
            Self::Include(_) => 3,
        }
    }

    /// Returns the filter's name in the grammar.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Where(_) => "where",
            Self::Order(_) => "order",
            Self::Skip(_) => "skip",
            Self::Limit(_) => "limit",
            Self::Include(_) => "include",
            Self::Distinct(_) => "distinct",
        }
    }

    /// Applies this clause to a query.
    pub fn apply<Q: QueryBuilder + ?Sized>(
        &self,
        query: &mut Q,
        ctx: &mut QueryBuildContext,
    ) -> Result<(), FilterError> {
        match self {
            Self::Where(clause) => query.add_where(clause),
            Self::Order(clause) => query.add_order(clause, ctx),
            Self::Skip(n) => query.set_skip(*n),
            Self::Limit(n) => query.set_limit(*n),
            Self::Include(tree) => query.set_include(tree),
            Self::Distinct(fields) => query.set_distinct(fields),
        }
    }
}
