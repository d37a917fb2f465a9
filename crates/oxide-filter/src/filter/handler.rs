//! Collects a request's filters and applies them to a query in order.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use super::{Direction, FilterSpec, IncludeTree};
use crate::error::FilterError;
use crate::query::QueryBuilder;

/// How a relationship prefix is joined by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Inner join: entities without related records drop out.
    Inner,
    /// Left outer join: entities without related records are kept.
    LeftOuter,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inner => "JOIN",
            Self::LeftOuter => "LEFT JOIN",
        })
    }
}

/// State accumulated while the filters of one request are applied.
///
/// Created by [`FilterHandler::apply`] and dropped when it returns.
#[derive(Debug, Default)]
pub struct QueryBuildContext {
    order: Vec<(String, Direction)>,
    join_specs: BTreeMap<String, JoinKind>,
}

impl QueryBuildContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an ordering term.
    pub fn push_order(&mut self, field: &str, direction: Direction) {
        self.order.push((field.to_string(), direction));
    }

    /// Returns the cumulative ordering.
    pub fn order(&self) -> &[(String, Direction)] {
        &self.order
    }

    /// Records a join for a relationship prefix.
    ///
    /// An outer join is never downgraded to an inner one.
    pub fn add_join(&mut self, prefix: &str, kind: JoinKind) {
        let entry = self.join_specs.entry(prefix.to_string()).or_insert(kind);
        if kind == JoinKind::LeftOuter {
            *entry = JoinKind::LeftOuter;
        }
    }

    /// Returns the joins recorded so far.
    pub fn join_specs(&self) -> &BTreeMap<String, JoinKind> {
        &self.join_specs
    }

    /// Forgets all accumulated state.
    pub fn clear(&mut self) {
        self.order.clear();
        self.join_specs.clear();
    }
}

/// The filters of one request.
#[derive(Debug, Clone, Default)]
pub struct FilterHandler {
    filters: Vec<FilterSpec>,
}

impl FilterHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter; a second include fails.
    pub fn add(&mut self, filter: FilterSpec) -> Result<(), FilterError> {
        if matches!(filter, FilterSpec::Include(_)) && self.include_tree().is_some() {
            return Err(FilterError::MultipleIncludes);
        }
        self.filters.push(filter);
        Ok(())
    }

    /// Adds several filters.
    pub fn add_all(
        &mut self,
        filters: impl IntoIterator<Item = FilterSpec>,
    ) -> Result<(), FilterError> {
        filters.into_iter().try_for_each(|f| self.add(f))
    }

    /// Returns the filters in the order they were added.
    pub fn filters(&self) -> &[FilterSpec] {
        &self.filters
    }

    /// Returns the include tree, if one was given.
    pub fn include_tree(&self) -> Option<&IncludeTree> {
        self.filters.iter().find_map(|f| match f {
            FilterSpec::Include(tree) => Some(tree),
            _ => None,
        })
    }

    /// Returns the distinct fields, if a distinct filter was given.
    ///
    /// The last distinct filter wins.
    pub fn distinct_fields(&self) -> Option<&[String]> {
        self.filters.iter().rev().find_map(|f| match f {
            FilterSpec::Distinct(fields) => Some(fields.as_slice()),
            _ => None,
        })
    }

    /// Applies every filter to `query`.
    ///
    /// Filters run by rank (where, then order and distinct, then skip and
    /// limit, then include), keeping request order within a rank. When the
    /// query couples pagination, a skip and a limit are set in one call.
    ///
    /// A distinct query may only be ordered by its distinct fields.
    pub fn apply<Q: QueryBuilder + ?Sized>(&self, query: &mut Q) -> Result<(), FilterError> {
        self.check_distinct_order()?;

        let mut ordered: Vec<&FilterSpec> = self.filters.iter().collect();
        ordered.sort_by_key(|f| f.rank());

        let mut ctx = QueryBuildContext::new();
        let coupled = query.couples_pagination();
        let skip = last_value(&ordered, |f| match f {
            FilterSpec::Skip(n) => Some(*n),
            _ => None,
        });
        let limit = last_value(&ordered, |f| match f {
            FilterSpec::Limit(n) => Some(*n),
            _ => None,
        });

        for filter in ordered {
            debug!(entity = %query.entity(), filter = filter.name(), "applying filter");
            match filter {
                FilterSpec::Skip(_) | FilterSpec::Limit(_) if coupled => {}
                other => other.apply(query, &mut ctx)?,
            }
        }

        if coupled {
            match (skip, limit) {
                (Some(skip), Some(limit)) => query.set_page(skip, limit)?,
                (Some(skip), None) => query.set_skip(skip)?,
                (None, Some(limit)) => query.set_limit(limit)?,
                (None, None) => {}
            }
        }
        Ok(())
    }

    fn check_distinct_order(&self) -> Result<(), FilterError> {
        let Some(fields) = self.distinct_fields() else {
            return Ok(());
        };
        let stray = self.filters.iter().find_map(|f| match f {
            FilterSpec::Order(clause) if !fields.contains(&clause.field) => Some(&clause.field),
            _ => None,
        });
        match stray {
            Some(field) => Err(FilterError::InvalidValue {
                field: field.clone(),
                message: format!("a distinct query can only be ordered by {}", fields.join(", ")),
            }),
            None => Ok(()),
        }
    }
}

fn last_value(filters: &[&FilterSpec], pick: impl Fn(&FilterSpec) -> Option<i64>) -> Option<i64> {
    filters.iter().rev().find_map(|f| pick(f))
}
