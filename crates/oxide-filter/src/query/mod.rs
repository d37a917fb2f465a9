//! Backend query builders.
//!
//! Each backend has one [`QueryBuilder`] implementation; filters are written
//! once against the trait and the store picks the implementation.

mod catalog;
mod relational;

pub use catalog::{CatalogQuery, Condition};
pub use relational::RelationalQuery;

use crate::backend::Backend;
use crate::error::FilterError;
use crate::filter::{IncludeTree, OrderClause, QueryBuildContext, WhereClause};

/// What a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregateMode {
    /// Whole records.
    #[default]
    None,
    /// Distinct tuples of the projected attributes.
    Distinct,
    /// The number of matching records.
    Count,
    /// The number of distinct projected tuples.
    CountDistinct,
}

impl AggregateMode {
    /// Returns the mode after a distinct projection is requested.
    pub fn with_distinct(self) -> Self {
        match self {
            Self::Count | Self::CountDistinct => Self::CountDistinct,
            Self::None | Self::Distinct => Self::Distinct,
        }
    }

    /// Returns the mode after a count is requested.
    pub fn with_count(self) -> Self {
        match self {
            Self::Distinct | Self::CountDistinct => Self::CountDistinct,
            Self::None | Self::Count => Self::Count,
        }
    }

    /// Returns whether the query projects distinct attributes.
    pub fn is_distinct(self) -> bool {
        matches!(self, Self::Distinct | Self::CountDistinct)
    }

    /// Returns whether the query counts.
    pub fn is_count(self) -> bool {
        matches!(self, Self::Count | Self::CountDistinct)
    }
}

/// A query under construction for one entity on one backend.
pub trait QueryBuilder {
    /// Returns the backend this query targets.
    fn backend(&self) -> Backend;

    /// Returns the queried entity.
    fn entity(&self) -> &str;

    /// Adds a condition; conditions are ANDed.
    fn add_where(&mut self, clause: &WhereClause) -> Result<(), FilterError>;

    /// Adds an ordering term after any existing ones.
    fn add_order(
        &mut self,
        clause: &OrderClause,
        ctx: &mut QueryBuildContext,
    ) -> Result<(), FilterError>;

    /// Projects the query onto distinct tuples of `fields`.
    fn set_distinct(&mut self, fields: &[String]) -> Result<(), FilterError>;

    /// Skips the first `skip` results.
    fn set_skip(&mut self, skip: i64) -> Result<(), FilterError>;

    /// Returns at most `limit` results.
    fn set_limit(&mut self, limit: i64) -> Result<(), FilterError>;

    /// Sets skip and limit together.
    fn set_page(&mut self, skip: i64, limit: i64) -> Result<(), FilterError> {
        self.set_skip(skip)?;
        self.set_limit(limit)
    }

    /// Returns whether skip and limit must be set in a single call.
    fn couples_pagination(&self) -> bool {
        false
    }

    /// Loads the relationships named by `tree` with each result.
    fn set_include(&mut self, tree: &IncludeTree) -> Result<(), FilterError>;

    /// Turns the query into a count.
    fn set_count(&mut self) -> Result<(), FilterError>;

    /// Returns the aggregate mode.
    fn aggregate(&self) -> AggregateMode;
}
