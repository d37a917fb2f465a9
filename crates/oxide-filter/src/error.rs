//! Error types for filtering, execution and configuration.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, warn};

/// Errors raised while parsing or applying a filter.
///
/// These are raised before the store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// The filter does not follow the filter grammar.
    #[error("malformed filter: {0}")]
    Malformed(String),

    /// The entity is not in the schema registry.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The entity has no attribute with this name.
    #[error("unknown field '{field}' on entity '{entity}'")]
    UnknownField {
        /// Entity the lookup started from.
        entity: String,
        /// Field that could not be resolved.
        field: String,
    },

    /// The entity has no relationship with this name.
    #[error("unknown relationship '{relationship}' on entity '{entity}'")]
    UnknownRelationship {
        /// Entity owning the relationship.
        entity: String,
        /// Relationship that could not be resolved.
        relationship: String,
    },

    /// The operator is not one of the recognised comparison operators.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// The operand cannot be used with the field or operator.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue {
        /// Field the operand was given for.
        field: String,
        /// What is wrong with the operand.
        message: String,
    },

    /// A relationship path or include tree is deeper than allowed.
    #[error("'{path}' exceeds the maximum depth of {max}")]
    DepthExceeded {
        /// The offending path.
        path: String,
        /// The configured maximum.
        max: usize,
    },

    /// More than one include filter was given for one request.
    #[error("only one include filter may be given per request")]
    MultipleIncludes,
}

/// Errors returned by request-level operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request's filters are invalid.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// The request cannot be carried out as given.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No record matched.
    #[error("no record found: {0}")]
    MissingRecord(String),

    /// Credentials are missing or were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl ApiError {
    /// Returns the HTTP-like status code for this error category.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Filter(_) | Self::BadRequest(_) => 400,
            Self::Authentication(_) => 403,
            Self::MissingRecord(_) => 404,
        }
    }

    /// Returns the message that may be shown to a caller.
    ///
    /// Details stay in the logs; callers only see the category.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Filter(_) => "Bad filter",
            Self::BadRequest(_) => "Bad request",
            Self::MissingRecord(_) => "No such record in table",
            Self::Authentication(_) => "Failed to authenticate",
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                warn!("relational store returned no row");
                Self::MissingRecord("no matching row".to_string())
            }
            other => {
                error!(error = %other, "relational store error");
                Self::BadRequest("the store rejected the request".to_string())
            }
        }
    }
}

/// Result type alias for request-level operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors raised while loading configuration or a schema registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read '{path}': {source}")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid JSON for the expected shape.
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The schema registry is inconsistent.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A setting is out of range.
    #[error("invalid setting '{name}': {message}")]
    InvalidSetting {
        /// Setting name.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },
}
