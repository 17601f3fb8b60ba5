//! Error types returned by the coordinator.

use std::fmt;

use thiserror::Error;

use crate::db::extensions::VectorIndex;

/// A failed database round-trip.
///
/// Keeps the server message and SQLSTATE so callers can recognise the
/// handful of conditions the coordinator recovers from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    pub message: String,
    pub code: Option<String>,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// pgvecto.rs reports a missing index this way from `pg_vector_index_stat`.
    pub fn is_missing_index(&self) -> bool {
        self.message.contains("index is not existing")
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<postgres::Error> for QueryError {
    fn from(e: postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => Self::with_code(db.message(), db.code().code()),
            None => Self::new(e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid version string {input:?}")]
    Parse { input: String },

    #[error("{0} extension is not installed")]
    NotInstalled(&'static str),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not recover index {index} after failed reindex: {source}")]
    RecoverableIndex {
        index: VectorIndex,
        #[source]
        source: QueryError,
    },

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("failed to check out a database connection: {0}")]
    Pool(String),

    #[error("unsupported {what} version {found}, expected {expected}")]
    UnsupportedVersion {
        what: &'static str,
        found: String,
        expected: String,
    },

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<postgres::Error> for CoordinatorError {
    fn from(e: postgres::Error) -> Self {
        CoordinatorError::Query(e.into())
    }
}

impl From<r2d2::Error> for CoordinatorError {
    fn from(e: r2d2::Error) -> Self {
        CoordinatorError::Pool(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
