//! Coordinates PostgreSQL vector extensions, vector index maintenance and
//! schema migrations for a photo library database.
//!
//! Changes to shared schema state happen inside [`db::DatabaseRepository::with_lock`],
//! which serialises callers within this process and, through PostgreSQL
//! advisory locks, across every process connected to the same database.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod service;
pub mod version;

pub use config::{Config, CoordinatorConfig};
pub use db::{DatabaseExtension, DatabaseLock, DatabaseRepository, VectorExtension, VectorIndex};
pub use error::{CoordinatorError, QueryError};
pub use service::{BootstrapReport, DatabaseService};
pub use version::Version;
