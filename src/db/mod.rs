//! Database access for the coordinator.
//!
//! Everything above this module talks to PostgreSQL through [`SqlExecutor`],
//! which is implemented for the synchronous `postgres` client, its
//! transactions and `r2d2` pooled connections. Fresh connections come from a
//! [`ConnectionProvider`].

pub mod extensions;
pub mod inventory;
pub mod locks;
pub mod migrations;
pub mod repository;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod testing;

use postgres::NoTls;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;

use crate::error::{CoordinatorError, QueryError, Result};

pub use extensions::{DatabaseExtension, VectorExtension, VectorIndex};
pub use locks::{AdvisoryLock, DatabaseLock, LockManager};
pub use migrations::{MigrationOptions, MigrationRunner, SqlMigrationRunner, TransactionMode};
pub use repository::DatabaseRepository;
pub use upgrade::UpgradeResult;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;
pub type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

/// Body run inside [`SqlExecutor::transaction`].
pub type TransactionBody<'a> = dyn FnMut(&mut dyn SqlExecutor) -> Result<()> + 'a;

/// The SQL surface the coordinator needs from a connection.
///
/// Parameters are bound as text and results are read back as the text of
/// the first column, which is all the catalog queries here need.
pub trait SqlExecutor {
    /// Run a single statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[&str]) -> std::result::Result<u64, QueryError>;

    /// Run one or more statements without parameters.
    fn batch_execute(&mut self, sql: &str) -> std::result::Result<(), QueryError>;

    /// First column of every returned row.
    fn query_column(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> std::result::Result<Vec<Option<String>>, QueryError>;

    /// Run `body` inside a transaction, committing only if it succeeds.
    fn transaction(&mut self, body: &mut TransactionBody<'_>) -> Result<()>;
}

/// Hands out connections that are not shared with anything else.
pub trait ConnectionProvider: Send + Sync {
    /// A connection for ordinary statements. It may be recycled afterwards.
    fn acquire(&self) -> Result<Box<dyn SqlExecutor + Send>>;

    /// A connection owned by the caller alone and closed when dropped.
    /// Session state such as advisory locks dies with it.
    fn session(&self) -> Result<Box<dyn SqlExecutor + Send>>;
}

fn bind<'a>(params: &'a [&'a str]) -> Vec<&'a (dyn postgres::types::ToSql + Sync)> {
    params
        .iter()
        .map(|p| p as &(dyn postgres::types::ToSql + Sync))
        .collect()
}

fn first_column(rows: Vec<postgres::Row>) -> std::result::Result<Vec<Option<String>>, QueryError> {
    rows.iter()
        .map(|row| row.try_get::<_, Option<String>>(0).map_err(QueryError::from))
        .collect()
}

macro_rules! impl_sql_executor {
    ($ty:ty) => {
        impl SqlExecutor for $ty {
            fn execute(&mut self, sql: &str, params: &[&str]) -> std::result::Result<u64, QueryError> {
                Ok(postgres::GenericClient::execute(self, sql, &bind(params))?)
            }

            fn batch_execute(&mut self, sql: &str) -> std::result::Result<(), QueryError> {
                Ok(postgres::GenericClient::batch_execute(self, sql)?)
            }

            fn query_column(
                &mut self,
                sql: &str,
                params: &[&str],
            ) -> std::result::Result<Vec<Option<String>>, QueryError> {
                let rows = postgres::GenericClient::query(self, sql, &bind(params))?;
                first_column(rows)
            }

            fn transaction(&mut self, body: &mut TransactionBody<'_>) -> Result<()> {
                let mut tx = postgres::GenericClient::transaction(self)?;
                body(&mut tx)?;
                tx.commit()?;
                Ok(())
            }
        }
    };
}

impl_sql_executor!(postgres::Client);
impl_sql_executor!(postgres::Transaction<'_>);

impl SqlExecutor for PgConnection {
    fn execute(&mut self, sql: &str, params: &[&str]) -> std::result::Result<u64, QueryError> {
        SqlExecutor::execute(&mut **self, sql, params)
    }

    fn batch_execute(&mut self, sql: &str) -> std::result::Result<(), QueryError> {
        SqlExecutor::batch_execute(&mut **self, sql)
    }

    fn query_column(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> std::result::Result<Vec<Option<String>>, QueryError> {
        SqlExecutor::query_column(&mut **self, sql, params)
    }

    fn transaction(&mut self, body: &mut TransactionBody<'_>) -> Result<()> {
        SqlExecutor::transaction(&mut **self, body)
    }
}

/// Pooled connections for statements, plain clients for lock sessions.
pub struct PgProvider {
    pool: PgPool,
    config: postgres::Config,
}

impl ConnectionProvider for PgProvider {
    fn acquire(&self) -> Result<Box<dyn SqlExecutor + Send>> {
        let conn = self.pool.get()?;
        Ok(Box::new(conn))
    }

    fn session(&self) -> Result<Box<dyn SqlExecutor + Send>> {
        let client = self.config.connect(NoTls)?;
        Ok(Box::new(client))
    }
}

fn parse_url(url: &str) -> Result<postgres::Config> {
    url.parse::<postgres::Config>()
        .map_err(|e| CoordinatorError::Configuration(format!("invalid database url: {}", e)))
}

/// Connect to `url` with a pool of `pool_size` connections.
pub fn open_pool(url: &str, pool_size: u32) -> Result<PgProvider> {
    if pool_size == 0 {
        return Err(CoordinatorError::Configuration(
            "database pool_size must be at least 1".into(),
        ));
    }
    let config = parse_url(url)?;
    let manager = PostgresConnectionManager::new(config.clone(), NoTls);
    let pool = Pool::builder().max_size(pool_size).build(manager)?;
    Ok(PgProvider { pool, config })
}
