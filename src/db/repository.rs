//! The coordinator's public surface.
//!
//! [`DatabaseRepository`] bundles the connection provider, the lock manager,
//! the resolved configuration and the migration runner. Each call checks out
//! its own connection; advisory locks get a dedicated one.

use std::sync::Arc;

use super::extensions::{DatabaseExtension, VectorExtension, VectorIndex};
use super::locks::{AdvisoryLock, DatabaseLock, LockManager};
use super::migrations::{MigrationOptions, MigrationRunner};
use super::upgrade::{self, UpgradeResult};
use super::{inventory, ConnectionProvider, SqlExecutor};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::version::{Version, VersionRange};

pub struct DatabaseRepository {
    provider: Arc<dyn ConnectionProvider>,
    locks: LockManager,
    config: CoordinatorConfig,
    migrations: Box<dyn MigrationRunner>,
}

impl DatabaseRepository {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        config: CoordinatorConfig,
        migrations: Box<dyn MigrationRunner>,
    ) -> Self {
        Self {
            locks: LockManager::new(provider.clone()),
            provider,
            config,
            migrations,
        }
    }

    fn connection(&self) -> Result<Box<dyn SqlExecutor + Send>> {
        self.provider.acquire()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ========================================================================
    // Locks
    // ========================================================================

    pub fn with_lock<R, E, F>(&self, lock: DatabaseLock, operation: F) -> std::result::Result<R, E>
    where
        F: FnOnce() -> std::result::Result<R, E>,
        E: From<CoordinatorError>,
    {
        self.locks.with_lock(lock, operation)
    }

    pub fn try_lock(&self, lock: DatabaseLock) -> Result<Option<AdvisoryLock>> {
        self.locks.try_lock(lock)
    }

    pub fn is_busy(&self, lock: DatabaseLock) -> bool {
        self.locks.is_busy(lock)
    }

    pub fn wait(&self, lock: DatabaseLock) {
        self.locks.wait(lock)
    }

    // ========================================================================
    // Inventory
    // ========================================================================

    pub fn get_extension_version(&self, extension: DatabaseExtension) -> Result<Option<Version>> {
        let mut conn = self.connection()?;
        inventory::extension_version(&mut *conn, extension)
    }

    pub fn get_available_extension_version(
        &self,
        extension: DatabaseExtension,
    ) -> Result<Option<Version>> {
        let mut conn = self.connection()?;
        inventory::available_extension_version(&mut *conn, extension)
    }

    /// Every installable version other than the installed one, ascending.
    pub fn get_available_extension_versions(
        &self,
        extension: DatabaseExtension,
    ) -> Result<Vec<Version>> {
        let mut conn = self.connection()?;
        inventory::available_extension_versions(&mut *conn, extension)
    }

    pub fn get_preferred_vector_extension(&self) -> DatabaseExtension {
        self.config.vector_extension.extension()
    }

    pub fn get_extension_version_range(&self, extension: VectorExtension) -> VersionRange {
        extension.supported_range()
    }

    pub fn get_postgres_version(&self) -> Result<Version> {
        let mut conn = self.connection()?;
        inventory::postgres_version(&mut *conn)
    }

    // ========================================================================
    // Extensions and indexes
    // ========================================================================

    pub fn create_extension(&self, extension: DatabaseExtension) -> Result<()> {
        let mut conn = self.connection()?;
        conn.batch_execute(&format!("CREATE EXTENSION IF NOT EXISTS {}", extension.sql_name()))?;
        Ok(())
    }

    pub fn update_extension(&self, extension: DatabaseExtension, version: Option<&Version>) -> Result<()> {
        let mut conn = self.connection()?;
        conn.batch_execute(&upgrade::update_extension_sql(extension.sql_name(), version))?;
        Ok(())
    }

    pub fn update_vector_extension(
        &self,
        extension: DatabaseExtension,
        target: Option<&Version>,
    ) -> Result<UpgradeResult> {
        let vector = extension.as_vector().ok_or_else(|| {
            CoordinatorError::Configuration(format!("{} is not a vector extension", extension))
        })?;
        let mut conn = self.connection()?;
        upgrade::update_vector_extension(&mut *conn, vector, target)
    }

    pub fn reindex(&self, index: VectorIndex) -> Result<()> {
        let mut conn = self.connection()?;
        upgrade::reindex(&mut *conn, self.config.vector_extension, index)
    }

    pub fn should_reindex(&self, index: VectorIndex) -> Result<bool> {
        let mut conn = self.connection()?;
        upgrade::should_reindex(&mut *conn, self.config.vector_extension, index)
    }

    pub fn create_vector_index(&self, index: VectorIndex) -> Result<()> {
        let mut conn = self.connection()?;
        upgrade::create_vector_index(&mut *conn, self.config.vector_extension, index)
    }

    // ========================================================================
    // Migrations
    // ========================================================================

    /// Apply pending migrations. Callers hold [`DatabaseLock::Migrations`].
    pub fn run_migrations(&self, options: MigrationOptions) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        self.migrations.run(&mut *conn, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::{Migration, SqlMigrationRunner, TransactionMode};
    use crate::db::testing::FakeDatabase;

    fn repository(db: &FakeDatabase, vector_extension: VectorExtension) -> DatabaseRepository {
        let config = CoordinatorConfig {
            vector_extension,
            ..CoordinatorConfig::default()
        };
        let runner = SqlMigrationRunner::new(vec![Migration {
            name: "0001_init".into(),
            sql: "CREATE TABLE smart_search (asset_id UUID)".into(),
        }]);
        DatabaseRepository::new(Arc::new(db.clone()), config, Box::new(runner))
    }

    #[test]
    fn test_preferred_vector_extension_comes_from_config() {
        let db = FakeDatabase::new();
        assert_eq!(
            repository(&db, VectorExtension::PgVector).get_preferred_vector_extension(),
            DatabaseExtension::Vector
        );
        assert_eq!(
            repository(&db, VectorExtension::PgVectoRs).get_preferred_vector_extension(),
            DatabaseExtension::Vectors
        );
    }

    #[test]
    fn test_create_and_update_extension() {
        let db = FakeDatabase::new();
        let repo = repository(&db, VectorExtension::PgVector);

        repo.create_extension(DatabaseExtension::EarthDistance).unwrap();
        repo.update_extension(DatabaseExtension::Vector, Some(&Version::new(0, 7, 0))).unwrap();
        repo.update_extension(DatabaseExtension::Cube, None).unwrap();

        assert_eq!(
            db.log(),
            [
                "CREATE EXTENSION IF NOT EXISTS earthdistance",
                "ALTER EXTENSION vector UPDATE TO '0.7.0'",
                "ALTER EXTENSION cube UPDATE",
            ]
        );
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn test_update_vector_extension_rejects_other_extensions() {
        let db = FakeDatabase::new();
        let repo = repository(&db, VectorExtension::PgVector);
        assert!(matches!(
            repo.update_vector_extension(DatabaseExtension::Cube, None),
            Err(CoordinatorError::Configuration(_))
        ));
    }

    #[test]
    fn test_update_vector_extension_scenario() {
        let db = FakeDatabase::new();
        db.on_query("pg_extension WHERE extname = $1 -- vector", &["0.5.0"]);
        let repo = repository(&db, VectorExtension::PgVector);

        let result = repo
            .update_vector_extension(DatabaseExtension::Vector, Some(&Version::new(0, 7, 0)))
            .unwrap();

        assert!(!result.restart_required);
        assert_eq!(db.count("ALTER EXTENSION vector UPDATE TO '0.7.0'"), 1);
        assert_eq!(db.count("REINDEX INDEX clip_index"), 1);
        assert_eq!(db.count("REINDEX INDEX face_index"), 1);
    }

    #[test]
    fn test_reindex_uses_configured_extension() {
        let db = FakeDatabase::new();
        db.on_query("atttypmod", &["768"])
            .fail_once("REINDEX INDEX face_index", crate::error::QueryError::new("broken"));
        let repo = repository(&db, VectorExtension::PgVectoRs);

        repo.reindex(VectorIndex::Face).unwrap();

        assert_eq!(db.count("vector(768)"), 1);
        assert_eq!(db.count("COMMIT"), 1);
    }

    #[test]
    fn test_run_migrations_under_lock() {
        let db = FakeDatabase::new();
        let repo = repository(&db, VectorExtension::PgVector);

        let applied = repo
            .with_lock(DatabaseLock::Migrations, || {
                assert!(repo.is_busy(DatabaseLock::Migrations));
                repo.run_migrations(MigrationOptions { transaction: TransactionMode::All })
            })
            .unwrap();

        assert_eq!(applied, ["0001_init"]);
        let lock = db.position("pg_advisory_lock(200)").unwrap();
        let migration = db.position("CREATE TABLE smart_search").unwrap();
        let unlock = db.position("pg_advisory_unlock(200)").unwrap();
        assert!(lock < migration && migration < unlock);
        assert!(!repo.is_busy(DatabaseLock::Migrations));
        assert_eq!(db.open_connections(), 0);
    }
}
