//! Startup routine that brings the database into a usable state.

use crate::db::extensions::MIN_POSTGRES_VERSION;
use crate::db::{
    DatabaseExtension, DatabaseLock, DatabaseRepository, MigrationOptions, VectorIndex,
};
use crate::error::{CoordinatorError, Result};
use crate::version::Version;

/// Outcome of [`DatabaseService::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub extension: DatabaseExtension,
    pub version: Version,
    pub restart_required: bool,
    pub reindexed: Vec<VectorIndex>,
    pub migrations: Vec<String>,
}

pub struct DatabaseService<'a> {
    repository: &'a DatabaseRepository,
}

impl<'a> DatabaseService<'a> {
    pub fn new(repository: &'a DatabaseRepository) -> Self {
        Self { repository }
    }

    /// Check the server, install or update the vector extension, rebuild
    /// stale indexes and run migrations. Everything after the server check
    /// runs under [`DatabaseLock::Migrations`].
    pub fn init(&self) -> Result<BootstrapReport> {
        self.assert_postgres()?;

        self.repository.with_lock(DatabaseLock::Migrations, || {
            tracing::info!("Acquired migration lock");
            let (extension, version, restart_required) = self.prepare_vector_extension()?;
            let reindexed = self.reindex_stale()?;
            let migrations = self.repository.run_migrations(MigrationOptions {
                transaction: self.repository.config().migration_mode,
            })?;
            if !migrations.is_empty() {
                tracing::info!(count = migrations.len(), "Migrations applied");
            }

            Ok(BootstrapReport {
                extension,
                version,
                restart_required,
                reindexed,
                migrations,
            })
        })
    }

    fn assert_postgres(&self) -> Result<()> {
        let version = self.repository.get_postgres_version()?;
        if version.is_older_than(&MIN_POSTGRES_VERSION) {
            return Err(CoordinatorError::UnsupportedVersion {
                what: "PostgreSQL",
                found: version.to_string(),
                expected: format!(">={}", MIN_POSTGRES_VERSION),
            });
        }
        tracing::debug!(version = %version, "PostgreSQL version supported");
        Ok(())
    }

    fn prepare_vector_extension(&self) -> Result<(DatabaseExtension, Version, bool)> {
        let vector = self.repository.config().vector_extension;
        let extension = self.repository.get_preferred_vector_extension();
        let range = self.repository.get_extension_version_range(vector);

        let available = self.repository.get_available_extension_versions(extension)?;
        let mut installed = self.repository.get_extension_version(extension)?;

        if installed.is_none() {
            if available.is_empty() {
                return Err(CoordinatorError::NotInstalled(extension.package_name()));
            }
            tracing::info!(extension = %extension, "Creating extension");
            self.repository.create_extension(extension)?;
            installed = self.repository.get_extension_version(extension)?;
        }
        let mut installed =
            installed.ok_or(CoordinatorError::NotInstalled(extension.package_name()))?;

        let mut restart_required = false;
        let candidate = available
            .into_iter()
            .filter(|v| range.contains(v) && installed.is_older_than(v))
            .max();
        if let Some(candidate) = candidate {
            tracing::info!(
                extension = %extension,
                from = %installed,
                to = %candidate,
                "Updating extension"
            );
            let result = self
                .repository
                .update_vector_extension(extension, Some(&candidate))?;
            restart_required = result.restart_required;
            if restart_required {
                tracing::warn!(
                    extension = %extension,
                    "The database server must be restarted before the new version is usable"
                );
            }
            installed = candidate;
        }

        if !range.contains(&installed) {
            return Err(CoordinatorError::UnsupportedVersion {
                what: extension.package_name(),
                found: installed.to_string(),
                expected: range.to_string(),
            });
        }

        Ok((extension, installed, restart_required))
    }

    fn reindex_stale(&self) -> Result<Vec<VectorIndex>> {
        let mut reindexed = Vec::new();
        for index in VectorIndex::ALL {
            let stale = self.repository.should_reindex(index).map_err(|e| {
                tracing::warn!(index = %index, error = %e, "Could not run vector reindexing checks");
                e
            })?;
            if stale {
                tracing::info!(index = %index, "Reindexing");
                self.repository.reindex(index)?;
                reindexed.push(index);
            }
        }
        Ok(reindexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::db::migrations::{Migration, SqlMigrationRunner};
    use crate::db::testing::FakeDatabase;
    use crate::db::VectorExtension;
    use crate::error::QueryError;
    use std::sync::Arc;

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
    fn test_rejects_old_postgres() {
        let db = FakeDatabase::new();
        db.on_query("server_version_num", &["130012"]);
        let repo = repository(&db, VectorExtension::PgVector);

        let result = DatabaseService::new(&repo).init();

        assert!(matches!(
            result,
            Err(CoordinatorError::UnsupportedVersion { what: "PostgreSQL", .. })
        ));
        assert_eq!(db.count("pg_advisory_lock"), 0);
    }

    #[test]
    fn test_missing_extension_fails_and_releases_lock() {
        let db = FakeDatabase::new();
        db.on_query("server_version_num", &["160002"]);
        let repo = repository(&db, VectorExtension::PgVector);

        let result = DatabaseService::new(&repo).init();

        assert!(matches!(result, Err(CoordinatorError::NotInstalled("pgvector"))));
        assert_eq!(db.count("pg_advisory_unlock(200)"), 1);
        assert!(!repo.is_busy(DatabaseLock::Migrations));
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn test_pgvector_up_to_date() {
        let db = FakeDatabase::new();
        db.on_query("server_version_num", &["160002"])
            .on_query("pg_extension WHERE extname", &["0.7.0"])
            .on_query("pg_available_extension_versions", &["0.6.0"]);
        let repo = repository(&db, VectorExtension::PgVector);

        let report = DatabaseService::new(&repo).init().unwrap();

        assert_eq!(report.extension, DatabaseExtension::Vector);
        assert_eq!(report.version, Version::new(0, 7, 0));
        assert!(!report.restart_required);
        assert!(report.reindexed.is_empty());
        assert_eq!(report.migrations, ["0001_init"]);
        assert_eq!(db.count("ALTER EXTENSION"), 0);
        assert_eq!(db.count("CREATE EXTENSION"), 0);
    }

    #[test]
    fn test_pgvecto_rs_update_and_reindex() {
        let db = FakeDatabase::new();
        db.on_query("server_version_num", &["160002"])
            .on_query("pg_extension WHERE extname", &["0.2.0"])
            .on_query("pg_available_extension_versions", &["0.3.0", "0.9.0"])
            .on_query("pg_vector_index_stat WHERE indexname = $1 -- clip_index", &["NORMAL"])
            .fail_once(
                "pg_vector_index_stat WHERE indexname = $1 -- face_index",
                QueryError::new("pgvecto.rs: The index is not existing in the background worker."),
            );
        let repo = repository(&db, VectorExtension::PgVectoRs);

        let report = DatabaseService::new(&repo).init().unwrap();

        // 0.9.0 is outside the supported range, so nothing happens with it.
        assert_eq!(db.count("UPDATE TO '0.9.0'"), 0);
        assert_eq!(db.count("ALTER EXTENSION vectors UPDATE TO '0.3.0'"), 1);
        assert!(report.restart_required);
        assert_eq!(report.version, Version::new(0, 3, 0));
        assert_eq!(report.reindexed, [VectorIndex::Face]);
        assert_eq!(db.count("REINDEX INDEX face_index"), 1);
        assert!(db.position("REINDEX INDEX face_index").unwrap() < db.position("0001_init").unwrap());
    }

    #[test]
    fn test_newer_versions_outside_range_are_ignored() {
        let db = FakeDatabase::new();
        db.on_query("server_version_num", &["160002"])
            .on_query("pg_extension WHERE extname", &["0.4.0"])
            .on_query("pg_available_extension_versions", &["0.5.0", "0.2.0"])
            .on_query("pg_vector_index_stat", &["NORMAL"]);
        let repo = repository(&db, VectorExtension::PgVectoRs);

        let report = DatabaseService::new(&repo).init().unwrap();

        assert_eq!(report.version, Version::new(0, 4, 0));
        assert!(!report.restart_required);
        assert_eq!(db.count("ALTER EXTENSION"), 0);
    }

    #[test]
    fn test_creates_extension_when_not_installed() {
        let db = FakeDatabase::new();
        db.on_query("server_version_num", &["150000"])
            .on_query("pg_available_extension_versions", &["0.6.0"]);
        let repo = repository(&db, VectorExtension::PgVector);

        let result = DatabaseService::new(&repo).init();

        // The fake never reports the extension as installed afterwards.
        assert!(matches!(result, Err(CoordinatorError::NotInstalled("pgvector"))));
        assert_eq!(db.count("CREATE EXTENSION IF NOT EXISTS vector"), 1);
    }

    #[test]
    fn test_installed_version_out_of_range() {
        let db = FakeDatabase::new();
        db.on_query("server_version_num", &["160002"])
            .on_query("pg_extension WHERE extname", &["0.1.1"]);
        let repo = repository(&db, VectorExtension::PgVectoRs);

        let result = DatabaseService::new(&repo).init();

        match result {
            Err(CoordinatorError::UnsupportedVersion { found, .. }) => assert_eq!(found, "0.1.11"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(db.count("INSERT INTO migrations"), 0);
    }
}
