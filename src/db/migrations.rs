//! Schema migrations.
//!
//! The coordinator does not own the schema. It only runs whatever
//! [`MigrationRunner`] it was given, under the `Migrations` lock, so that
//! migrations never interleave with extension upgrades.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::SqlExecutor;
use crate::error::{CoordinatorError, Result};

/// How pending migrations are grouped into transactions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    /// All pending migrations in one transaction.
    All,
    /// No transaction at all.
    None,
    /// One transaction per migration.
    #[default]
    Each,
}

impl FromStr for TransactionMode {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(TransactionMode::All),
            "none" => Ok(TransactionMode::None),
            "each" => Ok(TransactionMode::Each),
            other => Err(CoordinatorError::Configuration(format!(
                "unknown transaction mode {:?}, expected all, none or each",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    pub transaction: TransactionMode,
}

/// Something that brings the schema up to date.
pub trait MigrationRunner: Send + Sync {
    /// Apply pending migrations and return their names in order.
    fn run(&self, conn: &mut dyn SqlExecutor, options: MigrationOptions) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
    pub sql: String,
}

const MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Applies plain SQL migrations in name order, recording each one in the
/// `migrations` table.
#[derive(Debug, Clone, Default)]
pub struct SqlMigrationRunner {
    migrations: Vec<Migration>,
}

impl SqlMigrationRunner {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by(|a, b| a.name.cmp(&b.name));
        Self { migrations }
    }

    /// Load every `*.sql` file in `dir`; the file stem is the migration name.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            CoordinatorError::Migration(format!("cannot read {}: {}", dir.display(), e))
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| CoordinatorError::Migration(e.to_string()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let sql = std::fs::read_to_string(&path).map_err(|e| {
                CoordinatorError::Migration(format!("cannot read {}: {}", path.display(), e))
            })?;
            migrations.push(Migration {
                name: name.to_string(),
                sql,
            });
        }

        Ok(Self::new(migrations))
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }
}

fn apply(conn: &mut dyn SqlExecutor, migration: &Migration) -> Result<()> {
    tracing::info!(migration = %migration.name, "Applying migration");
    conn.batch_execute(&migration.sql)?;
    conn.execute(
        "INSERT INTO migrations (name) VALUES ($1)",
        &[migration.name.as_str()],
    )?;
    Ok(())
}

impl MigrationRunner for SqlMigrationRunner {
    fn run(&self, conn: &mut dyn SqlExecutor, options: MigrationOptions) -> Result<Vec<String>> {
        conn.batch_execute(MIGRATIONS_TABLE)?;
        let applied: HashSet<String> = conn
            .query_column("SELECT name FROM migrations", &[])?
            .into_iter()
            .flatten()
            .collect();

        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.name))
            .collect();
        if pending.is_empty() {
            tracing::debug!("No pending migrations");
            return Ok(Vec::new());
        }

        match options.transaction {
            TransactionMode::All => conn.transaction(&mut |tx| {
                for migration in &pending {
                    apply(tx, migration)?;
                }
                Ok(())
            })?,
            TransactionMode::Each => {
                for migration in &pending {
                    conn.transaction(&mut |tx| apply(tx, migration))?;
                }
            }
            TransactionMode::None => {
                for migration in &pending {
                    apply(conn, migration)?;
                }
            }
        }

        Ok(pending.iter().map(|m| m.name.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::FakeDatabase;
    use crate::error::QueryError;

    fn runner() -> SqlMigrationRunner {
        SqlMigrationRunner::new(vec![
            Migration {
                name: "0002_face_search".into(),
                sql: "CREATE TABLE face_search (face_id UUID PRIMARY KEY)".into(),
            },
            Migration {
                name: "0001_smart_search".into(),
                sql: "CREATE TABLE smart_search (asset_id UUID PRIMARY KEY)".into(),
            },
        ])
    }

    #[test]
    fn test_transaction_mode_parsing() {
        assert_eq!("all".parse::<TransactionMode>().unwrap(), TransactionMode::All);
        assert_eq!("none".parse::<TransactionMode>().unwrap(), TransactionMode::None);
        assert_eq!("each".parse::<TransactionMode>().unwrap(), TransactionMode::Each);
        assert!("some".parse::<TransactionMode>().is_err());
        assert_eq!(MigrationOptions::default().transaction, TransactionMode::Each);
    }

    #[test]
    fn test_each_mode_wraps_every_migration() {
        let db = FakeDatabase::new();
        let mut conn = db.connect();

        let applied = runner()
            .run(&mut conn, MigrationOptions { transaction: TransactionMode::Each })
            .unwrap();

        assert_eq!(applied, ["0001_smart_search", "0002_face_search"]);
        assert_eq!(db.count("BEGIN"), 2);
        assert_eq!(db.count("COMMIT"), 2);
        assert!(db.position("smart_search (").unwrap() < db.position("face_search (").unwrap());
        assert_eq!(db.count("INSERT INTO migrations"), 2);
    }

    #[test]
    fn test_all_mode_uses_one_transaction() {
        let db = FakeDatabase::new();
        let mut conn = db.connect();

        runner()
            .run(&mut conn, MigrationOptions { transaction: TransactionMode::All })
            .unwrap();

        assert_eq!(db.count("BEGIN"), 1);
        assert_eq!(db.log().last().unwrap(), "COMMIT");
    }

    #[test]
    fn test_none_mode_skips_transactions() {
        let db = FakeDatabase::new();
        let mut conn = db.connect();

        runner()
            .run(&mut conn, MigrationOptions { transaction: TransactionMode::None })
            .unwrap();

        assert_eq!(db.count("BEGIN"), 0);
        assert_eq!(db.count("INSERT INTO migrations"), 2);
    }

    #[test]
    fn test_applied_migrations_are_skipped() {
        let db = FakeDatabase::new();
        db.on_query("SELECT name FROM migrations", &["0001_smart_search"]);
        let mut conn = db.connect();

        let applied = runner().run(&mut conn, MigrationOptions::default()).unwrap();

        assert_eq!(applied, ["0002_face_search"]);
        assert_eq!(db.count("CREATE TABLE smart_search"), 0);
    }

    #[test]
    fn test_failed_migration_rolls_back_its_transaction() {
        let db = FakeDatabase::new();
        db.fail_once("CREATE TABLE face_search", QueryError::new("syntax error"));
        let mut conn = db.connect();

        let result = runner().run(&mut conn, MigrationOptions::default());

        assert!(matches!(result, Err(CoordinatorError::Query(_))));
        assert_eq!(db.count("COMMIT"), 1);
        assert_eq!(db.log().last().unwrap(), "ROLLBACK");
    }

    #[test]
    fn test_from_dir_reads_sql_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0002_b.sql"), "SELECT 2").unwrap();
        std::fs::write(dir.path().join("0001_a.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let runner = SqlMigrationRunner::from_dir(dir.path()).unwrap();

        let names: Vec<&str> = runner.migrations().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["0001_a", "0002_b"]);
        assert_eq!(runner.migrations()[0].sql, "SELECT 1");
    }

    #[test]
    fn test_from_dir_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = SqlMigrationRunner::from_dir(&dir.path().join("missing"));
        assert!(matches!(result, Err(CoordinatorError::Migration(_))));
    }
}
