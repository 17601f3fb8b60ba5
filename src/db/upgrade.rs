//! Vector extension upgrades and index maintenance.
//!
//! An upgrade runs these steps on one connection:
//!
//! 1. read the installed version (fail if not installed);
//! 2. classify the difference to the target version;
//! 3. for a minor or major pgvecto.rs upgrade, move the extension into its
//!    own `vectors` schema first, since it cannot be relocated in place;
//! 4. `ALTER EXTENSION ... UPDATE TO` the target;
//! 5. for a minor or major upgrade, either run pgvecto.rs's catalog repair
//!    (a restart is then needed to load the new library) or reindex both
//!    pgvector indexes.
//!
//! The steps are not wrapped in a single transaction: extension updates do
//! not combine safely with the other DDL here. A failure part way leaves the
//! database in an intermediate state for the caller to inspect.

use super::extensions::{VectorExtension, VectorIndex};
use super::{inventory, SqlExecutor};
use crate::error::{CoordinatorError, Result};
use crate::version::{Version, VersionDiff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpgradeResult {
    pub restart_required: bool,
}

/// What has to happen after the extension itself was updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostUpgrade {
    Nothing,
    RepairCatalog,
    Reindex,
}

/// Decisions for one upgrade, derived from the versions alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePlan {
    pub extension: VectorExtension,
    pub current: Version,
    pub target: Option<Version>,
    pub diff: VersionDiff,
    pub relocate_schema: bool,
    pub post_upgrade: PostUpgrade,
}

impl UpgradePlan {
    pub fn new(extension: VectorExtension, current: Version, target: Option<Version>) -> Self {
        // Only moving forward needs the relocation and post-upgrade steps.
        let diff = match &target {
            Some(target) if current.is_older_than(target) => current.diff(target),
            _ => VersionDiff::None,
        };
        let is_vectors = extension == VectorExtension::PgVectoRs;
        let post_upgrade = match (diff.is_minor_or_major(), is_vectors) {
            (false, _) => PostUpgrade::Nothing,
            (true, true) => PostUpgrade::RepairCatalog,
            (true, false) => PostUpgrade::Reindex,
        };

        Self {
            extension,
            current,
            target,
            diff,
            relocate_schema: is_vectors && diff.is_minor_or_major(),
            post_upgrade,
        }
    }

    pub fn update_sql(&self) -> String {
        update_extension_sql(self.extension.extension().sql_name(), self.target.as_ref())
    }
}

pub(crate) fn update_extension_sql(name: &str, target: Option<&Version>) -> String {
    match target {
        Some(version) => format!("ALTER EXTENSION {} UPDATE TO '{}'", name, version),
        None => format!("ALTER EXTENSION {} UPDATE", name),
    }
}

/// Upgrade `extension` to `target`, or to the newest available version when
/// no target is given.
pub fn update_vector_extension(
    conn: &mut dyn SqlExecutor,
    extension: VectorExtension,
    target: Option<&Version>,
) -> Result<UpgradeResult> {
    let current = inventory::extension_version(conn, extension.extension())?
        .ok_or(CoordinatorError::NotInstalled(extension.package_name()))?;

    let target = match target {
        Some(version) => Some(version.clone()),
        None => inventory::available_extension_version(conn, extension.extension())?
            .filter(|available| current.is_older_than(available)),
    };

    let plan = UpgradePlan::new(extension, current, target);
    tracing::info!(
        extension = %plan.extension,
        current = %plan.current,
        to = ?plan.target.as_ref().map(|v| v.to_string()),
        diff = ?plan.diff,
        "Updating vector extension"
    );

    if plan.relocate_schema {
        relocate_vectors_schema(conn, &plan.current)?;
    }

    conn.batch_execute(&plan.update_sql())?;

    match plan.post_upgrade {
        PostUpgrade::Nothing => Ok(UpgradeResult {
            restart_required: false,
        }),
        PostUpgrade::RepairCatalog => {
            conn.batch_execute("SELECT pgvectors_upgrade()")?;
            tracing::warn!(
                extension = %plan.extension,
                "Extension upgraded, the database server must be restarted"
            );
            Ok(UpgradeResult {
                restart_required: true,
            })
        }
        PostUpgrade::Reindex => {
            for index in VectorIndex::ALL {
                reindex(conn, extension, index)?;
            }
            Ok(UpgradeResult {
                restart_required: false,
            })
        }
    }
}

fn set_search_path(conn: &mut dyn SqlExecutor) -> Result<()> {
    conn.batch_execute(r#"SET search_path TO "$user", public, vectors"#)?;
    Ok(())
}

/// Move pgvecto.rs into the `vectors` schema by temporarily marking it
/// relocatable.
fn relocate_vectors_schema(conn: &mut dyn SqlExecutor, current: &Version) -> Result<()> {
    let name = VectorExtension::PgVectoRs.extension().sql_name();
    let current = current.to_string();

    set_search_path(conn)?;
    conn.batch_execute("CREATE SCHEMA IF NOT EXISTS vectors")?;
    conn.execute(
        "UPDATE pg_catalog.pg_extension SET extversion = $1 WHERE extname = $2",
        &[current.as_str(), name],
    )?;
    conn.execute(
        "UPDATE pg_catalog.pg_extension SET extrelocatable = true WHERE extname = $1",
        &[name],
    )?;
    conn.batch_execute("ALTER EXTENSION vectors SET SCHEMA vectors")?;
    conn.execute(
        "UPDATE pg_catalog.pg_extension SET extrelocatable = false WHERE extname = $1",
        &[name],
    )?;
    Ok(())
}

/// Rebuild `index`.
///
/// Under pgvecto.rs a failed rebuild is retried once after round-tripping the
/// embedding column through `real[]`, all inside one transaction.
pub fn reindex(conn: &mut dyn SqlExecutor, extension: VectorExtension, index: VectorIndex) -> Result<()> {
    let err = match conn.batch_execute(&format!("REINDEX INDEX {}", index)) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if extension != VectorExtension::PgVectoRs {
        return Err(err.into());
    }

    tracing::warn!(index = %index, error = %err, "Could not reindex, attempting to auto-fix");
    recover_index(conn, index).map_err(|e| match e {
        CoordinatorError::Query(source) => CoordinatorError::RecoverableIndex { index, source },
        other => other,
    })
}

fn recover_index(conn: &mut dyn SqlExecutor, index: VectorIndex) -> Result<()> {
    let dimensions = inventory::embedding_dimensions(conn, index)?;
    let table = index.table();

    conn.transaction(&mut |tx| {
        set_search_path(tx)?;
        tx.batch_execute(&format!("DROP INDEX IF EXISTS {}", index))?;
        tx.batch_execute(&format!(
            "ALTER TABLE {} ALTER COLUMN embedding SET DATA TYPE real[]",
            table
        ))?;
        tx.batch_execute(&format!(
            "ALTER TABLE {} ALTER COLUMN embedding SET DATA TYPE vector({})",
            table, dimensions
        ))?;
        create_vector_index(tx, VectorExtension::PgVectoRs, index)
    })?;

    tracing::info!(index = %index, "Index recreated");
    Ok(())
}

/// Create `index` with the standard HNSW parameters if it does not exist.
pub fn create_vector_index(
    conn: &mut dyn SqlExecutor,
    extension: VectorExtension,
    index: VectorIndex,
) -> Result<()> {
    if extension == VectorExtension::PgVectoRs {
        conn.batch_execute("SET vectors.pgvector_compatibility=on")?;
    }
    conn.batch_execute(&index.create_sql())?;
    Ok(())
}

/// Whether `index` has to be rebuilt before it can be used.
///
/// Only pgvecto.rs reports index status. An index it does not know about
/// needs to be created, so that counts as needing a rebuild.
pub fn should_reindex(
    conn: &mut dyn SqlExecutor,
    extension: VectorExtension,
    index: VectorIndex,
) -> Result<bool> {
    if extension != VectorExtension::PgVectoRs {
        return Ok(false);
    }

    match conn.query_column(
        "SELECT idx_status FROM pg_vector_index_stat WHERE indexname = $1",
        &[index.name()],
    ) {
        Ok(rows) => Ok(matches!(rows.first(), Some(Some(status)) if status == "UPGRADE")),
        Err(e) if e.is_missing_index() => Ok(true),
        Err(e) => Err(e.into()),
    }
}
