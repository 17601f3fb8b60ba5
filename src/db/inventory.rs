//! Catalog lookups: installed and available extension versions, server
//! version, embedding column dimensions.

use super::extensions::{DatabaseExtension, VectorIndex};
use super::SqlExecutor;
use crate::error::{CoordinatorError, QueryError, Result};
use crate::version::Version;

/// Installed version of `extension`, or `None` when it is not installed.
pub fn extension_version(
    conn: &mut dyn SqlExecutor,
    extension: DatabaseExtension,
) -> Result<Option<Version>> {
    let rows = conn.query_column(
        "SELECT extversion FROM pg_extension WHERE extname = $1",
        &[extension.sql_name()],
    )?;
    match rows.into_iter().flatten().next() {
        Some(raw) => Ok(Some(Version::parse(&raw)?.remap_installed())),
        None => Ok(None),
    }
}

/// Versions of `extension` the server could install, other than the one
/// currently installed. Rows that are not `x.y.z` are skipped.
pub fn available_extension_versions(
    conn: &mut dyn SqlExecutor,
    extension: DatabaseExtension,
) -> Result<Vec<Version>> {
    let rows = conn.query_column(
        "SELECT version FROM pg_available_extension_versions WHERE name = $1 AND installed = false",
        &[extension.sql_name()],
    )?;
    let mut versions = Vec::new();
    for raw in rows.into_iter().flatten() {
        match Version::parse(&raw) {
            Ok(version) => versions.push(version),
            Err(e) => tracing::warn!(
                extension = %extension,
                version = %raw,
                error = %e,
                "Skipping unparsable extension version"
            ),
        }
    }
    // Sorting in SQL would compare the versions as text.
    versions.sort();
    Ok(versions)
}

/// Highest version of `extension` the server could install that is not the
/// one currently installed.
pub fn available_extension_version(
    conn: &mut dyn SqlExecutor,
    extension: DatabaseExtension,
) -> Result<Option<Version>> {
    Ok(available_extension_versions(conn, extension)?.pop())
}

pub fn postgres_version(conn: &mut dyn SqlExecutor) -> Result<Version> {
    let rows = conn.query_column("SELECT current_setting('server_version_num')", &[])?;
    let raw = rows.into_iter().flatten().next().unwrap_or_default();
    let num: u32 = raw
        .trim()
        .parse()
        .map_err(|_| CoordinatorError::Parse { input: raw.clone() })?;
    Ok(Version::from_server_version_num(num))
}

/// Declared dimension of the `embedding` column behind `index`.
pub fn embedding_dimensions(conn: &mut dyn SqlExecutor, index: VectorIndex) -> Result<u32> {
    let rows = conn.query_column(
        "SELECT atttypmod::text FROM pg_attribute f \
         JOIN pg_class c ON c.oid = f.attrelid \
         WHERE c.relkind = 'r'::char AND f.attnum > 0 AND c.relname = $1 AND f.attname = 'embedding'",
        &[index.table()],
    )?;
    let raw = rows.into_iter().flatten().next().ok_or_else(|| {
        QueryError::new(format!("table {} has no embedding column", index.table()))
    })?;
    raw.trim()
        .parse()
        .map_err(|_| CoordinatorError::Parse { input: raw.clone() })
}
