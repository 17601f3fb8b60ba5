//! Named locks serialising schema and extension changes.
//!
//! A lock is held at two levels. Inside the process, the lock table lets at
//! most one caller per lock name proceed and gives `is_busy`/`wait` something
//! to observe. Across processes, a PostgreSQL session advisory lock on a
//! session opened outside the pool does the same for every server sharing the database.
//! Both are released by guards in reverse acquisition order.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::{ConnectionProvider, SqlExecutor};
use crate::error::{CoordinatorError, Result};

/// Advisory lock keys. The numbers are shared with every running process and
/// must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseLock {
    GeodataImport,
    Migrations,
    SystemFileMounts,
    StorageTemplateMigration,
    ClipDimSize,
    LibraryWatch,
    GetSystemConfig,
}

impl DatabaseLock {
    pub const ALL: [DatabaseLock; 7] = [
        DatabaseLock::GeodataImport,
        DatabaseLock::Migrations,
        DatabaseLock::SystemFileMounts,
        DatabaseLock::StorageTemplateMigration,
        DatabaseLock::ClipDimSize,
        DatabaseLock::LibraryWatch,
        DatabaseLock::GetSystemConfig,
    ];

    pub fn id(&self) -> i64 {
        match self {
            DatabaseLock::GeodataImport => 100,
            DatabaseLock::Migrations => 200,
            DatabaseLock::SystemFileMounts => 300,
            DatabaseLock::StorageTemplateMigration => 420,
            DatabaseLock::ClipDimSize => 512,
            DatabaseLock::LibraryWatch => 1337,
            DatabaseLock::GetSystemConfig => 69,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DatabaseLock::GeodataImport => "GeodataImport",
            DatabaseLock::Migrations => "Migrations",
            DatabaseLock::SystemFileMounts => "SystemFileMounts",
            DatabaseLock::StorageTemplateMigration => "StorageTemplateMigration",
            DatabaseLock::ClipDimSize => "CLIPDimSize",
            DatabaseLock::LibraryWatch => "LibraryWatch",
            DatabaseLock::GetSystemConfig => "GetSystemConfig",
        }
    }
}

impl fmt::Display for DatabaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

/// A held PostgreSQL session advisory lock and the connection holding it.
///
/// Call [`AdvisoryLock::release`] to unlock and observe errors. Dropping the
/// guard unlocks as well, logging instead of returning failures.
pub struct AdvisoryLock {
    lock: DatabaseLock,
    conn: Option<Box<dyn SqlExecutor + Send>>,
}

impl AdvisoryLock {
    /// Block until the advisory lock is granted on `conn`.
    pub fn acquire(mut conn: Box<dyn SqlExecutor + Send>, lock: DatabaseLock) -> Result<Self> {
        conn.execute(&format!("SELECT pg_advisory_lock({})", lock.id()), &[])?;
        tracing::debug!(lock = %lock, "Advisory lock acquired");
        Ok(Self {
            lock,
            conn: Some(conn),
        })
    }

    /// Take the advisory lock only if no other session holds it.
    pub fn try_acquire(mut conn: Box<dyn SqlExecutor + Send>, lock: DatabaseLock) -> Result<Option<Self>> {
        let rows = conn.query_column(
            &format!("SELECT pg_try_advisory_lock({})::text", lock.id()),
            &[],
        )?;
        let granted = matches!(rows.first(), Some(Some(v)) if v == "true" || v == "t");
        if !granted {
            return Ok(None);
        }
        Ok(Some(Self {
            lock,
            conn: Some(conn),
        }))
    }

    pub fn lock(&self) -> DatabaseLock {
        self.lock
    }

    /// Unlock, then close the session.
    pub fn release(mut self) -> Result<()> {
        self.unlock()
    }

    fn unlock(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        conn.execute(&format!("SELECT pg_advisory_unlock({})", self.lock.id()), &[])?;
        tracing::debug!(lock = %self.lock, "Advisory lock released");
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::warn!(lock = %self.lock, error = %e, "Failed to release advisory lock");
        }
    }
}

#[derive(Default)]
struct LockTable {
    held: Mutex<HashSet<DatabaseLock>>,
    released: Condvar,
}

impl LockTable {
    fn entries(&self) -> MutexGuard<'_, HashSet<DatabaseLock>> {
        // The set stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until_free<'a>(
        &self,
        mut held: MutexGuard<'a, HashSet<DatabaseLock>>,
        lock: DatabaseLock,
    ) -> MutexGuard<'a, HashSet<DatabaseLock>> {
        while held.contains(&lock) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held
    }
}

/// Marks a lock name busy in this process until dropped.
struct InProcessLock<'a> {
    table: &'a LockTable,
    lock: DatabaseLock,
}

impl<'a> InProcessLock<'a> {
    fn acquire(table: &'a LockTable, lock: DatabaseLock) -> Self {
        let held = table.entries();
        let mut held = table.wait_until_free(held, lock);
        held.insert(lock);
        Self { table, lock }
    }
}

impl Drop for InProcessLock<'_> {
    fn drop(&mut self) {
        self.table.entries().remove(&self.lock);
        self.table.released.notify_all();
    }
}

/// Process-wide coordinator for [`DatabaseLock`]s.
pub struct LockManager {
    provider: Arc<dyn ConnectionProvider>,
    table: LockTable,
}

impl LockManager {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            table: LockTable::default(),
        }
    }

    /// Run `operation` while holding `lock` in this process and in the
    /// database.
    pub fn with_lock<R, E, F>(&self, lock: DatabaseLock, operation: F) -> std::result::Result<R, E>
    where
        F: FnOnce() -> std::result::Result<R, E>,
        E: From<CoordinatorError>,
    {
        let _local = InProcessLock::acquire(&self.table, lock);
        let conn = self.provider.session()?;
        let advisory = AdvisoryLock::acquire(conn, lock)?;

        let result = operation();
        let released = advisory.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Take the database lock without waiting. The in-process table is not
    /// involved; the guard alone represents ownership.
    pub fn try_lock(&self, lock: DatabaseLock) -> Result<Option<AdvisoryLock>> {
        let conn = self.provider.session()?;
        AdvisoryLock::try_acquire(conn, lock)
    }

    /// Whether a `with_lock` call for `lock` is in flight in this process.
    pub fn is_busy(&self, lock: DatabaseLock) -> bool {
        self.table.entries().contains(&lock)
    }

    /// Block until no caller in this process holds `lock`. Never takes the
    /// lock itself.
    pub fn wait(&self, lock: DatabaseLock) {
        let held = self.table.entries();
        drop(self.table.wait_until_free(held, lock));
    }
}
