//! In-memory stand-in for PostgreSQL used by unit tests.
//!
//! Every statement is appended to a shared log. Query results and failures
//! are scripted by matching a substring of the SQL text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ConnectionProvider, SqlExecutor, TransactionBody};
use crate::error::{QueryError, Result};

#[derive(Default)]
struct State {
    log: Vec<String>,
    results: Vec<(String, Vec<Option<String>>)>,
    failures: HashMap<String, Vec<QueryError>>,
    connections: usize,
    released: usize,
    sessions: usize,
}

/// Shared fake database; clones see the same state.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<State>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned by any statement whose logged text (SQL followed by
    /// ` -- ` and its parameters) contains `pattern`. First match wins.
    pub fn on_query(&self, pattern: &str, rows: &[&str]) -> &Self {
        let rows = rows.iter().map(|r| Some(r.to_string())).collect();
        self.state
            .lock()
            .unwrap()
            .results
            .push((pattern.to_string(), rows));
        self
    }

    /// Fail the next statement containing `pattern`. Queued failures are
    /// consumed one per matching statement.
    pub fn fail_once(&self, pattern: &str, error: QueryError) -> &Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(pattern.to_string())
            .or_default()
            .push(error);
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Index of the first logged statement containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.log().iter().position(|s| s.contains(pattern))
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.log().iter().filter(|s| s.contains(pattern)).count()
    }

    pub fn open_connections(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.connections - state.released
    }

    /// Connections handed out through [`ConnectionProvider::session`].
    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().sessions
    }

    pub fn connect(&self) -> FakeConnection {
        self.state.lock().unwrap().connections += 1;
        FakeConnection { db: self.clone() }
    }

    fn run(&self, sql: &str, params: &[&str]) -> std::result::Result<Vec<Option<String>>, QueryError> {
        let mut state = self.state.lock().unwrap();
        let entry = if params.is_empty() {
            sql.to_string()
        } else {
            format!("{} -- {}", sql, params.join(", "))
        };
        state.log.push(entry.clone());

        let failed = state
            .failures
            .iter_mut()
            .find(|(pattern, queue)| entry.contains(pattern.as_str()) && !queue.is_empty())
            .map(|(_, queue)| queue.remove(0));
        if let Some(error) = failed {
            return Err(error);
        }

        Ok(state
            .results
            .iter()
            .find(|(pattern, _)| entry.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

impl ConnectionProvider for FakeDatabase {
    fn acquire(&self) -> Result<Box<dyn SqlExecutor + Send>> {
        Ok(Box::new(self.connect()))
    }

    fn session(&self) -> Result<Box<dyn SqlExecutor + Send>> {
        self.state.lock().unwrap().sessions += 1;
        Ok(Box::new(self.connect()))
    }
}

pub struct FakeConnection {
    db: FakeDatabase,
}

impl SqlExecutor for FakeConnection {
    fn execute(&mut self, sql: &str, params: &[&str]) -> std::result::Result<u64, QueryError> {
        self.db.run(sql, params).map(|rows| rows.len() as u64)
    }

    fn batch_execute(&mut self, sql: &str) -> std::result::Result<(), QueryError> {
        self.db.run(sql, &[]).map(|_| ())
    }

    fn query_column(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> std::result::Result<Vec<Option<String>>, QueryError> {
        self.db.run(sql, params)
    }

    fn transaction(&mut self, body: &mut TransactionBody<'_>) -> Result<()> {
        self.db.run("BEGIN", &[])?;
        match body(self) {
            Ok(()) => {
                self.db.run("COMMIT", &[])?;
                Ok(())
            }
            Err(e) => {
                self.db.run("ROLLBACK", &[])?;
                Err(e)
            }
        }
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        if let Ok(mut state) = self.db.state.lock() {
            state.released += 1;
        }
    }
}
