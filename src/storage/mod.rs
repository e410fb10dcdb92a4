//! Storage adapters: the persistence contract behind the store.
//!
//! Every adapter holds a [`Document`] view. `read()` loads it from the
//! backend (initialising and persisting an empty one if nothing exists yet),
//! `write()` persists the whole view, and `commit()` persists one logical
//! mutation. The file backend commits by rewriting the whole document; the
//! relational backends commit the changed rows in a single transaction.

mod file;
mod postgres;
mod sqlite;

pub use file::FileAdapter;
pub use postgres::{DEFAULT_POOL_SIZE, PgAdapter};
pub use sqlite::SqliteAdapter;

use crate::types::{Document, Epic, Project, Task};
use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Which physical backend an adapter talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    #[default]
    File,
    Sqlite,
    Postgres,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::File => write!(f, "file"),
            AdapterKind::Sqlite => write!(f, "sqlite"),
            AdapterKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// One entity-level change. A mutation is a list of these, committed together.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Project(Project),
    Epic(Epic),
    Task(Task),
    RemoveProject(String),
    RemoveEpic(String),
    RemoveTask(String),
}

impl Change {
    /// Apply this change to an in-memory document.
    ///
    /// Upserts replace an existing entity in place, keeping collection order,
    /// or append a new one.
    pub fn apply(&self, doc: &mut Document) {
        match self {
            Change::Project(project) => upsert(&mut doc.projects, project, |p| &p.id),
            Change::Epic(epic) => upsert(&mut doc.epics, epic, |e| &e.id),
            Change::Task(task) => upsert(&mut doc.tasks, task, |t| &t.id),
            Change::RemoveProject(id) => doc.projects.retain(|p| &p.id != id),
            Change::RemoveEpic(id) => doc.epics.retain(|e| &e.id != id),
            Change::RemoveTask(id) => doc.tasks.retain(|t| &t.id != id),
        }
    }
}

/// RFC 3339 text form used by the relational backends; keeps full precision.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

fn upsert<T: Clone>(items: &mut Vec<T>, item: &T, id: impl Fn(&T) -> &String) {
    match items.iter_mut().find(|existing| id(existing) == id(item)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

/// The persistence contract every backend implements.
pub trait StorageAdapter: Send + 'static {
    /// Backend kind, for logging and diagnostics.
    fn kind(&self) -> AdapterKind;

    /// True only for adapters built by a `for_tests` factory.
    fn is_test(&self) -> bool;

    /// Current in-memory view.
    fn data(&self) -> &Document;

    /// Mutable view. Only the store mutates it.
    fn data_mut(&mut self) -> &mut Document;

    /// Load the persisted snapshot into the view, creating an empty one if none exists.
    fn read(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Persist the entire view.
    fn write(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Persist one mutation whose changes have already been applied to the view.
    fn commit(&mut self, _changes: &[Change]) -> impl Future<Output = Result<()>> + Send {
        self.write()
    }
}

/// Runtime-selected backend.
pub enum Backend {
    File(FileAdapter),
    Sqlite(SqliteAdapter),
    Postgres(PgAdapter),
}

impl StorageAdapter for Backend {
    fn kind(&self) -> AdapterKind {
        match self {
            Backend::File(a) => a.kind(),
            Backend::Sqlite(a) => a.kind(),
            Backend::Postgres(a) => a.kind(),
        }
    }

    fn is_test(&self) -> bool {
        match self {
            Backend::File(a) => a.is_test(),
            Backend::Sqlite(a) => a.is_test(),
            Backend::Postgres(a) => a.is_test(),
        }
    }

    fn data(&self) -> &Document {
        match self {
            Backend::File(a) => a.data(),
            Backend::Sqlite(a) => a.data(),
            Backend::Postgres(a) => a.data(),
        }
    }

    fn data_mut(&mut self) -> &mut Document {
        match self {
            Backend::File(a) => a.data_mut(),
            Backend::Sqlite(a) => a.data_mut(),
            Backend::Postgres(a) => a.data_mut(),
        }
    }

    async fn read(&mut self) -> Result<()> {
        match self {
            Backend::File(a) => a.read().await,
            Backend::Sqlite(a) => a.read().await,
            Backend::Postgres(a) => a.read().await,
        }
    }

    async fn write(&mut self) -> Result<()> {
        match self {
            Backend::File(a) => a.write().await,
            Backend::Sqlite(a) => a.write().await,
            Backend::Postgres(a) => a.write().await,
        }
    }

    async fn commit(&mut self, changes: &[Change]) -> Result<()> {
        match self {
            Backend::File(a) => a.commit(changes).await,
            Backend::Sqlite(a) => a.commit(changes).await,
            Backend::Postgres(a) => a.commit(changes).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Visibility;
    use chrono::Utc;

    fn project(id: &str, name: &str) -> Project {
        let now = Utc::now();
        Project {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            visibility: Visibility::Public,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_change_upsert_keeps_order() {
        let mut doc = Document::default();
        Change::Project(project("prj-a", "A")).apply(&mut doc);
        Change::Project(project("prj-b", "B")).apply(&mut doc);
        Change::Project(project("prj-a", "A2")).apply(&mut doc);

        let names: Vec<_> = doc.projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["A2", "B"]);
    }

    #[test]
    fn test_change_remove_absent_is_noop() {
        let mut doc = Document::default();
        Change::Project(project("prj-a", "A")).apply(&mut doc);
        Change::RemoveProject("prj-missing".to_string()).apply(&mut doc);
        assert_eq!(doc.projects.len(), 1);
    }

    #[test]
    fn test_backend_delegates() {
        let backend = Backend::Sqlite(SqliteAdapter::for_tests().unwrap());
        assert_eq!(backend.kind(), AdapterKind::Sqlite);
        assert!(backend.is_test());
        assert!(backend.data().is_empty());
    }
}
