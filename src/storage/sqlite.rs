//! Embedded relational backend on SQLite.

use super::{AdapterKind, Change, StorageAdapter, format_timestamp, parse_timestamp};
use crate::types::{Document, Epic, Project, Task, TaskStatus, Visibility};
use eyre::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;

/// Row-per-entity storage with one transaction per committed mutation.
pub struct SqliteAdapter {
    db: Connection,
    data: Document,
    is_test: bool,
}

impl SqliteAdapter {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let db = Connection::open(path).context("Failed to open SQLite database")?;
        Self::with_connection(db, false)
    }

    /// Ephemeral database living only in this process.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::with_connection(db, false)
    }

    /// In-memory database marked for test use.
    pub fn for_tests() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::with_connection(db, true)
    }

    /// File database marked for test use.
    pub fn for_tests_at(path: &Path) -> Result<Self> {
        let mut adapter = Self::open(path)?;
        adapter.is_test = true;
        Ok(adapter)
    }

    fn with_connection(db: Connection, is_test: bool) -> Result<Self> {
        let adapter = Self {
            db,
            data: Document::default(),
            is_test,
        };
        adapter.init_schema()?;
        Ok(adapter)
    }

    /// Initialize SQLite schema.
    fn init_schema(&self) -> Result<()> {
        self.db
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    visibility TEXT NOT NULL CHECK (visibility IN ('public', 'private')),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS epics (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_epics_project ON epics(project_id);

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    epic_id TEXT,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('todo', 'in_progress', 'review', 'done')),
                    priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 2),
                    notes TEXT,
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);

                CREATE TABLE IF NOT EXISTS snapshot_blob (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    body TEXT NOT NULL
                );
            "#,
            )
            .context("Failed to initialize schema")?;

        Ok(())
    }

    fn load_rows(&self) -> Result<Document> {
        let mut stmt = self.db.prepare(
            "SELECT id, name, description, visibility, created_at, updated_at FROM projects ORDER BY rowid",
        )?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load projects")?;

        let mut stmt = self
            .db
            .prepare("SELECT id, project_id, title, description, created_at, updated_at FROM epics ORDER BY rowid")?;
        let epics = stmt
            .query_map([], row_to_epic)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load epics")?;

        let mut stmt = self.db.prepare(
            r#"
            SELECT id, project_id, epic_id, title, status, priority, notes, depends_on, created_at, updated_at
            FROM tasks ORDER BY rowid
            "#,
        )?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load tasks")?;

        Ok(Document { projects, epics, tasks })
    }

    /// Snapshot stored by older versions as a single JSON blob, if any.
    fn load_legacy_blob(&self) -> Result<Option<Document>> {
        let body: Option<String> = self
            .db
            .query_row("SELECT body FROM snapshot_blob WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        Ok(body.and_then(|body| match serde_json::from_str::<Document>(&body) {
            Ok(doc) => Some(doc),
            Err(e) => {
                log::warn!("Ignoring unreadable legacy snapshot blob: {}", e);
                None
            }
        }))
    }

    fn load(&mut self) -> Result<()> {
        let doc = self.load_rows()?;
        if doc.is_empty()
            && let Some(legacy) = self.load_legacy_blob()?
        {
            log::info!(
                "Importing legacy snapshot: {} projects, {} epics, {} tasks",
                legacy.projects.len(),
                legacy.epics.len(),
                legacy.tasks.len()
            );
            self.data = legacy;
            return self.replace_all();
        }
        self.data = doc;
        Ok(())
    }

    /// Replace every row with the current view in one transaction.
    ///
    /// The legacy blob is dropped in the same transaction, so an imported
    /// snapshot is never imported a second time.
    fn replace_all(&mut self) -> Result<()> {
        let tx = self.db.transaction().context("Failed to begin transaction")?;
        tx.execute_batch(
            r#"
            DELETE FROM tasks;
            DELETE FROM epics;
            DELETE FROM projects;
            DELETE FROM snapshot_blob;
        "#,
        )?;
        for project in &self.data.projects {
            upsert_project(&tx, project)?;
        }
        for epic in &self.data.epics {
            upsert_epic(&tx, epic)?;
        }
        for task in &self.data.tasks {
            upsert_task(&tx, task)?;
        }
        tx.commit().context("Failed to commit snapshot")?;
        Ok(())
    }

    fn commit_changes(&mut self, changes: &[Change]) -> Result<()> {
        let tx = self.db.transaction().context("Failed to begin transaction")?;
        for change in changes {
            apply_change(&tx, change)?;
        }
        tx.commit().context("Failed to commit mutation")?;
        Ok(())
    }
}

fn apply_change(conn: &Connection, change: &Change) -> Result<()> {
    match change {
        Change::Project(project) => upsert_project(conn, project)?,
        Change::Epic(epic) => upsert_epic(conn, epic)?,
        Change::Task(task) => upsert_task(conn, task)?,
        Change::RemoveProject(id) => {
            conn.execute("DELETE FROM projects WHERE id = ?", params![id])?;
        }
        Change::RemoveEpic(id) => {
            conn.execute("DELETE FROM epics WHERE id = ?", params![id])?;
        }
        Change::RemoveTask(id) => {
            conn.execute("DELETE FROM tasks WHERE id = ?", params![id])?;
        }
    }
    Ok(())
}

fn upsert_project(conn: &Connection, project: &Project) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO projects (id, name, description, visibility, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            visibility = excluded.visibility,
            updated_at = excluded.updated_at
        "#,
        params![
            project.id,
            project.name,
            project.description,
            project.visibility.as_str(),
            format_timestamp(&project.created_at),
            format_timestamp(&project.updated_at),
        ],
    )?;
    Ok(())
}

fn upsert_epic(conn: &Connection, epic: &Epic) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO epics (id, project_id, title, description, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            title = excluded.title,
            description = excluded.description,
            updated_at = excluded.updated_at
        "#,
        params![
            epic.id,
            epic.project_id,
            epic.title,
            epic.description,
            format_timestamp(&epic.created_at),
            format_timestamp(&epic.updated_at),
        ],
    )?;
    Ok(())
}

fn upsert_task(conn: &Connection, task: &Task) -> Result<()> {
    let depends_on = serde_json::to_string(&task.depends_on).context("Failed to serialize depends_on")?;
    conn.execute(
        r#"
        INSERT INTO tasks (id, project_id, epic_id, title, status, priority, notes, depends_on, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            epic_id = excluded.epic_id,
            title = excluded.title,
            status = excluded.status,
            priority = excluded.priority,
            notes = excluded.notes,
            depends_on = excluded.depends_on,
            updated_at = excluded.updated_at
        "#,
        params![
            task.id,
            task.project_id,
            task.epic_id,
            task.title,
            task.status.as_str(),
            task.priority,
            task.notes,
            depends_on,
            format_timestamp(&task.created_at),
            format_timestamp(&task.updated_at),
        ],
    )?;
    Ok(())
}

fn conversion_error(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| conversion_error(idx, e))
}

/// Convert a database row to a Project.
fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    let visibility: String = row.get(3)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        visibility: visibility
            .parse::<Visibility>()
            .map_err(|e| conversion_error(3, e))?,
        created_at: timestamp_at(row, 4)?,
        updated_at: timestamp_at(row, 5)?,
    })
}

/// Convert a database row to an Epic.
fn row_to_epic(row: &Row) -> rusqlite::Result<Epic> {
    Ok(Epic {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
        updated_at: timestamp_at(row, 5)?,
    })
}

/// Convert a database row to a Task.
fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    let depends_on: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        epic_id: row.get(2)?,
        title: row.get(3)?,
        status: status.parse::<TaskStatus>().map_err(|e| conversion_error(4, e))?,
        priority: row.get(5)?,
        notes: row.get(6)?,
        depends_on: serde_json::from_str(&depends_on).map_err(|e| conversion_error(7, e))?,
        created_at: timestamp_at(row, 8)?,
        updated_at: timestamp_at(row, 9)?,
    })
}

impl StorageAdapter for SqliteAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Sqlite
    }

    fn is_test(&self) -> bool {
        self.is_test
    }

    fn data(&self) -> &Document {
        &self.data
    }

    fn data_mut(&mut self) -> &mut Document {
        &mut self.data
    }

    async fn read(&mut self) -> Result<()> {
        self.load()
    }

    async fn write(&mut self) -> Result<()> {
        self.replace_all()
    }

    async fn commit(&mut self, changes: &[Change]) -> Result<()> {
        self.commit_changes(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_doc() -> Document {
        let now = Utc::now();
        Document {
            projects: vec![Project {
                id: "prj-0000000001".to_string(),
                name: "Board".to_string(),
                description: None,
                visibility: Visibility::Private,
                created_at: now,
                updated_at: now,
            }],
            epics: vec![Epic {
                id: "epc-0000000001".to_string(),
                project_id: "prj-0000000001".to_string(),
                title: "Epic".to_string(),
                description: Some("about".to_string()),
                created_at: now,
                updated_at: now,
            }],
            tasks: vec![Task {
                id: "tsk-0000000001".to_string(),
                project_id: "prj-0000000001".to_string(),
                epic_id: Some("epc-0000000001".to_string()),
                title: "Task ✓".to_string(),
                status: TaskStatus::InProgress,
                priority: 0,
                notes: Some("notes".to_string()),
                depends_on: vec!["tsk-0000000002".to_string()],
                created_at: now,
                updated_at: now,
            }],
        }
    }

    #[tokio::test]
    async fn test_write_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("board.db");
        let doc = sample_doc();

        let mut adapter = SqliteAdapter::for_tests_at(&path).unwrap();
        adapter.read().await.unwrap();
        *adapter.data_mut() = doc.clone();
        adapter.write().await.unwrap();
        drop(adapter);

        let mut reopened = SqliteAdapter::for_tests_at(&path).unwrap();
        reopened.read().await.unwrap();
        assert_eq!(reopened.data(), &doc);
        assert!(reopened.is_test());
    }

    #[tokio::test]
    async fn test_commit_touches_only_changed_rows() {
        let mut adapter = SqliteAdapter::for_tests().unwrap();
        adapter.read().await.unwrap();
        *adapter.data_mut() = sample_doc();
        adapter.write().await.unwrap();

        let mut task = adapter.data().tasks[0].clone();
        task.title = "Renamed".to_string();
        adapter
            .commit(&[Change::Task(task), Change::RemoveEpic("epc-0000000001".to_string())])
            .await
            .unwrap();

        let doc = adapter.load_rows().unwrap();
        assert_eq!(doc.projects.len(), 1);
        assert!(doc.epics.is_empty());
        assert_eq!(doc.tasks[0].title, "Renamed");
    }

    #[tokio::test]
    async fn test_imports_legacy_blob() {
        let mut adapter = SqliteAdapter::for_tests().unwrap();
        let body = serde_json::to_string(&sample_doc()).unwrap();
        adapter
            .db
            .execute("INSERT INTO snapshot_blob (id, body) VALUES (1, ?)", params![body])
            .unwrap();

        adapter.read().await.unwrap();

        assert_eq!(adapter.data().projects.len(), 1);
        assert_eq!(adapter.load_rows().unwrap().tasks.len(), 1);
        assert!(adapter.load_legacy_blob().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_blob_not_reimported_after_emptying() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("board.db");
        let body = serde_json::to_string(&sample_doc()).unwrap();

        let mut adapter = SqliteAdapter::for_tests_at(&path).unwrap();
        adapter
            .db
            .execute("INSERT INTO snapshot_blob (id, body) VALUES (1, ?)", params![body])
            .unwrap();
        adapter.read().await.unwrap();
        assert_eq!(adapter.data().projects.len(), 1);

        adapter
            .commit(&[
                Change::RemoveTask("tsk-0000000001".to_string()),
                Change::RemoveEpic("epc-0000000001".to_string()),
                Change::RemoveProject("prj-0000000001".to_string()),
            ])
            .await
            .unwrap();
        drop(adapter);

        let mut reopened = SqliteAdapter::for_tests_at(&path).unwrap();
        reopened.read().await.unwrap();
        assert!(reopened.data().is_empty());
    }
}
