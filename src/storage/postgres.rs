//! Remote relational backend on PostgreSQL.
//!
//! Connections come from a deadpool pool. Every committed mutation runs in
//! its own transaction; connection and query failures are returned to the
//! caller instead of serving a stale view.

use super::{AdapterKind, Change, StorageAdapter, format_timestamp, parse_timestamp};
use crate::types::{Document, Epic, Project, Task, TaskStatus, Visibility};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use eyre::{Context, Result};
use std::time::Duration;
use tokio_postgres::{NoTls, Row, Transaction};

/// Default maximum pool size.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Bound on connecting, checking a connection out of the pool, and on any
/// single statement. Keeps a dead server from holding the store's write lock.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS projects (
        seq BIGSERIAL,
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        visibility TEXT NOT NULL CHECK (visibility IN ('public', 'private')),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS epics (
        seq BIGSERIAL,
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_epics_project ON epics(project_id);

    CREATE TABLE IF NOT EXISTS tasks (
        seq BIGSERIAL,
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
"#;

const UPSERT_PROJECT: &str = r#"
    INSERT INTO projects (id, name, description, visibility, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (id) DO UPDATE SET
        name = EXCLUDED.name,
        description = EXCLUDED.description,
        visibility = EXCLUDED.visibility,
        updated_at = EXCLUDED.updated_at
"#;

const UPSERT_EPIC: &str = r#"
    INSERT INTO epics (id, project_id, title, description, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (id) DO UPDATE SET
        project_id = EXCLUDED.project_id,
        title = EXCLUDED.title,
        description = EXCLUDED.description,
        updated_at = EXCLUDED.updated_at
"#;

const UPSERT_TASK: &str = r#"
    INSERT INTO tasks (id, project_id, epic_id, title, status, priority, notes, depends_on, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (id) DO UPDATE SET
        project_id = EXCLUDED.project_id,
        epic_id = EXCLUDED.epic_id,
        title = EXCLUDED.title,
        status = EXCLUDED.status,
        priority = EXCLUDED.priority,
        notes = EXCLUDED.notes,
        depends_on = EXCLUDED.depends_on,
        updated_at = EXCLUDED.updated_at
"#;

/// PostgreSQL-backed adapter.
pub struct PgAdapter {
    pool: Pool,
    data: Document,
    schema_ready: bool,
    is_test: bool,
}

impl PgAdapter {
    /// Build a pool for `url`. No connection is made until the first read or write.
    pub fn connect(url: &str, max_size: usize) -> Result<Self> {
        let mut pg_config: tokio_postgres::Config = url.parse().context("Invalid PostgreSQL connection string")?;
        pg_config
            .connect_timeout(NETWORK_TIMEOUT)
            .options(&format!("-c statement_timeout={}", NETWORK_TIMEOUT.as_millis()));
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(NETWORK_TIMEOUT))
            .create_timeout(Some(NETWORK_TIMEOUT))
            .recycle_timeout(Some(NETWORK_TIMEOUT))
            .build()
            .map_err(|e| eyre::eyre!("Failed to create connection pool: {}", e))?;

        Ok(Self {
            pool,
            data: Document::default(),
            schema_ready: false,
            is_test: false,
        })
    }

    /// Adapter marked for test use, typically against a throwaway database.
    pub fn for_tests(url: &str) -> Result<Self> {
        let mut adapter = Self::connect(url, 2)?;
        adapter.is_test = true;
        Ok(adapter)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| eyre::eyre!("Remote database unavailable: {}", e))
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        if self.schema_ready {
            return Ok(());
        }
        let client = self.client().await?;
        client
            .batch_execute(SCHEMA)
            .await
            .context("Failed to initialize remote schema")?;
        self.schema_ready = true;
        Ok(())
    }

    async fn load_rows(&self) -> Result<Document> {
        let client = self.client().await?;

        let projects = client
            .query(
                "SELECT id, name, description, visibility, created_at, updated_at FROM projects ORDER BY seq",
                &[],
            )
            .await
            .context("Failed to load projects")?
            .iter()
            .map(row_to_project)
            .collect::<Result<Vec<_>>>()?;

        let epics = client
            .query(
                "SELECT id, project_id, title, description, created_at, updated_at FROM epics ORDER BY seq",
                &[],
            )
            .await
            .context("Failed to load epics")?
            .iter()
            .map(row_to_epic)
            .collect::<Result<Vec<_>>>()?;

        let tasks = client
            .query(
                r#"
                SELECT id, project_id, epic_id, title, status, priority, notes, depends_on, created_at, updated_at
                FROM tasks ORDER BY seq
                "#,
                &[],
            )
            .await
            .context("Failed to load tasks")?
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>>>()?;

        Ok(Document { projects, epics, tasks })
    }
}

async fn apply_change(tx: &Transaction<'_>, change: &Change) -> Result<()> {
    match change {
        Change::Project(project) => upsert_project(tx, project).await?,
        Change::Epic(epic) => upsert_epic(tx, epic).await?,
        Change::Task(task) => upsert_task(tx, task).await?,
        Change::RemoveProject(id) => {
            tx.execute("DELETE FROM projects WHERE id = $1", &[id]).await?;
        }
        Change::RemoveEpic(id) => {
            tx.execute("DELETE FROM epics WHERE id = $1", &[id]).await?;
        }
        Change::RemoveTask(id) => {
            tx.execute("DELETE FROM tasks WHERE id = $1", &[id]).await?;
        }
    }
    Ok(())
}

async fn upsert_project(tx: &Transaction<'_>, project: &Project) -> Result<()> {
    let created_at = format_timestamp(&project.created_at);
    let updated_at = format_timestamp(&project.updated_at);
    tx.execute(
        UPSERT_PROJECT,
        &[
            &project.id,
            &project.name,
            &project.description,
            &project.visibility.as_str(),
            &created_at,
            &updated_at,
        ],
    )
    .await
    .context("Failed to upsert project")?;
    Ok(())
}

async fn upsert_epic(tx: &Transaction<'_>, epic: &Epic) -> Result<()> {
    let created_at = format_timestamp(&epic.created_at);
    let updated_at = format_timestamp(&epic.updated_at);
    tx.execute(
        UPSERT_EPIC,
        &[
            &epic.id,
            &epic.project_id,
            &epic.title,
            &epic.description,
            &created_at,
            &updated_at,
        ],
    )
    .await
    .context("Failed to upsert epic")?;
    Ok(())
}

async fn upsert_task(tx: &Transaction<'_>, task: &Task) -> Result<()> {
    let depends_on = serde_json::to_string(&task.depends_on).context("Failed to serialize depends_on")?;
    let priority = i32::from(task.priority);
    let created_at = format_timestamp(&task.created_at);
    let updated_at = format_timestamp(&task.updated_at);
    tx.execute(
        UPSERT_TASK,
        &[
            &task.id,
            &task.project_id,
            &task.epic_id,
            &task.title,
            &task.status.as_str(),
            &priority,
            &task.notes,
            &depends_on,
            &created_at,
            &updated_at,
        ],
    )
    .await
    .context("Failed to upsert task")?;
    Ok(())
}

fn timestamp(row: &Row, column: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.try_get(column)?;
    parse_timestamp(&raw).with_context(|| format!("Invalid timestamp in column {}", column))
}

fn row_to_project(row: &Row) -> Result<Project> {
    let visibility: String = row.try_get("visibility")?;
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        visibility: visibility.parse::<Visibility>().map_err(|e| eyre::eyre!(e))?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

fn row_to_epic(row: &Row) -> Result<Epic> {
    Ok(Epic {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

fn row_to_task(row: &Row) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let priority: i32 = row.try_get("priority")?;
    let depends_on: String = row.try_get("depends_on")?;
    Ok(Task {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        epic_id: row.try_get("epic_id")?,
        title: row.try_get("title")?,
        status: status.parse::<TaskStatus>().map_err(|e| eyre::eyre!(e))?,
        priority: u8::try_from(priority).context("Task priority out of range")?,
        notes: row.try_get("notes")?,
        depends_on: serde_json::from_str(&depends_on).context("Invalid depends_on column")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

impl StorageAdapter for PgAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Postgres
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
        self.ensure_schema().await?;
        self.data = self.load_rows().await?;
        Ok(())
    }

    async fn write(&mut self) -> Result<()> {
        self.ensure_schema().await?;
        let mut conn = self.client().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let tx = client.transaction().await.context("Failed to begin transaction")?;
        tx.batch_execute("DELETE FROM tasks; DELETE FROM epics; DELETE FROM projects;")
            .await
            .context("Failed to clear tables")?;
        for project in &self.data.projects {
            upsert_project(&tx, project).await?;
        }
        for epic in &self.data.epics {
            upsert_epic(&tx, epic).await?;
        }
        for task in &self.data.tasks {
            upsert_task(&tx, task).await?;
        }
        tx.commit().await.context("Failed to commit snapshot")?;
        Ok(())
    }

    async fn commit(&mut self, changes: &[Change]) -> Result<()> {
        self.ensure_schema().await?;
        let mut conn = self.client().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let tx = client.transaction().await.context("Failed to begin transaction")?;
        for change in changes {
            apply_change(&tx, change).await?;
        }
        tx.commit().await.context("Failed to commit mutation")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_bad_url() {
        assert!(PgAdapter::connect("not a url ===", DEFAULT_POOL_SIZE).is_err());
    }

    #[test]
    fn test_for_tests_is_marked() {
        let adapter = PgAdapter::for_tests("postgres://user:pw@localhost:1/none").unwrap();
        assert!(adapter.is_test());
        assert_eq!(adapter.kind(), AdapterKind::Postgres);
    }

    #[tokio::test]
    async fn test_unreachable_server_surfaces_error() {
        let mut adapter = PgAdapter::for_tests("postgres://user:pw@127.0.0.1:1/none").unwrap();
        assert!(adapter.read().await.is_err());
    }
}
