//! High-level store API for boardkeep.
//!
//! The store owns the authoritative in-memory snapshot. Reads are served
//! synchronously from a published copy of it. Mutations are serialized
//! through the adapter lock: each one validates against the adapter's view,
//! applies its changes, commits them, and only then publishes the new
//! snapshot. A failed commit restores the previous view, so it can never
//! leak into a later write.
//!
//! Every commit runs under a deadline. A remote backend that stops answering
//! fails the mutation with [`StoreError::Backend`] and releases the lock
//! instead of stalling every other writer.

use crate::id::{EPIC_PREFIX, PROJECT_PREFIX, TASK_PREFIX, generate_unique_id};
use crate::storage::{AdapterKind, Change, StorageAdapter};
use crate::types::{
    DEFAULT_PRIORITY, Document, Epic, EpicPatch, Project, ProjectPatch, Task, TaskFields, TaskPatch,
    ValidationError, Visibility,
};
use chrono::Utc;
use eyre::{Context, Result};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::sync::Mutex;

/// Environment variable that marks a test execution context.
pub const ENV_VAR: &str = "BOARDKEEP_ENV";

/// Longest a single adapter commit may take before the mutation is failed.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Referenced project does not exist.
    ProjectNotFound(String),
    /// Referenced epic does not exist.
    EpicNotFound(String),
    /// Referenced task does not exist.
    TaskNotFound(String),
    /// Epic exists but belongs to another project.
    EpicProjectMismatch { epic_id: String, project_id: String },
    /// Validation error.
    Validation(ValidationError),
    /// The adapter failed to persist a mutation.
    Backend(AdapterKind),
    /// A non-test adapter was handed to a store while running tests.
    UnsafeAdapter(AdapterKind),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ProjectNotFound(id) => write!(f, "project not found: {}", id),
            StoreError::EpicNotFound(id) => write!(f, "epic not found: {}", id),
            StoreError::TaskNotFound(id) => write!(f, "task not found: {}", id),
            StoreError::EpicProjectMismatch { epic_id, project_id } => {
                write!(f, "epic {} does not belong to project {}", epic_id, project_id)
            }
            StoreError::Validation(e) => write!(f, "validation error: {}", e),
            StoreError::Backend(kind) => write!(f, "{} backend failed to persist the change", kind),
            StoreError::UnsafeAdapter(kind) => write!(
                f,
                "refusing to use a non-test {} adapter while running tests; \
                 construct it with the adapter's `for_tests` factory \
                 (e.g. FileAdapter::for_tests or SqliteAdapter::for_tests)",
                kind
            ),
        }
    }
}

impl std::error::Error for StoreError {}

/// True when running under a test harness.
pub fn running_under_test() -> bool {
    cfg!(test) || std::env::var(ENV_VAR).is_ok_and(|v| v == "test")
}

fn invalid(e: ValidationError) -> eyre::Report {
    eyre::eyre!(StoreError::Validation(e))
}

/// The main boardkeep store.
pub struct Store<A: StorageAdapter> {
    adapter: Mutex<A>,
    snapshot: RwLock<Document>,
    commit_timeout: Duration,
}

impl<A: StorageAdapter> Store<A> {
    /// Wrap an adapter without loading it. Call [`Store::init`] before use.
    pub fn new(adapter: A) -> Result<Self> {
        if running_under_test() && !adapter.is_test() {
            return Err(eyre::eyre!(StoreError::UnsafeAdapter(adapter.kind())));
        }
        let snapshot = adapter.data().clone();
        Ok(Self {
            adapter: Mutex::new(adapter),
            snapshot: RwLock::new(snapshot),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        })
    }

    /// Override the per-commit deadline.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Wrap an adapter and load its snapshot.
    pub async fn open(adapter: A) -> Result<Self> {
        let store = Self::new(adapter)?;
        store.init().await?;
        Ok(store)
    }

    /// (Re)load the snapshot from the adapter.
    pub async fn init(&self) -> Result<()> {
        let mut adapter = self.adapter.lock().await;
        adapter.read().await.context("Failed to read snapshot")?;
        self.publish(adapter.data());
        log::info!(
            "Loaded {} snapshot: {} projects, {} epics, {} tasks",
            adapter.kind(),
            adapter.data().projects.len(),
            adapter.data().epics.len(),
            adapter.data().tasks.len()
        );
        Ok(())
    }

    fn publish(&self, doc: &Document) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = doc.clone();
    }

    fn view(&self) -> RwLockReadGuard<'_, Document> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one mutation: plan against the current view, apply, commit, publish.
    async fn mutate<T, F>(&self, plan: F) -> Result<T>
    where
        F: FnOnce(&Document) -> Result<(Vec<Change>, T)> + Send,
        T: Send,
    {
        let mut adapter = self.adapter.lock().await;
        let (changes, output) = plan(adapter.data())?;
        if changes.is_empty() {
            return Ok(output);
        }

        let previous = adapter.data().clone();
        for change in &changes {
            change.apply(adapter.data_mut());
        }

        let committed = match tokio::time::timeout(self.commit_timeout, adapter.commit(&changes)).await {
            Ok(result) => result,
            Err(_) => Err(eyre::eyre!("commit did not finish within {:?}", self.commit_timeout)),
        };
        if let Err(e) = committed {
            let kind = adapter.kind();
            *adapter.data_mut() = previous;
            log::warn!("{} commit failed, view restored: {:#}", kind, e);
            return Err(e.wrap_err(StoreError::Backend(kind)));
        }

        self.publish(adapter.data());
        Ok(output)
    }

    /// Copy of the whole snapshot.
    pub fn snapshot(&self) -> Document {
        self.view().clone()
    }

    // ---------------------------------------------------------------------
    // Projects
    // ---------------------------------------------------------------------

    /// Create a new project. Visibility defaults to public.
    pub async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        visibility: Option<Visibility>,
    ) -> Result<Project> {
        let now = Utc::now();
        let project = self
            .mutate(|doc| {
                let project = Project {
                    id: generate_unique_id(PROJECT_PREFIX, name, now, |id| doc.project(id).is_some()),
                    name: name.to_string(),
                    description: description.map(String::from),
                    visibility: visibility.unwrap_or_default(),
                    created_at: now,
                    updated_at: now,
                };
                project.validate().map_err(invalid)?;
                Ok((vec![Change::Project(project.clone())], project))
            })
            .await
            .context("Failed to create project")?;

        log::debug!("Created project {}", project.id);
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Option<Project> {
        self.view().project(id).cloned()
    }

    pub fn get_projects(&self) -> Vec<Project> {
        self.view().projects.clone()
    }

    /// Apply a patch; `Ok(None)` if the project does not exist.
    pub async fn update_project(&self, id: &str, patch: &ProjectPatch) -> Result<Option<Project>> {
        self.mutate(|doc| {
            let Some(existing) = doc.project(id) else {
                return Ok((vec![], None));
            };
            let mut updated = existing.clone();
            patch.apply(&mut updated);
            updated.updated_at = Utc::now().max(updated.created_at);
            updated.validate().map_err(invalid)?;
            Ok((vec![Change::Project(updated.clone())], Some(updated)))
        })
        .await
        .context("Failed to update project")
    }

    /// Delete a project together with its epics and tasks.
    ///
    /// Returns `false` if the project was already absent.
    pub async fn delete_project(&self, id: &str) -> Result<bool> {
        let deleted = self
            .mutate(|doc| {
                if doc.project(id).is_none() {
                    return Ok((vec![], false));
                }
                let mut changes: Vec<Change> = doc
                    .tasks
                    .iter()
                    .filter(|t| t.project_id == id)
                    .map(|t| Change::RemoveTask(t.id.clone()))
                    .collect();
                changes.extend(
                    doc.epics
                        .iter()
                        .filter(|e| e.project_id == id)
                        .map(|e| Change::RemoveEpic(e.id.clone())),
                );
                changes.push(Change::RemoveProject(id.to_string()));
                Ok((changes, true))
            })
            .await
            .context("Failed to delete project")?;

        if deleted {
            log::debug!("Deleted project {} with its epics and tasks", id);
        }
        Ok(deleted)
    }

    // ---------------------------------------------------------------------
    // Epics
    // ---------------------------------------------------------------------

    /// Create an epic in an existing project.
    pub async fn create_epic(&self, project_id: &str, title: &str, description: Option<&str>) -> Result<Epic> {
        let now = Utc::now();
        self.mutate(|doc| {
            if doc.project(project_id).is_none() {
                return Err(eyre::eyre!(StoreError::ProjectNotFound(project_id.to_string())));
            }
            let epic = Epic {
                id: generate_unique_id(EPIC_PREFIX, title, now, |id| doc.epic(id).is_some()),
                project_id: project_id.to_string(),
                title: title.to_string(),
                description: description.map(String::from),
                created_at: now,
                updated_at: now,
            };
            epic.validate().map_err(invalid)?;
            Ok((vec![Change::Epic(epic.clone())], epic))
        })
        .await
        .context("Failed to create epic")
    }

    pub fn get_epic(&self, id: &str) -> Option<Epic> {
        self.view().epic(id).cloned()
    }

    /// Epics of one project, in creation order.
    pub fn get_epics(&self, project_id: &str) -> Vec<Epic> {
        self.view()
            .epics
            .iter()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Apply a patch; `Ok(None)` if the epic does not exist.
    pub async fn update_epic(&self, id: &str, patch: &EpicPatch) -> Result<Option<Epic>> {
        self.mutate(|doc| {
            let Some(existing) = doc.epic(id) else {
                return Ok((vec![], None));
            };
            let mut updated = existing.clone();
            patch.apply(&mut updated);
            updated.updated_at = Utc::now().max(updated.created_at);
            updated.validate().map_err(invalid)?;
            Ok((vec![Change::Epic(updated.clone())], Some(updated)))
        })
        .await
        .context("Failed to update epic")
    }

    /// Delete an epic. Its tasks stay in the project with `epic_id` cleared.
    pub async fn delete_epic(&self, id: &str) -> Result<bool> {
        self.mutate(|doc| {
            if doc.epic(id).is_none() {
                return Ok((vec![], false));
            }
            let now = Utc::now();
            let mut changes: Vec<Change> = doc
                .tasks
                .iter()
                .filter(|t| t.epic_id.as_deref() == Some(id))
                .map(|t| {
                    let mut detached = t.clone();
                    detached.epic_id = None;
                    detached.updated_at = now.max(detached.created_at);
                    Change::Task(detached)
                })
                .collect();
            changes.push(Change::RemoveEpic(id.to_string()));
            Ok((changes, true))
        })
        .await
        .context("Failed to delete epic")
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Create a task in an existing project, optionally inside one of its epics.
    pub async fn create_task(
        &self,
        project_id: &str,
        title: &str,
        epic_id: Option<&str>,
        fields: TaskFields,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = self
            .mutate(|doc| {
                if doc.project(project_id).is_none() {
                    return Err(eyre::eyre!(StoreError::ProjectNotFound(project_id.to_string())));
                }
                if let Some(epic_id) = epic_id {
                    check_epic(doc, epic_id, project_id)?;
                }
                check_dependencies(doc, &fields.depends_on)?;

                let task = Task {
                    id: generate_unique_id(TASK_PREFIX, title, now, |id| doc.task(id).is_some()),
                    project_id: project_id.to_string(),
                    epic_id: epic_id.map(String::from),
                    title: title.to_string(),
                    status: fields.status.unwrap_or_default(),
                    priority: fields.priority.unwrap_or(DEFAULT_PRIORITY),
                    notes: fields.notes,
                    depends_on: fields.depends_on,
                    created_at: now,
                    updated_at: now,
                };
                task.validate().map_err(invalid)?;
                Ok((vec![Change::Task(task.clone())], task))
            })
            .await
            .context("Failed to create task")?;

        log::debug!("Created task {} in project {}", task.id, task.project_id);
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.view().task(id).cloned()
    }

    /// Tasks of one project, in creation order.
    pub fn get_tasks(&self, project_id: &str) -> Vec<Task> {
        self.view()
            .tasks
            .iter()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Apply a patch; `Ok(None)` if the task does not exist.
    ///
    /// Concurrent updates of one task are applied whole, one after another.
    pub async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Option<Task>> {
        self.mutate(|doc| {
            let Some(existing) = doc.task(id) else {
                return Ok((vec![], None));
            };
            let mut updated = existing.clone();
            patch.apply(&mut updated);
            if let Some(epic_id) = &updated.epic_id
                && existing.epic_id.as_ref() != Some(epic_id)
            {
                check_epic(doc, epic_id, &updated.project_id)?;
            }
            if patch.depends_on.is_some() {
                check_dependencies(doc, &updated.depends_on)?;
            }
            updated.updated_at = Utc::now().max(updated.created_at);
            updated.validate().map_err(invalid)?;
            Ok((vec![Change::Task(updated.clone())], Some(updated)))
        })
        .await
        .context("Failed to update task")
    }

    /// Delete a task and drop it from other tasks' `depends_on`.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        self.mutate(|doc| {
            if doc.task(id).is_none() {
                return Ok((vec![], false));
            }
            let now = Utc::now();
            let mut changes: Vec<Change> = doc
                .tasks
                .iter()
                .filter(|t| t.depends_on.iter().any(|dep| dep == id))
                .map(|t| {
                    let mut unlinked = t.clone();
                    unlinked.depends_on.retain(|dep| dep != id);
                    unlinked.updated_at = now.max(unlinked.created_at);
                    Change::Task(unlinked)
                })
                .collect();
            changes.push(Change::RemoveTask(id.to_string()));
            Ok((changes, true))
        })
        .await
        .context("Failed to delete task")
    }
}

fn check_epic(doc: &Document, epic_id: &str, project_id: &str) -> Result<()> {
    let epic = doc
        .epic(epic_id)
        .ok_or_else(|| eyre::eyre!(StoreError::EpicNotFound(epic_id.to_string())))?;
    if epic.project_id != project_id {
        return Err(eyre::eyre!(StoreError::EpicProjectMismatch {
            epic_id: epic_id.to_string(),
            project_id: project_id.to_string(),
        }));
    }
    Ok(())
}

fn check_dependencies(doc: &Document, depends_on: &[String]) -> Result<()> {
    match depends_on.iter().find(|dep| doc.task(dep).is_none()) {
        Some(missing) => Err(eyre::eyre!(StoreError::TaskNotFound(missing.clone()))),
        None => Ok(()),
    }
}
