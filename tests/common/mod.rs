//! Shared test infrastructure for boardkeep integration tests.
//!
//! Provides TestEnv helper for consistent test setup/teardown. Every
//! helper that builds a store first marks the process as a test run, so the
//! store rejects production adapters in every integration binary.

#![allow(dead_code)]

use boardkeep::{
    AdapterKind, Change, Document, Epic, FileAdapter, Project, SqliteAdapter, StorageAdapter, Store, Task, TaskFields,
};
use boardkeep::store::ENV_VAR;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;

static MARK_TEST_RUN: Once = Once::new();

/// Set `BOARDKEEP_ENV=test` for this test binary.
pub fn mark_test_run() {
    MARK_TEST_RUN.call_once(|| {
        // SAFETY: written once, before any store is built; callers racing to
        // get here block on the Once until the write is done.
        unsafe { std::env::set_var(ENV_VAR, "test") };
    });
}

/// Test environment with automatic cleanup.
pub struct TestEnv<A: StorageAdapter> {
    pub temp_dir: TempDir,
    pub store: Store<A>,
}

impl TestEnv<FileAdapter> {
    /// Store backed by a JSON document in a temp dir.
    pub async fn file() -> Self {
        mark_test_run();
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open(FileAdapter::for_tests(temp_dir.path().join("board.json")))
            .await
            .expect("Failed to open store");
        Self { temp_dir, store }
    }

    /// A second store over the same document, as a new process would see it.
    pub async fn reopen(&self) -> Store<FileAdapter> {
        Store::open(FileAdapter::for_tests(self.temp_dir.path().join("board.json")))
            .await
            .expect("Failed to reopen store")
    }
}

impl TestEnv<SqliteAdapter> {
    /// Store backed by a SQLite database file in a temp dir.
    pub async fn sqlite() -> Self {
        mark_test_run();
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let adapter = SqliteAdapter::for_tests_at(&temp_dir.path().join("board.db")).expect("Failed to open sqlite");
        let store = Store::open(adapter).await.expect("Failed to open store");
        Self { temp_dir, store }
    }

    pub async fn reopen(&self) -> Store<SqliteAdapter> {
        let adapter =
            SqliteAdapter::for_tests_at(&self.temp_dir.path().join("board.db")).expect("Failed to reopen sqlite");
        Store::open(adapter).await.expect("Failed to reopen store")
    }
}

impl<A: StorageAdapter> TestEnv<A> {
    /// Create a public project.
    pub async fn create_project(&self, name: &str) -> Project {
        self.store
            .create_project(name, None, None)
            .await
            .expect("Failed to create project")
    }

    pub async fn create_epic(&self, project: &Project, title: &str) -> Epic {
        self.store
            .create_epic(&project.id, title, None)
            .await
            .expect("Failed to create epic")
    }

    /// Create a task with default fields.
    pub async fn create_task(&self, project: &Project, title: &str) -> Task {
        self.store
            .create_task(&project.id, title, None, TaskFields::new())
            .await
            .expect("Failed to create task")
    }

    pub async fn create_task_in_epic(&self, epic: &Epic, title: &str) -> Task {
        self.store
            .create_task(&epic.project_id, title, Some(&epic.id), TaskFields::new())
            .await
            .expect("Failed to create task")
    }

    /// Get tasks count for a project.
    pub fn task_count(&self, project: &Project) -> usize {
        self.store.get_tasks(&project.id).len()
    }
}

/// In-memory adapter whose commits can be made to fail or hang on demand.
///
/// `persisted` holds what a real backend would have on disk.
pub struct FailingAdapter {
    data: Document,
    pub fail: Arc<AtomicBool>,
    pub stall: Arc<AtomicBool>,
    pub persisted: Arc<Mutex<Document>>,
}

impl FailingAdapter {
    pub fn new() -> Self {
        mark_test_run();
        Self {
            data: Document::default(),
            fail: Arc::new(AtomicBool::new(false)),
            stall: Arc::new(AtomicBool::new(false)),
            persisted: Arc::new(Mutex::new(Document::default())),
        }
    }
}

impl StorageAdapter for FailingAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::File
    }

    fn is_test(&self) -> bool {
        true
    }

    fn data(&self) -> &Document {
        &self.data
    }

    fn data_mut(&mut self) -> &mut Document {
        &mut self.data
    }

    async fn read(&mut self) -> eyre::Result<()> {
        self.data = self.persisted.lock().unwrap().clone();
        Ok(())
    }

    async fn write(&mut self) -> eyre::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            eyre::bail!("disk full");
        }
        *self.persisted.lock().unwrap() = self.data.clone();
        Ok(())
    }

    async fn commit(&mut self, _changes: &[Change]) -> eyre::Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.write().await
    }
}
