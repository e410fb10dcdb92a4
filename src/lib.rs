//! Boardkeep: persistence and access control for a project/epic/task board.
//!
//! The [`Store`] keeps an in-memory snapshot of every project, epic and task
//! and persists each mutation through a [`StorageAdapter`]: a JSON file, an
//! embedded SQLite database, or a remote PostgreSQL database. The
//! [`auth`] module decides which projects a caller may read or write from
//! the API key they present.
//!
//! # Example
//!
//! ```no_run
//! use boardkeep::{FileAdapter, Store, TaskFields, TaskPatch, TaskStatus};
//!
//! # async fn demo() -> eyre::Result<()> {
//! let store = Store::open(FileAdapter::new(".boardkeep/board.json")).await?;
//!
//! let project = store.create_project("Website", None, None).await?;
//! let task = store
//!     .create_task(&project.id, "Write landing copy", None, TaskFields::new())
//!     .await?;
//!
//! store.update_task(&task.id, &TaskPatch::status(TaskStatus::Done)).await?;
//! assert_eq!(store.get_tasks(&project.id).len(), 1);
//! # Ok(())
//! # }
//! ```

mod id;

pub mod auth;
pub mod client;
pub mod config;
pub mod credential;
pub mod daemon;
pub mod keyring;
pub mod protocol;
pub mod storage;
pub mod store;
pub mod types;

// Re-export public API
pub use auth::{AuthContext, AuthError, Authorizer, KeyType, Method, ProjectLookup};
pub use client::Client;
pub use config::Config;
pub use daemon::{Daemon, DaemonConfig, Handler, is_daemon_running, start_daemon};
pub use keyring::{ApiKey, KeyRing, KeyScope};
pub use protocol::{Operation, Request, Response};
pub use storage::{AdapterKind, Backend, Change, FileAdapter, PgAdapter, SqliteAdapter, StorageAdapter};
pub use store::{Store, StoreError};
pub use types::{
    Document, Epic, EpicPatch, Project, ProjectPatch, Task, TaskFields, TaskPatch, TaskStatus, ValidationError,
    Visibility,
};
