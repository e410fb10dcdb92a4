//! Background daemon serving the board over a Unix socket.
//!
//! The daemon owns one [`Store`] and one [`KeyRing`]. Each connection sends
//! newline-delimited JSON [`Request`]s; every request is authorized on its
//! own token before it reaches the store. Connections are served
//! concurrently and the store serializes their mutations.

use crate::auth::{
    AuthContext, Authorizer, can_read_project, can_write_project, filter_projects, master_key_from_env,
};
use crate::config::{Config, board_dir, keys_path};
use crate::keyring::KeyRing;
use crate::protocol::{Operation, Request, Response};
use crate::storage::{Backend, StorageAdapter};
use crate::store::{Store, StoreError};
use eyre::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

/// Socket file name within the .boardkeep directory.
const SOCKET_FILE: &str = "daemon.sock";

/// PID file name within the .boardkeep directory.
const PID_FILE: &str = "daemon.pid";

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root directory containing .boardkeep
    pub root: PathBuf,
}

impl DaemonConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> PathBuf {
        board_dir(&self.root).join(SOCKET_FILE)
    }

    /// Get the PID file path.
    pub fn pid_path(&self) -> PathBuf {
        board_dir(&self.root).join(PID_FILE)
    }
}

/// Authorizes and dispatches requests. Cheap to clone; clones share state.
pub struct Handler<A: StorageAdapter> {
    store: Arc<Store<A>>,
    keys: Arc<RwLock<KeyRing>>,
    master_key: Option<String>,
    shutdown: Arc<Notify>,
}

impl<A: StorageAdapter> Clone for Handler<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: Arc::clone(&self.keys),
            master_key: self.master_key.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<A: StorageAdapter> Handler<A> {
    pub fn new(store: Store<A>, keys: KeyRing, master_key: Option<String>) -> Self {
        Self {
            store: Arc::new(store),
            keys: Arc::new(RwLock::new(keys)),
            master_key,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Store<A> {
        &self.store
    }

    /// Resolve the caller against the key ring as it is on disk now, so keys
    /// issued or revoked by another process take effect immediately.
    fn authorize(&self, request: &Request) -> Option<AuthContext> {
        let resolved = {
            let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = keys.reload() {
                log::error!("Failed to reload key ring: {:#}", e);
                return None;
            }
            Authorizer::new(self.master_key.clone(), &keys).resolve(request.token.as_deref(), request.op.method())
        };

        let ctx = resolved.ok()?;
        if let Some(key) = &ctx.api_key {
            let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = keys.mark_used(&key.id) {
                log::warn!("Failed to record use of key {}: {:#}", key.id, e);
            }
        }
        Some(ctx)
    }

    /// Handle a single request.
    pub async fn handle(&self, request: Request) -> Response {
        let Some(ctx) = self.authorize(&request) else {
            return Response::Unauthorized;
        };
        let store: &Store<A> = &self.store;

        match request.op {
            Operation::CreateProject {
                name,
                description,
                visibility,
            } => {
                if !ctx.is_privileged() {
                    return Response::Unauthorized;
                }
                match store.create_project(&name, description.as_deref(), visibility).await {
                    Ok(project) => Response::Project { project },
                    Err(e) => error_response(e),
                }
            }

            Operation::UpdateProject { id, patch } => {
                if !can_write_project(&ctx, &id) {
                    return Response::Unauthorized;
                }
                match store.update_project(&id, &patch).await {
                    Ok(Some(project)) => Response::Project { project },
                    Ok(None) => Response::NotFound { id },
                    Err(e) => error_response(e),
                }
            }

            Operation::DeleteProject { id } => {
                if !can_write_project(&ctx, &id) {
                    return Response::Unauthorized;
                }
                match store.delete_project(&id).await {
                    Ok(deleted) => Response::Deleted { deleted },
                    Err(e) => error_response(e),
                }
            }

            Operation::GetProject { id } => match store.get_project(&id) {
                Some(project) if can_read_project(&ctx, &id, store) => Response::Project { project },
                _ => Response::NotFound { id },
            },

            Operation::ListProjects => Response::Projects {
                projects: filter_projects(&ctx, store),
            },

            Operation::CreateEpic {
                project_id,
                title,
                description,
            } => {
                if !can_write_project(&ctx, &project_id) {
                    return Response::Unauthorized;
                }
                match store.create_epic(&project_id, &title, description.as_deref()).await {
                    Ok(epic) => Response::Epic { epic },
                    Err(e) => error_response(e),
                }
            }

            Operation::UpdateEpic { id, patch } => {
                let Some(epic) = store
                    .get_epic(&id)
                    .filter(|e| can_read_project(&ctx, &e.project_id, store))
                else {
                    return Response::NotFound { id };
                };
                if !can_write_project(&ctx, &epic.project_id) {
                    return Response::Unauthorized;
                }
                match store.update_epic(&id, &patch).await {
                    Ok(Some(epic)) => Response::Epic { epic },
                    Ok(None) => Response::NotFound { id },
                    Err(e) => error_response(e),
                }
            }

            Operation::DeleteEpic { id } => {
                let Some(epic) = store
                    .get_epic(&id)
                    .filter(|e| can_read_project(&ctx, &e.project_id, store))
                else {
                    return Response::Deleted { deleted: false };
                };
                if !can_write_project(&ctx, &epic.project_id) {
                    return Response::Unauthorized;
                }
                match store.delete_epic(&id).await {
                    Ok(deleted) => Response::Deleted { deleted },
                    Err(e) => error_response(e),
                }
            }

            Operation::ListEpics { project_id } => {
                if store.get_project(&project_id).is_none() || !can_read_project(&ctx, &project_id, store) {
                    return Response::NotFound { id: project_id };
                }
                Response::Epics {
                    epics: store.get_epics(&project_id),
                }
            }

            Operation::CreateTask {
                project_id,
                title,
                epic_id,
                fields,
            } => {
                if !can_write_project(&ctx, &project_id) {
                    return Response::Unauthorized;
                }
                match store.create_task(&project_id, &title, epic_id.as_deref(), fields).await {
                    Ok(task) => Response::Task { task },
                    Err(e) => error_response(e),
                }
            }

            Operation::UpdateTask { id, patch } => {
                let Some(task) = store
                    .get_task(&id)
                    .filter(|t| can_read_project(&ctx, &t.project_id, store))
                else {
                    return Response::NotFound { id };
                };
                if !can_write_project(&ctx, &task.project_id) {
                    return Response::Unauthorized;
                }
                match store.update_task(&id, &patch).await {
                    Ok(Some(task)) => Response::Task { task },
                    Ok(None) => Response::NotFound { id },
                    Err(e) => error_response(e),
                }
            }

            Operation::DeleteTask { id } => {
                let Some(task) = store
                    .get_task(&id)
                    .filter(|t| can_read_project(&ctx, &t.project_id, store))
                else {
                    return Response::Deleted { deleted: false };
                };
                if !can_write_project(&ctx, &task.project_id) {
                    return Response::Unauthorized;
                }
                match store.delete_task(&id).await {
                    Ok(deleted) => Response::Deleted { deleted },
                    Err(e) => error_response(e),
                }
            }

            Operation::GetTask { id } => match store.get_task(&id) {
                Some(task) if can_read_project(&ctx, &task.project_id, store) => Response::Task { task },
                _ => Response::NotFound { id },
            },

            Operation::ListTasks { project_id } => {
                if store.get_project(&project_id).is_none() || !can_read_project(&ctx, &project_id, store) {
                    return Response::NotFound { id: project_id };
                }
                Response::Tasks {
                    tasks: store.get_tasks(&project_id),
                }
            }

            Operation::Shutdown => {
                if !ctx.is_privileged() {
                    return Response::Unauthorized;
                }
                self.shutdown.notify_one();
                Response::Ok
            }

            Operation::Ping => Response::Pong,
        }
    }

    /// Handle a single client connection.
    async fn serve_connection(self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await.context("Failed to read line")? {
            if line.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.handle(request).await,
                Err(e) => Response::error(format!("invalid request: {}", e)),
            };

            let mut response_json = serde_json::to_string(&response)?;
            response_json.push('\n');
            writer.write_all(response_json.as_bytes()).await?;
            writer.flush().await?;
        }

        Ok(())
    }
}

/// Map store errors onto protocol responses; not-found references stay structured.
fn error_response(e: eyre::Report) -> Response {
    match e.downcast_ref::<StoreError>() {
        Some(StoreError::ProjectNotFound(id) | StoreError::EpicNotFound(id) | StoreError::TaskNotFound(id)) => {
            Response::NotFound { id: id.clone() }
        }
        _ => Response::error(format!("{:#}", e)),
    }
}

/// The boardkeep daemon.
pub struct Daemon<A: StorageAdapter> {
    config: DaemonConfig,
    handler: Handler<A>,
}

impl Daemon<Backend> {
    /// Open the configured backend, key ring and master key for `config.root`.
    pub async fn open(config: DaemonConfig) -> Result<Self> {
        let settings = Config::load(&config.root).context("Failed to load config")?;
        let backend = settings.open_backend(&config.root)?;
        let store = Store::open(backend).await.context("Failed to open store")?;
        let keys = KeyRing::open(keys_path(&config.root)).context("Failed to open key ring")?;
        let handler = Handler::new(store, keys, master_key_from_env());
        Ok(Self::new(config, handler))
    }
}

impl<A: StorageAdapter> Daemon<A> {
    pub fn new(config: DaemonConfig, handler: Handler<A>) -> Self {
        Self { config, handler }
    }

    pub fn handler(&self) -> &Handler<A> {
        &self.handler
    }

    /// Run until a `Shutdown` request arrives.
    pub async fn run(&self) -> Result<()> {
        let socket_path = self.config.socket_path();
        fs::create_dir_all(board_dir(&self.config.root)).context("Failed to create board directory")?;
        if socket_path.exists() {
            fs::remove_file(&socket_path).ok();
        }

        let pid_path = self.config.pid_path();
        fs::write(&pid_path, std::process::id().to_string()).context("Failed to write PID file")?;

        let listener = UnixListener::bind(&socket_path).context("Failed to bind to Unix socket")?;
        log::info!("Daemon listening on {:?}", socket_path);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.serve_connection(stream).await {
                                log::warn!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                _ = self.handler.shutdown.notified() => {
                    log::info!("Daemon shutting down");
                    break;
                }
            }
        }

        fs::remove_file(&socket_path).ok();
        fs::remove_file(&pid_path).ok();

        Ok(())
    }
}

/// Check if a daemon is running for the given board root.
pub fn is_daemon_running(root: &Path) -> bool {
    let config = DaemonConfig::new(root);
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if !socket_path.exists() {
        return false;
    }

    if let Ok(pid_str) = fs::read_to_string(&pid_path)
        && let Ok(pid) = pid_str.trim().parse::<i32>()
    {
        // Signal 0 checks for existence without sending anything
        unsafe {
            if libc::kill(pid, 0) == 0 {
                return true;
            }
        }
    }

    // Stale socket, clean up
    fs::remove_file(&socket_path).ok();
    fs::remove_file(&pid_path).ok();
    false
}

/// Start the daemon as a background process.
pub fn start_daemon(root: &Path) -> Result<()> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe().context("Failed to get current executable")?;

    Command::new(exe)
        .arg("--dir")
        .arg(root)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn daemon process")?;

    std::thread::sleep(Duration::from_millis(100));

    Ok(())
}
