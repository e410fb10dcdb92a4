//! Client for connecting to the boardkeep daemon.

use crate::auth::AuthError;
use crate::daemon::{DaemonConfig, is_daemon_running, start_daemon};
use crate::protocol::{Operation, Request, Response};
use crate::types::{Epic, EpicPatch, Project, ProjectPatch, Task, TaskFields, TaskPatch, Visibility};
use eyre::{Context, Result, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client for communicating with the boardkeep daemon.
pub struct Client {
    root: PathBuf,
    stream: UnixStream,
    token: Option<String>,
}

impl Client {
    /// Connect to the daemon, optionally auto-starting it if not running.
    pub fn connect(root: &Path, auto_start: bool) -> Result<Self> {
        let config = DaemonConfig::new(root);
        let socket_path = config.socket_path();

        let stream = match UnixStream::connect(&socket_path) {
            Ok(stream) => stream,
            Err(_) if auto_start => {
                if !is_daemon_running(root) {
                    start_daemon(root).context("Failed to auto-start daemon")?;

                    let mut attempts = 0;
                    loop {
                        if attempts > 20 {
                            bail!("Daemon failed to start in time");
                        }
                        std::thread::sleep(Duration::from_millis(50));
                        if let Ok(stream) = UnixStream::connect(&socket_path) {
                            break stream;
                        }
                        attempts += 1;
                    }
                } else {
                    UnixStream::connect(&socket_path).context("Failed to connect to daemon")?
                }
            }
            Err(e) => {
                bail!("Failed to connect to daemon: {}. Is it running?", e);
            }
        };

        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .context("Failed to set read timeout")?;

        Ok(Self {
            root: root.to_path_buf(),
            stream,
            token: None,
        })
    }

    /// Present `token` as the bearer credential on every request.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Get the board root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Send one operation and receive its response.
    fn request(&mut self, op: Operation) -> Result<Response> {
        let request = Request::new(self.token.clone(), op);
        let request_json = serde_json::to_string(&request)?;
        writeln!(self.stream, "{}", request_json)?;
        self.stream.flush()?;

        let mut reader = BufReader::new(&self.stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line)?;
        if response_line.is_empty() {
            bail!("Daemon closed the connection");
        }

        let response: Response = serde_json::from_str(&response_line).context("Failed to parse response")?;
        Ok(response)
    }

    pub fn create_project(
        &mut self,
        name: &str,
        description: Option<&str>,
        visibility: Option<Visibility>,
    ) -> Result<Project> {
        match self.request(Operation::CreateProject {
            name: name.to_string(),
            description: description.map(String::from),
            visibility,
        })? {
            Response::Project { project } => Ok(project),
            other => Err(unexpected(other)),
        }
    }

    pub fn update_project(&mut self, id: &str, patch: ProjectPatch) -> Result<Option<Project>> {
        match self.request(Operation::UpdateProject {
            id: id.to_string(),
            patch,
        })? {
            Response::Project { project } => Ok(Some(project)),
            Response::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete_project(&mut self, id: &str) -> Result<bool> {
        match self.request(Operation::DeleteProject { id: id.to_string() })? {
            Response::Deleted { deleted } => Ok(deleted),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_project(&mut self, id: &str) -> Result<Option<Project>> {
        match self.request(Operation::GetProject { id: id.to_string() })? {
            Response::Project { project } => Ok(Some(project)),
            Response::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Projects visible to this client's token.
    pub fn list_projects(&mut self) -> Result<Vec<Project>> {
        match self.request(Operation::ListProjects)? {
            Response::Projects { projects } => Ok(projects),
            other => Err(unexpected(other)),
        }
    }

    pub fn create_epic(&mut self, project_id: &str, title: &str, description: Option<&str>) -> Result<Epic> {
        match self.request(Operation::CreateEpic {
            project_id: project_id.to_string(),
            title: title.to_string(),
            description: description.map(String::from),
        })? {
            Response::Epic { epic } => Ok(epic),
            other => Err(unexpected(other)),
        }
    }

    pub fn update_epic(&mut self, id: &str, patch: EpicPatch) -> Result<Option<Epic>> {
        match self.request(Operation::UpdateEpic {
            id: id.to_string(),
            patch,
        })? {
            Response::Epic { epic } => Ok(Some(epic)),
            Response::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete_epic(&mut self, id: &str) -> Result<bool> {
        match self.request(Operation::DeleteEpic { id: id.to_string() })? {
            Response::Deleted { deleted } => Ok(deleted),
            other => Err(unexpected(other)),
        }
    }

    pub fn list_epics(&mut self, project_id: &str) -> Result<Vec<Epic>> {
        match self.request(Operation::ListEpics {
            project_id: project_id.to_string(),
        })? {
            Response::Epics { epics } => Ok(epics),
            other => Err(unexpected(other)),
        }
    }

    pub fn create_task(
        &mut self,
        project_id: &str,
        title: &str,
        epic_id: Option<&str>,
        fields: TaskFields,
    ) -> Result<Task> {
        match self.request(Operation::CreateTask {
            project_id: project_id.to_string(),
            title: title.to_string(),
            epic_id: epic_id.map(String::from),
            fields,
        })? {
            Response::Task { task } => Ok(task),
            other => Err(unexpected(other)),
        }
    }

    pub fn update_task(&mut self, id: &str, patch: TaskPatch) -> Result<Option<Task>> {
        match self.request(Operation::UpdateTask {
            id: id.to_string(),
            patch,
        })? {
            Response::Task { task } => Ok(Some(task)),
            Response::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete_task(&mut self, id: &str) -> Result<bool> {
        match self.request(Operation::DeleteTask { id: id.to_string() })? {
            Response::Deleted { deleted } => Ok(deleted),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_task(&mut self, id: &str) -> Result<Option<Task>> {
        match self.request(Operation::GetTask { id: id.to_string() })? {
            Response::Task { task } => Ok(Some(task)),
            Response::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub fn list_tasks(&mut self, project_id: &str) -> Result<Vec<Task>> {
        match self.request(Operation::ListTasks {
            project_id: project_id.to_string(),
        })? {
            Response::Tasks { tasks } => Ok(tasks),
            other => Err(unexpected(other)),
        }
    }

    /// Shutdown the daemon.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.request(Operation::Shutdown)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Ping the daemon.
    pub fn ping(&mut self) -> Result<()> {
        match self.request(Operation::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Turn a response the caller did not expect into an error.
fn unexpected(response: Response) -> eyre::Report {
    match response {
        Response::Unauthorized => eyre::eyre!(AuthError::Unauthorized),
        Response::NotFound { id } => eyre::eyre!("not found: {}", id),
        Response::Error { message } => eyre::eyre!("{}", message),
        other => eyre::eyre!("Unexpected response: {:?}", other),
    }
}
