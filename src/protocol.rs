//! IPC protocol types for daemon communication.

use crate::auth::Method;
use crate::types::{Epic, EpicPatch, Project, ProjectPatch, Task, TaskFields, TaskPatch, Visibility};
use serde::{Deserialize, Serialize};

/// Request sent from client to daemon: an optional bearer token plus the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    pub op: Operation,
}

impl Request {
    pub fn new(token: Option<String>, op: Operation) -> Self {
        Self { token, op }
    }
}

/// Store operations the daemon dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Create a new project.
    CreateProject {
        name: String,
        description: Option<String>,
        visibility: Option<Visibility>,
    },

    /// Update an existing project.
    UpdateProject { id: String, patch: ProjectPatch },

    /// Delete a project with its epics and tasks.
    DeleteProject { id: String },

    /// Get a project by ID.
    GetProject { id: String },

    /// List the projects visible to the caller.
    ListProjects,

    /// Create an epic.
    CreateEpic {
        project_id: String,
        title: String,
        description: Option<String>,
    },

    UpdateEpic { id: String, patch: EpicPatch },

    DeleteEpic { id: String },

    /// List epics of a project.
    ListEpics { project_id: String },

    /// Create a task.
    CreateTask {
        project_id: String,
        title: String,
        epic_id: Option<String>,
        #[serde(default)]
        fields: TaskFields,
    },

    UpdateTask { id: String, patch: TaskPatch },

    DeleteTask { id: String },

    /// Get a task by ID.
    GetTask { id: String },

    /// List tasks of a project.
    ListTasks { project_id: String },

    /// Shutdown the daemon.
    Shutdown,

    /// Ping to check if daemon is alive.
    Ping,
}

impl Operation {
    /// Whether this operation mutates state.
    pub fn method(&self) -> Method {
        match self {
            Operation::GetProject { .. }
            | Operation::ListProjects
            | Operation::ListEpics { .. }
            | Operation::GetTask { .. }
            | Operation::ListTasks { .. }
            | Operation::Ping => Method::Read,
            _ => Method::Write,
        }
    }
}

/// Response sent from daemon to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Project { project: Project },

    Projects { projects: Vec<Project> },

    Epic { epic: Epic },

    Epics { epics: Vec<Epic> },

    Task { task: Task },

    Tasks { tasks: Vec<Task> },

    /// Result of a delete: false if the id was already absent.
    Deleted { deleted: bool },

    /// Entity not found, or not visible to the caller.
    NotFound { id: String },

    /// Missing, invalid or insufficient credential.
    Unauthorized,

    /// Operation succeeded.
    Ok,

    /// Pong response to ping.
    Pong,

    /// Error response.
    Error { message: String },
}

impl Response {
    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::new(
            Some("bk_live_token".to_string()),
            Operation::CreateTask {
                project_id: "prj-0000000001".to_string(),
                title: "Test".to_string(),
                epic_id: None,
                fields: TaskFields::new().with_priority(2),
            },
        );

        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.token.as_deref(), Some("bk_live_token"));
        if let Operation::CreateTask { title, fields, .. } = parsed.op {
            assert_eq!(title, "Test");
            assert_eq!(fields.priority, Some(2));
        } else {
            panic!("Wrong operation type");
        }
    }

    #[test]
    fn test_request_without_token() {
        let parsed: Request = serde_json::from_str(r#"{"op":{"type":"ListProjects"}}"#).unwrap();
        assert!(parsed.token.is_none());
        assert_eq!(parsed.op.method(), Method::Read);
    }

    #[test]
    fn test_method_classification() {
        assert_eq!(Operation::Ping.method(), Method::Read);
        assert_eq!(
            Operation::DeleteTask {
                id: "tsk-x".to_string()
            }
            .method(),
            Method::Write
        );
        assert_eq!(Operation::Shutdown.method(), Method::Write);
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::error("test error");
        let json = serde_json::to_string(&resp).unwrap();

        assert!(json.contains("Error"));
        assert!(json.contains("test error"));

        let json = serde_json::to_string(&Response::Unauthorized).unwrap();
        assert_eq!(json, r#"{"type":"Unauthorized"}"#);
    }
}
