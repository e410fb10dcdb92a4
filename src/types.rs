//! Core data types for boardkeep: projects, epics, tasks and their patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Maximum length of names and titles.
pub const MAX_TITLE_LEN: usize = 500;

/// Highest allowed task priority.
pub const MAX_PRIORITY: u8 = 2;

/// Priority given to tasks created without one.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Who may read a project without a scoped credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// Task workflow states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "review" => Ok(TaskStatus::Review),
            "done" => Ok(TaskStatus::Done),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A project: the unit of ownership and visibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    /// Unique identifier: "prj-" + 10 hex chars
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub visibility: Visibility,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// A group of tasks inside one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Epic {
    /// Unique identifier: "epc-" + 10 hex chars
    pub id: String,

    /// Owning project
    pub project_id: String,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique identifier: "tsk-" + 10 hex chars, never reused
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Optional epic, always within the same project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,

    pub title: String,

    #[serde(default)]
    pub status: TaskStatus,

    /// Priority 0-2 (0 = high)
    pub priority: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Ids of tasks that must be done before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// True if any dependency listed in `depends_on` is present in `tasks` and not done.
    pub fn is_blocked(&self, tasks: &[Task]) -> bool {
        self.depends_on.iter().any(|dep| {
            tasks
                .iter()
                .any(|t| &t.id == dep && t.status != TaskStatus::Done)
        })
    }
}

/// The full snapshot of projects, epics and tasks.
///
/// This is the unit of durability for the file backend and the interchange
/// shape every backend reads and writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub epics: Vec<Epic>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Document {
    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn epic(&self, id: &str) -> Option<&Epic> {
        self.epics.iter().find(|e| e.id == id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty() && self.epics.is_empty() && self.tasks.is_empty()
    }
}

/// Deserialize a present field (including `null`) as `Some`.
///
/// Combined with `#[serde(default)]` this lets `Option<Option<T>>` tell an
/// absent field (leave alone) from an explicit `null` (clear).
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Partial update for a project. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

impl ProjectPatch {
    pub fn apply(&self, project: &mut Project) {
        if let Some(name) = &self.name {
            project.name = name.clone();
        }
        if let Some(description) = &self.description {
            project.description = description.clone();
        }
        if let Some(visibility) = self.visibility {
            project.visibility = visibility;
        }
    }
}

/// Partial update for an epic. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpicPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
}

impl EpicPatch {
    pub fn apply(&self, epic: &mut Epic) {
        if let Some(title) = &self.title {
            epic.title = title.clone();
        }
        if let Some(description) = &self.description {
            epic.description = description.clone();
        }
    }
}

/// Partial update for a task. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

impl TaskPatch {
    /// Patch that only changes the title.
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Patch that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(epic_id) = &self.epic_id {
            task.epic_id = epic_id.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(notes) = &self.notes {
            task.notes = notes.clone();
        }
        if let Some(depends_on) = &self.depends_on {
            task.depends_on = depends_on.clone();
        }
    }
}

/// Optional fields supplied when creating a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFields {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the notes.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Set the dependencies.
    pub fn with_depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = ids.into_iter().map(|id| id.into()).collect();
        self
    }
}

/// Validation errors for entity fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyTitle,
    TitleTooLong,
    InvalidCharacters,
    InvalidPriority,
    SelfDependency,
    InvalidTimestamp,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyTitle => write!(f, "name/title cannot be empty"),
            ValidationError::TitleTooLong => write!(f, "name/title exceeds {} characters", MAX_TITLE_LEN),
            ValidationError::InvalidCharacters => write!(f, "name/title contains control characters"),
            ValidationError::InvalidPriority => write!(f, "priority must be 0-{}", MAX_PRIORITY),
            ValidationError::SelfDependency => write!(f, "a task cannot depend on itself"),
            ValidationError::InvalidTimestamp => write!(f, "updated_at cannot be before created_at"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Names and titles: required, 1-500 chars, no control characters.
fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ValidationError::TitleTooLong);
    }
    if title.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

fn validate_timestamps(created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Result<(), ValidationError> {
    if updated_at < created_at {
        return Err(ValidationError::InvalidTimestamp);
    }
    Ok(())
}

impl Project {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.name)?;
        validate_timestamps(self.created_at, self.updated_at)
    }
}

impl Epic {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        validate_timestamps(self.created_at, self.updated_at)
    }
}

impl Task {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        if self.priority > MAX_PRIORITY {
            return Err(ValidationError::InvalidPriority);
        }
        if self.depends_on.iter().any(|dep| dep == &self.id) {
            return Err(ValidationError::SelfDependency);
        }
        validate_timestamps(self.created_at, self.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task(title: &str) -> Task {
        let now = Utc::now();
        Task {
            id: "tsk-test123456".to_string(),
            project_id: "prj-test123456".to_string(),
            epic_id: None,
            title: title.to_string(),
            status: TaskStatus::Todo,
            priority: 1,
            notes: None,
            depends_on: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_task_validation_valid() {
        assert!(make_task("Valid title").validate().is_ok());
    }

    #[test]
    fn test_task_validation_empty_title() {
        assert_eq!(make_task("").validate(), Err(ValidationError::EmptyTitle));
    }

    #[test]
    fn test_task_validation_title_too_long() {
        let task = make_task(&"x".repeat(501));
        assert_eq!(task.validate(), Err(ValidationError::TitleTooLong));
    }

    #[test]
    fn test_task_validation_multibyte_title_counts_chars() {
        let task = make_task(&"é".repeat(500));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_task_validation_control_chars() {
        let task = make_task("Title\x00with null");
        assert_eq!(task.validate(), Err(ValidationError::InvalidCharacters));
    }

    #[test]
    fn test_task_validation_invalid_priority() {
        let mut task = make_task("Valid title");
        task.priority = 3;
        assert_eq!(task.validate(), Err(ValidationError::InvalidPriority));
    }

    #[test]
    fn test_task_validation_self_dependency() {
        let mut task = make_task("Valid title");
        task.depends_on = vec![task.id.clone()];
        assert_eq!(task.validate(), Err(ValidationError::SelfDependency));
    }

    #[test]
    fn test_is_blocked_by_open_dependency() {
        let mut dep = make_task("Dependency");
        dep.id = "tsk-dep0000001".to_string();
        let mut task = make_task("Dependent");
        task.depends_on = vec![dep.id.clone()];

        let tasks = vec![dep.clone(), task.clone()];
        assert!(task.is_blocked(&tasks));

        dep.status = TaskStatus::Done;
        let tasks = vec![dep, task.clone()];
        assert!(!task.is_blocked(&tasks));
    }

    #[test]
    fn test_task_patch_applies_only_present_fields() {
        let mut task = make_task("Original");
        task.notes = Some("keep me".to_string());

        TaskPatch::title("Renamed").apply(&mut task);
        assert_eq!(task.title, "Renamed");
        assert_eq!(task.notes.as_deref(), Some("keep me"));
        assert_eq!(task.priority, 1);
    }

    #[test]
    fn test_patch_null_clears_absent_keeps() {
        let patch: ProjectPatch = serde_json::from_str(r#"{"description": null}"#).unwrap();
        assert_eq!(patch.description, Some(None));

        let patch: ProjectPatch = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        assert_eq!(patch.description, None);
    }

    #[test]
    fn test_document_uses_three_collections() {
        let json = serde_json::to_value(Document::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert!(obj.contains_key("projects"));
        assert!(obj.contains_key("epics"));
        assert!(obj.contains_key("tasks"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in_progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert!("closed".parse::<TaskStatus>().is_err());
        assert_eq!("private".parse::<Visibility>(), Ok(Visibility::Private));
    }
}
