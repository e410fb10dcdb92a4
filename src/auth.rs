//! Request authorization: who is calling, and which projects they may touch.
//!
//! A context is resolved once per request from the presented bearer token:
//!
//! 1. Nothing configured (no master key, no issued keys): development mode,
//!    anonymous with full access.
//! 2. Token equals the master key: `env`, full access.
//! 3. Token validates against an issued key: `server` or `project`.
//! 4. Otherwise reads proceed as `anonymous` (public projects only) and
//!    writes fail with [`AuthError::Unauthorized`].

use crate::credential::secrets_equal;
use crate::keyring::{ApiKey, KeyRing, KeyScope};
use crate::storage::StorageAdapter;
use crate::store::Store;
use crate::types::{Document, Project, Visibility};
use serde::{Deserialize, Serialize};

/// Environment variable holding the master key.
pub const MASTER_KEY_ENV: &str = "BOARDKEEP_MASTER_KEY";

/// Read the master key from the environment. Empty values count as unset.
pub fn master_key_from_env() -> Option<String> {
    std::env::var(MASTER_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Env,
    Server,
    Project,
    Anonymous,
}

/// Whether an operation only reads or also mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Read,
    Write,
}

/// Per-request authorization state. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub key_type: KeyType,
    pub project_ids: Option<Vec<String>>,
    pub api_key: Option<ApiKey>,
    /// False in development mode.
    pub auth_required: bool,
}

impl AuthContext {
    fn anonymous(auth_required: bool) -> Self {
        Self {
            key_type: KeyType::Anonymous,
            project_ids: None,
            api_key: None,
            auth_required,
        }
    }

    /// Full access regardless of scope.
    pub fn is_privileged(&self) -> bool {
        !self.auth_required || matches!(self.key_type, KeyType::Env | KeyType::Server)
    }

    /// True if a project-scoped key lists this project.
    pub fn owns(&self, project_id: &str) -> bool {
        self.key_type == KeyType::Project
            && self
                .project_ids
                .as_ref()
                .is_some_and(|ids| ids.iter().any(|id| id == project_id))
    }
}

/// Authorization failure. Deliberately carries no reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Unauthorized,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Project visibility source for read decisions.
pub trait ProjectLookup {
    fn project_visibility(&self, id: &str) -> Option<Visibility>;
    fn all_projects(&self) -> Vec<Project>;
}

impl ProjectLookup for Document {
    fn project_visibility(&self, id: &str) -> Option<Visibility> {
        self.project(id).map(|p| p.visibility)
    }

    fn all_projects(&self) -> Vec<Project> {
        self.projects.clone()
    }
}

impl<A: StorageAdapter> ProjectLookup for Store<A> {
    fn project_visibility(&self, id: &str) -> Option<Visibility> {
        self.get_project(id).map(|p| p.visibility)
    }

    fn all_projects(&self) -> Vec<Project> {
        self.get_projects()
    }
}

/// Resolves auth contexts against the master key and the key ring.
pub struct Authorizer<'a> {
    master_key: Option<String>,
    keys: &'a KeyRing,
}

impl<'a> Authorizer<'a> {
    pub fn new(master_key: Option<String>, keys: &'a KeyRing) -> Self {
        Self { master_key, keys }
    }

    /// True unless nothing is configured.
    pub fn auth_required(&self) -> bool {
        self.master_key.is_some() || !self.keys.is_empty()
    }

    /// Resolve the context for one request.
    pub fn resolve(&self, token: Option<&str>, method: Method) -> Result<AuthContext, AuthError> {
        if !self.auth_required() {
            return Ok(AuthContext::anonymous(false));
        }

        if let Some(token) = token {
            if let Some(master) = &self.master_key
                && secrets_equal(token, master)
            {
                return Ok(AuthContext {
                    key_type: KeyType::Env,
                    project_ids: None,
                    api_key: None,
                    auth_required: true,
                });
            }

            if let Some(key) = self.keys.find(token) {
                let (key_type, project_ids) = match &key.scope {
                    KeyScope::Server => (KeyType::Server, None),
                    KeyScope::Project { project_ids } => (KeyType::Project, Some(project_ids.clone())),
                };
                return Ok(AuthContext {
                    key_type,
                    project_ids,
                    api_key: Some(key.clone()),
                    auth_required: true,
                });
            }
        }

        match method {
            Method::Read => Ok(AuthContext::anonymous(true)),
            Method::Write => {
                log::debug!("Rejected unauthenticated write");
                Err(AuthError::Unauthorized)
            }
        }
    }
}

pub fn can_write_project(ctx: &AuthContext, project_id: &str) -> bool {
    ctx.is_privileged() || ctx.owns(project_id)
}

/// Missing projects are never readable without full access.
pub fn can_read_project(ctx: &AuthContext, project_id: &str, lookup: &impl ProjectLookup) -> bool {
    if ctx.is_privileged() || ctx.owns(project_id) {
        return true;
    }
    matches!(lookup.project_visibility(project_id), Some(Visibility::Public))
}

/// The projects this context may see, in store order.
pub fn filter_projects(ctx: &AuthContext, lookup: &impl ProjectLookup) -> Vec<Project> {
    let projects = lookup.all_projects();
    if ctx.is_privileged() {
        return projects;
    }
    projects
        .into_iter()
        .filter(|p| p.visibility == Visibility::Public || ctx.owns(&p.id))
        .collect()
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const MASTER: &str = "master-secret";

    fn project(id: &str, visibility: Visibility) -> Project {
        let now = Utc::now();
        Project {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            visibility,
            created_at: now,
            updated_at: now,
        }
    }

    fn board() -> Document {
        Document {
            projects: vec![
                project("prj-p1", Visibility::Private),
                project("prj-p2", Visibility::Public),
                project("prj-p3", Visibility::Private),
            ],
            ..Document::default()
        }
    }

    #[test]
    fn test_dev_mode_allows_everything() {
        let keys = KeyRing::in_memory();
        let auth = Authorizer::new(None, &keys);
        let doc = board();

        for token in [None, Some("anything"), Some("")] {
            let ctx = auth.resolve(token, Method::Write).unwrap();
            assert!(!ctx.auth_required);
            assert!(can_write_project(&ctx, "prj-p1"));
            assert!(can_read_project(&ctx, "prj-p3", &doc));
            assert_eq!(filter_projects(&ctx, &doc).len(), 3);
        }
    }

    #[test]
    fn test_master_key_anonymous_read() {
        let keys = KeyRing::in_memory();
        let auth = Authorizer::new(Some(MASTER.to_string()), &keys);
        let doc = board();

        let ctx = auth.resolve(None, Method::Read).unwrap();
        assert_eq!(ctx.key_type, KeyType::Anonymous);
        assert!(!can_read_project(&ctx, "prj-p1", &doc));
        assert!(can_read_project(&ctx, "prj-p2", &doc));

        let ctx = auth.resolve(Some(MASTER), Method::Read).unwrap();
        assert_eq!(ctx.key_type, KeyType::Env);
        assert!(can_read_project(&ctx, "prj-p1", &doc));
        assert!(can_read_project(&ctx, "prj-p2", &doc));
    }

    #[test]
    fn test_write_without_valid_token_unauthorized() {
        let keys = KeyRing::in_memory();
        let auth = Authorizer::new(Some(MASTER.to_string()), &keys);

        let missing = auth.resolve(None, Method::Write).unwrap_err();
        let wrong = auth.resolve(Some("wrong"), Method::Write).unwrap_err();
        assert_eq!(missing, wrong);
        assert_eq!(missing, AuthError::Unauthorized);
    }

    #[test]
    fn test_issued_keys_alone_require_auth() {
        let mut keys = KeyRing::in_memory();
        let issued = keys.issue(None, KeyScope::Server).unwrap();
        let auth = Authorizer::new(None, &keys);

        assert!(auth.resolve(None, Method::Write).is_err());
        let ctx = auth.resolve(Some(&issued.key), Method::Write).unwrap();
        assert_eq!(ctx.key_type, KeyType::Server);
        assert_eq!(ctx.api_key.as_ref().map(|k| &k.id), Some(&issued.record.id));
    }

    #[test]
    fn test_project_key_scope() {
        let mut keys = KeyRing::in_memory();
        let issued = keys
            .issue(
                None,
                KeyScope::Project {
                    project_ids: vec!["prj-p1".to_string()],
                },
            )
            .unwrap();
        let auth = Authorizer::new(None, &keys);
        let doc = board();

        let ctx = auth.resolve(Some(&issued.key), Method::Write).unwrap();
        assert_eq!(ctx.key_type, KeyType::Project);
        assert!(can_write_project(&ctx, "prj-p1"));
        assert!(!can_write_project(&ctx, "prj-p2"));
        assert!(can_read_project(&ctx, "prj-p2", &doc));
        assert!(!can_read_project(&ctx, "prj-p3", &doc));

        let ids: Vec<_> = filter_projects(&ctx, &doc).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["prj-p1", "prj-p2"]);
    }

    #[test]
    fn test_missing_project_not_readable_anonymously() {
        let keys = KeyRing::in_memory();
        let auth = Authorizer::new(Some(MASTER.to_string()), &keys);
        let ctx = auth.resolve(None, Method::Read).unwrap();
        assert!(!can_read_project(&ctx, "prj-missing", &board()));
        assert!(!can_write_project(&ctx, "prj-p2"));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc  "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }
}
