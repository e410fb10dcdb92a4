//! Persisted API key records.
//!
//! Only the hash and display prefix of a key are stored. The plaintext is
//! handed out once, by [`KeyRing::issue`].
//!
//! The CLI and a running daemon share `keys.json`. Every change re-reads the
//! file under an exclusive lock and rewrites it, so one process never
//! overwrites records another process added or revoked.

use crate::credential::{GeneratedKey, generate_key, validate_key};
use crate::id::{KEY_PREFIX, generate_unique_id};
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// What a key grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyScope {
    /// Every project.
    Server,
    /// Only the listed projects.
    Project { project_ids: Vec<String> },
}

/// A stored API key record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    /// Unique identifier: "key-" + 10 hex chars
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// First characters of the plaintext, for display
    pub prefix: String,

    /// SHA-256 hex of the plaintext
    pub hash: String,

    pub scope: KeyScope,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Result of issuing a key: the record plus the one-time plaintext.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: String,
    pub record: ApiKey,
}

#[derive(Deserialize)]
struct KeyFile {
    #[serde(default)]
    keys: Vec<ApiKey>,
}

/// The set of issued keys, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct KeyRing {
    path: Option<PathBuf>,
    keys: Vec<ApiKey>,
}

fn read_keys(path: &Path) -> Result<Vec<ApiKey>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let file: KeyFile = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse key ring at {}", path.display()))?;
            Ok(file.keys)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read key ring at {}", path.display())),
    }
}

impl KeyRing {
    /// Load the key ring at `path`; a missing file is an empty ring.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys = read_keys(&path)?;
        log::debug!("Loaded {} keys from {}", keys.len(), path.display());
        Ok(Self { path: Some(path), keys })
    }

    /// A ring that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn list(&self) -> &[ApiKey] {
        &self.keys
    }

    /// Replace the in-memory records with what is on disk now.
    pub fn reload(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            self.keys = read_keys(path)?;
        }
        Ok(())
    }

    /// Generate and store a new key.
    pub fn issue(&mut self, name: Option<&str>, scope: KeyScope) -> Result<IssuedKey> {
        let GeneratedKey { key, prefix, hash } = generate_key();
        let now = Utc::now();
        let name = name.map(String::from);

        let record = self.update(|keys| {
            let id = generate_unique_id(KEY_PREFIX, &prefix, now, |id| keys.iter().any(|k| k.id == id));
            let record = ApiKey {
                id,
                name,
                prefix,
                hash,
                scope,
                created_at: now,
                last_used_at: None,
            };
            keys.push(record.clone());
            Some(record)
        })?;

        match record {
            Some(record) => {
                log::info!("Issued key {} ({})", record.id, record.prefix);
                Ok(IssuedKey { key, record })
            }
            None => eyre::bail!("Key was not recorded"),
        }
    }

    /// Remove a key by id. Returns `false` if it was not present.
    pub fn revoke(&mut self, id: &str) -> Result<bool> {
        let removed = self.update(|keys| {
            let pos = keys.iter().position(|k| k.id == id)?;
            Some(keys.remove(pos))
        })?;
        if removed.is_some() {
            log::info!("Revoked key {}", id);
        }
        Ok(removed.is_some())
    }

    /// Find the record a presented token validates against.
    pub fn find(&self, token: &str) -> Option<&ApiKey> {
        self.keys.iter().find(|k| validate_key(token, &k.hash))
    }

    /// Record that a key was just used. A key revoked in the meantime stays revoked.
    pub fn mark_used(&mut self, id: &str) -> Result<()> {
        self.update(|keys| {
            let key = keys.iter_mut().find(|k| k.id == id)?;
            key.last_used_at = Some(Utc::now());
            Some(())
        })?;
        Ok(())
    }

    /// Read-modify-write against the backing file.
    ///
    /// `change` returns `None` when it changed nothing; the file is then left
    /// untouched. On a failed save the in-memory records are restored.
    fn update<T>(&mut self, change: impl FnOnce(&mut Vec<ApiKey>) -> Option<T>) -> Result<Option<T>> {
        let _lock = self.lock()?;
        self.reload()?;

        let previous = self.keys.clone();
        let Some(out) = change(&mut self.keys) else {
            return Ok(None);
        };
        if let Err(e) = self.save() {
            self.keys = previous;
            return Err(e);
        }
        Ok(Some(out))
    }

    /// Exclusive lock on `<keys>.lock`, released when the handle drops.
    fn lock(&self) -> Result<Option<File>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("Failed to create key ring directory")?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.with_extension("json.lock"))
            .context("Failed to open key ring lock")?;
        file.lock_exclusive().context("Failed to lock key ring")?;
        Ok(Some(file))
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&KeyFileRef { keys: &self.keys })
            .context("Failed to serialize key ring")?;
        let tmp_path = path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path).context("Failed to create temporary key ring")?;
        file.write_all(json.as_bytes())
            .context("Failed to write temporary key ring")?;
        file.sync_all().context("Failed to sync temporary key ring")?;
        fs::rename(&tmp_path, path).context("Failed to replace key ring")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct KeyFileRef<'a> {
    keys: &'a [ApiKey],
}
