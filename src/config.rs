//! Board configuration: `<root>/.boardkeep/config.yaml` plus environment overrides.

use crate::credential::decrypt;
use crate::storage::{AdapterKind, Backend, DEFAULT_POOL_SIZE, FileAdapter, PgAdapter, SqliteAdapter, StorageAdapter};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory under the board root that holds all boardkeep state.
pub const BOARD_DIR: &str = ".boardkeep";

const CONFIG_FILE: &str = "config.yaml";
const KEYS_FILE: &str = "keys.json";
const DOCUMENT_FILE: &str = "board.json";
const DATABASE_FILE: &str = "board.db";

/// Marks a `database_url` stored as ciphertext.
pub const ENCRYPTED_PREFIX: &str = "enc:";

pub const BACKEND_ENV: &str = "BOARDKEEP_BACKEND";
pub const DATABASE_URL_ENV: &str = "BOARDKEEP_DATABASE_URL";
/// Password for `enc:` values in the config file.
pub const SECRET_ENV: &str = "BOARDKEEP_SECRET";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: AdapterKind,

    /// Document or database file, relative to the board root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Connection string for the remote backend, optionally `enc:`-prefixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
}

pub fn board_dir(root: &Path) -> PathBuf {
    root.join(BOARD_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    board_dir(root).join(CONFIG_FILE)
}

pub fn keys_path(root: &Path) -> PathBuf {
    board_dir(root).join(KEYS_FILE)
}

impl Config {
    /// Load the config for `root` and apply process environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let mut config = Self::load_file(root)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load only the file; a missing file yields the defaults.
    pub fn load_file(root: &Path) -> Result<Self> {
        let path = config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = config_path(root);
        fs::create_dir_all(board_dir(root)).context("Failed to create board directory")?;
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(&path, contents).with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Apply `BOARDKEEP_BACKEND` and `BOARDKEEP_DATABASE_URL` from `env`.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = env(BACKEND_ENV) {
            match serde_yaml::from_str::<AdapterKind>(&backend) {
                Ok(kind) => self.backend = kind,
                Err(_) => log::warn!("Ignoring unknown {}={}", BACKEND_ENV, backend),
            }
        }
        if let Some(url) = env(DATABASE_URL_ENV).filter(|u| !u.is_empty()) {
            self.database_url = Some(url);
        }
    }

    /// Where the file or sqlite backend keeps its data.
    pub fn data_path(&self, root: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root.join(path),
            None => match self.backend {
                AdapterKind::Sqlite => board_dir(root).join(DATABASE_FILE),
                _ => board_dir(root).join(DOCUMENT_FILE),
            },
        }
    }

    /// The plaintext database URL, decrypting an `enc:` value with `secret`.
    pub fn database_url(&self, secret: Option<&str>) -> Result<Option<String>> {
        let Some(url) = &self.database_url else {
            return Ok(None);
        };
        let Some(ciphertext) = url.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(Some(url.clone()));
        };
        let secret = secret.ok_or_else(|| eyre::eyre!("database_url is encrypted but {} is not set", SECRET_ENV))?;
        decrypt(ciphertext, secret)
            .map(Some)
            .ok_or_else(|| eyre::eyre!("Failed to decrypt database_url (wrong {}?)", SECRET_ENV))
    }

    /// Build the configured backend for `root`.
    pub fn open_backend(&self, root: &Path) -> Result<Backend> {
        let backend = match self.backend {
            AdapterKind::File => Backend::File(FileAdapter::new(self.data_path(root))),
            AdapterKind::Sqlite => Backend::Sqlite(SqliteAdapter::open(&self.data_path(root))?),
            AdapterKind::Postgres => {
                let secret = std::env::var(SECRET_ENV).ok();
                let url = self
                    .database_url(secret.as_deref())?
                    .ok_or_else(|| eyre::eyre!("postgres backend requires database_url or {}", DATABASE_URL_ENV))?;
                Backend::Postgres(PgAdapter::connect(&url, self.pool_size.unwrap_or(DEFAULT_POOL_SIZE))?)
            }
        };
        log::info!("Using {} backend", backend.kind());
        Ok(backend)
    }
}
