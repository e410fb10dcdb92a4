//! Flat-file backend: the whole document as one JSON file.

use super::{AdapterKind, StorageAdapter};
use crate::types::Document;
use eyre::{Context, Result};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Persists the full snapshot as a single JSON document.
pub struct FileAdapter {
    path: PathBuf,
    data: Document,
    is_test: bool,
}

impl FileAdapter {
    /// Adapter for the document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Document::default(),
            is_test: false,
        }
    }

    /// Adapter marked for test use.
    pub fn for_tests(path: impl Into<PathBuf>) -> Self {
        Self {
            is_test: true,
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document, or `None` when there is nothing usable to load.
    ///
    /// Only a missing file or unparseable contents count as nothing usable.
    /// Unparseable contents are moved aside to `<name>.corrupt` first. Any
    /// other I/O error is returned, leaving the file in place.
    fn load(&self) -> Result<Option<Document>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("No document at {}; starting from an empty one", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read document {}", self.path.display()));
            }
        };

        match serde_json::from_str::<Document>(&contents) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                let corrupt_path = self.sibling("corrupt");
                log::warn!(
                    "Failed to parse document at {}: {}; moved to {} and starting from an empty one",
                    self.path.display(),
                    e,
                    corrupt_path.display()
                );
                fs::rename(&self.path, &corrupt_path).context("Failed to move corrupt document aside")?;
                Ok(None)
            }
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Serialize to a sibling temp file, fsync, then rename over the target.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("Failed to create document directory")?;
        }

        let json = serde_json::to_string_pretty(&self.data).context("Failed to serialize document")?;

        let tmp_path = self.sibling("tmp");

        let mut file = File::create(&tmp_path).context("Failed to create temporary document")?;
        file.write_all(json.as_bytes())
            .context("Failed to write temporary document")?;
        file.sync_all().context("Failed to sync temporary document")?;
        fs::rename(&tmp_path, &self.path).context("Failed to replace document")?;

        Ok(())
    }
}

impl StorageAdapter for FileAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::File
    }

    fn is_test(&self) -> bool {
        self.is_test
    }

    fn data(&self) -> &Document {
        &self.data
    }

    fn data_mut(&mut self) -> &mut Document {
        &mut self.data
    }

    async fn read(&mut self) -> Result<()> {
        match self.load()? {
            Some(doc) => self.data = doc,
            None => {
                self.data = Document::default();
                self.persist()?;
            }
        }
        Ok(())
    }

    async fn write(&mut self) -> Result<()> {
        self.persist()
    }
}
