//! Storage for expiration tags of successfully provisioned images.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

use super::ProvisionError;

/// Records the expiration tag of the last successful provisioning run per
/// cache key.
pub trait TagStore: Send + Sync {
    /// Returns the recorded tag for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::TagStore`] when the store cannot be read.
    fn recorded(&self, key: &str) -> Result<Option<String>, ProvisionError>;

    /// Records `tag` for `key`, replacing any previous tag.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::TagStore`] when the store cannot be written.
    fn record(&self, key: &str, tag: &str) -> Result<(), ProvisionError>;
}

/// Process-local tag store.
#[derive(Debug, Default)]
pub struct MemoryTagStore {
    tags: Mutex<BTreeMap<String, String>>,
}

impl MemoryTagStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagStore for MemoryTagStore {
    fn recorded(&self, key: &str) -> Result<Option<String>, ProvisionError> {
        let tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tags.get(key).cloned())
    }

    fn record(&self, key: &str, tag: &str) -> Result<(), ProvisionError> {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), tag.to_owned());
        Ok(())
    }
}

/// Tag store persisted as a JSON object in a single file.
#[derive(Debug)]
pub struct FileTagStore {
    path: Utf8PathBuf,
    write_lock: Mutex<()>,
}

impl FileTagStore {
    /// Creates a store backed by `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn io_error(&self, err: &impl ToString) -> ProvisionError {
        ProvisionError::TagStore {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }

    fn parent(&self) -> &Utf8Path {
        self.path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."))
    }

    fn file_name(&self) -> Result<&str, ProvisionError> {
        self.path
            .file_name()
            .ok_or_else(|| self.io_error(&"tag store path is missing a file name"))
    }

    fn load(&self) -> Result<BTreeMap<String, String>, ProvisionError> {
        let file_name = self.file_name()?;
        let dir = match Dir::open_ambient_dir(self.parent(), ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_error(&err)),
        };
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_error(&err)),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|err| self.io_error(&err))
    }

    fn save(&self, tags: &BTreeMap<String, String>) -> Result<(), ProvisionError> {
        let file_name = self.file_name()?;
        Dir::create_ambient_dir_all(self.parent(), ambient_authority())
            .map_err(|err| self.io_error(&err))?;
        let dir = Dir::open_ambient_dir(self.parent(), ambient_authority())
            .map_err(|err| self.io_error(&err))?;
        let rendered = serde_json::to_string_pretty(tags).map_err(|err| self.io_error(&err))?;
        dir.write(file_name, rendered)
            .map_err(|err| self.io_error(&err))
    }
}

impl TagStore for FileTagStore {
    fn recorded(&self, key: &str) -> Result<Option<String>, ProvisionError> {
        Ok(self.load()?.remove(key))
    }

    fn record(&self, key: &str, tag: &str) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tags = self.load()?;
        tags.insert(key.to_owned(), tag.to_owned());
        self.save(&tags)
    }
}
