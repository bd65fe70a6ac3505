//! Whole-file JSON documents.
//!
//! A document is read once when opened and rewritten in full after every
//! change. There is no file locking: one process owns the data directory, and
//! inside the process every change goes through the document's mutex.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, PathContext, Result};
use crate::utils::write_atomic;

pub struct JsonDocument<T> {
    path: PathBuf,
    data: Mutex<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + PartialEq,
{
    /// Loads `path`, creating it with an empty document when it is absent.
    /// A present file with the wrong shape is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match read_json(&path) {
            Ok(data) => data,
            Err(Error::Path { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                let data = T::default();
                write_json(&path, &data)?;
                tracing::debug!("created {}", path.display());
                data
            }
            Err(e) => return Err(e),
        };

        Ok(Self { path, data: Mutex::new(data) })
    }

    /// Like [`JsonDocument::open`] but starts from an empty document when the
    /// file cannot be parsed.
    pub fn open_lenient(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match Self::open(path.clone()) {
            Err(Error::Malformed { source, .. }) => {
                tracing::warn!("{} is corrupt, starting empty: {}", path.display(), source);
                Ok(Self { path, data: Mutex::new(T::default()) })
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    pub fn snapshot(&self) -> T {
        self.lock().clone()
    }

    /// Applies `f` to a copy of the document and writes the copy out. The
    /// in-memory document only changes once the write succeeded; nothing is
    /// written when `f` left the document unchanged.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let result = f(&mut next);
        if next != *guard {
            write_json(&self.path, &next)?;
            *guard = next;
        }
        Ok(result)
    }

    /// Re-reads the file, picking up changes written by another instance.
    pub fn reload(&self) -> Result<()> {
        let data = read_json(&self.path)?;
        *self.lock() = data;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).at(path)?;
    serde_json::from_slice(&bytes).map_err(|source| Error::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let json = serde_json::to_vec_pretty(data)?;
    write_atomic(path, &json)
}
