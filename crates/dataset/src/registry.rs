use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::config::IdentityMode;
use crate::document::JsonDocument;
use crate::error::{PathContext, Result};

const ID_LEN: usize = 8;

/// Stable name of a managed dataset: the first 8 hex digits of a digest. It
/// doubles as the managed folder name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    /// SHA-256 based id.
    pub fn for_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let hex = format!("{digest:x}");
        Self(hex[..ID_LEN].to_string())
    }

    /// MD5 of a bare folder name, the naming of folder-name data directories.
    pub fn for_folder_name(name: &str) -> Self {
        let digest = Md5::digest(name.as_bytes());
        let hex = format!("{digest:x}");
        Self(hex[..ID_LEN].to_string())
    }

    /// Identity of an existing source folder.
    pub fn for_source(source: &Path, mode: IdentityMode) -> Result<Self> {
        match mode {
            IdentityMode::CanonicalPath => {
                let path = source.canonicalize().at(source)?;
                Ok(Self::for_name(&path.to_string_lossy()))
            }
            IdentityMode::FolderName => {
                let name = source
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Self::for_folder_name(&name))
            }
        }
    }

    /// Takes the folder name of a managed dataset path.
    pub fn from_managed_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Some(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

type Names = IndexMap<DatasetId, String>;

/// Which datasets were imported and what the user calls them.
///
/// Origins (`hash_to_name.json`) record where a dataset was imported from and
/// decide whether an import already happened. Display names
/// (`dataset_names.json`) are cosmetic and edited freely.
pub struct DatasetRegistry {
    origins: JsonDocument<Names>,
    names: JsonDocument<Names>,
}

impl DatasetRegistry {
    pub fn open(origins: impl Into<PathBuf>, names: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            origins: JsonDocument::open(origins)?,
            names: JsonDocument::open(names)?,
        })
    }

    pub fn contains(&self, id: &DatasetId) -> bool {
        self.origins.read(|origins| origins.contains_key(id))
    }

    pub fn origin(&self, id: &DatasetId) -> Option<String> {
        self.origins.read(|origins| origins.get(id).cloned())
    }

    pub fn record_origin(&self, id: &DatasetId, origin: &str) -> Result<()> {
        self.origins.update(|origins| {
            origins.insert(id.clone(), origin.to_string());
        })
    }

    pub fn rename(&self, id: &DatasetId, name: &str) -> Result<()> {
        self.names.update(|names| {
            names.insert(id.clone(), name.to_string());
        })
    }

    /// The user-chosen name, else the leaf of the origin path, else the id.
    pub fn display_name(&self, id: &DatasetId) -> String {
        if let Some(name) = self.names.read(|names| names.get(id).cloned()) {
            return name;
        }
        self.origin(id)
            .and_then(|origin| {
                Path::new(&origin)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| id.to_string())
    }

    pub fn remove(&self, id: &DatasetId) -> Result<bool> {
        let had_origin = self.origins.update(|origins| origins.shift_remove(id).is_some())?;
        let had_name = self.names.update(|names| names.shift_remove(id).is_some())?;
        Ok(had_origin || had_name)
    }

    pub fn ids(&self) -> Vec<DatasetId> {
        self.origins.read(|origins| origins.keys().cloned().collect())
    }
}

/// Free-form per-image records supplied by remote imports (`blazons.json`).
pub struct ImageMetadata {
    doc: JsonDocument<IndexMap<DatasetId, IndexMap<String, Value>>>,
}

impl ImageMetadata {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self { doc: JsonDocument::open(path)? })
    }

    pub fn set(&self, id: &DatasetId, file: &str, value: Value) -> Result<()> {
        self.doc.update(|data| {
            data.entry(id.clone()).or_default().insert(file.to_string(), value);
        })
    }

    pub fn get(&self, id: &DatasetId, file: &str) -> Option<Value> {
        self.doc.read(|data| data.get(id)?.get(file).cloned())
    }

    pub fn for_dataset(&self, id: &DatasetId) -> IndexMap<String, Value> {
        self.doc.read(|data| data.get(id).cloned().unwrap_or_default())
    }

    pub fn remove_dataset(&self, id: &DatasetId) -> Result<()> {
        self.doc.update(|data| {
            data.shift_remove(id);
        })
    }
}
