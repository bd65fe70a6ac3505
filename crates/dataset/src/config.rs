use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PathContext, Result};

pub const DATA_DIR_ENV: &str = "ANNOTATOR_DATA_DIR";
const APP_DIR_NAME: &str = "ImageAnnotationTool";

/// What a dataset identity hash is computed over.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum IdentityMode {
    /// The canonical absolute path of the source folder.
    #[default]
    CanonicalPath,
    /// Only the leaf folder name. Two folders with the same name share an
    /// identity; kept for data directories created that way.
    FolderName,
}

/// On-disk locations of every document the application owns.
#[derive(Debug, Clone)]
pub struct Layout {
    data_dir: PathBuf,
}

impl Layout {
    /// Creates `data_dir` if needed and resolves it to its canonical path.
    /// Store keys embed this path, so every spelling of the same directory
    /// must yield the same one.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).at(data_dir)?;
        let data_dir = data_dir.canonicalize().at(data_dir)?;
        Ok(Self { data_dir })
    }

    /// `$ANNOTATOR_DATA_DIR`, falling back to the platform data directory.
    pub fn from_env() -> Result<Self> {
        match env::var_os(DATA_DIR_ENV) {
            Some(dir) => Self::new(dir),
            None => Self::new(default_data_dir()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn managed_root(&self) -> PathBuf {
        self.data_dir.join("annotated_dataset")
    }

    pub fn annotations(&self) -> PathBuf {
        self.managed_root().join("annotations.json")
    }

    pub fn origins(&self) -> PathBuf {
        self.managed_root().join("hash_to_name.json")
    }

    pub fn display_names(&self) -> PathBuf {
        self.managed_root().join("dataset_names.json")
    }

    pub fn image_metadata(&self) -> PathBuf {
        self.managed_root().join("blazons.json")
    }

    pub fn dictionary(&self) -> PathBuf {
        self.data_dir.join("annotation_dictionary.json")
    }

    pub fn default_export_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }
}

fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        if let Some(home) = dirs::home_dir() {
            return home.join(".imageannotationtool");
        }
    }

    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(APP_DIR_NAME))
}
