use std::collections::hash_map::RandomState;
use std::fs;
use std::hash::{BuildHasher, Hasher};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{PathContext, Result};

/// Extensions recognised as images, lowercase and without the dot.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "bmp"];

/// Scratch file next to its final destination. Removed on drop unless it was
/// persisted.
pub(crate) struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    pub(crate) fn new(dir: impl AsRef<Path>) -> Result<Self, io::Error> {
        let unique = RandomState::new().build_hasher().finish();
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(".{unique:016x}.tmp"));
        Ok(Self { path, persisted: false })
    }

    pub(crate) fn persist(mut self, target: impl AsRef<Path>) -> Result<(), io::Error> {
        fs::rename(&self.path, target)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(..) => tracing::debug!("deleted {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("deleting {} error: {:?}", self.path.display(), e),
        }
    }
}

impl Deref for TempFile {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

/// Replaces `path` with `contents` so readers see either the old or the new
/// file, never a partial one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let temp = TempFile::new(dir).at(dir)?;
    fs::write(&*temp, contents).at(&*temp)?;
    temp.persist(path).at(path)
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<_> = fs::read_dir(dir)
        .at(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    images.sort();
    Ok(images)
}

/// Recursively copies `src` into `dst`. Files already present in `dst` are
/// left alone, so the first copy of a name wins. Returns the number of files
/// written.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).at(&target)?;
        } else if !target.exists() {
            fs::copy(entry.path(), &target).at(entry.path())?;
            copied += 1;
        }
    }
    Ok(copied)
}
