//! The set of managed datasets and every operation that touches more than
//! one document at a time: importing, merging, deleting.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Local;
use image::{DynamicImage, ImageFormat};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::annotation::Annotation;
use crate::config::{IdentityMode, Layout};
use crate::dictionary::LabelDictionary;
use crate::error::{Error, PathContext, Result};
use crate::export::{ExportOptions, ExportRequest};
use crate::registry::{DatasetId, DatasetRegistry, ImageMetadata};
use crate::store::AnnotationStore;
use crate::utils::{copy_tree, list_images};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDataset {
    pub id: DatasetId,
    pub path: PathBuf,
}

impl ManagedDataset {
    /// Key of this dataset in the annotation store.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct DatasetSummary {
    pub id: DatasetId,
    pub display_name: String,
    pub origin: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DatasetStats {
    pub images: usize,
    pub annotated: usize,
}

#[derive(Debug)]
pub struct MergeReport {
    pub dataset: ManagedDataset,
    pub merged: usize,
    /// Inputs that no longer exist.
    pub skipped: usize,
    pub failed: usize,
    pub files_copied: usize,
}

#[derive(Debug, Default)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: Vec<(DatasetId, String)>,
}

#[derive(Debug)]
pub struct ImportReport {
    pub dataset: ManagedDataset,
    pub saved: usize,
    pub failed: usize,
}

/// An image handed over by a remote source, with whatever record the source
/// keeps about it.
pub struct RemoteImage {
    pub name: String,
    pub image: DynamicImage,
    pub metadata: Value,
}

pub struct Library {
    layout: Layout,
    mode: IdentityMode,
    store: AnnotationStore,
    registry: DatasetRegistry,
    metadata: ImageMetadata,
    dictionary: LabelDictionary,
    // Serializes operations spanning several documents and folders.
    lock: Mutex<()>,
}

impl Library {
    pub fn open(layout: Layout, mode: IdentityMode) -> Result<Self> {
        let root = layout.managed_root();
        fs::create_dir_all(&root).at(&root)?;

        let library = Self {
            store: AnnotationStore::open(layout.annotations())?,
            registry: DatasetRegistry::open(layout.origins(), layout.display_names())?,
            metadata: ImageMetadata::open(layout.image_metadata())?,
            dictionary: LabelDictionary::open(layout.dictionary())?,
            layout,
            mode,
            lock: Mutex::new(()),
        };
        tracing::info!("library opened at {}", root.display());
        Ok(library)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn dictionary(&self) -> &LabelDictionary {
        &self.dictionary
    }

    pub fn managed_path(&self, id: &DatasetId) -> PathBuf {
        self.layout.managed_root().join(id.as_str())
    }

    pub fn folder_key(&self, id: &DatasetId) -> String {
        self.managed_path(id).to_string_lossy().into_owned()
    }

    fn managed(&self, id: DatasetId) -> ManagedDataset {
        let path = self.managed_path(&id);
        ManagedDataset { id, path }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identity of a dataset that has no source folder on disk, named as if
    /// it lived in the managed root.
    fn synthetic_id(&self, name: &str) -> DatasetId {
        match self.mode {
            IdentityMode::CanonicalPath => {
                DatasetId::for_name(&self.layout.managed_root().join(name).to_string_lossy())
            }
            IdentityMode::FolderName => DatasetId::for_folder_name(name),
        }
    }

    /// Copies `source` into the managed root once. Later calls for the same
    /// source return the existing copy. A missing source gives `None`.
    pub fn materialize(&self, source: &Path) -> Result<Option<ManagedDataset>> {
        if !source.exists() {
            tracing::debug!("{} does not exist, nothing to import", source.display());
            return Ok(None);
        }

        let id = DatasetId::for_source(source, self.mode)?;
        let dataset = self.managed(id);
        let _guard = self.guard();

        if self.registry.contains(&dataset.id) {
            tracing::debug!("{} already imported as {}", source.display(), dataset.id);
            return Ok(Some(dataset));
        }

        fs::create_dir_all(&dataset.path).at(&dataset.path)?;
        let copied = copy_tree(source, &dataset.path)?;
        let origin = source.canonicalize().at(source)?;
        self.registry.record_origin(&dataset.id, &origin.to_string_lossy())?;

        tracing::info!("imported {} as {} ({} files)", origin.display(), dataset.id, copied);
        Ok(Some(dataset))
    }

    /// [`Library::materialize`] for a folder picked by the user, which has to
    /// contain images.
    pub fn import_folder(&self, source: &Path) -> Result<ManagedDataset> {
        if !source.is_dir() {
            return Err(Error::NotADirectory(source.to_path_buf()));
        }
        if list_images(source)?.is_empty() {
            return Err(Error::NoImages(source.to_path_buf()));
        }

        self.materialize(source)?
            .ok_or_else(|| Error::NotADirectory(source.to_path_buf()))
    }

    /// Saves images received from a remote source as a dataset named
    /// `<group>_drive`, or `<group>_drive_copy` if that one exists already.
    pub fn import_images(&self, group: &str, images: Vec<RemoteImage>) -> Result<ImportReport> {
        let group = group.trim();
        if group.is_empty() {
            return Err(Error::InvalidInput("import group has no name".into()));
        }

        let _guard = self.guard();
        let mut name = format!("{group}_drive");
        let mut id = self.synthetic_id(&name);
        if self.registry.contains(&id) {
            name.push_str("_copy");
            id = self.synthetic_id(&name);
        }

        let dataset = self.managed(id);
        fs::create_dir_all(&dataset.path).at(&dataset.path)?;
        let origin = self.layout.managed_root().join(&name);
        self.registry.record_origin(&dataset.id, &origin.to_string_lossy())?;

        let mut saved = 0;
        let mut failed = 0;
        for remote in images {
            let Some(file) = remote_file_name(&remote.name) else {
                tracing::warn!("refusing remote image name {:?}", remote.name);
                failed += 1;
                continue;
            };
            let target = dataset.path.join(&file);

            match remote.image.to_rgb8().save_with_format(&target, ImageFormat::Jpeg) {
                Ok(()) => {
                    self.metadata.set(&dataset.id, &file, remote.metadata)?;
                    saved += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to save {}: {}", target.display(), e);
                    failed += 1;
                }
            }
        }

        tracing::info!("imported {} images into {} ({})", saved, dataset.id, name);
        Ok(ImportReport { dataset, saved, failed })
    }

    /// Combines `ids` into a new dataset `merged_<timestamp>`. Folder trees
    /// are copied in order, the first copy of a file name wins; annotations
    /// are unioned per image, the last dataset wins.
    pub fn merge(&self, ids: &[DatasetId]) -> Result<MergeReport> {
        if ids.is_empty() {
            return Err(Error::InvalidInput("nothing to merge".into()));
        }

        let _guard = self.guard();
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut name = format!("merged_{stamp}");
        let mut id = self.synthetic_id(&name);
        let mut n = 2;
        while self.registry.contains(&id) {
            name = format!("merged_{stamp}_{n}");
            id = self.synthetic_id(&name);
            n += 1;
        }

        let dataset = self.managed(id);
        fs::create_dir_all(&dataset.path).at(&dataset.path)?;
        let origin = self.layout.managed_root().join(&name);
        self.registry.record_origin(&dataset.id, &origin.to_string_lossy())?;

        let dest_key = dataset.key();
        let mut report = MergeReport { dataset, merged: 0, skipped: 0, failed: 0, files_copied: 0 };

        for source in ids {
            let path = self.managed_path(source);
            if !path.is_dir() {
                tracing::warn!("dataset {} is gone, skipping", source);
                report.skipped += 1;
                continue;
            }

            let result = copy_tree(&path, &report.dataset.path).and_then(|copied| {
                let files = self.store.folder(&self.folder_key(source));
                self.store.merge_folder(&dest_key, files)?;
                Ok(copied)
            });
            match result {
                Ok(copied) => {
                    report.files_copied += copied;
                    report.merged += 1;
                }
                Err(e) => {
                    tracing::error!("failed to merge {}: {}", source, e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            "merged {} datasets into {} ({} skipped, {} failed)",
            report.merged,
            report.dataset.id,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Removes each dataset's folder, annotations, registry entries and image
    /// metadata. Stops between datasets once `cancel` fires.
    pub fn delete(
        &self,
        ids: &[DatasetId],
        cancel: Option<&CancellationToken>,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<DeleteReport> {
        let _guard = self.guard();
        let mut report = DeleteReport::default();

        for (i, id) in ids.iter().enumerate() {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                tracing::info!("deletion cancelled after {} of {} datasets", i, ids.len());
                return Err(Error::Cancelled);
            }

            match self.delete_one(id) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    tracing::error!("failed to delete {}: {}", id, e);
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
            progress(i + 1, ids.len());
        }

        Ok(report)
    }

    fn delete_one(&self, id: &DatasetId) -> Result<()> {
        let path = self.managed_path(id);
        if path.exists() {
            fs::remove_dir_all(&path).at(&path)?;
        }
        self.store.remove_folder(&self.folder_key(id))?;
        self.registry.remove(id)?;
        self.metadata.remove_dataset(id)?;
        tracing::info!("deleted dataset {}", id);
        Ok(())
    }

    /// Changes only the name shown to the user.
    pub fn rename(&self, id: &DatasetId, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("dataset name is empty".into()));
        }
        self.registry.rename(id, name)
    }

    /// Every folder in the managed root, sorted by display name.
    pub fn datasets(&self) -> Result<Vec<DatasetSummary>> {
        let root = self.layout.managed_root();
        let mut datasets = Vec::new();

        for entry in fs::read_dir(&root).at(&root)? {
            let path = entry.at(&root)?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = DatasetId::from_managed_path(&path) else {
                continue;
            };
            datasets.push(DatasetSummary {
                display_name: self.registry.display_name(&id),
                origin: self.registry.origin(&id),
                id,
                path,
            });
        }

        datasets.sort_by(|a, b| a.display_name.cmp(&b.display_name).then_with(|| a.id.cmp(&b.id)));
        Ok(datasets)
    }

    pub fn stats(&self, id: &DatasetId) -> Result<DatasetStats> {
        let path = self.managed_path(id);
        if !path.is_dir() {
            return Err(Error::NotADirectory(path));
        }
        Ok(DatasetStats {
            images: list_images(&path)?.len(),
            annotated: self.store.folder(&self.folder_key(id)).len(),
        })
    }

    /// Stores a new box and counts its label for suggestions.
    pub fn annotate(&self, dataset: &DatasetId, file: &str, annotation: Annotation) -> Result<bool> {
        let text = annotation.text.clone();
        let added = self
            .store
            .add_annotation_to_file(&self.folder_key(dataset), file, annotation)?;
        if added {
            self.dictionary.add(&text)?;
        }
        Ok(added)
    }

    pub fn export_request(&self, ids: &[DatasetId], options: ExportOptions) -> ExportRequest {
        ExportRequest {
            annotations: self.layout.annotations(),
            images_root: self.layout.managed_root(),
            datasets: ids.iter().map(|id| id.to_string()).collect(),
            options,
        }
    }
}

/// `<name>.jpg`, unless the name is empty or could leave the dataset folder.
fn remote_file_name(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return None;
    }
    Some(format!("{name}.jpg"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn open(dir: &Path) -> Library {
        Library::open(Layout::new(dir.join("app")).unwrap(), IdentityMode::CanonicalPath).unwrap()
    }

    fn source(dir: &Path, name: &str, files: &[&str]) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(&path).unwrap();
        for file in files {
            fs::write(path.join(file), file.as_bytes()).unwrap();
        }
        path
    }

    fn ann(text: &str) -> Annotation {
        Annotation::new([1.0, 2.0, 30.0, 40.0], text, 1.0).unwrap()
    }

    #[test]
    fn materialize_copies_once() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let src = source(dir.path(), "photos", &["a.jpg", "b.png"]);

        let first = library.materialize(&src).unwrap().unwrap();
        assert!(first.path.join("a.jpg").is_file());

        fs::write(src.join("c.jpg"), b"late").unwrap();
        let second = library.materialize(&src).unwrap().unwrap();

        assert_eq!(first, second);
        assert!(!second.path.join("c.jpg").exists());
        assert_eq!(fs::read_dir(&second.path).unwrap().count(), 2);
        assert_eq!(
            library.registry().origin(&first.id),
            Some(src.canonicalize().unwrap().to_string_lossy().into_owned())
        );
    }

    #[test]
    fn materialize_missing_source_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        assert!(library.materialize(&dir.path().join("nope")).unwrap().is_none());
        assert!(library.registry().ids().is_empty());
    }

    #[test]
    fn import_folder_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let empty = source(dir.path(), "empty", &["notes.txt"]);
        let file = dir.path().join("file.jpg");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(library.import_folder(&empty), Err(Error::NoImages(_))));
        assert!(matches!(library.import_folder(&file), Err(Error::NotADirectory(_))));
        assert!(library.registry().ids().is_empty());
    }

    #[test]
    fn merge_unions_folders_and_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let a = library.import_folder(&source(dir.path(), "a", &["img1.jpg"])).unwrap();
        let b = library.import_folder(&source(dir.path(), "b", &["img2.jpg"])).unwrap();
        library.annotate(&a.id, "img1.jpg", ann("cat")).unwrap();
        library.annotate(&b.id, "img2.jpg", ann("dog")).unwrap();

        let gone = DatasetId::from("deadbeef");
        let report = library.merge(&[a.id.clone(), gone, b.id.clone()]).unwrap();

        assert_eq!((report.merged, report.skipped, report.failed), (2, 1, 0));
        let merged = library.store().folder(&report.dataset.key());
        assert_eq!(merged["img1.jpg"], vec![ann("cat")]);
        assert_eq!(merged["img2.jpg"], vec![ann("dog")]);
        assert!(report.dataset.path.join("img1.jpg").is_file());
        assert!(report.dataset.path.join("img2.jpg").is_file());
        assert!(library
            .registry()
            .display_name(&report.dataset.id)
            .starts_with("merged_"));
    }

    #[test]
    fn delete_purges_every_document() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let ds = library.import_folder(&source(dir.path(), "a", &["img1.jpg"])).unwrap();
        library.annotate(&ds.id, "img1.jpg", ann("cat")).unwrap();
        library.metadata().set(&ds.id, "img1.jpg", json!("argent")).unwrap();

        let mut calls = Vec::new();
        let report = library.delete(&[ds.id.clone()], None, |done, total| calls.push((done, total))).unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(calls, [(1, 1)]);
        assert!(!ds.path.exists());
        assert!(!library.store().contains_folder(&ds.key()));
        assert!(!library.registry().contains(&ds.id));
        assert!(library.metadata().for_dataset(&ds.id).is_empty());

        // Importing again after deletion copies afresh.
        let again = library.import_folder(&dir.path().join("a")).unwrap();
        assert!(again.path.join("img1.jpg").is_file());
    }

    #[test]
    fn delete_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let ds = library.import_folder(&source(dir.path(), "a", &["img1.jpg"])).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = library.delete(&[ds.id.clone()], Some(&token), |_, _| {});
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(ds.path.exists());
    }

    #[test]
    fn rename_keeps_store_keys() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let ds = library.import_folder(&source(dir.path(), "a", &["img1.jpg", "img2.jpg"])).unwrap();
        library.annotate(&ds.id, "img1.jpg", ann("cat")).unwrap();

        library.rename(&ds.id, "  Cats  ").unwrap();
        assert!(library.rename(&ds.id, " ").is_err());

        let summaries = library.datasets().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].display_name, "Cats");
        assert!(library.store().contains_folder(&ds.key()));
        assert_eq!(library.stats(&ds.id).unwrap(), DatasetStats { images: 2, annotated: 1 });
    }

    #[test]
    fn remote_import_uses_a_copy_for_a_known_group() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let images = || {
            vec![RemoteImage {
                name: "lion".into(),
                image: DynamicImage::new_rgba8(8, 8),
                metadata: json!("Or, a lion rampant"),
            }]
        };

        let first = library.import_images("north", images()).unwrap();
        let second = library.import_images("north", images()).unwrap();

        assert_eq!((first.saved, first.failed), (1, 0));
        assert_ne!(first.dataset.id, second.dataset.id);
        assert!(first.dataset.path.join("lion.jpg").is_file());
        assert_eq!(library.registry().display_name(&second.dataset.id), "north_drive_copy");
        assert_eq!(
            library.metadata().get(&first.dataset.id, "lion.jpg"),
            Some(json!("Or, a lion rampant"))
        );
    }

    #[test]
    fn remote_import_counts_images_it_cannot_save() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let id = library.synthetic_id("north_drive");
        // A directory in the way makes the save fail.
        fs::create_dir_all(library.managed_path(&id).join("blocked.jpg")).unwrap();

        let image = |name: &str| RemoteImage {
            name: name.into(),
            image: DynamicImage::new_rgb8(4, 4),
            metadata: json!(name),
        };
        let report = library
            .import_images("north", vec![image("lion"), image("blocked"), image("../escape"), image("..")])
            .unwrap();

        assert_eq!(report.dataset.id, id);
        assert_eq!((report.saved, report.failed), (1, 3));
        assert!(report.dataset.path.join("lion.jpg").is_file());
        assert!(!library.layout().managed_root().join("escape.jpg").exists());
        assert!(library.metadata().get(&id, "blocked.jpg").is_none());
    }

    #[test]
    fn remote_file_names_stay_inside_the_dataset() {
        assert_eq!(remote_file_name("lion").as_deref(), Some("lion.jpg"));
        assert_eq!(remote_file_name(" lion ").as_deref(), Some("lion.jpg"));
        assert_eq!(remote_file_name("../x"), None);
        assert_eq!(remote_file_name("a/b"), None);
        assert_eq!(remote_file_name("a\\b"), None);
        assert_eq!(remote_file_name(".."), None);
        assert_eq!(remote_file_name("  "), None);
    }

    #[test]
    fn annotate_feeds_the_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let library = open(dir.path());
        let id = DatasetId::from("0000aaaa");
        assert!(library.annotate(&id, "x.jpg", ann("owl")).unwrap());
        assert!(!library.annotate(&id, "x.jpg", ann("owl")).unwrap());
        assert_eq!(library.dictionary().count("owl"), 1);
    }
}
