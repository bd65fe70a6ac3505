use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::annotation::Annotation;
use crate::document::{read_json, JsonDocument};
use crate::error::{Error, PathContext, Result};

/// Annotations of one dataset, keyed by image file name.
pub type FolderAnnotations = IndexMap<String, Vec<Annotation>>;

/// The whole store, keyed by managed dataset path.
pub type StoreData = IndexMap<String, FolderAnnotations>;

/// Extensions tried, in order, when an image name is not found verbatim.
const FALLBACK_EXTENSIONS: [&str; 4] = ["jpeg", "jpg", "png", "gif"];

fn push_unique(list: &mut Vec<Annotation>, annotation: Annotation) -> bool {
    if list.contains(&annotation) {
        return false;
    }
    list.push(annotation);
    true
}

fn dedup(list: &mut Vec<Annotation>) -> usize {
    let before = list.len();
    let mut kept: Vec<Annotation> = Vec::with_capacity(before);
    for annotation in list.drain(..) {
        push_unique(&mut kept, annotation);
    }
    *list = kept;
    before - list.len()
}

/// Name variants with the same stem and another common image extension.
pub(crate) fn name_variants(name: &str) -> impl Iterator<Item = String> + '_ {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name);
    FALLBACK_EXTENSIONS
        .iter()
        .map(move |ext| format!("{stem}.{ext}"))
        .filter(move |candidate| candidate != name)
}

/// `annotations.json`: managed dataset path → image name → annotations.
///
/// Every write path drops annotations equal to one already stored for the
/// same image.
pub struct AnnotationStore {
    doc: JsonDocument<StoreData>,
}

impl AnnotationStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self { doc: JsonDocument::open(path)? })
    }

    /// Loads a store file without creating it. Used by batch jobs that need
    /// the store to already exist.
    pub fn read_snapshot(path: &Path) -> Result<StoreData> {
        match read_json(path) {
            Err(Error::Path { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Err(Error::MissingStore(path.to_path_buf()))
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        self.doc.path()
    }

    pub fn reload(&self) -> Result<()> {
        self.doc.reload()
    }

    pub fn snapshot(&self) -> StoreData {
        self.doc.snapshot()
    }

    /// Annotations of `file`, or of the same image under another common
    /// extension. Missing keys give an empty list.
    pub fn get_annotations(&self, folder: &str, file: &str) -> Vec<Annotation> {
        self.doc.read(|data| {
            let Some(files) = data.get(folder) else {
                return Vec::new();
            };
            if let Some(list) = files.get(file) {
                return list.clone();
            }
            name_variants(file)
                .find_map(|candidate| files.get(&candidate).cloned())
                .unwrap_or_default()
        })
    }

    /// Returns `false` when an equal annotation was already stored.
    pub fn add_annotation_to_file(
        &self,
        folder: &str,
        file: &str,
        annotation: Annotation,
    ) -> Result<bool> {
        annotation.validate()?;
        self.doc.update(|data| {
            let list = data
                .entry(folder.to_string())
                .or_default()
                .entry(file.to_string())
                .or_default();
            push_unique(list, annotation)
        })
    }

    /// Appends every annotation not already present; returns how many were
    /// added.
    pub fn add(&self, folder: &str, file: &str, annotations: Vec<Annotation>) -> Result<usize> {
        for annotation in &annotations {
            annotation.validate()?;
        }
        self.doc.update(|data| {
            let list = data
                .entry(folder.to_string())
                .or_default()
                .entry(file.to_string())
                .or_default();
            annotations
                .into_iter()
                .filter(|annotation| push_unique(list, annotation.clone()))
                .count()
        })
    }

    /// Removes every annotation equal to `annotation`; returns how many.
    pub fn delete_annotation_from_file(
        &self,
        folder: &str,
        file: &str,
        annotation: &Annotation,
    ) -> Result<usize> {
        self.doc.update(|data| {
            let Some(list) = data.get_mut(folder).and_then(|files| files.get_mut(file)) else {
                return 0;
            };
            let before = list.len();
            list.retain(|a| a != annotation);
            before - list.len()
        })
    }

    pub fn delete_file(&self, folder: &str, file: &str) -> Result<bool> {
        self.doc.update(|data| {
            data.get_mut(folder)
                .and_then(|files| files.shift_remove(file))
                .is_some()
        })
    }

    /// Overwrites the list stored for `file`.
    pub fn replace(&self, folder: &str, file: &str, annotations: Vec<Annotation>) -> Result<()> {
        for annotation in &annotations {
            annotation.validate()?;
        }
        self.doc.update(|data| {
            let files = data.entry(folder.to_string()).or_default();
            let mut list = Vec::with_capacity(annotations.len());
            for annotation in annotations {
                push_unique(&mut list, annotation);
            }
            files.insert(file.to_string(), list);
        })
    }

    /// Overwrites the annotations of `image` and makes sure a copy of the
    /// image sits in `<folder>/images/`.
    pub fn save_annotations(
        &self,
        folder: &str,
        image: &Path,
        annotations: Vec<Annotation>,
    ) -> Result<()> {
        let file = image
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("{} has no file name", image.display())))?;

        for annotation in &annotations {
            annotation.validate()?;
        }

        // The list is only written once the image copy exists.
        let images_dir = Path::new(folder).join("images");
        let cached = images_dir.join(file);
        if !cached.exists() {
            fs::create_dir_all(&images_dir).at(&images_dir)?;
            fs::copy(image, &cached).at(image)?;
            tracing::debug!("cached {} in {}", file, images_dir.display());
        }

        self.replace(folder, file, annotations)
    }

    pub fn folder(&self, folder: &str) -> FolderAnnotations {
        self.doc.read(|data| data.get(folder).cloned().unwrap_or_default())
    }

    pub fn folders(&self) -> Vec<String> {
        self.doc.read(|data| data.keys().cloned().collect())
    }

    pub fn contains_folder(&self, folder: &str) -> bool {
        self.doc.read(|data| data.contains_key(folder))
    }

    pub fn set_folder(&self, folder: &str, mut files: FolderAnnotations) -> Result<()> {
        files.values_mut().for_each(|list| {
            dedup(list);
        });
        self.doc.update(|data| {
            data.insert(folder.to_string(), files);
        })
    }

    pub fn remove_folder(&self, folder: &str) -> Result<Option<FolderAnnotations>> {
        self.doc.update(|data| data.shift_remove(folder))
    }

    /// Unions `files` into `dest`. A new `dest` takes `files` as they are;
    /// otherwise each file name in `files` replaces the one in `dest`.
    pub fn merge_folder(&self, dest: &str, files: FolderAnnotations) -> Result<()> {
        self.doc.update(|data| {
            let target = data.entry(dest.to_string()).or_default();
            for (file, mut list) in files {
                dedup(&mut list);
                target.insert(file, list);
            }
        })
    }

    /// Collapses duplicate annotations left by older versions. Returns the
    /// number removed.
    pub fn dedup_all(&self) -> Result<usize> {
        self.doc.update(|data| {
            data.values_mut()
                .flat_map(|files| files.values_mut())
                .map(dedup)
                .sum()
        })
    }

    /// What [`AnnotationStore::dedup_all`] would remove, without writing.
    pub fn count_duplicates(&self) -> usize {
        let mut data = self.snapshot();
        data.values_mut()
            .flat_map(|files| files.values_mut())
            .map(dedup)
            .sum()
    }

    pub fn count(&self) -> usize {
        self.doc.read(|data| {
            data.values()
                .flat_map(|files| files.values())
                .map(Vec::len)
                .sum()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOLDER: &str = "/data/annotated_dataset/1a2b3c4d";

    fn ann(x: f64, text: &str) -> Annotation {
        Annotation::new([x, x, x + 10.0, x + 10.0], text, 1.0).unwrap()
    }

    fn open() -> (tempfile::TempDir, AnnotationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::open(dir.path().join("annotations.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_keys_give_empty_lists() {
        let (_dir, store) = open();
        assert!(store.get_annotations("nope", "img.jpg").is_empty());
        store.add_annotation_to_file(FOLDER, "a.jpg", ann(1.0, "cat")).unwrap();
        assert!(store.get_annotations(FOLDER, "b.jpg").is_empty());
    }

    #[test]
    fn add_skips_equal_values() {
        let (_dir, store) = open();
        assert!(store.add_annotation_to_file(FOLDER, "a.jpg", ann(1.0, "cat")).unwrap());
        assert!(!store.add_annotation_to_file(FOLDER, "a.jpg", ann(1.0, "cat")).unwrap());
        let added = store
            .add(FOLDER, "a.jpg", vec![ann(1.0, "cat"), ann(2.0, "dog"), ann(2.0, "dog")])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.get_annotations(FOLDER, "a.jpg"), vec![ann(1.0, "cat"), ann(2.0, "dog")]);
    }

    #[test]
    fn delete_removes_all_equal_values_only() {
        let (dir, store) = open();
        store.add(FOLDER, "a.jpg", vec![ann(1.0, "cat"), ann(2.0, "dog"), ann(3.0, "cat")]).unwrap();

        // A legacy document may still hold duplicates.
        let path = dir.path().join("annotations.json");
        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw[FOLDER]["a.jpg"].as_array_mut().unwrap().push(ann(1.0, "cat").to_value());
        fs::write(&path, raw.to_string()).unwrap();
        store.reload().unwrap();

        let removed = store.delete_annotation_from_file(FOLDER, "a.jpg", &ann(1.0, "cat")).unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.get_annotations(FOLDER, "a.jpg"), vec![ann(2.0, "dog"), ann(3.0, "cat")]);
        assert_eq!(store.delete_annotation_from_file(FOLDER, "x.jpg", &ann(1.0, "cat")).unwrap(), 0);
    }

    #[test]
    fn replace_overwrites_the_list() {
        let (_dir, store) = open();
        store.add(FOLDER, "a.jpg", vec![ann(1.0, "cat")]).unwrap();
        store.replace(FOLDER, "a.jpg", vec![ann(5.0, "owl"), ann(5.0, "owl")]).unwrap();
        assert_eq!(store.get_annotations(FOLDER, "a.jpg"), vec![ann(5.0, "owl")]);

        assert!(store.delete_file(FOLDER, "a.jpg").unwrap());
        assert!(!store.delete_file(FOLDER, "a.jpg").unwrap());
        assert!(store.folder(FOLDER).is_empty());
    }

    #[test]
    fn lookup_falls_back_to_other_extensions() {
        let (_dir, store) = open();
        store.add(FOLDER, "photo.jpeg", vec![ann(1.0, "cat")]).unwrap();
        assert_eq!(store.get_annotations(FOLDER, "photo.jpg"), vec![ann(1.0, "cat")]);
        assert_eq!(store.get_annotations(FOLDER, "photo.png"), vec![ann(1.0, "cat")]);
        assert!(store.get_annotations(FOLDER, "other.jpg").is_empty());
    }

    #[test]
    fn reopening_yields_the_same_mapping() {
        let (dir, store) = open();
        store.add(FOLDER, "b.jpg", vec![ann(1.0, "cat")]).unwrap();
        store.add(FOLDER, "a.jpg", vec![ann(2.0, "dog")]).unwrap();
        store.add("/other", "c.png", vec![ann(3.0, "owl")]).unwrap();

        let reopened = AnnotationStore::open(dir.path().join("annotations.json")).unwrap();
        let snapshot = reopened.snapshot();
        assert_eq!(snapshot, store.snapshot());
        let order: Vec<_> = snapshot[FOLDER].keys().cloned().collect();
        assert_eq!(order, ["b.jpg", "a.jpg"]);
    }

    #[test]
    fn invalid_annotations_are_not_written() {
        let (_dir, store) = open();
        let bad = Annotation { coords: [0.0; 4], text: "".into(), ratio: 1.0 };
        assert!(store.add_annotation_to_file(FOLDER, "a.jpg", bad).is_err());
        assert!(!store.contains_folder(FOLDER));
    }

    #[test]
    fn save_annotations_caches_the_image() {
        let (dir, store) = open();
        let folder = dir.path().join("managed");
        let image = dir.path().join("shot.png");
        fs::write(&image, b"png bytes").unwrap();
        let folder_key = folder.to_string_lossy().into_owned();

        store.save_annotations(&folder_key, &image, vec![ann(1.0, "cat")]).unwrap();

        assert_eq!(fs::read(folder.join("images/shot.png")).unwrap(), b"png bytes");
        assert_eq!(store.get_annotations(&folder_key, "shot.png").len(), 1);
    }

    #[test]
    fn save_annotations_with_unreadable_image_keeps_the_old_list() {
        let (dir, store) = open();
        let folder_key = dir.path().join("managed").to_string_lossy().into_owned();
        store.add(&folder_key, "gone.png", vec![ann(1.0, "cat")]).unwrap();

        let result = store.save_annotations(&folder_key, &dir.path().join("gone.png"), vec![ann(7.0, "owl")]);

        assert!(matches!(result, Err(Error::Path { .. })));
        assert_eq!(store.get_annotations(&folder_key, "gone.png"), vec![ann(1.0, "cat")]);
        let reopened = AnnotationStore::open(store.path()).unwrap();
        assert_eq!(reopened.get_annotations(&folder_key, "gone.png"), vec![ann(1.0, "cat")]);
        assert!(!dir.path().join("managed/images/gone.png").exists());
    }

    #[test]
    fn merge_folder_is_a_union_with_last_writer_per_file() {
        let (_dir, store) = open();
        let a: FolderAnnotations = [("img1.jpg".to_string(), vec![ann(1.0, "cat")])].into();
        let b: FolderAnnotations = [
            ("img2.jpg".to_string(), vec![ann(2.0, "dog")]),
            ("img1.jpg".to_string(), vec![ann(9.0, "owl")]),
        ]
        .into();

        store.merge_folder("/merged", a).unwrap();
        store.merge_folder("/merged", b).unwrap();

        let merged = store.folder("/merged");
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["img1.jpg"], vec![ann(9.0, "owl")]);
        assert_eq!(merged["img2.jpg"], vec![ann(2.0, "dog")]);
    }

    #[test]
    fn dedup_all_collapses_legacy_duplicates() {
        let (dir, store) = open();
        let path = dir.path().join("annotations.json");
        let cat = ann(1.0, "cat").to_value();
        let dog = ann(2.0, "dog").to_value();
        let raw = serde_json::json!({ FOLDER: { "a.jpg": [cat, dog, cat], "b.jpg": [dog, dog] } });
        fs::write(&path, raw.to_string()).unwrap();
        store.reload().unwrap();

        assert_eq!(store.count_duplicates(), 2);
        assert_eq!(store.count(), 5);
        assert_eq!(store.dedup_all().unwrap(), 2);
        assert_eq!(store.count(), 3);
        assert_eq!(store.dedup_all().unwrap(), 0);
    }

    #[test]
    fn structural_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotations.json");
        fs::write(&path, r#"{"/ds": ["not", "an", "object"]}"#).unwrap();
        assert!(matches!(AnnotationStore::open(&path), Err(Error::Malformed { .. })));
    }

    #[test]
    fn read_snapshot_requires_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotations.json");
        assert!(matches!(AnnotationStore::read_snapshot(&path), Err(Error::MissingStore(_))));
    }
}
