//! Conversion of stored annotations into a YOLO training layout:
//!
//! ```text
//! <output>/train/images  <output>/train/labels
//! <output>/val/images    <output>/val/labels
//! <output>/test/images   <output>/test/labels   (test runs only)
//! <output>/data.yaml
//! ```
//!
//! An export is one pass through collecting, splitting, writing and
//! finalizing. Nothing is resumable; a failed export is simply run again.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use math::{YoloBox, YoloLabel};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::annotation::Annotation;
use crate::error::{Error, PathContext, Result};
use crate::store::{name_variants, AnnotationStore};

pub const MANIFEST_FILE: &str = "data.yaml";

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ExportMode {
    /// Fresh train/val split and a new manifest.
    #[default]
    Train,
    /// Everything goes to `test`; the manifest only gains a `test` entry.
    Test,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LinkMode {
    #[default]
    Copy,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub output_dir: PathBuf,
    /// Explicit classes, in index order. Labels outside the list are left
    /// out of the label files. `None` derives a sorted list from the data.
    pub class_names: Option<Vec<String>>,
    pub train_ratio: f64,
    pub seed: u64,
    pub mode: ExportMode,
    pub link: LinkMode,
    /// Appended to stored image names that have no extension.
    pub default_extension: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            class_names: None,
            train_ratio: 0.8,
            seed: 42,
            mode: ExportMode::Train,
            link: LinkMode::Copy,
            default_extension: ".jpg".to_string(),
        }
    }
}

/// Everything an export reads: the store file, the directory holding the
/// managed datasets, and which of them to include (by folder name).
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub annotations: PathBuf,
    pub images_root: PathBuf,
    pub datasets: Vec<String>,
    pub options: ExportOptions,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExportStage {
    Collecting,
    Splitting,
    Writing,
    Finalizing,
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportStage::Collecting => "collecting",
            ExportStage::Splitting => "splitting",
            ExportStage::Writing => "writing",
            ExportStage::Finalizing => "finalizing",
        })
    }
}

/// `data.yaml` as read by the trainer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    pub nc: usize,
    pub names: Vec<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).at(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = fs::File::options()
            .truncate(true)
            .create(true)
            .write(true)
            .open(path)
            .at(path)?;

        let mut writer = BufWriter::new(file);
        serde_yaml::to_writer(&mut writer, self)?;
        writer.flush().at(path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub train: usize,
    pub val: usize,
    pub test: usize,
    /// Store entries whose image file was not found.
    pub missing: usize,
    /// Images that could not be read or written.
    pub failed: usize,
    pub classes: Vec<String>,
    /// Boxes written per class index.
    pub class_counts: Vec<usize>,
    pub manifest: PathBuf,
}

impl ExportReport {
    fn count_mut(&mut self, split: Split) -> &mut usize {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }
}

#[derive(Debug)]
struct PoolItem {
    image: PathBuf,
    dataset: String,
    /// File name inside the split, unique across the whole export.
    target: String,
    annotations: Vec<Annotation>,
}

pub fn export(request: &ExportRequest) -> Result<ExportReport> {
    export_with(request, None, |_, _| {})
}

/// Runs an export, stopping between images once `cancel` fires and calling
/// `on_progress(done, total)` as images are written.
pub fn export_with(
    request: &ExportRequest,
    cancel: Option<&CancellationToken>,
    on_progress: impl Fn(usize, usize) + Sync,
) -> Result<ExportReport> {
    let options = &request.options;
    validate(options)?;

    let output_dir = absolute(&options.output_dir)?;
    let manifest_path = output_dir.join(MANIFEST_FILE);
    let previous = match options.mode {
        ExportMode::Test if manifest_path.exists() => Some(Manifest::load(&manifest_path)?),
        _ => None,
    };
    if let (Some(names), Some(manifest)) = (&options.class_names, &previous) {
        // Test labels must index the class list the manifest already names.
        if *names != manifest.names {
            return Err(Error::InvalidInput(format!(
                "classes {:?} differ from {:?} in {}",
                names,
                manifest.names,
                manifest_path.display()
            )));
        }
    }

    enter(ExportStage::Collecting);
    let data = AnnotationStore::read_snapshot(&request.annotations)?;
    let mut report = ExportReport::default();
    let mut pool = Vec::new();
    let mut seen_labels = BTreeSet::new();
    let mut used_stems = HashSet::new();

    for name in &request.datasets {
        let dir = request.images_root.join(name);
        let key = dir.to_string_lossy();
        let Some(files) = data.get(&*key) else {
            tracing::warn!("no annotations stored for dataset {}", dir.display());
            continue;
        };

        for (file, annotations) in files {
            seen_labels.extend(annotations.iter().map(|a| a.text.clone()));

            let file = with_extension(file, &options.default_extension);
            let Some(image) = locate_image(&dir, &file) else {
                tracing::warn!("image not found: {}", dir.join(&file).display());
                report.missing += 1;
                continue;
            };

            let target = unique_target(&image, name, &mut used_stems);
            pool.push(PoolItem {
                image,
                dataset: key.to_string(),
                target,
                annotations: annotations.clone(),
            });
        }
    }

    let classes = match (&options.class_names, &previous) {
        (Some(names), _) => names.clone(),
        (None, Some(manifest)) => manifest.names.clone(),
        (None, None) => {
            let names: Vec<String> = seen_labels.into_iter().collect();
            tracing::info!("derived classes: {:?}", names);
            names
        }
    };
    let filtered = options.class_names.is_some() || previous.is_some();
    tracing::info!("collected {} images, {} missing", pool.len(), report.missing);

    enter(ExportStage::Splitting);
    let splits = split(pool, options);

    enter(ExportStage::Writing);
    let total: usize = splits.iter().map(|(_, items)| items.len()).sum();
    let done = AtomicUsize::new(0);
    let class_counts: Vec<AtomicUsize> = classes.iter().map(|_| AtomicUsize::new(0)).collect();

    for (split, items) in &splits {
        let split_dir = output_dir.join(split.dir_name());
        if split_dir.exists() {
            fs::remove_dir_all(&split_dir).at(&split_dir)?;
        }
        let images_dir = split_dir.join("images");
        let labels_dir = split_dir.join("labels");
        fs::create_dir_all(&images_dir).at(&images_dir)?;
        fs::create_dir_all(&labels_dir).at(&labels_dir)?;

        let results: Vec<Result<()>> = items
            .par_iter()
            .map(|item| {
                if cancel.is_some_and(|token| token.is_cancelled()) {
                    return Err(Error::Cancelled);
                }

                let written = write_item(item, &images_dir, &labels_dir, &classes, options.link)?;
                for class_id in written {
                    class_counts[class_id].fetch_add(1, Ordering::Relaxed);
                }
                on_progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                Ok(())
            })
            .collect();

        for (item, result) in items.iter().zip(results) {
            match result {
                Ok(()) => *report.count_mut(*split) += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::error!("failed to export {} from {}: {}", item.image.display(), item.dataset, e);
                    report.failed += 1;
                }
            }
        }
    }

    enter(ExportStage::Finalizing);
    let images_path = |split: Split| {
        output_dir
            .join(split.dir_name())
            .join("images")
            .to_string_lossy()
            .into_owned()
    };
    let manifest = match options.mode {
        ExportMode::Train => Manifest {
            train: Some(images_path(Split::Train)),
            val: Some(images_path(Split::Val)),
            test: None,
            nc: classes.len(),
            names: classes.clone(),
        },
        ExportMode::Test => {
            let mut manifest = previous.unwrap_or_else(|| {
                tracing::warn!("{} not found, writing a test-only manifest", manifest_path.display());
                Manifest { nc: classes.len(), names: classes.clone(), ..Manifest::default() }
            });
            manifest.test = Some(images_path(Split::Test));
            manifest
        }
    };
    manifest.save(&manifest_path)?;

    if filtered {
        tracing::debug!("labels outside {:?} were left out", classes);
    }
    tracing::info!(
        "dataset prepared in {}: train {}, val {}, test {}, missing {}, failed {}",
        output_dir.display(),
        report.train,
        report.val,
        report.test,
        report.missing,
        report.failed,
    );

    report.class_counts = class_counts.into_iter().map(AtomicUsize::into_inner).collect();
    report.classes = classes;
    report.manifest = manifest_path;
    Ok(report)
}

fn enter(stage: ExportStage) {
    tracing::info!("export: {stage}");
}

fn validate(options: &ExportOptions) -> Result<()> {
    if !(0.0..=1.0).contains(&options.train_ratio) {
        return Err(Error::InvalidInput(format!(
            "train ratio {} is not within 0..=1",
            options.train_ratio
        )));
    }

    if let Some(names) = &options.class_names {
        if names.is_empty() {
            return Err(Error::InvalidInput("class list is empty".into()));
        }
        let mut unique = HashSet::new();
        if let Some(dup) = names.iter().find(|name| !unique.insert(name.as_str())) {
            return Err(Error::InvalidInput(format!("class {dup:?} is listed twice")));
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir().at(path)?.join(path))
}

fn with_extension(file: &str, default_extension: &str) -> String {
    if file.contains('.') {
        return file.to_string();
    }
    let ext = default_extension.trim_start_matches('.');
    format!("{file}.{ext}")
}

/// Finds `file` in `dir` or in its `images/` cache, trying other common image
/// extensions when the exact name is absent.
fn locate_image(dir: &Path, file: &str) -> Option<PathBuf> {
    let candidates: Vec<String> = std::iter::once(file.to_string())
        .chain(name_variants(file))
        .collect();

    [dir.to_path_buf(), dir.join("images")]
        .iter()
        .flat_map(|base| candidates.iter().map(move |name| base.join(name)))
        .find(|path| path.is_file())
}

/// Image and label files are matched by stem, so two datasets contributing
/// `img1.jpg` (or `img1.jpg` and `img1.png`) must not share a name.
fn unique_target(image: &Path, dataset: &str, used: &mut HashSet<String>) -> String {
    let file_name = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem_of(&file_name);

    if used.insert(stem.clone()) {
        return file_name;
    }

    let mut n = 1;
    loop {
        let candidate = if n == 1 {
            format!("{dataset}_{file_name}")
        } else {
            format!("{dataset}_{n}_{file_name}")
        };
        if used.insert(stem_of(&candidate)) {
            return candidate;
        }
        n += 1;
    }
}

fn stem_of(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Stable given the pool order and seed: shuffle with a seeded ChaCha8, then
/// cut at `round(ratio * n)`.
fn split(mut pool: Vec<PoolItem>, options: &ExportOptions) -> Vec<(Split, Vec<PoolItem>)> {
    match options.mode {
        ExportMode::Test => vec![(Split::Test, pool)],
        ExportMode::Train => {
            let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
            pool.shuffle(&mut rng);

            let train_size = ((options.train_ratio * pool.len() as f64).round() as usize).min(pool.len());
            let val = pool.split_off(train_size);
            vec![(Split::Train, pool), (Split::Val, val)]
        }
    }
}

/// Places the image and writes its label file. Returns the class index of
/// every box written.
fn write_item(
    item: &PoolItem,
    images_dir: &Path,
    labels_dir: &Path,
    classes: &[String],
    link: LinkMode,
) -> Result<Vec<usize>> {
    let (width, height) = image::image_dimensions(&item.image).map_err(|source| Error::Image {
        path: item.image.clone(),
        source,
    })?;

    place_image(&item.image, &images_dir.join(&item.target), link)?;

    let labels_path = labels_dir.join(&item.target).with_extension("txt");
    let file = fs::File::create(&labels_path).at(&labels_path)?;
    let mut writer = BufWriter::new(file);
    let mut written = Vec::new();

    for annotation in &item.annotations {
        let Some(class_id) = classes.iter().position(|name| *name == annotation.text) else {
            continue;
        };
        if let Err(e) = annotation.validate() {
            tracing::warn!("skipping box in {}: {}", item.image.display(), e);
            continue;
        }

        let bbox = YoloBox::from_pixels(annotation.original_bbox(), width, height);
        writeln!(writer, "{}", YoloLabel { class_id, bbox }).at(&labels_path)?;
        written.push(class_id);
    }

    writer.flush().at(&labels_path)?;
    Ok(written)
}

fn place_image(src: &Path, dst: &Path, link: LinkMode) -> Result<()> {
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst).at(dst)?;
    }

    match link {
        LinkMode::Copy => {
            fs::copy(src, dst).at(src)?;
        }
        LinkMode::Symlink => {
            let src = src.canonicalize().at(src)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&src, dst).at(dst)?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_file(&src, dst).at(dst)?;
        }
    }
    Ok(())
}
