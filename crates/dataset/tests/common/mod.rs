#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use dataset::Annotation;
use serde_json::{json, Value};

pub fn write_image(path: &Path, width: u32, height: u32) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    image::RgbImage::new(width, height).save(path).unwrap();
}

pub fn ann(coords: [f64; 4], text: &str, ratio: f64) -> Annotation {
    Annotation::new(coords, text, ratio).unwrap()
}

/// Writes `annotations.json` for `datasets` (folder name → store entry) kept
/// under `root`, and returns its path.
pub fn write_store(root: &Path, datasets: &[(&str, Value)]) -> PathBuf {
    let mut doc = serde_json::Map::new();
    for (name, files) in datasets {
        doc.insert(root.join(name).to_string_lossy().into_owned(), files.clone());
    }
    fs::create_dir_all(root).unwrap();
    let path = root.join("annotations.json");
    fs::write(&path, serde_json::to_vec_pretty(&Value::Object(doc)).unwrap()).unwrap();
    path
}

pub fn cat_box() -> Value {
    json!({"coords": [0, 0, 100, 100], "text": "cat", "ratio": 1.0})
}

pub fn read_labels(dir: &Path) -> Vec<(String, String)> {
    let mut labels: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, fs::read_to_string(&path).unwrap())
        })
        .collect();
    labels.sort();
    labels
}

pub fn file_names(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
