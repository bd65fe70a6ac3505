//! Annotation storage for image datasets and their conversion into YOLO
//! training layouts.

pub mod annotation;
pub mod config;
pub mod dictionary;
pub mod document;
pub mod error;
pub mod export;
pub mod jobs;
pub mod library;
pub mod registry;
pub mod store;
pub mod train;
mod utils;

pub use annotation::Annotation;
pub use config::{IdentityMode, Layout};
pub use error::{Error, Result};
pub use export::{export, export_with, ExportMode, ExportOptions, ExportReport, ExportRequest, LinkMode, Manifest};
pub use library::{Library, ManagedDataset};
pub use registry::DatasetId;
pub use store::AnnotationStore;
pub use utils::{is_image, list_images, IMAGE_EXTENSIONS};
