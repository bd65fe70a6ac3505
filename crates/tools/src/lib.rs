//! Pieces shared by the command line tools.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use dataset::{IdentityMode, Layout, Library};
use tracing_subscriber::EnvFilter;

/// Logs to stderr. `RUST_LOG` overrides the default of `info` for the
/// library and the running tool.
pub fn init_tracing(bin: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dataset=info,tools=info,{bin}=info")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Args, Debug, Clone)]
pub struct DataDirArgs {
    /// Application data directory [default: $ANNOTATOR_DATA_DIR or the platform data dir]
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Identify datasets by folder name only, as older data directories do
    #[arg(long)]
    pub legacy_ids: bool,
}

impl DataDirArgs {
    pub fn layout(&self) -> anyhow::Result<Layout> {
        let layout = match &self.data_dir {
            Some(dir) => Layout::new(dir),
            None => Layout::from_env(),
        };
        layout.context("resolving data directory")
    }

    pub fn identity_mode(&self) -> IdentityMode {
        if self.legacy_ids {
            IdentityMode::FolderName
        } else {
            IdentityMode::CanonicalPath
        }
    }

    pub fn open_library(&self) -> anyhow::Result<Library> {
        let layout = self.layout()?;
        let data_dir = layout.data_dir().to_path_buf();
        Library::open(layout, self.identity_mode())
            .with_context(|| format!("opening library in {}", data_dir.display()))
    }
}

/// `{:<10} ({}): {}` rows of boxes per class.
pub fn class_table(classes: &[String], counts: &[usize]) -> Vec<String> {
    classes
        .iter()
        .zip(counts)
        .enumerate()
        .map(|(idx, (name, count))| format!("{:<10} ({}): {}", name, idx, count))
        .collect()
}
