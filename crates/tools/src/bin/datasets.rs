use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dataset::library::DatasetSummary;
use dataset::DatasetId;
use serde_json::json;

/// Manages the datasets kept in the application data directory.
#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    #[command(flatten)]
    data: tools::DataDirArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy image folders into the library
    Import { folders: Vec<PathBuf> },
    /// Combine datasets into a new one
    Merge {
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,
    },
    /// Change the name shown for a dataset
    Rename { id: String, name: String },
    /// Remove datasets with their annotations
    Delete {
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,
    },
    /// Show every dataset
    List {
        #[arg(long)]
        json: bool,
    },
    /// Count images and annotated images of a dataset
    Stats { id: String },
    /// Most used labels, optionally starting with a prefix
    Labels {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

fn ids(raw: &[String]) -> Vec<DatasetId> {
    raw.iter().map(|it| DatasetId::from(it.as_str())).collect()
}

fn summary_json(summary: &DatasetSummary) -> serde_json::Value {
    json!({
        "id": summary.id,
        "name": summary.display_name,
        "origin": summary.origin,
        "path": summary.path,
    })
}

fn main() -> anyhow::Result<()> {
    tools::init_tracing("datasets");
    let args = Args::parse();
    let library = args.data.open_library()?;

    match args.command {
        Command::Import { folders } => {
            let mut failed = 0;
            for folder in &folders {
                match library.import_folder(folder) {
                    Ok(dataset) => println!("{} -> {}", folder.display(), dataset.id),
                    Err(e) => {
                        tracing::error!("{}: {}", folder.display(), e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} imports failed", folders.len());
            }
        }
        Command::Merge { ids: raw } => {
            let report = library.merge(&ids(&raw))?;
            println!(
                "{} ({} merged, {} skipped, {} failed, {} files)",
                report.dataset.id, report.merged, report.skipped, report.failed, report.files_copied
            );
        }
        Command::Rename { id, name } => {
            let id = DatasetId::from(id.as_str());
            if !library.registry().contains(&id) {
                anyhow::bail!("unknown dataset {id}");
            }
            library.rename(&id, &name)?;
        }
        Command::Delete { ids: raw } => {
            let report = library.delete(&ids(&raw), None, |done, total| {
                tracing::info!("{done}/{total} deleted");
            })?;
            for (id, e) in &report.failed {
                tracing::error!("{id}: {e}");
            }
            println!("{} / {}", report.deleted, raw.len());
        }
        Command::List { json } => {
            let datasets = library.datasets()?;
            if json {
                let list: Vec<_> = datasets.iter().map(summary_json).collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for it in &datasets {
                    println!("{}  {:<24} {}", it.id, it.display_name, it.origin.as_deref().unwrap_or("-"));
                }
            }
        }
        Command::Stats { id } => {
            let id = DatasetId::from(id.as_str());
            let stats = library
                .stats(&id)
                .with_context(|| format!("dataset {id}"))?;
            println!("{}: {} / {} images annotated", library.registry().display_name(&id), stats.annotated, stats.images);
        }
        Command::Labels { prefix, limit } => {
            for label in library.dictionary().suggestions(&prefix, limit) {
                println!("{:<10} {}", label, library.dictionary().count(&label));
            }
        }
    }

    Ok(())
}
