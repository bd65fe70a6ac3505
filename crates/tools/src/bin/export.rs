use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use dataset::export::export_with;
use dataset::jobs::{JobEvent, JobRunner, JobStatus};
use dataset::{DatasetId, ExportMode, ExportOptions, LinkMode};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Converts annotated datasets into a YOLO training layout.
#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    #[command(flatten)]
    data: tools::DataDirArgs,

    /// Dataset ids to include [default: every managed dataset]
    datasets: Vec<String>,

    /// Output directory [default: <data dir>/data]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Comma separated classes, in index order [default: every label, sorted]
    #[arg(short, long, value_delimiter = ',')]
    classes: Vec<String>,

    /// Share of images going to the training split
    #[arg(long, default_value_t = 0.8, value_parser = validate_ratio)]
    train_ratio: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Put everything into `test` and add it to the existing data.yaml
    #[arg(long)]
    test: bool,

    /// Symlink images instead of copying them
    #[arg(long)]
    symlink: bool,
}

fn validate_ratio(s: &str) -> Result<f64, String> {
    match f64::from_str(s) {
        Ok(val) if (0.0..=1.0).contains(&val) => Ok(val),
        _ => Err("RATIO must be between 0.0 and 1.0".to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tools::init_tracing("export");
    let args = Args::parse();
    let library = args.data.open_library()?;

    let ids: Vec<DatasetId> = if args.datasets.is_empty() {
        library.datasets()?.into_iter().map(|it| it.id).collect()
    } else {
        args.datasets.iter().map(|it| DatasetId::from(it.as_str())).collect()
    };
    if ids.is_empty() {
        anyhow::bail!("no datasets to export");
    }

    let options = ExportOptions {
        output_dir: args.output.unwrap_or_else(|| library.layout().default_export_dir()),
        class_names: (!args.classes.is_empty()).then_some(args.classes),
        train_ratio: args.train_ratio,
        seed: args.seed,
        mode: if args.test { ExportMode::Test } else { ExportMode::Train },
        link: if args.symlink { LinkMode::Symlink } else { LinkMode::Copy },
        ..ExportOptions::default()
    };
    let request = library.export_request(&ids, options);

    let (runner, mut events) = JobRunner::new(Handle::current());
    let (report_tx, report_rx) = oneshot::channel();
    let handle = runner.spawn("export", move |ctx| {
        let report = export_with(&request, Some(ctx.cancel_token()), |done, total| ctx.progress(done, total))?;
        let summary = format!(
            "{} train, {} val, {} test, {} missing, {} failed",
            report.train, report.val, report.test, report.missing, report.failed
        );
        _ = report_tx.send(report);
        Ok(summary)
    });

    let mut cancelling = false;
    let status = loop {
        tokio::select! {
            event = events.recv() => match event.context("export job vanished")? {
                JobEvent::Progress { done, total, .. } if done == total || done % 100 == 0 => {
                    tracing::info!("{done}/{total} images written");
                }
                JobEvent::Message { text, .. } => tracing::info!("{text}"),
                JobEvent::Finished { status, .. } => break status,
                _ => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                tracing::warn!("cancelling export...");
                handle.cancel();
                cancelling = true;
            }
        }
    };

    match status {
        JobStatus::Succeeded(_) => {
            let report = report_rx.await.context("export report")?;
            for row in tools::class_table(&report.classes, &report.class_counts) {
                println!("{row}");
            }
            println!("manifest: {}", report.manifest.display());
            Ok(())
        }
        JobStatus::Failed(e) => anyhow::bail!("export failed: {e}"),
        JobStatus::Cancelled => anyhow::bail!("export cancelled"),
    }
}
