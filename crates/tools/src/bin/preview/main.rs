use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use dataset::{list_images, Manifest};
use image::RgbImage;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use math::{parse_labels, YoloLabel};
use rayon::prelude::*;

mod colors;

/// Draws the label boxes of an exported split onto copies of its images.
#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    /// Split directory holding `images/` and `labels/`, e.g. `data/train`
    split: PathBuf,

    /// Where to write the annotated copies [default: <split>/preview]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Manifest naming the classes [default: data.yaml next to the split]
    #[arg(long)]
    manifest: Option<PathBuf>,
}

fn read_labels(path: &Path) -> anyhow::Result<Vec<YoloLabel>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_labels(&text).with_context(|| format!("parsing {}", path.display()))
}

fn draw_labels(image: &mut RgbImage, labels: &[YoloLabel]) {
    let (width, height) = image.dimensions();
    for label in labels {
        let color = colors::class_color(label.class_id);
        let rect = label.bbox.to_rect(width, height);
        draw_hollow_rect_mut(image, rect, color);

        let tag = Rect::at(rect.left(), rect.top()).of_size(rect.width().min(8), rect.height().min(8));
        draw_filled_rect_mut(image, tag, color);
        draw_hollow_rect_mut(image, tag, colors::contrast_color(color));
    }
}

fn preview(image_path: &Path, labels_dir: &Path, output: &Path) -> anyhow::Result<Vec<usize>> {
    let labels_path = labels_dir.join(image_path.file_name().context("no file name")?).with_extension("txt");
    let labels = read_labels(&labels_path)?;

    let mut image = image::open(image_path)
        .with_context(|| format!("opening {}", image_path.display()))?
        .to_rgb8();
    draw_labels(&mut image, &labels);

    let target = output.join(image_path.file_name().context("no file name")?);
    image.save(&target).with_context(|| format!("saving {}", target.display()))?;

    Ok(labels.iter().map(|it| it.class_id).collect())
}

fn main() -> anyhow::Result<()> {
    tools::init_tracing("preview");
    let args = Args::parse();

    let output = args.output.unwrap_or_else(|| args.split.join("preview"));
    fs::create_dir_all(&output).with_context(|| format!("creating {}", output.display()))?;

    let manifest_path = args
        .manifest
        .or_else(|| args.split.parent().map(|it| it.join(dataset::export::MANIFEST_FILE)));
    let names = match manifest_path {
        Some(path) if path.exists() => Manifest::load(&path)?.names,
        _ => Vec::new(),
    };

    let images = list_images(&args.split.join("images"))?;
    let labels_dir = args.split.join("labels");
    tracing::info!("drawing {} images into {}", images.len(), output.display());

    let results: Vec<_> = images
        .par_iter()
        .map(|path| (path, preview(path, &labels_dir, &output)))
        .collect();

    let mut counts: Vec<usize> = vec![0; names.len()];
    let mut failed = 0;
    for (path, result) in results {
        match result {
            Ok(class_ids) => {
                for class_id in class_ids {
                    if class_id >= counts.len() {
                        counts.resize(class_id + 1, 0);
                    }
                    counts[class_id] += 1;
                }
            }
            Err(e) => {
                tracing::error!("{}: {:#}", path.display(), e);
                failed += 1;
            }
        }
    }

    let names: Vec<String> = (0..counts.len())
        .map(|idx| names.get(idx).cloned().unwrap_or_else(|| idx.to_string()))
        .collect();
    for row in tools::class_table(&names, &counts) {
        println!("{row}");
    }
    println!("{} / {}", images.len() - failed, images.len());
    Ok(())
}
