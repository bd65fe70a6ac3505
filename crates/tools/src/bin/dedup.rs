use anyhow::Context;
use clap::Parser;
use dataset::AnnotationStore;

/// Removes duplicate annotations left in the store by older versions.
#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    #[command(flatten)]
    data: tools::DataDirArgs,

    /// Only report what would be removed
    #[arg(long)]
    dry_run: bool,
}

fn main() -> anyhow::Result<()> {
    tools::init_tracing("dedup");
    let args = Args::parse();
    let path = args.data.layout()?.annotations();

    let store = AnnotationStore::open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let total = store.count();

    let removed = if args.dry_run {
        store.count_duplicates()
    } else {
        store.dedup_all()?
    };

    tracing::info!("{} checked", path.display());
    println!("{} / {}", removed, total);
    Ok(())
}
