use std::error::Error as StdError;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::export::{export_with, ExportMode, ExportRequest};
use crate::jobs::JobContext;

pub type TrainerError = Box<dyn StdError + Send + Sync>;

/// Whatever consumes an exported dataset: a training run in train mode, an
/// evaluation in test mode. Implementations should check `cancel` between
/// epochs.
pub trait Trainer: Send {
    fn run(&mut self, manifest: &Path, mode: ExportMode, cancel: &CancellationToken) -> Result<(), TrainerError>;

    /// Frees the model and any device memory. Called once per run, whatever
    /// the outcome.
    fn release(&mut self) {}
}

struct Session<'a, T: Trainer + ?Sized>(&'a mut T);

impl<T: Trainer + ?Sized> Deref for Session<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0
    }
}

impl<T: Trainer + ?Sized> DerefMut for Session<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.0
    }
}

impl<T: Trainer + ?Sized> Drop for Session<'_, T> {
    fn drop(&mut self) {
        self.0.release();
        tracing::debug!("trainer released");
    }
}

/// Exports `request` and hands the result to `trainer`. Meant to run as a
/// background job; progress of the export is reported through `ctx`.
pub fn export_and_train<T>(request: &ExportRequest, trainer: &mut T, ctx: &JobContext) -> Result<String>
where
    T: Trainer + ?Sized,
{
    let mut session = Session(trainer);
    ctx.checkpoint()?;

    let report = export_with(request, Some(ctx.cancel_token()), |done, total| ctx.progress(done, total))?;
    ctx.message(format!(
        "dataset ready: {} train, {} val, {} test images",
        report.train, report.val, report.test
    ));
    ctx.checkpoint()?;

    let mode = request.options.mode;
    session
        .run(&report.manifest, mode, ctx.cancel_token())
        .map_err(Error::Trainer)?;
    ctx.checkpoint()?;

    Ok(match mode {
        ExportMode::Train => format!("training finished on {} images", report.train + report.val),
        ExportMode::Test => format!("testing finished on {} images", report.test),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio::runtime::Handle;

    use super::*;
    use crate::export::ExportOptions;
    use crate::jobs::{JobRunner, JobStatus};

    #[derive(Default)]
    struct FakeTrainer {
        fail: bool,
        ran: Arc<AtomicBool>,
        released: Arc<AtomicBool>,
    }

    impl Trainer for FakeTrainer {
        fn run(&mut self, manifest: &Path, _: ExportMode, _: &CancellationToken) -> Result<(), TrainerError> {
            assert!(manifest.exists());
            self.ran.store(true, Ordering::SeqCst);
            if self.fail {
                return Err("out of memory".into());
            }
            Ok(())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn request(dir: &Path) -> ExportRequest {
        let annotations = dir.join("annotations.json");
        std::fs::write(&annotations, "{}").unwrap();
        ExportRequest {
            annotations,
            images_root: dir.to_path_buf(),
            datasets: Vec::new(),
            options: ExportOptions {
                output_dir: dir.join("data"),
                class_names: Some(vec!["cat".into()]),
                ..ExportOptions::default()
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trainer_is_released_after_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _rx) = JobRunner::new(Handle::current());

        for fail in [false, true] {
            let trainer = FakeTrainer { fail, ..FakeTrainer::default() };
            let (ran, released) = (trainer.ran.clone(), trainer.released.clone());
            let request = request(dir.path());

            let handle = runner.spawn("train", move |ctx| {
                let mut trainer = trainer;
                export_and_train(&request, &mut trainer, ctx)
            });
            let status = handle.wait().await;

            assert!(ran.load(Ordering::SeqCst));
            assert!(released.load(Ordering::SeqCst));
            match status {
                JobStatus::Succeeded(_) => assert!(!fail),
                JobStatus::Failed(e) => assert!(fail && e.contains("out of memory")),
                JobStatus::Cancelled => panic!("not cancelled"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_store_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _rx) = JobRunner::new(Handle::current());
        let trainer = FakeTrainer::default();
        let (ran, released) = (trainer.ran.clone(), trainer.released.clone());
        let mut request = request(dir.path());
        request.annotations = dir.path().join("missing.json");

        let status = runner
            .spawn("train", move |ctx| {
                let mut trainer = trainer;
                export_and_train(&request, &mut trainer, ctx)
            })
            .wait()
            .await;

        assert!(matches!(status, JobStatus::Failed(e) if e.contains("does not exist")));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(released.load(Ordering::SeqCst));
    }
}
