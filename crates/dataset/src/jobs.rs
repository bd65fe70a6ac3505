//! Background jobs for long operations (bulk delete, export, training).
//!
//! Jobs run on the tokio blocking pool and never touch caller-owned state
//! directly: everything they have to say goes through a [`JobEvent`] queue that
//! the owning thread drains on its own schedule. Cancellation is cooperative;
//! a job checks its token between units of work.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub type JobId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Succeeded(String),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started { job: JobId, name: String },
    Progress { job: JobId, done: usize, total: usize },
    Message { job: JobId, text: String },
    Finished { job: JobId, status: JobStatus },
}

/// What a running job gets to talk to the outside world.
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    cancel: CancellationToken,
    events: UnboundedSender<JobEvent>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Error::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn progress(&self, done: usize, total: usize) {
        self.send(JobEvent::Progress { job: self.id, done, total });
    }

    pub fn message(&self, text: impl Into<String>) {
        self.send(JobEvent::Message { job: self.id, text: text.into() });
    }

    fn send(&self, event: JobEvent) {
        // The receiver going away only means nobody listens any more.
        _ = self.events.send(event);
    }
}

pub struct JobHandle {
    id: JobId,
    cancel: CancellationToken,
    task: JoinHandle<JobStatus>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> JobStatus {
        self.task
            .await
            .unwrap_or_else(|e| JobStatus::Failed(format!("job aborted: {e}")))
    }
}

pub struct JobRunner {
    runtime: Handle,
    events: UnboundedSender<JobEvent>,
    next_id: AtomicU64,
}

impl JobRunner {
    pub fn new(runtime: Handle) -> (Self, UnboundedReceiver<JobEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let runner = Self { runtime, events, next_id: AtomicU64::new(1) };
        (runner, rx)
    }

    /// Runs `job` in the background. Its return value, error or panic becomes
    /// the final [`JobEvent::Finished`].
    pub fn spawn<F>(&self, name: impl Into<String>, job: F) -> JobHandle
    where
        F: FnOnce(&JobContext) -> Result<String> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let cancel = CancellationToken::new();
        let ctx = JobContext { id, cancel: cancel.clone(), events: self.events.clone() };

        let task = self.runtime.spawn_blocking(move || {
            ctx.send(JobEvent::Started { job: id, name: name.clone() });

            let status = match panic::catch_unwind(AssertUnwindSafe(|| job(&ctx))) {
                Ok(Ok(summary)) => JobStatus::Succeeded(summary),
                Ok(Err(Error::Cancelled)) => JobStatus::Cancelled,
                Ok(Err(e)) => JobStatus::Failed(e.to_string()),
                Err(payload) => JobStatus::Failed(panic_message(payload)),
            };

            match &status {
                JobStatus::Succeeded(summary) => tracing::info!("job #{id} {name}: {summary}"),
                JobStatus::Failed(e) => tracing::error!("job #{id} {name} failed: {e}"),
                JobStatus::Cancelled => tracing::info!("job #{id} {name} cancelled"),
            }

            ctx.send(JobEvent::Finished { job: id, status: status.clone() });
            status
        });

        JobHandle { id, cancel, task }
    }
}

/// Everything queued so far, without waiting.
pub fn drain_events(rx: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn events_arrive_in_order() {
        let (runner, mut rx) = JobRunner::new(Handle::current());
        let handle = runner.spawn("count", |ctx| {
            for i in 1..=3 {
                ctx.progress(i, 3);
            }
            ctx.message("halfway there");
            Ok("counted".to_string())
        });
        let id = handle.id();

        assert_eq!(handle.wait().await, JobStatus::Succeeded("counted".into()));

        let events = drain_events(&mut rx);
        assert_eq!(events.first(), Some(&JobEvent::Started { job: id, name: "count".into() }));
        assert_eq!(events[1], JobEvent::Progress { job: id, done: 1, total: 3 });
        assert_eq!(events[4], JobEvent::Message { job: id, text: "halfway there".into() });
        assert_eq!(
            events.last(),
            Some(&JobEvent::Finished { job: id, status: JobStatus::Succeeded("counted".into()) })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_is_cooperative() {
        let (runner, _rx) = JobRunner::new(Handle::current());
        let handle = runner.spawn("spin", |ctx| loop {
            ctx.checkpoint()?;
            std::thread::sleep(Duration::from_millis(5));
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert_eq!(handle.wait().await, JobStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn errors_and_panics_become_failed_status() {
        let (runner, mut rx) = JobRunner::new(Handle::current());
        let failing = runner.spawn("fail", |_| Err(Error::InvalidInput("bad ratio".into())));
        let panicking = runner.spawn("panic", |_| panic!("boom"));

        assert_eq!(failing.wait().await, JobStatus::Failed("invalid input: bad ratio".into()));
        match panicking.wait().await {
            JobStatus::Failed(message) => assert!(message.contains("boom")),
            other => panic!("unexpected status {other:?}"),
        }

        let finished = drain_events(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, JobEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 2);
    }
}
