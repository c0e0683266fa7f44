//! Cancellable periodic background jobs.
//!
//! A [`PeriodicTask`] runs a job once right away, then every `period`. It
//! can be triggered to run early; triggers arriving while a run is in
//! progress collapse into a single follow-up run. A triggered run restarts
//! the period.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle used to request an early run of a [`PeriodicTask`].
#[derive(Debug, Clone, Default)]
pub struct TaskTrigger {
    notify: Arc<Notify>,
}

impl TaskTrigger {
    /// Create a trigger not yet bound to a task.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a run as soon as the current one, if any, finishes.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// A job running on a fixed period until cancelled.
#[derive(Debug)]
pub struct PeriodicTask {
    trigger: TaskTrigger,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn a periodic task on the current runtime.
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        cancel: CancellationToken,
        job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_trigger(name, period, cancel, TaskTrigger::new(), job)
    }

    /// Spawn a periodic task that listens on an existing trigger.
    ///
    /// Lets other jobs hold the trigger before this task exists.
    pub fn spawn_with_trigger<F, Fut>(
        name: &'static str,
        period: Duration,
        cancel: CancellationToken,
        trigger: TaskTrigger,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let notify = Arc::clone(&trigger.notify);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = notify.notified() => ticker.reset(),
                    _ = ticker.tick() => {}
                }
                debug!(task = name, "Running periodic task");
                job().await;
            }

            debug!(task = name, "Periodic task stopped");
        });

        Self { trigger, handle }
    }

    /// Request an early run.
    pub fn trigger(&self) {
        self.trigger.trigger();
    }

    /// Returns true once the task loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
