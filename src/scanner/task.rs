//! Periodic scan task
//!
//! Runs an async job at a fixed period on the tokio runtime. The loop is
//! driven by an interval, a cancellation token and a watch channel holding
//! the pause flag. Control signals are only observed between executions,
//! so an in-flight cycle always completes.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Job executed once per period
pub type ScanJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle of a [`ScanTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never started
    Ready,
    Running,
    Paused,
    /// Cancelled; the task cannot be started again
    Stopped,
}

/// Cancellable, pausable periodic task
pub struct ScanTask {
    period: Duration,
    job: ScanJob,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    state: Mutex<TaskState>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cycles: Arc<AtomicU64>,
}

impl ScanTask {
    /// Create a task that runs `job` every `period` once started
    pub fn new<F>(period: Duration, job: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let (paused, _) = watch::channel(false);
        Self {
            period,
            job: Arc::new(job),
            cancel: CancellationToken::new(),
            paused,
            state: Mutex::new(TaskState::Ready),
            handle: Mutex::new(None),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of completed executions
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Spawn the loop. The first execution happens one period from now.
    ///
    /// Returns false when the task was already started or has been stopped.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != TaskState::Ready {
            debug!("Scan task start ignored in state {:?}", *state);
            return false;
        }

        let period = self.period;
        let job = self.job.clone();
        let cancel = self.cancel.clone();
        let cycles = self.cycles.clone();
        let mut paused_rx = self.paused.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let is_paused = *paused_rx.borrow_and_update();

                if is_paused {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = paused_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            // Resumed: next execution one full period from now
                            ticker.reset();
                            continue;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = paused_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }

                if AssertUnwindSafe((job)()).catch_unwind().await.is_err() {
                    error!("Scan job panicked, next execution in {:?}", period);
                }
                cycles.fetch_add(1, Ordering::SeqCst);
            }

            debug!("Scan task loop exited");
        });

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *state = if *self.paused.borrow() {
            TaskState::Paused
        } else {
            TaskState::Running
        };
        true
    }

    /// Suspend future executions
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            TaskState::Stopped => warn!("Cannot pause a stopped scan task"),
            TaskState::Ready => {
                // Takes effect once started
                self.paused.send_replace(true);
            }
            TaskState::Running | TaskState::Paused => {
                self.paused.send_replace(true);
                *state = TaskState::Paused;
            }
        }
    }

    /// Resume after [`pause`](Self::pause)
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            TaskState::Stopped => warn!("Cannot restart a stopped scan task"),
            TaskState::Ready => {
                self.paused.send_replace(false);
            }
            TaskState::Running | TaskState::Paused => {
                self.paused.send_replace(false);
                *state = TaskState::Running;
            }
        }
    }

    /// Cancel the loop and wait for an in-flight execution to finish
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == TaskState::Stopped {
                return;
            }
            *state = TaskState::Stopped;
        }

        self.cancel.cancel();

        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scan task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ScanTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_task(period: Duration) -> (ScanTask, Arc<AtomicU64>) {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let task = ScanTask::new(period, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        (task, runs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_period() {
        let (task, runs) = counting_task(Duration::from_secs(5));
        assert!(task.start());
        assert_eq!(task.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_restart() {
        let (task, runs) = counting_task(Duration::from_secs(5));
        task.start();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        task.pause();
        assert_eq!(task.state(), TaskState::Paused);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        task.restart();
        assert_eq!(task.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (task, runs) = counting_task(Duration::from_secs(1));
        assert!(task.start());
        assert!(!task.start());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_terminal() {
        let (task, runs) = counting_task(Duration::from_secs(1));
        task.start();
        task.stop().await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert!(!task.start());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_cycle() {
        let finished = Arc::new(AtomicU64::new(0));
        let flag = finished.clone();
        let task = ScanTask::new(Duration::from_secs(1), move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        task.start();

        // Land inside the first cycle
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        task.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_keeps_the_loop_alive() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let task = ScanTask::new(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first cycle blows up");
                }
            }
            .boxed()
        });
        task.start();

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(task.cycles(), 3);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_before_start() {
        let (task, runs) = counting_task(Duration::from_secs(1));
        task.pause();
        task.start();
        assert_eq!(task.state(), TaskState::Paused);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        task.restart();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        task.stop().await;
    }
}
