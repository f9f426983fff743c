//! Periodic Task Scheduling
//!
//! Reconciliation runs as a named periodic job on a [`Scheduler`]. The map
//! only relies on three properties of a scheduler:
//!
//! - a job runs later, possibly repeatedly
//! - installing under an existing name replaces the old task
//! - a task can be removed by name
//!
//! Two implementations ship with the crate. [`TokioScheduler`] drives each
//! task from its own tokio task. [`ManualScheduler`] only records tasks and
//! runs them when asked, which keeps tests deterministic.

use mapcache_core::MapResult;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Blocking job body. An error asks the scheduler to try again on the next
/// interval.
pub type Job = Arc<dyn Fn() -> MapResult<()> + Send + Sync>;

/// Parameters of a periodic task.
#[derive(Clone)]
pub struct TaskSpec {
    /// Delay before the first run.
    pub start_delay: Duration,
    /// Interval between runs.
    pub run_interval: Duration,
    pub job: Job,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("start_delay", &self.start_delay)
            .field("run_interval", &self.run_interval)
            .finish_non_exhaustive()
    }
}

/// Runs named periodic tasks.
pub trait Scheduler: Send + Sync {
    /// Install `task` under `name`, replacing any task with that name.
    fn install(&self, name: &str, task: TaskSpec);

    /// Stop and forget the task installed under `name`.
    fn remove(&self, name: &str);
}

// Task tables hold no invariants a panicking job could break.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MANUAL SCHEDULER
// ============================================================================

/// Scheduler that never runs anything on its own.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    tasks: Mutex<HashMap<String, TaskSpec>>,
    installs: AtomicU64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self, name: &str) -> bool {
        lock(&self.tasks).contains_key(name)
    }

    /// Number of `install` calls so far, replacements included.
    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.tasks).keys().cloned().collect();
        names.sort();
        names
    }

    /// Start delay and run interval of the task named `name`.
    pub fn timing(&self, name: &str) -> Option<(Duration, Duration)> {
        lock(&self.tasks)
            .get(name)
            .map(|t| (t.start_delay, t.run_interval))
    }

    /// Run the task named `name` once on the calling thread.
    ///
    /// Returns `None` when no such task is installed.
    pub fn run(&self, name: &str) -> Option<MapResult<()>> {
        // Release the table before running: the job may reinstall itself.
        let job = lock(&self.tasks).get(name).map(|t| t.job.clone())?;
        Some(job())
    }
}

impl Scheduler for ManualScheduler {
    fn install(&self, name: &str, task: TaskSpec) {
        self.installs.fetch_add(1, Ordering::Relaxed);
        lock(&self.tasks).insert(name.to_string(), task);
    }

    fn remove(&self, name: &str) {
        lock(&self.tasks).remove(name);
    }
}

// ============================================================================
// TOKIO SCHEDULER
// ============================================================================

/// Counters shared by all tasks of a [`TokioScheduler`].
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Tasks installed, replacements included
    pub installs: AtomicU64,

    /// Job runs that returned `Ok`
    pub runs: AtomicU64,

    /// Job runs that returned an error or panicked
    pub failures: AtomicU64,
}

impl SchedulerMetrics {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            installs: self.installs.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Scheduler counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub installs: u64,
    pub runs: u64,
    pub failures: u64,
}

/// Scheduler running each task as a tokio task.
///
/// Jobs run on the blocking pool since they take the map lock and talk to
/// the store synchronously. Dropping the scheduler stops all its tasks.
#[derive(Debug)]
pub struct TokioScheduler {
    handle: Handle,
    tasks: Mutex<HashMap<String, watch::Sender<bool>>>,
    metrics: Arc<SchedulerMetrics>,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tasks: Mutex::new(HashMap::new()),
            metrics: Arc::new(SchedulerMetrics::default()),
        }
    }

    /// Scheduler on the runtime of the calling context, if there is one.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn metrics(&self) -> SchedulerSnapshot {
        self.metrics.snapshot()
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.tasks).keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every task.
    pub fn shutdown(&self) {
        for (_, shutdown_tx) in lock(&self.tasks).drain() {
            let _ = shutdown_tx.send(true);
        }
    }
}

impl Scheduler for TokioScheduler {
    fn install(&self, name: &str, task: TaskSpec) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Some(previous) = lock(&self.tasks).insert(name.to_string(), shutdown_tx) {
            let _ = previous.send(true);
        }
        self.metrics.installs.fetch_add(1, Ordering::Relaxed);
        self.handle.spawn(run_task(
            name.to_string(),
            task,
            shutdown_rx,
            self.metrics.clone(),
        ));
    }

    fn remove(&self, name: &str) {
        if let Some(shutdown_tx) = lock(&self.tasks).remove(name) {
            let _ = shutdown_tx.send(true);
            tracing::info!(task = name, "Scheduled task removed");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_task(
    name: String,
    task: TaskSpec,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<SchedulerMetrics>,
) {
    tokio::select! {
        _ = tokio::time::sleep(task.start_delay) => {}
        _ = shutdown_rx.changed() => return,
    }

    // tokio intervals must have a non-zero period
    let mut ticker = interval(task.run_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        task = %name,
        run_interval_ms = task.run_interval.as_millis() as u64,
        "Scheduled task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let job = task.job.clone();
                match tokio::task::spawn_blocking(move || job()).await {
                    Ok(Ok(())) => {
                        metrics.runs.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        metrics.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(task = %name, error = %e, "Scheduled task run failed");
                    }
                    Err(e) => {
                        metrics.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(task = %name, error = %e, "Scheduled task panicked");
                    }
                }
            }
        }
    }

    tracing::info!(task = %name, "Scheduled task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapcache_core::MapError;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: Arc<AtomicUsize>, fail: bool) -> TaskSpec {
        TaskSpec {
            start_delay: Duration::from_millis(5),
            run_interval: Duration::from_millis(10),
            job: Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(MapError::SyncOutstanding { count: 1 })
                } else {
                    Ok(())
                }
            }),
        }
    }

    #[test]
    fn test_manual_install_replaces() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.install("sync", counting_task(counter.clone(), false));
        scheduler.install("sync", counting_task(counter.clone(), true));

        assert_eq!(scheduler.installs(), 2);
        assert_eq!(scheduler.task_names(), vec!["sync".to_string()]);
        assert!(scheduler.run("sync").unwrap().is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_run_missing_task() {
        let scheduler = ManualScheduler::new();
        assert!(scheduler.run("nothing").is_none());
    }

    #[test]
    fn test_manual_remove() {
        let scheduler = ManualScheduler::new();
        scheduler.install("sync", counting_task(Arc::new(AtomicUsize::new(0)), false));
        scheduler.remove("sync");
        assert!(!scheduler.is_installed("sync"));
    }

    #[test]
    fn test_tokio_scheduler_current_needs_runtime() {
        assert!(TokioScheduler::current().is_none());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        assert!(TokioScheduler::current().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_runs_and_stops() {
        let scheduler = TokioScheduler::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.install("sync", counting_task(counter.clone(), true));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.metrics().failures >= 2);

        scheduler.remove("sync");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped_at = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), stopped_at);
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_replace_keeps_one_task() {
        let scheduler = TokioScheduler::new(Handle::current());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        scheduler.install("sync", counting_task(first.clone(), false));
        scheduler.install("sync", counting_task(second.clone(), false));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(second.load(Ordering::SeqCst) >= 1);
        assert_eq!(scheduler.metrics().installs, 2);
    }
}
