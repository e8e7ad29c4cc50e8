//! Cron scheduling for periodic runners

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

/// Handle to a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

type JobFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    name: String,
    running: AtomicBool,
    current: Mutex<Option<AbortHandle>>,
    run: JobFn,
}

/// Clears the running flag when an invocation ends, however it ends
struct RunningGuard(Arc<Job>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl Job {
    /// Start an invocation unless the previous one is still running
    fn fire(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(job = %self.name, "Previous run still in progress, skipping");
            return false;
        }

        let guard = RunningGuard(Arc::clone(self));
        let fut = (self.run)();
        let task = tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
        *self.current.lock() = Some(task.abort_handle());
        true
    }

    fn cancel(&self) {
        if let Some(current) = self.current.lock().take() {
            current.abort();
        }
    }
}

/// Runs jobs on cron schedules, never overlapping two runs of the same job
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<JobId, (Arc<Job>, JoinHandle<()>)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job` to run on every trigger of `schedule`
    pub fn add<F, Fut>(&self, name: impl Into<String>, schedule: cron::Schedule, job: F) -> JobId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Arc::new(Job {
            name: name.into(),
            running: AtomicBool::new(false),
            current: Mutex::new(None),
            run: Box::new(move || -> BoxFuture<'static, ()> { Box::pin(job()) }),
        });

        let ticker = tokio::spawn({
            let job = Arc::clone(&job);
            async move {
                for next in schedule.upcoming(Utc) {
                    let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(delay).await;
                    job.fire();
                }
                warn!(job = %job.name, "Schedule has no further triggers");
            }
        });

        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().insert(id, (job, ticker));
        id
    }

    /// Remove a job, cancelling any run in progress
    pub fn remove(&self, id: JobId) -> bool {
        let Some((job, ticker)) = self.jobs.lock().remove(&id) else {
            return false;
        };
        ticker.abort();
        job.cancel();
        debug!(job = %job.name, "Job removed");
        true
    }

    /// Number of scheduled jobs
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether no jobs are scheduled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, (job, ticker)) in self.jobs.get_mut().drain() {
            ticker.abort();
            job.cancel();
        }
    }
}
