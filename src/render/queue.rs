use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use smallvec::SmallVec;

use crate::foundation::config::from_json_str;
use crate::foundation::error::{RasterflowError, RasterflowResult};
use crate::foundation::ids::JobId;
use crate::task::graph::{Lane, RunParams};

/// Worker pool configuration.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QueueOpts {
    /// Worker count. `None` uses the available parallelism. The pool never has fewer than two
    /// workers.
    pub threads: Option<usize>,
    /// Reserve worker 0 for [`Lane::Dedicated`] jobs. When off, every worker serves every lane.
    pub dedicated_lane: bool,
    /// Emit begin/end events for every job.
    pub trace_tasks: bool,
    /// Emit an event whenever a worker goes to sleep with work still pending.
    pub trace_waits: bool,
}

impl Default for QueueOpts {
    fn default() -> Self {
        Self {
            threads: None,
            dedicated_lane: true,
            trace_tasks: false,
            trace_waits: false,
        }
    }
}

impl QueueOpts {
    /// Parse from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> RasterflowResult<Self> {
        from_json_str("queue options", json)
    }
}

/// What a worker sees while running a job.
pub struct JobContext<'a> {
    /// Parameters injected at submission.
    pub params: &'a RunParams,
    /// `false` when a dependency of this job failed.
    pub upstream_ok: bool,
    /// Index of the executing worker.
    pub worker: usize,
}

/// Unit of work executed by the [`TaskQueue`].
pub trait Job: Send + Sync {
    /// Name used in trace events.
    fn label(&self) -> &str;

    /// Lane the job must run on.
    fn lane(&self) -> Lane {
        Lane::Shared
    }

    /// Execute. `false` marks the job failed.
    fn run(&self, ctx: &JobContext<'_>) -> bool;

    /// Called once for jobs still pending when the queue stops; they will never run.
    fn abandon(&self) {}
}

/// A job plus the jobs it must wait for.
pub struct QueuedJob {
    /// Identity of the job inside the queue.
    pub id: JobId,
    /// Jobs that must complete first.
    pub deps: SmallVec<[JobId; 4]>,
    /// The work.
    pub job: Arc<dyn Job>,
}

impl QueuedJob {
    /// Wrap `job` under a fresh id, with no dependencies.
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self {
            id: JobId::next(),
            deps: SmallVec::new(),
            job,
        }
    }

    /// Replace the dependency set.
    pub fn with_deps(mut self, deps: impl IntoIterator<Item = JobId>) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }
}

struct Pending {
    id: JobId,
    deps: SmallVec<[JobId; 4]>,
    job: Arc<dyn Job>,
    params: RunParams,
    success: bool,
}

struct State {
    pending: Vec<Pending>,
    started: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    trace_tasks: bool,
    trace_waits: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn next(&self, worker: usize, lane: Option<Lane>) -> Option<Pending> {
        let mut state = lock(&self.state);
        loop {
            if !state.started {
                return None;
            }

            if let Some(pos) = state
                .pending
                .iter()
                .position(|p| p.deps.is_empty() && lane.is_none_or(|l| p.job.lane() == l))
            {
                return Some(state.pending.remove(pos));
            }

            if self.trace_waits && !state.pending.is_empty() {
                tracing::trace!(worker, pending = state.pending.len(), "worker waits for task");
            }

            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn done(&self, id: JobId, success: bool) {
        let mut state = lock(&self.state);
        let mut unlocked = false;
        state.pending.retain(|p| p.id != id);
        for p in &mut state.pending {
            let before = p.deps.len();
            p.deps.retain(|d| *d != id);
            if p.deps.len() != before {
                if !success {
                    p.success = false;
                }
                if p.deps.is_empty() {
                    unlocked = true;
                }
            }
        }
        if unlocked {
            self.cond.notify_all();
        }
    }

    fn process(&self, worker: usize, lane: Option<Lane>) {
        while let Some(task) = self.next(worker, lane) {
            if self.trace_tasks {
                tracing::debug!(worker, task = task.job.label(), "begin task");
            }

            let ctx = JobContext {
                params: &task.params,
                upstream_ok: task.success,
                worker,
            };
            let ok = match catch_unwind(AssertUnwindSafe(|| task.job.run(&ctx))) {
                Ok(ok) => ok,
                Err(_) => {
                    tracing::error!(worker, task = task.job.label(), "task panicked");
                    false
                }
            };

            if self.trace_tasks {
                tracing::debug!(worker, task = task.job.label(), ok, "end task");
            }

            self.done(task.id, task.success && ok);
        }
    }
}

/// Fixed pool of worker threads executing jobs in dependency order.
///
/// A job is eligible once its dependency set is empty. Completing a job removes it from every
/// pending dependency set and, if it failed, taints the dependents (they still run).
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    lanes: Vec<Option<Lane>>,
}

impl TaskQueue {
    /// Spawn the workers.
    pub fn new(opts: &QueueOpts) -> RasterflowResult<Self> {
        if opts.threads == Some(0) {
            return Err(RasterflowError::validation(
                "queue 'threads' must be >= 1 when set",
            ));
        }
        let count = opts
            .threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(usize::from)
                    .unwrap_or(2)
            })
            .max(2);

        let lanes: Vec<Option<Lane>> = (0..count)
            .map(|i| match (opts.dedicated_lane, i) {
                (false, _) => None,
                (true, 0) => Some(Lane::Dedicated),
                (true, _) => Some(Lane::Shared),
            })
            .collect();

        let queue = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: Vec::new(),
                    started: true,
                }),
                cond: Condvar::new(),
                trace_tasks: opts.trace_tasks,
                trace_waits: opts.trace_waits,
            }),
            workers: Mutex::new(Vec::with_capacity(count)),
            lanes,
        };

        for (worker, &lane) in queue.lanes.iter().enumerate() {
            let shared = Arc::clone(&queue.shared);
            let handle = std::thread::Builder::new()
                .name(format!("rasterflow-worker-{worker}"))
                .spawn(move || shared.process(worker, lane))
                .map_err(|e| {
                    RasterflowError::scheduler(format!("failed to spawn worker {worker}: {e}"))
                })?;
            lock(&queue.workers).push(handle);
        }

        tracing::info!(threads = count, "rendering threads {count}");
        Ok(queue)
    }

    /// Number of workers.
    pub fn thread_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane served by `worker`; `None` means every lane.
    pub fn worker_lane(&self, worker: usize) -> Option<Lane> {
        self.lanes.get(worker).copied().flatten()
    }

    /// `false` once [`TaskQueue::stop`] was called.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).started
    }

    /// Jobs submitted but not yet picked up by a worker.
    pub fn pending_len(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Submit one job.
    pub fn enqueue_one(&self, job: QueuedJob, params: RunParams) -> RasterflowResult<()> {
        self.enqueue(vec![job], params)
    }

    /// Submit a batch.
    ///
    /// Every job is stamped with `params` and a fresh success flag. Dependencies on jobs that are
    /// neither pending nor part of this batch (already finished) are dropped.
    pub fn enqueue(&self, batch: Vec<QueuedJob>, params: RunParams) -> RasterflowResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = lock(&self.shared.state);
        if !state.started {
            return Err(RasterflowError::scheduler("task queue is stopped"));
        }

        let known: HashSet<JobId> = state
            .pending
            .iter()
            .map(|p| p.id)
            .chain(batch.iter().map(|j| j.id))
            .collect();

        for QueuedJob { id, mut deps, job } in batch {
            deps.retain(|d| known.contains(d));
            state.pending.push(Pending {
                id,
                deps,
                job,
                params: params.clone(),
                success: true,
            });
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Submit a batch followed by a barrier depending on all of it, and block until the barrier
    /// runs. Returns `true` when no job of the batch (transitively) failed.
    pub fn run_batch(
        &self,
        mut batch: Vec<QueuedJob>,
        params: RunParams,
    ) -> RasterflowResult<bool> {
        let completion = Arc::new(Completion::default());
        let barrier = QueuedJob::new(Arc::new(BarrierJob {
            completion: Arc::clone(&completion),
        }))
        .with_deps(batch.iter().map(|j| j.id));
        batch.push(barrier);

        self.enqueue(batch, params)?;
        completion.wait().ok_or_else(|| {
            RasterflowError::scheduler("task queue stopped before the batch completed")
        })
    }

    /// Drop every pending job. Meant for shutdown; waiters of dropped batches are released with
    /// an error.
    pub fn clear(&self) {
        let drained: Vec<Pending> = lock(&self.shared.state).pending.drain(..).collect();
        for p in drained {
            p.job.abandon();
        }
    }

    /// Stop the workers and join them. Jobs already running finish; pending jobs never start.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.started = false;
            self.shared.cond.notify_all();
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("rendering worker exited by panic");
            }
        }

        let abandoned: Vec<Arc<dyn Job>> = lock(&self.shared.state)
            .pending
            .iter()
            .map(|p| Arc::clone(&p.job))
            .collect();
        for job in abandoned {
            job.abandon();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One-shot latch carrying a batch outcome.
#[derive(Default)]
pub(crate) struct Completion {
    outcome: Mutex<Option<Option<bool>>>,
    cond: Condvar,
}

impl Completion {
    fn finish(&self, outcome: Option<bool>) {
        let mut slot = lock(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Block until the latch is released. `Some(success)` when the barrier ran, `None` when it
    /// was abandoned.
    pub(crate) fn wait(&self) -> Option<bool> {
        let mut slot = lock(&self.outcome);
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct BarrierJob {
    completion: Arc<Completion>,
}

impl Job for BarrierJob {
    fn label(&self) -> &str {
        "barrier"
    }

    fn run(&self, ctx: &JobContext<'_>) -> bool {
        self.completion.finish(Some(ctx.upstream_ok));
        true
    }

    fn abandon(&self) {
        self.completion.finish(None);
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/queue.rs"]
mod tests;
