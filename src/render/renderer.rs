use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::foundation::config::from_json_str;
use crate::foundation::error::RasterflowResult;
use crate::foundation::ids::{JobId, TaskId};
use crate::optimize::category::Category;
use crate::optimize::pipeline::{OptimizeStats, OptimizerOpts, OptimizerSet};
use crate::optimize::rule::Optimizer;
use crate::render::hazard::find_dependencies;
use crate::render::queue::{Job, JobContext, QueuedJob, TaskQueue};
use crate::task::dump::log_list;
use crate::task::graph::{Lane, RunParams, TaskContext, TaskGraph};

/// Options of a [`Renderer`].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RenderOpts {
    /// Fixpoint loop options.
    pub optimizer: OptimizerOpts,
    /// Dump the submitted list and the optimized list.
    pub log_task_lists: bool,
    /// Report elapsed time of the optimize, dependency and execution phases.
    pub measure: bool,
}

impl RenderOpts {
    /// Parse from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> RasterflowResult<Self> {
        from_json_str("render options", json)
    }
}

/// Outcome and counters of one [`Renderer::run_with_report`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    /// `false` when any executed task failed.
    pub success: bool,
    /// Entries of the submitted list.
    pub input_tasks: usize,
    /// Entries left after optimization, i.e. jobs submitted.
    pub optimized_tasks: usize,
    /// Ordering edges derived from buffer overlaps.
    pub dependency_edges: usize,
    /// Fixpoint loop steps.
    pub optimizer_steps: usize,
    /// Sweeps restarted from the first category.
    pub optimizer_restarts: usize,
}

/// A rendering backend: an optimizer registry bound to a shared [`TaskQueue`].
///
/// `run` optimizes a copy of the submitted graph, derives the ordering constraints between the
/// surviving tasks, submits them and blocks until all of them completed.
pub struct Renderer {
    optimizers: RwLock<OptimizerSet>,
    queue: Arc<TaskQueue>,
    opts: RenderOpts,
}

impl Renderer {
    /// Backend with no optimizers.
    pub fn new(queue: Arc<TaskQueue>, opts: RenderOpts) -> Self {
        Self {
            optimizers: RwLock::new(OptimizerSet::new()),
            queue,
            opts,
        }
    }

    /// Queue the backend submits to.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Backend options.
    pub fn opts(&self) -> &RenderOpts {
        &self.opts
    }

    /// Append a rule to its category.
    pub fn register_optimizer(&self, optimizer: Arc<dyn Optimizer>) -> RasterflowResult<()> {
        self.optimizers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(optimizer)
    }

    /// Remove a rule.
    pub fn unregister_optimizer(&self, optimizer: &Arc<dyn Optimizer>) {
        self.optimizers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(optimizer);
    }

    /// Return `true` when this exact rule instance is registered.
    pub fn is_optimizer_registered(&self, optimizer: &Arc<dyn Optimizer>) -> bool {
        self.read_optimizers().is_registered(optimizer)
    }

    /// Snapshot of the rules of `category`, in application order.
    pub fn optimizers(&self, category: Category) -> Vec<Arc<dyn Optimizer>> {
        self.read_optimizers().optimizers(category).to_vec()
    }

    fn read_optimizers(&self) -> std::sync::RwLockReadGuard<'_, OptimizerSet> {
        self.optimizers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the registered rules over `list` until fixpoint.
    pub fn optimize(
        &self,
        graph: &mut TaskGraph,
        list: &mut Vec<Option<TaskId>>,
    ) -> RasterflowResult<OptimizeStats> {
        self.read_optimizers()
            .optimize(graph, list, &self.opts.optimizer)
    }

    /// Render `list` and report whether every task succeeded.
    pub fn run(&self, graph: &TaskGraph, list: &[TaskId]) -> RasterflowResult<bool> {
        Ok(self
            .run_with_report(graph, list, RunParams::default())?
            .success)
    }

    /// Render `list` with `params` injected into every task, and return the run counters.
    ///
    /// The caller's graph is left untouched; rewrites happen on a private copy.
    #[tracing::instrument(level = "debug", skip_all, fields(tasks = list.len()))]
    pub fn run_with_report(
        &self,
        graph: &TaskGraph,
        list: &[TaskId],
        params: RunParams,
    ) -> RasterflowResult<RunReport> {
        graph.check_tree(list)?;

        let mut graph = graph.clone();
        let mut optimized: Vec<Option<TaskId>> = list.iter().copied().map(Some).collect();
        if self.opts.log_task_lists {
            log_list(&graph, &optimized, "list");
        }

        let started = Instant::now();
        let stats = self.optimize(&mut graph, &mut optimized)?;
        let optimize_time = started.elapsed();
        if self.opts.log_task_lists {
            log_list(&graph, &optimized, "optimized list");
        }

        let order: Vec<TaskId> = optimized.into_iter().flatten().collect();

        let started = Instant::now();
        let plan = find_dependencies(&graph, &order);
        let deps_time = started.elapsed();

        let graph = Arc::new(graph);
        let ids: Vec<JobId> = order.iter().map(|_| JobId::next()).collect();
        let batch: Vec<QueuedJob> = order
            .iter()
            .zip(&ids)
            .zip(&plan.deps)
            .map(|((&task, &id), deps)| QueuedJob {
                id,
                deps: deps.iter().map(|&k| ids[k]).collect(),
                job: Arc::new(GraphJob {
                    graph: Arc::clone(&graph),
                    task,
                }),
            })
            .collect();

        let started = Instant::now();
        let success = if batch.is_empty() {
            true
        } else {
            self.queue.run_batch(batch, params)?
        };
        let run_time = started.elapsed();

        if self.opts.measure {
            tracing::info!(
                optimize_ms = optimize_time.as_secs_f64() * 1000.0,
                find_deps_ms = deps_time.as_secs_f64() * 1000.0,
                run_ms = run_time.as_secs_f64() * 1000.0,
                tasks = order.len(),
                "render measure"
            );
        }
        if !success {
            tracing::debug!("render batch finished with failed tasks");
        }

        Ok(RunReport {
            success,
            input_tasks: list.len(),
            optimized_tasks: order.len(),
            dependency_edges: plan.edges,
            optimizer_steps: stats.steps,
            optimizer_restarts: stats.restarts,
        })
    }
}

/// Adapter running one node of a frozen batch graph on the queue.
struct GraphJob {
    graph: Arc<TaskGraph>,
    task: TaskId,
}

impl Job for GraphJob {
    fn label(&self) -> &str {
        self.graph[self.task].name()
    }

    fn lane(&self) -> Lane {
        self.graph[self.task].lane()
    }

    fn run(&self, ctx: &JobContext<'_>) -> bool {
        let task = TaskContext {
            graph: &self.graph,
            id: self.task,
            params: ctx.params,
            upstream_ok: ctx.upstream_ok,
            worker: ctx.worker,
        };
        self.graph[self.task].kind().run(&task)
    }
}
