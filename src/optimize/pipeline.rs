use std::sync::Arc;

use crate::foundation::config::from_json_str;
use crate::foundation::error::{RasterflowError, RasterflowResult};
use crate::foundation::ids::TaskId;
use crate::optimize::category::{Category, CategoryMask};
use crate::optimize::rule::{ListParams, OptimizeMode, Optimizer, OptimizerParams};
use crate::task::dump::log_list;
use crate::task::graph::TaskGraph;

/// Options of the optimizer fixpoint loop.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OptimizerOpts {
    /// Upper bound on loop steps (category steps, restarts and repeats) before the sweep is
    /// declared non-terminating.
    pub max_steps: usize,
    /// Dump the list before each optimization step.
    pub log_steps: bool,
}

impl Default for OptimizerOpts {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            log_steps: false,
        }
    }
}

impl OptimizerOpts {
    /// Parse from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> RasterflowResult<Self> {
        from_json_str("optimizer options", json)
    }
}

/// Counters of one [`OptimizerSet::optimize`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    /// Loop steps taken.
    pub steps: usize,
    /// Sweeps restarted from the first category.
    pub restarts: usize,
}

struct Budget {
    steps: usize,
    max: usize,
}

impl Budget {
    fn spend(&mut self) -> RasterflowResult<()> {
        self.steps += 1;
        if self.steps > self.max {
            tracing::error!(
                max_steps = self.max,
                "optimizer did not reach a fixpoint, a rule misreports its affected categories"
            );
            return Err(RasterflowError::optimizer(format!(
                "no fixpoint after {} steps",
                self.max
            )));
        }
        Ok(())
    }
}

/// Per-category ordered rule registry plus the rewrite driver.
#[derive(Clone, Default)]
pub struct OptimizerSet {
    by_category: [Vec<Arc<dyn Optimizer>>; Category::COUNT],
}

fn same_rule(a: &Arc<dyn Optimizer>, b: &Arc<dyn Optimizer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl OptimizerSet {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules of `category`, in application order.
    pub fn optimizers(&self, category: Category) -> &[Arc<dyn Optimizer>] {
        &self.by_category[category.index()]
    }

    /// Return `true` when this exact rule instance is registered.
    pub fn is_registered(&self, optimizer: &Arc<dyn Optimizer>) -> bool {
        let category = optimizer.descriptor().category;
        self.by_category[category.index()]
            .iter()
            .any(|o| same_rule(o, optimizer))
    }

    /// Append a rule to its category.
    ///
    /// Registering the same instance twice, or a rule that depends on a later category, is a
    /// contract violation.
    pub fn register(&mut self, optimizer: Arc<dyn Optimizer>) -> RasterflowResult<()> {
        let d = optimizer.descriptor();
        if self.is_registered(&optimizer) {
            tracing::error!(rule = optimizer.name(), "optimizer already registered");
            return Err(RasterflowError::registry(format!(
                "optimizer '{}' already registered",
                optimizer.name()
            )));
        }
        let allowed = d.category.below() | d.category.mask();
        if !allowed.contains(d.depends_from) {
            tracing::error!(
                rule = optimizer.name(),
                "optimizer depends on a category that runs after its own"
            );
            return Err(RasterflowError::validation(format!(
                "optimizer '{}' in {:?} depends on later categories {:?}",
                optimizer.name(),
                d.category,
                d.depends_from - allowed
            )));
        }
        self.by_category[d.category.index()].push(optimizer);
        Ok(())
    }

    /// Remove every registration of this rule instance.
    pub fn unregister(&mut self, optimizer: &Arc<dyn Optimizer>) {
        let category = optimizer.descriptor().category;
        self.by_category[category.index()].retain(|o| !same_rule(o, optimizer));
    }

    /// Rewrite `list` (and the task trees it references) until no category is dirty, then drop
    /// `None` entries.
    #[tracing::instrument(level = "debug", skip_all, fields(tasks = list.len()))]
    pub fn optimize(
        &self,
        graph: &mut TaskGraph,
        list: &mut Vec<Option<TaskId>>,
        opts: &OptimizerOpts,
    ) -> RasterflowResult<OptimizeStats> {
        let mut budget = Budget {
            steps: 0,
            max: opts.max_steps,
        };
        let mut restarts = 0usize;

        let mut category_id = 0usize;
        let mut rule_index = 0usize;
        let mut current_affected = CategoryMask::empty();
        let mut to_process = CategoryMask::all();

        while !to_process.is_empty() {
            budget.spend()?;

            let Some(category) = Category::from_index(category_id) else {
                category_id = 0;
                rule_index = 0;
                current_affected = CategoryMask::empty();
                continue;
            };

            if !to_process.contains(category.mask()) {
                category_id += 1;
                rule_index = 0;
                current_affected = CategoryMask::empty();
                continue;
            }

            let registered = &self.by_category[category_id];
            if rule_index >= registered.len() {
                to_process.remove(category.mask());
                to_process |= current_affected;
                category_id += 1;
                rule_index = 0;
                current_affected = CategoryMask::empty();
                continue;
            }

            let current: &[Arc<dyn Optimizer>] = if category.simultaneous() {
                registered
            } else {
                let rule = &registered[rule_index];
                let depends_from_self = rule.descriptor().depends_from & category.mask();
                if current_affected.intersects(depends_from_self) {
                    tracing::trace!(
                        ?category,
                        rule = rule.name(),
                        "self dependency dirty, restart"
                    );
                    restarts += 1;
                    category_id = 0;
                    rule_index = 0;
                    current_affected = CategoryMask::empty();
                    continue;
                }
                std::slice::from_ref(rule)
            };

            let mut depends_from = CategoryMask::empty();
            let mut for_list = false;
            let mut for_task = false;
            let mut for_root_task = false;
            for rule in current {
                let d = rule.descriptor();
                depends_from |= category.below() & d.depends_from;
                for_list |= d.for_list;
                for_task |= d.for_task;
                for_root_task |= d.for_root_task;
            }

            if opts.log_steps {
                log_list(
                    graph,
                    list,
                    &format!("before optimize category {category_id} index {rule_index}"),
                );
            }

            if for_list {
                for rule in current {
                    if to_process.intersects(depends_from) {
                        break;
                    }
                    if !rule.descriptor().for_list {
                        continue;
                    }
                    let before = list.clone();
                    let mut params = ListParams {
                        graph: &mut *graph,
                        list: &mut *list,
                        depends_from,
                        affects: CategoryMask::empty(),
                    };
                    rule.run_list(&mut params);
                    let mut affects = params.affects;
                    if *list != before {
                        affects |= rule.descriptor().affects;
                    }
                    current_affected |= affects;
                    to_process |= current_affected;
                }
            }

            if for_task || for_root_task {
                let mut j = 0usize;
                while !to_process.intersects(depends_from) && j < list.len() {
                    let Some(task) = list[j] else {
                        list.remove(j);
                        continue;
                    };
                    let (replacement, affects, mode) = {
                        let mut params =
                            OptimizerParams::root(&mut *graph, list.as_slice(), depends_from, task);
                        self.optimize_recursive(current, &mut params, !for_task, &mut budget)?;
                        (params.task, params.affects, params.mode)
                    };
                    match replacement {
                        Some(new_task) if new_task == task => j += 1,
                        Some(new_task) => {
                            list[j] = Some(new_task);
                            if mode.contains(OptimizeMode::REPEAT_LAST) {
                                budget.spend()?;
                            } else {
                                j += 1;
                            }
                        }
                        None => {
                            list.remove(j);
                        }
                    }
                    current_affected |= affects;
                    to_process |= current_affected;
                }
            }

            if to_process.intersects(depends_from) {
                tracing::trace!(
                    ?category,
                    dirty = ?(to_process & depends_from),
                    "upstream category dirty, restart"
                );
                restarts += 1;
                category_id = 0;
                rule_index = 0;
                current_affected = CategoryMask::empty();
                continue;
            }

            rule_index += current.len();
        }

        list.retain(Option::is_some);

        Ok(OptimizeStats {
            steps: budget.steps,
            restarts,
        })
    }

    fn optimize_recursive(
        &self,
        rules: &[Arc<dyn Optimizer>],
        params: &mut OptimizerParams<'_>,
        first_level_only: bool,
        budget: &mut Budget,
    ) -> RasterflowResult<()> {
        if params.is_stale() {
            return Ok(());
        }

        if !apply_rules(rules, params, false) {
            return Ok(());
        }

        if !first_level_only {
            let mut cloned = false;
            let mut i = 0usize;
            loop {
                let Some(current) = params.task else {
                    return Ok(());
                };
                let Some(&slot) = params.graph[current].sub_tasks.get(i) else {
                    break;
                };
                let Some(child) = slot else {
                    i += 1;
                    continue;
                };

                let (sub_task, sub_affects, sub_mode) = {
                    let mut sub = params.sub(child);
                    self.optimize_recursive(rules, &mut sub, false, budget)?;
                    (sub.task, sub.affects, sub.mode)
                };

                if sub_task == Some(child) {
                    i += 1;
                } else {
                    let parent = if cloned {
                        current
                    } else {
                        cloned = true;
                        let copy = params.graph.clone_task(current);
                        params.task = Some(copy);
                        copy
                    };
                    params.graph[parent].sub_tasks[i] = sub_task;
                    if sub_mode.contains(OptimizeMode::REPEAT_LAST) {
                        budget.spend()?;
                    } else {
                        i += 1;
                    }
                }

                params.affects |= sub_affects;
                if sub_mode.contains(OptimizeMode::REPEAT_PARENT) {
                    params.mode |= sub_mode;
                }
                if params.affects.intersects(params.depends_from) {
                    return Ok(());
                }
            }
        }

        apply_rules(rules, params, true);
        Ok(())
    }
}

/// Run the pre-order (`deep_first == false`) or post-order rules of `rules` on `params.task`.
/// Returns `false` once the task is gone or a gated category became dirty.
fn apply_rules(
    rules: &[Arc<dyn Optimizer>],
    params: &mut OptimizerParams<'_>,
    deep_first: bool,
) -> bool {
    for rule in rules {
        let d = rule.descriptor();
        if d.deep_first != deep_first || !d.applies_to_task(params.parent.is_some()) {
            continue;
        }
        let (task, affects, mode) = {
            let mut p = params.fork();
            rule.run_task(&mut p);
            (p.task, p.affects, p.mode)
        };
        if task != params.task {
            params.affects |= d.affects;
        }
        params.task = task;
        params.affects |= affects;
        params.mode |= mode;
        if params.is_stale() {
            return false;
        }
    }
    true
}

#[cfg(test)]
#[path = "../../tests/unit/optimize/pipeline.rs"]
mod tests;
