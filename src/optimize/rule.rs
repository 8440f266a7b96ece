use bitflags::bitflags;

use crate::foundation::ids::TaskId;
use crate::optimize::category::{Category, CategoryMask};
use crate::task::graph::{TaskGraph, TaskNode};

bitflags! {
    /// Repeat requests a rule can raise after rewriting a task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OptimizeMode: u8 {
        /// Re-apply the current rule set to the replacement before advancing.
        const REPEAT_LAST   = 1 << 0;
        /// Forward the request to the parent level.
        const REPEAT_PARENT = 1 << 1;
        /// Repeat here and at the parent level.
        const REPEAT_BRANCH = Self::REPEAT_LAST.bits() | Self::REPEAT_PARENT.bits();
    }
}

/// Static description of a rule: where it applies and how it interacts with other categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptimizerDescriptor {
    /// Category the rule belongs to.
    pub category: Category,
    /// Rule rewrites the flat task list as a whole.
    pub for_list: bool,
    /// Rule rewrites every task, at any depth.
    pub for_task: bool,
    /// Rule rewrites only the tasks of the list itself (no parent).
    pub for_root_task: bool,
    /// Apply after the children were processed (post-order) instead of before.
    pub deep_first: bool,
    /// Categories whose stability the rule relies on.
    pub depends_from: CategoryMask,
    /// Categories marked affected whenever the rule rewrites its task or the list.
    pub affects: CategoryMask,
}

impl OptimizerDescriptor {
    /// Descriptor that applies nowhere yet.
    pub fn new(category: Category) -> Self {
        Self {
            category,
            for_list: false,
            for_task: false,
            for_root_task: false,
            deep_first: false,
            depends_from: CategoryMask::empty(),
            affects: CategoryMask::empty(),
        }
    }

    /// Apply to the flat list.
    pub fn for_list(mut self) -> Self {
        self.for_list = true;
        self
    }

    /// Apply to every task.
    pub fn for_task(mut self) -> Self {
        self.for_task = true;
        self
    }

    /// Apply to list-level tasks only.
    pub fn for_root_task(mut self) -> Self {
        self.for_root_task = true;
        self
    }

    /// Apply post-order.
    pub fn deep_first(mut self) -> Self {
        self.deep_first = true;
        self
    }

    /// Set the depends-from mask.
    pub fn depends_from(mut self, mask: CategoryMask) -> Self {
        self.depends_from = mask;
        self
    }

    /// Set the affects mask.
    pub fn affects(mut self, mask: CategoryMask) -> Self {
        self.affects = mask;
        self
    }

    /// Whether the rule runs for a task with (or without) a parent.
    pub(crate) fn applies_to_task(&self, has_parent: bool) -> bool {
        self.for_task || (self.for_root_task && !has_parent)
    }
}

/// State handed to a per-task rule.
///
/// The rule reads `task`, and may reassign it: to `None` to drop the task, or to a new node
/// (allocate it in `graph`, never mutate a node in place, it may be shared). A rewrite marks
/// the descriptor's `affects` mask dirty; a rule may OR further categories into `affects` and
/// raise repeat flags in `mode`.
pub struct OptimizerParams<'a> {
    /// Arena of the batch.
    pub graph: &'a mut TaskGraph,
    /// The list under optimization, as it was when the sweep reached the current root.
    pub list: &'a [Option<TaskId>],
    /// Categories whose dirtiness aborts the descent.
    pub depends_from: CategoryMask,
    /// Task under consideration; `None` removes it.
    pub task: Option<TaskId>,
    /// Parent of `task`, `None` at list level.
    pub parent: Option<TaskId>,
    /// Accumulated affected categories.
    pub affects: CategoryMask,
    /// Accumulated repeat requests.
    pub mode: OptimizeMode,
}

impl<'a> OptimizerParams<'a> {
    pub(crate) fn root(
        graph: &'a mut TaskGraph,
        list: &'a [Option<TaskId>],
        depends_from: CategoryMask,
        task: TaskId,
    ) -> Self {
        Self {
            graph,
            list,
            depends_from,
            task: Some(task),
            parent: None,
            affects: CategoryMask::empty(),
            mode: OptimizeMode::empty(),
        }
    }

    /// The node of `task`, if still present.
    pub fn node(&self) -> Option<&TaskNode> {
        self.task.and_then(|id| self.graph.get(id))
    }

    /// Replace the task and record the disturbed categories.
    pub fn replace(&mut self, task: Option<TaskId>, affects: CategoryMask) {
        self.task = task;
        self.affects |= affects;
    }

    pub(crate) fn fork(&mut self) -> OptimizerParams<'_> {
        OptimizerParams {
            graph: &mut *self.graph,
            list: self.list,
            depends_from: self.depends_from,
            task: self.task,
            parent: self.parent,
            affects: self.affects,
            mode: self.mode,
        }
    }

    pub(crate) fn sub(&mut self, task: TaskId) -> OptimizerParams<'_> {
        OptimizerParams {
            graph: &mut *self.graph,
            list: self.list,
            depends_from: self.depends_from,
            task: Some(task),
            parent: self.task,
            affects: CategoryMask::empty(),
            mode: OptimizeMode::empty(),
        }
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.task.is_none() || self.affects.intersects(self.depends_from)
    }
}

/// State handed to a whole-list rule. The rule edits `list` in place; `None` entries are
/// allowed and compacted later.
pub struct ListParams<'a> {
    /// Arena of the batch.
    pub graph: &'a mut TaskGraph,
    /// The list under optimization.
    pub list: &'a mut Vec<Option<TaskId>>,
    /// Categories the current step depends on.
    pub depends_from: CategoryMask,
    /// Affected categories reported by the rule.
    pub affects: CategoryMask,
}

/// A pluggable rewrite rule.
pub trait Optimizer: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Where and when the rule applies.
    fn descriptor(&self) -> OptimizerDescriptor;

    /// Rewrite a single task. Called when the descriptor has `for_task` or `for_root_task`.
    fn run_task(&self, _params: &mut OptimizerParams<'_>) {}

    /// Rewrite the list. Called when the descriptor has `for_list`.
    fn run_list(&self, _params: &mut ListParams<'_>) {}
}
