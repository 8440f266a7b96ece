//! Dependency derivation for a linearized task list.
//!
//! Two list entries conflict when they touch overlapping pixels of the same buffer and at least
//! one of them writes: write/write on the targets, read/write when one entry's sub-tasks read
//! what the other writes. A later entry must wait for every earlier entry it conflicts with,
//! but an edge is only recorded when the ordering is not already implied by the edges chosen
//! before it. A task overlapping two earlier tasks that do not overlap each other waits for
//! both.

use smallvec::SmallVec;

use crate::foundation::ids::TaskId;
use crate::task::graph::{TaskGraph, TaskNode};

/// Per-entry predecessor indices into the analyzed list.
pub(crate) type Deps = SmallVec<[usize; 4]>;

/// Result of [`find_dependencies`].
#[derive(Debug, Default)]
pub(crate) struct DependencyPlan {
    /// `deps[i]` holds indices `< i` that entry `i` must wait for.
    pub deps: Vec<Deps>,
    /// Total number of recorded edges.
    pub edges: usize,
}

fn reads<'g>(graph: &'g TaskGraph, node: &'g TaskNode) -> impl Iterator<Item = &'g TaskNode> {
    node.sub_tasks.iter().flatten().map(move |&id| &graph[id])
}

fn conflicts(graph: &TaskGraph, earlier: &TaskNode, later: &TaskNode) -> bool {
    later.overlaps(earlier)
        || reads(graph, later).any(|r| r.overlaps(earlier))
        || reads(graph, earlier).any(|r| later.overlaps(r))
}

/// Compute the dependency edges of `list`, in list order.
pub(crate) fn find_dependencies(graph: &TaskGraph, list: &[TaskId]) -> DependencyPlan {
    let mut plan = DependencyPlan {
        deps: Vec::with_capacity(list.len()),
        edges: 0,
    };
    // reached[k] == i: entry k is already ordered before entry i.
    let mut reached = vec![usize::MAX; list.len()];
    let mut stack: Vec<usize> = Vec::new();

    for (i, &task) in list.iter().enumerate() {
        let node = &graph[task];
        let mut deps = Deps::new();
        if node.target.is_some() || !node.sub_tasks.is_empty() {
            for k in (0..i).rev() {
                if reached[k] == i || !conflicts(graph, &graph[list[k]], node) {
                    continue;
                }
                deps.push(k);
                stack.push(k);
                while let Some(x) = stack.pop() {
                    if reached[x] == i {
                        continue;
                    }
                    reached[x] = i;
                    stack.extend(plan.deps[x].iter().copied());
                }
            }
        }
        plan.edges += deps.len();
        plan.deps.push(deps);
    }
    plan
}
