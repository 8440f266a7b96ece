use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::optimize::rule::OptimizerDescriptor;
use crate::task::graph::{TaskContext, TaskKind, TaskNode};

struct Label(&'static str);

impl TaskKind for Label {
    fn name(&self) -> &str {
        self.0
    }

    fn run(&self, _ctx: &TaskContext<'_>) -> bool {
        true
    }
}

type TaskFn = dyn Fn(&mut OptimizerParams<'_>) + Send + Sync;
type ListFn = dyn Fn(&mut ListParams<'_>) + Send + Sync;

struct Rule {
    name: &'static str,
    descriptor: OptimizerDescriptor,
    calls: AtomicUsize,
    task_fn: Option<Box<TaskFn>>,
    list_fn: Option<Box<ListFn>>,
}

impl Rule {
    fn task(
        name: &'static str,
        descriptor: OptimizerDescriptor,
        f: impl Fn(&mut OptimizerParams<'_>) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            descriptor,
            calls: AtomicUsize::new(0),
            task_fn: Some(Box::new(f)),
            list_fn: None,
        })
    }

    fn list(
        name: &'static str,
        descriptor: OptimizerDescriptor,
        f: impl Fn(&mut ListParams<'_>) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            descriptor,
            calls: AtomicUsize::new(0),
            task_fn: None,
            list_fn: Some(Box::new(f)),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Optimizer for Rule {
    fn name(&self) -> &str {
        self.name
    }

    fn descriptor(&self) -> OptimizerDescriptor {
        self.descriptor
    }

    fn run_task(&self, params: &mut OptimizerParams<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(f) = &self.task_fn {
            f(params);
        }
    }

    fn run_list(&self, params: &mut ListParams<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(f) = &self.list_fn {
            f(params);
        }
    }
}

fn name_of(params: &OptimizerParams<'_>) -> &'static str {
    match params.node().map(TaskNode::name) {
        Some("raw") => "raw",
        Some("norm") => "norm",
        Some("special") => "special",
        Some("empty") => "empty",
        Some("wrap") => "wrap",
        Some("leaf") => "leaf",
        Some("group") => "group",
        _ => "other",
    }
}

/// Rebuild the current node with another label, keeping target and children.
fn relabel(params: &mut OptimizerParams<'_>, label: &'static str, affects: CategoryMask) {
    let Some(id) = params.task else {
        return;
    };
    let old = params.graph[id].clone();
    let mut node = TaskNode::new(Label(label));
    node.target = old.target;
    node.target_rect = old.target_rect;
    node.bounds = old.bounds;
    node.sub_tasks = old.sub_tasks;
    let new_id = params.graph.insert(node);
    params.replace(Some(new_id), affects);
}

fn names(graph: &TaskGraph, list: &[Option<TaskId>]) -> Vec<String> {
    list.iter()
        .map(|t| t.map_or("NULL".to_string(), |id| graph[id].name().to_string()))
        .collect()
}

#[test]
fn empty_registry_only_compacts() {
    let mut g = TaskGraph::new();
    let a = g.insert(TaskNode::new(Label("leaf")));
    let mut list = vec![None, Some(a), None];
    let stats = OptimizerSet::new()
        .optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(list, vec![Some(a)]);
    assert_eq!(stats.restarts, 0);
    assert_eq!(g.len(), 1);
}

#[test]
fn removing_a_child_clones_the_parent_once() {
    let mut g = TaskGraph::new();
    let e1 = g.insert(TaskNode::new(Label("empty")));
    let leaf = g.insert(TaskNode::new(Label("leaf")));
    let e2 = g.insert(TaskNode::new(Label("empty")));
    let group = g.insert(TaskNode::new(Label("group")).with_sub_tasks([e1, leaf, e2]));

    let mut set = OptimizerSet::new();
    set.register(Rule::task(
        "drop-empty",
        OptimizerDescriptor::new(Category::Common).for_task(),
        |p| {
            if name_of(p) == "empty" {
                p.replace(None, CategoryMask::empty());
            }
        },
    ))
    .unwrap();

    let before = g.len();
    let mut list = vec![Some(group)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();

    let new_group = list[0].unwrap();
    assert_ne!(new_group, group);
    assert_eq!(g.len(), before + 1, "parent cloned exactly once");
    assert_eq!(g[new_group].sub_tasks.as_slice(), &[None, Some(leaf), None]);
    assert_eq!(
        g[group].sub_tasks.as_slice(),
        &[Some(e1), Some(leaf), Some(e2)],
        "original parent untouched"
    );
}

#[test]
fn removed_root_disappears_from_list() {
    let mut g = TaskGraph::new();
    let a = g.insert(TaskNode::new(Label("empty")));
    let b = g.insert(TaskNode::new(Label("leaf")));
    let mut set = OptimizerSet::new();
    set.register(Rule::task(
        "drop-empty",
        OptimizerDescriptor::new(Category::Common).for_root_task(),
        |p| {
            if name_of(p) == "empty" {
                p.replace(None, CategoryMask::empty());
            }
        },
    ))
    .unwrap();

    let mut list = vec![Some(a), Some(b)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(list, vec![Some(b)]);
}

#[test]
fn root_only_rules_do_not_descend() {
    let mut g = TaskGraph::new();
    let leaf = g.insert(TaskNode::new(Label("leaf")));
    let group = g.insert(TaskNode::new(Label("group")).with_sub_tasks([leaf]));
    let other = g.insert(TaskNode::new(Label("leaf")));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_rule = Arc::clone(&seen);
    let rule = Rule::task(
        "roots",
        OptimizerDescriptor::new(Category::Common).for_root_task(),
        move |p| {
            seen_in_rule
                .lock()
                .unwrap()
                .push((p.task.unwrap(), p.parent.is_none()));
        },
    );
    let mut set = OptimizerSet::new();
    set.register(rule.clone()).unwrap();

    let mut list = vec![Some(group), Some(other)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(group, true), (other, true)]);
    assert_eq!(rule.calls(), 2);
}

#[test]
fn pre_order_and_post_order_visit_orders() {
    let mut g = TaskGraph::new();
    let leaf = g.insert(TaskNode::new(Label("leaf")));
    let group = g.insert(TaskNode::new(Label("group")).with_sub_tasks([leaf]));

    let order = Arc::new(Mutex::new(Vec::new()));
    let pre_order = Arc::clone(&order);
    let post_order = Arc::clone(&order);
    let mut set = OptimizerSet::new();
    set.register(Rule::task(
        "pre",
        OptimizerDescriptor::new(Category::Common).for_task(),
        move |p| pre_order.lock().unwrap().push(format!("pre:{}", name_of(p))),
    ))
    .unwrap();
    set.register(Rule::task(
        "post",
        OptimizerDescriptor::new(Category::Common)
            .for_task()
            .deep_first(),
        move |p| post_order.lock().unwrap().push(format!("post:{}", name_of(p))),
    ))
    .unwrap();

    let mut list = vec![Some(group)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["pre:group", "pre:leaf", "post:leaf", "post:group"]
    );
}

#[test]
fn repeat_last_applies_rule_to_its_own_output() {
    let mut g = TaskGraph::new();
    let leaf = g.insert(TaskNode::new(Label("leaf")));
    let w1 = g.insert(TaskNode::new(Label("wrap")).with_sub_tasks([leaf]));
    let w2 = g.insert(TaskNode::new(Label("wrap")).with_sub_tasks([w1]));
    let w3 = g.insert(TaskNode::new(Label("wrap")).with_sub_tasks([w2]));

    let rule = Rule::task(
        "unwrap",
        OptimizerDescriptor::new(Category::Common).for_root_task(),
        |p| {
            if name_of(p) == "wrap" {
                let inner = p.node().and_then(|n| n.sub_tasks.first().copied().flatten());
                p.replace(inner, CategoryMask::empty());
                p.mode |= OptimizeMode::REPEAT_LAST;
            }
        },
    );
    let mut set = OptimizerSet::new();
    set.register(rule.clone()).unwrap();

    let mut list = vec![Some(w3)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(list, vec![Some(leaf)]);
    // three unwraps plus the final no-op visit of the leaf
    assert_eq!(rule.calls(), 4);
}

#[test]
fn repeat_parent_propagates_to_parent_level() {
    let mut g = TaskGraph::new();
    let raw = g.insert(TaskNode::new(Label("raw")));
    let group = g.insert(TaskNode::new(Label("group")).with_sub_tasks([raw]));

    let parent_modes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&parent_modes);
    let mut set = OptimizerSet::new();
    set.register(Rule::task(
        "norm-branch",
        OptimizerDescriptor::new(Category::Common).for_task(),
        |p| {
            if name_of(p) == "raw" {
                relabel(p, "norm", CategoryMask::empty());
                p.mode |= OptimizeMode::REPEAT_BRANCH;
            }
        },
    ))
    .unwrap();
    set.register(Rule::task(
        "observe",
        OptimizerDescriptor::new(Category::Common)
            .for_task()
            .deep_first(),
        move |p| {
            if name_of(p) == "group" {
                seen.lock().unwrap().push(p.mode);
            }
        },
    ))
    .unwrap();

    let mut list = vec![Some(group)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    let modes = parent_modes.lock().unwrap();
    assert!(modes.iter().any(|m| m.contains(OptimizeMode::REPEAT_PARENT)));
    let child = g[list[0].unwrap()].sub_tasks[0].unwrap();
    assert_eq!(g[child].name(), "norm");
}

#[test]
fn upstream_dirt_restarts_and_reruns_dependents() {
    // Common: raw -> norm (disturbs Specialize)
    // Specialize: norm -> special, relies on Common
    // PostSpecialize: on the first visit, appends a raw child (disturbs Common)
    let mut g = TaskGraph::new();
    let root = g.insert(TaskNode::new(Label("raw")));

    let normalize = Rule::task(
        "normalize",
        OptimizerDescriptor::new(Category::Common)
            .for_task()
            .affects(CategoryMask::SPECIALIZE),
        |p| {
            if name_of(p) == "raw" {
                relabel(p, "norm", CategoryMask::SPECIALIZE);
            }
        },
    );
    let specialize = Rule::task(
        "specialize",
        OptimizerDescriptor::new(Category::Specialize)
            .for_task()
            .depends_from(CategoryMask::COMMON),
        |p| {
            if name_of(p) == "norm" {
                relabel(p, "special", CategoryMask::empty());
            }
        },
    );
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_rule = Arc::clone(&fired);
    let grow = Rule::task(
        "grow",
        OptimizerDescriptor::new(Category::PostSpecialize)
            .for_root_task()
            .affects(CategoryMask::COMMON),
        move |p| {
            if fired_in_rule.fetch_add(1, Ordering::SeqCst) > 0 {
                return;
            }
            let Some(id) = p.task else {
                return;
            };
            let child = p.graph.insert(TaskNode::new(Label("raw")));
            let copy = p.graph.clone_task(id);
            p.graph[copy].sub_tasks.push(Some(child));
            p.replace(Some(copy), CategoryMask::COMMON);
        },
    );

    let mut set = OptimizerSet::new();
    set.register(normalize.clone()).unwrap();
    set.register(specialize.clone()).unwrap();
    set.register(grow.clone()).unwrap();

    let mut list = vec![Some(root)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();

    let out = list[0].unwrap();
    assert_eq!(g[out].name(), "special");
    let child = g[out].sub_tasks[0].unwrap();
    assert_eq!(g[child].name(), "special");
    assert!(normalize.calls() >= 2);
    assert!(specialize.calls() >= 2, "specialize must run again");
}

#[test]
fn declared_affects_mask_marks_rewrites_dirty() {
    let mut g = TaskGraph::new();
    let root = g.insert(TaskNode::new(Label("group")));

    let normalize = Rule::task(
        "normalize",
        OptimizerDescriptor::new(Category::Common).for_task(),
        |p| {
            if name_of(p) == "raw" {
                relabel(p, "norm", CategoryMask::empty());
            }
        },
    );
    // Reports nothing through params; only the descriptor names Common.
    let grow = Rule::task(
        "grow",
        OptimizerDescriptor::new(Category::PostSpecialize)
            .for_root_task()
            .affects(CategoryMask::COMMON),
        |p| {
            let Some(id) = p.task else {
                return;
            };
            if !p.graph[id].sub_tasks.is_empty() {
                return;
            }
            let child = p.graph.insert(TaskNode::new(Label("raw")));
            let copy = p.graph.clone_task(id);
            p.graph[copy].sub_tasks.push(Some(child));
            p.task = Some(copy);
        },
    );

    let mut set = OptimizerSet::new();
    set.register(normalize.clone()).unwrap();
    set.register(grow).unwrap();

    let mut list = vec![Some(root)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();

    let child = g[list[0].unwrap()].sub_tasks[0].unwrap();
    assert_eq!(g[child].name(), "norm");
    assert!(normalize.calls() >= 2);
}

#[test]
fn declared_affects_mask_applies_to_list_rewrites() {
    let mut g = TaskGraph::new();
    let leaf = g.insert(TaskNode::new(Label("leaf")));

    let normalize = Rule::task(
        "normalize",
        OptimizerDescriptor::new(Category::Common).for_task(),
        |p| {
            if name_of(p) == "raw" {
                relabel(p, "norm", CategoryMask::empty());
            }
        },
    );
    let append = Rule::list(
        "append-raw",
        OptimizerDescriptor::new(Category::Linear)
            .for_list()
            .affects(CategoryMask::COMMON),
        |p| {
            if p.list.len() == 1 {
                let raw = p.graph.insert(TaskNode::new(Label("raw")));
                p.list.push(Some(raw));
            }
        },
    );
    // Rewrites nothing, so its declared mask must not keep the sweep going.
    let idle = Rule::list(
        "idle",
        OptimizerDescriptor::new(Category::List)
            .for_list()
            .affects(CategoryMask::all()),
        |_| {},
    );

    let mut set = OptimizerSet::new();
    set.register(normalize).unwrap();
    set.register(append).unwrap();
    set.register(idle).unwrap();

    let mut list = vec![Some(leaf)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(names(&g, &list), ["leaf", "norm"]);
}

#[test]
fn dirty_gate_short_circuits_list_rules() {
    let mut g = TaskGraph::new();
    let a = g.insert(TaskNode::new(Label("leaf")));

    // Common reports itself dirty once; Linear's list rule depends on Common and must not run
    // before Common settles.
    let once = Arc::new(AtomicUsize::new(0));
    let once_in_rule = Arc::clone(&once);
    let common = Rule::list(
        "common-once",
        OptimizerDescriptor::new(Category::Common).for_list(),
        move |p| {
            if once_in_rule.fetch_add(1, Ordering::SeqCst) == 0 {
                p.affects |= CategoryMask::COMMON;
            }
        },
    );
    let linear_saw_clean = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&once);
    let saw = Arc::clone(&linear_saw_clean);
    let linear = Rule::list(
        "linear",
        OptimizerDescriptor::new(Category::Linear)
            .for_list()
            .depends_from(CategoryMask::COMMON),
        move |_p| {
            if probe.load(Ordering::SeqCst) >= 2 {
                saw.fetch_add(1, Ordering::SeqCst);
            }
        },
    );
    let mut set = OptimizerSet::new();
    set.register(common.clone()).unwrap();
    set.register(linear.clone()).unwrap();

    let mut list = vec![Some(a)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(common.calls(), 2);
    assert_eq!(linear.calls(), 1);
    assert_eq!(linear_saw_clean.load(Ordering::SeqCst), 1);
}

#[test]
fn sequential_self_dependency_restarts_sweep() {
    let mut g = TaskGraph::new();
    let a = g.insert(TaskNode::new(Label("raw")));

    // Two sequential Convert rules; the second relies on Convert itself being stable.
    let first = Rule::task(
        "first",
        OptimizerDescriptor::new(Category::Convert).for_task(),
        |p| {
            if name_of(p) == "raw" {
                relabel(p, "norm", CategoryMask::CONVERT);
            }
        },
    );
    let second = Rule::task(
        "second",
        OptimizerDescriptor::new(Category::Convert)
            .for_task()
            .depends_from(CategoryMask::CONVERT),
        |p| {
            if name_of(p) == "norm" {
                relabel(p, "special", CategoryMask::empty());
            }
        },
    );
    let mut set = OptimizerSet::new();
    set.register(first.clone()).unwrap();
    set.register(second.clone()).unwrap();

    let mut list = vec![Some(a)];
    let stats = set
        .optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(g[list[0].unwrap()].name(), "special");
    assert!(stats.restarts >= 1);
}

#[test]
fn misreporting_rule_hits_step_bound() {
    let mut g = TaskGraph::new();
    let a = g.insert(TaskNode::new(Label("leaf")));
    let mut set = OptimizerSet::new();
    set.register(Rule::task(
        "always-dirty",
        OptimizerDescriptor::new(Category::Common).for_task(),
        |p| p.affects |= CategoryMask::COMMON,
    ))
    .unwrap();

    let opts = OptimizerOpts {
        max_steps: 500,
        ..OptimizerOpts::default()
    };
    let mut list = vec![Some(a)];
    let err = set.optimize(&mut g, &mut list, &opts).unwrap_err();
    assert!(matches!(err, RasterflowError::Optimizer(_)));
}

#[test]
fn second_run_is_a_noop() {
    let mut g = TaskGraph::new();
    let e = g.insert(TaskNode::new(Label("empty")));
    let raw = g.insert(TaskNode::new(Label("raw")));
    let group = g.insert(TaskNode::new(Label("group")).with_sub_tasks([e, raw]));

    let mut set = OptimizerSet::new();
    set.register(Rule::task(
        "drop-empty",
        OptimizerDescriptor::new(Category::Common).for_task(),
        |p| {
            if name_of(p) == "empty" {
                p.replace(None, CategoryMask::empty());
            }
        },
    ))
    .unwrap();
    set.register(Rule::task(
        "normalize",
        OptimizerDescriptor::new(Category::Common).for_task(),
        |p| {
            if name_of(p) == "raw" {
                relabel(p, "norm", CategoryMask::empty());
            }
        },
    ))
    .unwrap();

    let mut list = vec![Some(group), None];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    let first = list.clone();
    let allocated = g.len();

    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(list, first);
    assert_eq!(g.len(), allocated, "no rewrite on an optimized list");
    assert_eq!(names(&g, &list), vec!["group"]);
}

#[test]
fn list_rules_may_leave_holes() {
    let mut g = TaskGraph::new();
    let a = g.insert(TaskNode::new(Label("leaf")));
    let b = g.insert(TaskNode::new(Label("leaf")));
    let mut set = OptimizerSet::new();
    set.register(Rule::list(
        "drop-first",
        OptimizerDescriptor::new(Category::List).for_list(),
        |p| {
            if let Some(first) = p.list.first_mut() {
                *first = None;
            }
        },
    ))
    .unwrap();

    let mut list = vec![Some(a), Some(b)];
    set.optimize(&mut g, &mut list, &OptimizerOpts::default())
        .unwrap();
    assert_eq!(list, vec![Some(b)]);
}

#[test]
fn registration_contract() {
    let rule: Arc<dyn Optimizer> = Rule::task(
        "r",
        OptimizerDescriptor::new(Category::Specialize).for_task(),
        |_| {},
    );
    let mut set = OptimizerSet::new();
    set.register(Arc::clone(&rule)).unwrap();
    assert!(set.is_registered(&rule));
    assert!(matches!(
        set.register(Arc::clone(&rule)),
        Err(RasterflowError::Registry(_))
    ));
    assert_eq!(set.optimizers(Category::Specialize).len(), 1);

    set.unregister(&rule);
    assert!(!set.is_registered(&rule));
    assert!(set.optimizers(Category::Specialize).is_empty());

    let backwards: Arc<dyn Optimizer> = Rule::task(
        "backwards",
        OptimizerDescriptor::new(Category::Common)
            .for_task()
            .depends_from(CategoryMask::LIST),
        |_| {},
    );
    assert!(matches!(
        set.register(backwards),
        Err(RasterflowError::Validation(_))
    ));
}
