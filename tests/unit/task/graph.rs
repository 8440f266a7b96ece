use super::*;

struct Noop(&'static str);

impl TaskKind for Noop {
    fn name(&self) -> &str {
        self.0
    }

    fn run(&self, _ctx: &TaskContext<'_>) -> bool {
        true
    }
}

struct Pinned;

impl TaskKind for Pinned {
    fn name(&self) -> &str {
        "pinned"
    }

    fn lane(&self) -> Lane {
        Lane::Dedicated
    }

    fn run(&self, _ctx: &TaskContext<'_>) -> bool {
        true
    }
}

struct Plane {
    w: u32,
    h: u32,
}

impl Buffer for Plane {
    fn name(&self) -> &str {
        "plane"
    }

    fn width(&self) -> u32 {
        self.w
    }

    fn height(&self) -> u32 {
        self.h
    }
}

#[test]
fn buffer_handles_compare_by_identity() {
    let a = BufferHandle::new(Plane { w: 4, h: 4 });
    let b = BufferHandle::new(Plane { w: 4, h: 4 });
    assert_eq!(a, a.clone());
    assert_ne!(a, b);
    assert_eq!(a.downcast_ref::<Plane>().map(|p| p.w), Some(4));
    assert!(format!("{a:?}").starts_with("plane (4x4)"));
}

#[test]
fn overlap_requires_same_buffer_and_intersecting_rects() {
    let x = BufferHandle::new(Plane { w: 16, h: 16 });
    let y = BufferHandle::new(Plane { w: 16, h: 16 });
    let a = TaskNode::new(Noop("a")).with_target(x.clone(), RectI::new(0, 0, 10, 10));
    let b = TaskNode::new(Noop("b")).with_target(x.clone(), RectI::new(5, 5, 15, 15));
    let c = TaskNode::new(Noop("c")).with_target(y, RectI::new(0, 0, 10, 10));
    let d = TaskNode::new(Noop("d"));
    assert!(a.overlaps(&b));
    assert!(!a.overlaps(&c));
    assert!(!a.overlaps(&d));
    assert!(!d.overlaps(&d.clone()));
}

#[test]
fn clone_task_is_copy_on_write() {
    let mut g = TaskGraph::new();
    let leaf = g.insert(TaskNode::new(Noop("leaf")));
    let parent = g.insert(TaskNode::new(Noop("parent")).with_sub_tasks([leaf]));
    let copy = g.clone_task(parent);
    g[copy].sub_tasks[0] = None;

    assert_ne!(copy, parent);
    assert_eq!(g[parent].sub_tasks.as_slice(), &[Some(leaf)]);
    assert_eq!(g[copy].sub_tasks.as_slice(), &[None]);
    assert!(Arc::ptr_eq(g[copy].kind(), g[parent].kind()));
    assert_eq!(g.len(), 3);
}

#[test]
fn kind_downcast_and_lane() {
    let node = TaskNode::new(Pinned);
    assert!(node.kind_as::<Pinned>().is_some());
    assert!(node.kind_as::<Noop>().is_none());
    assert_eq!(node.lane(), Lane::Dedicated);
    assert_eq!(TaskNode::new(Noop("n")).lane(), Lane::Shared);
}

#[test]
fn check_tree_accepts_shared_subtrees_and_rejects_cycles() {
    let mut g = TaskGraph::new();
    let leaf = g.insert(TaskNode::new(Noop("leaf")));
    let a = g.insert(TaskNode::new(Noop("a")).with_sub_tasks([leaf]));
    let b = g.insert(TaskNode::new(Noop("b")).with_sub_tasks([leaf, a]));
    assert!(g.check_tree(&[a, b]).is_ok());

    g[leaf].sub_tasks.push(Some(b));
    let err = g.check_tree(&[b]).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn check_tree_rejects_foreign_ids() {
    let mut other = TaskGraph::new();
    other.insert(TaskNode::new(Noop("x")));
    let foreign = other.insert(TaskNode::new(Noop("y")));

    let g = TaskGraph::new();
    assert!(g.check_tree(&[foreign]).is_err());
}

#[test]
fn run_params_downcast() {
    let p = RunParams::with_data(7u32);
    assert_eq!(p.get::<u32>(), Some(&7));
    assert_eq!(p.get::<i64>(), None);
    assert_eq!(RunParams::default().get::<u32>(), None);
}

#[test]
fn task_context_lists_live_sub_tasks() {
    let mut g = TaskGraph::new();
    let a = g.insert(TaskNode::new(Noop("a")));
    let b = g.insert(TaskNode::new(Noop("b")));
    let root = g.insert(TaskNode::new(Noop("root")).with_sub_tasks([a, b]));
    g[root].sub_tasks.insert(1, None);

    let params = RunParams::default();
    let ctx = TaskContext {
        graph: &g,
        id: root,
        params: &params,
        upstream_ok: true,
        worker: 0,
    };
    let subs: Vec<&TaskNode> = ctx.sub_tasks().collect();
    let names: Vec<&str> = subs.iter().map(|n| n.name()).collect();
    assert_eq!(names, ["a", "b"]);
}
