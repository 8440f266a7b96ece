use std::any::Any;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::foundation::core::{Rect, RectI};
use crate::foundation::error::{RasterflowError, RasterflowResult};
use crate::foundation::ids::TaskId;

/// Worker partition a task must run on.
///
/// `Dedicated` work (e.g. anything bound to a GPU context) is only ever picked up by the single
/// dedicated worker, and ordinary work never lands there.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Lane {
    /// Ordinary work, spread over the shared workers.
    #[default]
    Shared,
    /// Work pinned to the dedicated worker.
    Dedicated,
}

/// Upcast helper so task kinds and buffers can be inspected by concrete type.
pub trait AsAny {
    /// `self` as [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Output buffer written by tasks. The scheduler never touches pixels; it only compares handles.
pub trait Buffer: AsAny + Send + Sync {
    /// Short human-readable name used in task dumps.
    fn name(&self) -> &str {
        "buffer"
    }

    /// Width in pixels.
    fn width(&self) -> u32;

    /// Height in pixels.
    fn height(&self) -> u32;
}

/// Shared handle to a [`Buffer`]. Two handles are equal iff they point to the same buffer.
#[derive(Clone)]
pub struct BufferHandle(Arc<dyn Buffer>);

impl BufferHandle {
    /// Wrap a buffer in a fresh handle.
    pub fn new(buffer: impl Buffer + 'static) -> Self {
        Self(Arc::new(buffer))
    }

    /// Wrap an already shared buffer.
    pub fn from_arc(buffer: Arc<dyn Buffer>) -> Self {
        Self(buffer)
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &dyn Buffer {
        self.0.as_ref()
    }

    /// Downcast the underlying buffer.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.buffer().as_any().downcast_ref::<T>()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0).cast::<()>()
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for BufferHandle {}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x{}) {:p}",
            self.0.name(),
            self.0.width(),
            self.0.height(),
            self.addr()
        )
    }
}

/// Opaque per-run parameters injected into every task of a batch at submission time.
#[derive(Clone, Default)]
pub struct RunParams {
    data: Option<Arc<dyn Any + Send + Sync>>,
}

impl RunParams {
    /// Parameters carrying `data`.
    pub fn with_data<T: Any + Send + Sync>(data: T) -> Self {
        Self {
            data: Some(Arc::new(data)),
        }
    }

    /// Borrow the carried value when it has type `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for RunParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunParams")
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

/// What a task does when it runs. Implemented by external task producers.
pub trait TaskKind: AsAny + Send + Sync {
    /// Name shown in dumps and trace events.
    fn name(&self) -> &str;

    /// Lane the task must execute on.
    fn lane(&self) -> Lane {
        Lane::Shared
    }

    /// Execute the task. Returning `false` marks the task failed; dependents still run but the
    /// batch reports failure.
    fn run(&self, ctx: &TaskContext<'_>) -> bool;
}

/// Everything a running task can see.
pub struct TaskContext<'a> {
    /// The frozen graph of the batch.
    pub graph: &'a TaskGraph,
    /// The running task.
    pub id: TaskId,
    /// Parameters injected at submission.
    pub params: &'a RunParams,
    /// `false` when an upstream dependency already failed.
    pub upstream_ok: bool,
    /// Index of the executing worker.
    pub worker: usize,
}

impl<'a> TaskContext<'a> {
    /// The running task's node.
    pub fn node(&self) -> &TaskNode {
        &self.graph[self.id]
    }

    /// The running task's non-null sub-tasks, in order.
    pub fn sub_tasks(&self) -> impl Iterator<Item = &'a TaskNode> + 'a {
        let graph = self.graph;
        graph[self.id]
            .sub_tasks
            .iter()
            .flatten()
            .map(move |&id| &graph[id])
    }
}

/// One node of the task tree.
///
/// Cloning a node is shallow: the behaviour and the target buffer are shared, the sub-task list
/// is copied.
#[derive(Clone)]
pub struct TaskNode {
    /// Buffer the task writes into.
    pub target: Option<BufferHandle>,
    /// Region of `target` written by the task.
    pub target_rect: RectI,
    /// Floating-point bounds of the content, if known.
    pub bounds: Option<Rect>,
    /// Ordered children; `None` entries are holes left by rewrites.
    pub sub_tasks: SmallVec<[Option<TaskId>; 4]>,
    kind: Arc<dyn TaskKind>,
}

impl TaskNode {
    /// New node with no target, no bounds and no children.
    pub fn new(kind: impl TaskKind + 'static) -> Self {
        Self::from_kind(Arc::new(kind))
    }

    /// New node sharing an existing behaviour.
    pub fn from_kind(kind: Arc<dyn TaskKind>) -> Self {
        Self {
            target: None,
            target_rect: RectI::invalid(),
            bounds: None,
            sub_tasks: SmallVec::new(),
            kind,
        }
    }

    /// Set target buffer and rectangle.
    pub fn with_target(mut self, target: BufferHandle, rect: RectI) -> Self {
        self.target = Some(target);
        self.target_rect = rect;
        self
    }

    /// Set floating-point bounds.
    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Replace the children.
    pub fn with_sub_tasks(mut self, sub_tasks: impl IntoIterator<Item = TaskId>) -> Self {
        self.sub_tasks = sub_tasks.into_iter().map(Some).collect();
        self
    }

    /// The task behaviour.
    pub fn kind(&self) -> &Arc<dyn TaskKind> {
        &self.kind
    }

    /// Downcast the behaviour to its concrete type.
    pub fn kind_as<T: Any>(&self) -> Option<&T> {
        let kind: &dyn TaskKind = self.kind.as_ref();
        kind.as_any().downcast_ref::<T>()
    }

    /// Shorthand for `self.kind().name()`.
    pub fn name(&self) -> &str {
        self.kind.name()
    }

    /// Shorthand for `self.kind().lane()`.
    pub fn lane(&self) -> Lane {
        self.kind.lane()
    }

    /// Return `true` when both nodes write overlapping pixels of the same buffer.
    pub fn overlaps(&self, other: &TaskNode) -> bool {
        match (&self.target, &other.target) {
            (Some(a), Some(b)) => a == b && self.target_rect.intersects(other.target_rect),
            _ => false,
        }
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("kind", &self.kind.name())
            .field("target", &self.target)
            .field("target_rect", &self.target_rect)
            .field("bounds", &self.bounds)
            .field("sub_tasks", &self.sub_tasks)
            .finish()
    }
}

/// Batch-scoped arena owning every task node.
///
/// Nodes are never removed; rewrites allocate new nodes (copy-on-write) and leave the old ones
/// in place for anyone still holding their id.
#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its handle.
    pub fn insert(&mut self, node: TaskNode) -> TaskId {
        let id = TaskId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(node);
        id
    }

    /// Borrow a node.
    pub fn get(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(id.index())
    }

    /// Mutably borrow a node.
    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id.index())
    }

    /// Duplicate a node and return the copy's handle.
    pub fn clone_task(&mut self, id: TaskId) -> TaskId {
        let node = self[id].clone();
        self.insert(node)
    }

    /// Number of nodes ever allocated.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Return `true` when no node was allocated.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fail when a sub-task reference is dangling or the trees reachable from `roots` contain a
    /// cycle.
    pub fn check_tree(&self, roots: &[TaskId]) -> RasterflowResult<()> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut stack: Vec<(TaskId, usize)> = Vec::new();
        for &root in roots {
            if self.get(root).is_none() {
                return Err(RasterflowError::validation(format!(
                    "task {root} does not belong to this graph"
                )));
            }
            if marks[root.index()] == Mark::Done {
                continue;
            }
            marks[root.index()] = Mark::Open;
            stack.push((root, 0));
            while let Some((id, child)) = stack.pop() {
                let Some(slot) = self[id].sub_tasks.get(child) else {
                    marks[id.index()] = Mark::Done;
                    continue;
                };
                stack.push((id, child + 1));
                let Some(sub) = *slot else {
                    continue;
                };
                match marks.get(sub.index()) {
                    None => {
                        return Err(RasterflowError::validation(format!(
                            "task {id} references unknown sub-task {sub}"
                        )));
                    }
                    Some(Mark::Open) => {
                        return Err(RasterflowError::validation(format!(
                            "task tree contains a cycle through {sub}"
                        )));
                    }
                    Some(Mark::Done) => {}
                    Some(Mark::New) => {
                        marks[sub.index()] = Mark::Open;
                        stack.push((sub, 0));
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::ops::Index<TaskId> for TaskGraph {
    type Output = TaskNode;

    fn index(&self, id: TaskId) -> &TaskNode {
        &self.nodes[id.index()]
    }
}

impl std::ops::IndexMut<TaskId> for TaskGraph {
    fn index_mut(&mut self, id: TaskId) -> &mut TaskNode {
        &mut self.nodes[id.index()]
    }
}

#[cfg(test)]
#[path = "../../tests/unit/task/graph.rs"]
mod tests;
