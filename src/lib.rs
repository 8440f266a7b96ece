//! Rasterflow schedules trees of rendering tasks onto a pool of worker threads.
//!
//! A submission goes through three stages:
//!
//! - Rewrite the task trees with the registered [`Optimizer`] rules until every rule
//!   [`Category`] is stable
//! - Derive ordering constraints between the surviving tasks from overlapping buffer regions
//! - Execute them on the [`TaskQueue`] and wait for the whole batch
//!
//! Everything hangs off an explicit [`RenderContext`]: it owns the workers and the named
//! [`Renderer`] backends.
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod foundation;

/// Rule-based task list rewriting.
pub mod optimize;
/// Scheduling and execution.
pub mod render;
/// Task tree model.
pub mod task;

pub use crate::foundation::core::{Rect, RectI};
pub use crate::foundation::error::{RasterflowError, RasterflowResult};
pub use crate::foundation::ids::{JobId, TaskId};

pub use crate::optimize::category::{Category, CategoryMask};
pub use crate::optimize::pipeline::{OptimizeStats, OptimizerOpts, OptimizerSet};
pub use crate::optimize::rule::{
    ListParams, OptimizeMode, Optimizer, OptimizerDescriptor, OptimizerParams,
};
pub use crate::render::context::{ContextOpts, RenderContext};
pub use crate::render::queue::{Job, JobContext, QueueOpts, QueuedJob, TaskQueue};
pub use crate::render::renderer::{RenderOpts, Renderer, RunReport};
pub use crate::task::graph::{
    AsAny, Buffer, BufferHandle, Lane, RunParams, TaskContext, TaskGraph, TaskKind, TaskNode,
};
