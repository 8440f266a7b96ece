//! Execution side: dependency analysis, the worker pool, backends and their registry.

/// Backend registry and worker pool ownership.
pub mod context;
pub(crate) mod hazard;
/// Worker pool.
pub mod queue;
/// Optimize-analyze-submit driver.
pub mod renderer;
