//! Task tree data model and diagnostics.

/// Task-tree dumps for the diagnostics sink.
pub mod dump;
/// Batch-scoped task arena.
pub mod graph;
