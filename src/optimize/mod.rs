//! Rule-based rewriting of task lists.
//!
//! Rules are grouped into totally ordered [`Category`](category::Category) buckets. The
//! [`OptimizerSet`](pipeline::OptimizerSet) walks the categories in order and re-walks them
//! whenever a rule reports that it disturbed a category something downstream depends on, until a
//! full pass leaves every category clean.

/// Rule categories and category masks.
pub mod category;
/// Category fixpoint driver and rule registry.
pub mod pipeline;
/// Rule contract.
pub mod rule;
