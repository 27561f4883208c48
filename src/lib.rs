//! # Docflow Workflow IR
//!
//! A workflow intermediate representation and optimizer that compiles
//! document query plans into an aggregation runtime: native pipelines where
//! possible, map-reduce jobs where not.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Op graph (smart constructors, coalescing peepholes)
//!     ↓
//! [merge]       → one graph for two plans sharing a source (optional)
//!     ↓
//! [finish]      → unused projected fields dropped
//!     ↓
//! [finalize]    → pipeline/JS boundary rewrites
//!     ↓
//! [crush]       → WorkflowTask tree (pipelines + map-reduce jobs)
//!     ↓
//! Execution layer
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use docflow::{workflow, Selector, WorkflowOp};
//! use serde_json::json;
//!
//! let plan = workflow(WorkflowOp::limit(
//!     WorkflowOp::match_(WorkflowOp::read("zips"), Selector::eq("state", json!("CA"))),
//!     10,
//! ))?;
//! println!("{}", plan.pretty_print(0));
//! # Ok::<(), docflow::PlanError>(())
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `expr` | Field paths, document expressions, group operators |
//! | `reshape` | Ordered record constructors with recursive merge |
//! | `selector` | Find-query selectors and pipelinability |
//! | `js` | The closed JS subset carried by map/reduce stages |
//! | `stage` | Native pipeline stage descriptions |
//! | `op` | Workflow op DAG and coalescing smart constructors |
//! | `merge` | Binary combinator over two workflow graphs |
//! | `prune` | Unused-field pruning (`finish`) |
//! | `finalize` | Pipeline/JS boundary rewrites |
//! | `crush` | Lowering to the task tree |
//! | `task` | The output IR consumed by the execution layer |
//!
//! Ops are immutable value objects and every pass is deterministic and
//! side-effect free, so disjoint graphs can be processed concurrently.
//!
//! The reserved field labels `lEft`, `rIght`, and `value` belong to the
//! output contract: the first two namespace merged branches, the third is
//! the carrier produced by map-reduce stages. They must not appear in user
//! input.

pub mod expr;
pub mod js;
pub mod reshape;
pub mod selector;
pub mod stage;

pub mod op;

pub mod merge;

mod crush;
mod finalize;
mod prune;

pub mod task;

mod error;

// Re-export the working vocabulary.
pub use crate::error::{PlanError, PlanResult};
pub use crate::expr::{DocVar, Expression, GroupOp, Grouped, PathElement};
pub use crate::merge::{merge, LEFT_LABEL, RIGHT_LABEL};
pub use crate::op::{Collection, WorkflowOp};
pub use crate::reshape::{FieldValue, Reshape};
pub use crate::selector::{Predicate, Selector};
pub use crate::stage::{GeoNear, PipelineStage, SortDir};
pub use crate::task::{MapReduce, OutAction, WorkflowTask};

pub use crate::crush::crush;
pub use crate::finalize::{finalize, VALUE_LABEL};
pub use crate::prune::finish;

/// Produce the executable task tree for a completed op graph:
/// `crush(finalize(finish(op)))`.
///
/// Deterministic: structurally equal graphs yield identical task trees.
pub fn workflow(op: WorkflowOp) -> PlanResult<WorkflowTask> {
    let (_, task) = crush::crush(finalize::finalize(prune::finish(op))?)?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_end_to_end() {
        let plan = WorkflowOp::limit(
            WorkflowOp::match_(WorkflowOp::read("zips"), Selector::eq("state", json!("CA"))),
            10,
        );
        let task = workflow(plan).expect("lowering");
        let WorkflowTask::Pipeline { source, stages } = task else {
            panic!("expected a pipeline task");
        };
        assert_eq!(*source, WorkflowTask::Read(Collection::new("zips")));
        assert_eq!(stages.len(), 2);
    }

    #[test]
    fn test_workflow_is_deterministic() {
        let build = || {
            WorkflowOp::match_(
                WorkflowOp::skip(WorkflowOp::read("c"), 2),
                Selector::eq("x", json!(1)),
            )
        };
        let first = workflow(build()).expect("first");
        let second = workflow(build()).expect("second");
        assert_eq!(first, second);
    }
}
