//! Error types for workflow construction and lowering.
//!
//! Every variant is a programming/construction error, not a user error:
//! the caller should not retry with the same input.

/// Errors raised while building, rewriting, or lowering a workflow.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, thiserror::Error)]
pub enum PlanError {
    /// A reference substitution turned a group operator into a plain
    /// expression. Group stages may only carry group-operator values.
    #[error("rewrite of group field '{field}' produced a non-group operator")]
    NonGroupOpRewrite { field: String },

    /// A fold-left tail failed to lower to a map-reduce task at crush time.
    #[error("fold-left tail lowered to {task} instead of a map-reduce task")]
    InvalidFoldLeftTail { task: String },

    /// Two geo-near stages ended up in the same pipeline chain. Geo-near must
    /// be the first stage after the source, so a chain admits at most one.
    #[error("a pipeline chain admits at most one geo-near stage")]
    DuplicateGeoNear,
}

/// Convenience alias used throughout the crate.
pub type PlanResult<T> = Result<T, PlanError>;
