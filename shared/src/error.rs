use thiserror::Error;

/// Reasons a structural edit is refused. The input tree is never modified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("group not found: {0}")]
    NodeNotFound(String),

    #[error("drop target not found: {0}")]
    TargetNotFound(String),

    #[error("moving {node} under {target} would create a cycle")]
    Cycle { node: String, target: String },

    #[error("the root group cannot be moved, renamed or removed")]
    RootImmutable,

    #[error("group {0} is disabled and cannot be moved")]
    NotMovable(String),

    #[error("no groups given to move")]
    EmptyBatch,
}
