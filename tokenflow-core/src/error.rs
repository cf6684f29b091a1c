use thiserror::Error;

/// Error kinds surfaced by planning and validation.
///
/// Policy: only retryable task errors are recovered locally (per-token retry
/// budget); everything here propagates to workflow finalization. Store-level
/// plumbing failures travel as `anyhow::Error` and are not modeled here.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Input violates its schema. Fails `start` before any token exists.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A condition or mapping references a construct the evaluator cannot
    /// type. Fail fast: no silent coercion fallback.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Unknown merge strategy at a fan-in.
    #[error("merge failed: {0}")]
    Merge(String),

    /// The definition references a node or transition that does not exist,
    /// or is structurally unusable.
    #[error("definition error: {0}")]
    Definition(String),
}

impl CoordinatorError {
    pub fn evaluation(msg: impl Into<String>) -> Self {
        CoordinatorError::Evaluation(msg.into())
    }

    pub fn definition(msg: impl Into<String>) -> Self {
        CoordinatorError::Definition(msg.into())
    }
}
