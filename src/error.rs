//! Error types for backward-graph execution.

use thiserror::Error;

pub type GradResult<T> = std::result::Result<T, GradError>;

/// Failures surfaced while running the backward graph. There is no fallback
/// path: the first error aborts the pass and reaches the caller as-is.
#[derive(Debug, Error)]
pub enum GradError {
    #[error("shape mismatch: cannot combine gradient of shape {lhs:?} with shape {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    /// Gradients of different element types cannot be combined. All tensors
    /// currently carry f64 elements, so this only fires once mixed element
    /// types exist; the variant is part of the public taxonomy regardless.
    #[error("type mismatch: cannot combine {lhs} gradient with {rhs}")]
    TypeMismatch {
        lhs: &'static str,
        rhs: &'static str,
    },

    /// The engine handed a node the wrong number of input slots. Indicates a
    /// caller bug, not a user-recoverable condition.
    #[error("invalid arity: {node} expected {expected} input slot(s), got {got}")]
    InvalidArity {
        node: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("hook failed: {0}")]
    Hook(String),
}
