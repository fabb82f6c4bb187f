// ─────────────────────────────────────────────────────────────────────
// Gradspace — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use thiserror::Error;

/// Root error type for every Gradspace failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GradientError {
    /// Malformed shape, non-finite value where none is permitted, or an
    /// object used before it was fitted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Geometry and data vector sizes disagree.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// Eigensolver exhausted its iteration budget.
    #[error("{solver} did not converge within {iterations} iterations (residual {residual:.3e})")]
    Convergence {
        solver: &'static str,
        iterations: usize,
        residual: f64,
    },

    /// Operation not defined for the selected embedding approach.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Spatial weight graph too degenerate for Moran eigenvectors.
    #[error("singular weight matrix: only {retained} non-trivial eigenvector(s) after centering, need at least 2")]
    SingularWeightMatrix { retained: usize },

    /// Configuration rejected.
    #[error("config error: {0}")]
    Config(String),
}

impl GradientError {
    pub fn shape(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}

pub type GradientResult<T> = Result<T, GradientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = GradientError::shape("left hemisphere data", 10, 12);
        let msg = err.to_string();
        assert!(msg.contains("left hemisphere data"), "{msg}");
        assert!(msg.contains("expected 10"), "{msg}");
        assert!(msg.contains("got 12"), "{msg}");
    }

    #[test]
    fn test_convergence_message_carries_budget() {
        let err = GradientError::Convergence {
            solver: "subspace iteration",
            iterations: 500,
            residual: 1.5e-3,
        };
        assert!(err.to_string().contains("500 iterations"));
    }
}
