//! Structured error types for phylodyn.

use thiserror::Error;

/// Unified error type for all phylodyn operations.
///
/// Probability-zero states (a tree violating a clade constraint, a child
/// older than its parent) are not errors: they evaluate to a log density of
/// negative infinity. This type is reserved for model-specification mistakes
/// and numerical failures.
#[derive(Debug, Error)]
pub enum PhyloError {
    /// Parse error (malformed Newick input, unknown condition string)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, conflicting or missing parameters,
    /// mismatched vector lengths)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Dependency-graph misuse (unknown node, wrong value kind, cycles)
    #[error("graph error: {0}")]
    Graph(String),

    /// Numerical failure (integrator step budget exhausted, non-finite state)
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout phylodyn.
pub type Result<T> = std::result::Result<T, PhyloError>;
