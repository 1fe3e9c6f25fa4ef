//! # SQL Fragment Errors

use thiserror::Error;

/// Result type for fragment compilation
pub type SqlResult<T> = Result<T, SqlError>;

/// Errors raised while compiling a fragment tree
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlError {
    /// A placeholder was compiled without a value
    #[error("Placeholder '{0}' has no value")]
    UnresolvedPlaceholder(String),

    /// A placeholder value refers back to the same placeholder
    #[error("Placeholder '{0}' resolves to itself")]
    RecursivePlaceholder(String),

    /// The alias substitution map contains a cycle
    #[error("Symbol substitution cycle at '{0}'")]
    SubstitutionCycle(String),
}
