//! # Executor Errors
//!
//! Error types for running finalized plans.

use thiserror::Error;

use crate::plan::{PlanError, PlanId};

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Executor errors
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    // ==================
    // Plan State Errors
    // ==================
    /// Execution requested before finalize
    #[error("Plan {0} has not been finalized")]
    NotFinalized(PlanId),

    /// Streaming requested for a plan finalized without stream texts
    #[error("Plan was not finalized for streaming")]
    NotStreamable,

    // ==================
    // Database Errors
    // ==================
    /// The underlying executor failed
    #[error("Database error: {0}")]
    Database(String),

    /// A row could not be routed back to its batch entry
    #[error("Row routing failed: {0}")]
    Routing(String),

    // ==================
    // Planner Errors
    // ==================
    #[error(transparent)]
    Plan(#[from] PlanError),
}

impl ExecutorError {
    /// Wraps a driver error
    pub fn database(reason: impl Into<String>) -> Self {
        Self::Database(reason.into())
    }

    /// True for errors the client caused (a bad cursor)
    pub fn is_user_facing(&self) -> bool {
        matches!(self, ExecutorError::Plan(err) if err.is_user_facing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExecutorError::NotFinalized(PlanId::from_index(3));
        assert_eq!(err.to_string(), "Plan #3 has not been finalized");

        let err = ExecutorError::database("connection reset");
        assert_eq!(err.to_string(), "Database error: connection reset");
    }

    #[test]
    fn test_plan_error_is_transparent() {
        let err: ExecutorError = PlanError::invalid_cursor().into();
        assert!(err.to_string().contains("SELECTPLAN_INVALID_CURSOR"));
        assert!(err.is_user_facing());
        assert!(!ExecutorError::NotStreamable.is_user_facing());
    }
}
