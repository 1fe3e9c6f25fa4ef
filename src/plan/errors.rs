//! Plan error types
//!
//! Error codes:
//! - SELECTPLAN_PARAMETER_LOCKED (FATAL)
//! - SELECTPLAN_LAST_WITH_OFFSET (FATAL)
//! - SELECTPLAN_FIRST_WITH_LAST (FATAL)
//! - SELECTPLAN_NOT_AGGREGATE (FATAL)
//! - SELECTPLAN_MULTI_ROW_DEPENDENCY (FATAL)
//! - SELECTPLAN_TOO_MANY_PLACEHOLDERS (FATAL)
//! - SELECTPLAN_UNSUPPORTED_MERGE (FATAL)
//! - SELECTPLAN_CURSOR_UNSUPPORTED (FATAL)
//! - SELECTPLAN_NOT_UNIQUE (FATAL)
//! - SELECTPLAN_INVALID_CONFIG (FATAL)
//! - SELECTPLAN_INVALID_CURSOR (REJECT)
//! - SELECTPLAN_CALLBACK_REENTRANT (FATAL, internal)
//! - SELECTPLAN_RECURSIVE_DEPENDENCY (FATAL, internal)
//! - SELECTPLAN_DEPENDENCY_MISMATCH (FATAL, internal)
//! - SELECTPLAN_SELF_MERGE (FATAL, internal)
//! - SELECTPLAN_COMPILE_FAILED (FATAL, internal)
//! - SELECTPLAN_UNKNOWN_PLAN (FATAL, internal)

use std::fmt;

use crate::sql::SqlError;

/// User-facing message for every cursor failure
pub const INVALID_CURSOR_MESSAGE: &str = "invalid cursor for this ordering";

/// Severity levels for plan errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Bad client input, recoverable at the request boundary
    Reject,
    /// Planner misuse or planner bug, never retried
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Reject => write!(f, "REJECT"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Who is at fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The resolver layer called the plan API incorrectly
    Programming,
    /// The request carried a bad cursor
    Cursor,
    /// The planner reached an inconsistent state
    Internal,
}

/// Plan-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanErrorCode {
    /// Mutating a locked parameter
    ParameterLocked,
    /// `last` combined with `offset`
    LastWithOffset,
    /// `first` combined with `last`
    FirstWithLast,
    /// Grouping on a non-aggregate plan
    NotAggregate,
    /// Multi-row plan used where a single value is required
    MultiRowDependency,
    /// Placeholder ceiling exceeded
    TooManyPlaceholders,
    /// Inlining into an unsupported target
    UnsupportedMerge,
    /// Cursor pagination on an aggregate or non-unique ordering
    CursorUnsupported,
    /// `single()` on a plan that may return several rows
    NotUnique,
    /// Planner configuration rejected
    InvalidConfig,
    /// Cursor could not be decoded for the current ordering
    InvalidCursor,
    /// Lock callback registered while callbacks were draining
    CallbackReentrant,
    /// Plan depends on itself
    RecursiveDependency,
    /// Dependency index changed across a clone
    DependencyMismatch,
    /// Merge target depends on the merged plan
    SelfMerge,
    /// Fragment compilation failed
    CompileFailed,
    /// Plan id does not name a plan of the expected kind
    UnknownPlan,
}

impl PlanErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            PlanErrorCode::ParameterLocked => "SELECTPLAN_PARAMETER_LOCKED",
            PlanErrorCode::LastWithOffset => "SELECTPLAN_LAST_WITH_OFFSET",
            PlanErrorCode::FirstWithLast => "SELECTPLAN_FIRST_WITH_LAST",
            PlanErrorCode::NotAggregate => "SELECTPLAN_NOT_AGGREGATE",
            PlanErrorCode::MultiRowDependency => "SELECTPLAN_MULTI_ROW_DEPENDENCY",
            PlanErrorCode::TooManyPlaceholders => "SELECTPLAN_TOO_MANY_PLACEHOLDERS",
            PlanErrorCode::UnsupportedMerge => "SELECTPLAN_UNSUPPORTED_MERGE",
            PlanErrorCode::CursorUnsupported => "SELECTPLAN_CURSOR_UNSUPPORTED",
            PlanErrorCode::NotUnique => "SELECTPLAN_NOT_UNIQUE",
            PlanErrorCode::InvalidConfig => "SELECTPLAN_INVALID_CONFIG",
            PlanErrorCode::InvalidCursor => "SELECTPLAN_INVALID_CURSOR",
            PlanErrorCode::CallbackReentrant => "SELECTPLAN_CALLBACK_REENTRANT",
            PlanErrorCode::RecursiveDependency => "SELECTPLAN_RECURSIVE_DEPENDENCY",
            PlanErrorCode::DependencyMismatch => "SELECTPLAN_DEPENDENCY_MISMATCH",
            PlanErrorCode::SelfMerge => "SELECTPLAN_SELF_MERGE",
            PlanErrorCode::CompileFailed => "SELECTPLAN_COMPILE_FAILED",
            PlanErrorCode::UnknownPlan => "SELECTPLAN_UNKNOWN_PLAN",
        }
    }

    /// Returns the category for this code
    pub fn category(&self) -> ErrorCategory {
        match self {
            PlanErrorCode::InvalidCursor => ErrorCategory::Cursor,
            PlanErrorCode::CallbackReentrant
            | PlanErrorCode::RecursiveDependency
            | PlanErrorCode::DependencyMismatch
            | PlanErrorCode::SelfMerge
            | PlanErrorCode::CompileFailed
            | PlanErrorCode::UnknownPlan => ErrorCategory::Internal,
            _ => ErrorCategory::Programming,
        }
    }

    /// Returns the severity level for this code
    pub fn severity(&self) -> Severity {
        match self.category() {
            ErrorCategory::Cursor => Severity::Reject,
            _ => Severity::Fatal,
        }
    }
}

impl fmt::Display for PlanErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Plan error with context
#[derive(Debug, Clone, PartialEq)]
pub struct PlanError {
    code: PlanErrorCode,
    message: String,
    /// Parameter name for lock errors
    parameter: Option<&'static str>,
}

impl PlanError {
    fn new(code: PlanErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            parameter: None,
        }
    }

    /// Mutation of an already locked parameter
    pub fn parameter_locked(parameter: &'static str) -> Self {
        Self {
            code: PlanErrorCode::ParameterLocked,
            message: format!("Parameter '{}' is locked and can no longer be changed", parameter),
            parameter: Some(parameter),
        }
    }

    pub fn last_with_offset() -> Self {
        Self::new(
            PlanErrorCode::LastWithOffset,
            "Cannot combine 'last' with 'offset'",
        )
    }

    pub fn first_with_last() -> Self {
        Self::new(
            PlanErrorCode::FirstWithLast,
            "Cannot combine 'first' with 'last'",
        )
    }

    pub fn not_aggregate(what: &str) -> Self {
        Self::new(
            PlanErrorCode::NotAggregate,
            format!("'{}' is only allowed in aggregate mode", what),
        )
    }

    pub fn multi_row_dependency(reason: impl Into<String>) -> Self {
        Self::new(PlanErrorCode::MultiRowDependency, reason)
    }

    pub fn too_many_placeholders(limit: usize) -> Self {
        Self::new(
            PlanErrorCode::TooManyPlaceholders,
            format!("Plan exceeds the placeholder ceiling of {}", limit),
        )
    }

    pub fn unsupported_merge(reason: impl Into<String>) -> Self {
        Self::new(PlanErrorCode::UnsupportedMerge, reason)
    }

    pub fn cursor_unsupported(reason: impl Into<String>) -> Self {
        Self::new(PlanErrorCode::CursorUnsupported, reason)
    }

    pub fn not_unique(name: &str) -> Self {
        Self::new(
            PlanErrorCode::NotUnique,
            format!("Plan '{}' is not unique and cannot yield a single row", name),
        )
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::new(PlanErrorCode::InvalidConfig, reason)
    }

    /// Every cursor failure carries the same message
    pub fn invalid_cursor() -> Self {
        Self::new(PlanErrorCode::InvalidCursor, INVALID_CURSOR_MESSAGE)
    }

    pub fn callback_reentrant(parameter: &'static str) -> Self {
        Self {
            code: PlanErrorCode::CallbackReentrant,
            message: format!(
                "Lock callback registered for '{}' while it was locking or locked",
                parameter
            ),
            parameter: Some(parameter),
        }
    }

    pub fn recursive_dependency(name: &str) -> Self {
        Self::new(
            PlanErrorCode::RecursiveDependency,
            format!("Plan '{}' depends on itself", name),
        )
    }

    pub fn dependency_mismatch(expected: usize, actual: usize) -> Self {
        Self::new(
            PlanErrorCode::DependencyMismatch,
            format!(
                "Dependency index mismatch after clone: expected {}, got {}",
                expected, actual
            ),
        )
    }

    pub fn self_merge(name: &str) -> Self {
        Self::new(
            PlanErrorCode::SelfMerge,
            format!("Merge target for '{}' depends on the plan being merged", name),
        )
    }

    pub fn unknown_plan(reason: impl Into<String>) -> Self {
        Self::new(PlanErrorCode::UnknownPlan, reason)
    }

    /// Returns the error code
    pub fn code(&self) -> PlanErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the category
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the locked parameter, if applicable
    pub fn parameter(&self) -> Option<&'static str> {
        self.parameter
    }

    /// True for cursor errors that should be reported to the client
    pub fn is_user_facing(&self) -> bool {
        self.severity() == Severity::Reject
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )
    }
}

impl std::error::Error for PlanError {}

impl From<SqlError> for PlanError {
    fn from(err: SqlError) -> Self {
        Self::new(PlanErrorCode::CompileFailed, err.to_string())
    }
}

/// Result type for plan operations
pub type PlanResult<T> = Result<T, PlanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            PlanErrorCode::ParameterLocked.code(),
            "SELECTPLAN_PARAMETER_LOCKED"
        );
        assert_eq!(
            PlanErrorCode::InvalidCursor.code(),
            "SELECTPLAN_INVALID_CURSOR"
        );
        assert_eq!(
            PlanErrorCode::DependencyMismatch.code(),
            "SELECTPLAN_DEPENDENCY_MISMATCH"
        );
    }

    #[test]
    fn test_cursor_errors_reject() {
        let err = PlanError::invalid_cursor();
        assert_eq!(err.severity(), Severity::Reject);
        assert!(err.is_user_facing());
        assert_eq!(err.message(), INVALID_CURSOR_MESSAGE);
    }

    #[test]
    fn test_internal_errors_are_fatal() {
        let err = PlanError::recursive_dependency("users");
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(!err.is_user_facing());
    }

    #[test]
    fn test_error_display() {
        let err = PlanError::parameter_locked("orderBy");
        let display = format!("{}", err);
        assert!(display.contains("FATAL"));
        assert!(display.contains("SELECTPLAN_PARAMETER_LOCKED"));
        assert!(display.contains("orderBy"));
        assert_eq!(err.parameter(), Some("orderBy"));
    }

    #[test]
    fn test_sql_error_converts() {
        let err: PlanError = SqlError::UnresolvedPlaceholder("p".into()).into();
        assert_eq!(err.code(), PlanErrorCode::CompileFailed);
        assert_eq!(err.category(), ErrorCategory::Internal);
    }
}
