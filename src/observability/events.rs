//! Planner lifecycle events
//!
//! Events are explicit and typed.

use std::fmt;

use super::logger::Severity;

/// Observable events in the plan lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Planning
    /// Plan added to the arena
    PlanCreated,
    /// Plan replaced by an equivalent peer
    PlanDeduplicated,
    /// Plan folded into its parent as a left join
    PlanInlinedJoin,
    /// Plan folded into its parent as an array subquery
    PlanInlinedSubquery,
    /// Plan will run as its own query
    PlanStandalone,
    /// SQL compiled
    PlanFinalized,

    // Execution
    /// One batch round trip finished
    BatchExecuted,
    /// Incremental source opened for a batch entry
    StreamOpened,
    /// Incremental source dropped unconsumed
    StreamSourceReleased,

    // Input
    /// Cursor failed to decode for the current ordering
    CursorRejected,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PlanCreated => "PLAN_CREATED",
            Event::PlanDeduplicated => "PLAN_DEDUPLICATED",
            Event::PlanInlinedJoin => "PLAN_INLINED_JOIN",
            Event::PlanInlinedSubquery => "PLAN_INLINED_SUBQUERY",
            Event::PlanStandalone => "PLAN_STANDALONE",
            Event::PlanFinalized => "PLAN_FINALIZED",
            Event::BatchExecuted => "BATCH_EXECUTED",
            Event::StreamOpened => "STREAM_OPENED",
            Event::StreamSourceReleased => "STREAM_SOURCE_RELEASED",
            Event::CursorRejected => "CURSOR_REJECTED",
        }
    }

    /// Default severity for this event
    pub fn severity(&self) -> Severity {
        match self {
            Event::PlanCreated | Event::PlanFinalized | Event::StreamSourceReleased => {
                Severity::Trace
            }
            Event::CursorRejected => Severity::Warn,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::PlanCreated,
            Event::PlanDeduplicated,
            Event::PlanInlinedJoin,
            Event::PlanInlinedSubquery,
            Event::PlanStandalone,
            Event::PlanFinalized,
            Event::BatchExecuted,
            Event::StreamOpened,
            Event::StreamSourceReleased,
            Event::CursorRejected,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_cursor_rejection_is_a_warning() {
        assert_eq!(Event::CursorRejected.severity(), Severity::Warn);
        assert_eq!(Event::PlanInlinedJoin.severity(), Severity::Info);
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::PlanDeduplicated), "PLAN_DEDUPLICATED");
    }
}
