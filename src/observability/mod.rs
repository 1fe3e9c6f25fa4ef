//! Observability for the planner
//!
//! - Structured JSON logging with a process-wide minimum severity
//! - Typed lifecycle events
//! - Atomic counters
//! - Phase scopes with elapsed time
//!
//! ```ignore
//! use selectplan::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::PlanDeduplicated, &[("plan", "users"), ("into", "#3")]);
//! ```
//!
//! Logging never fails the caller.

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsSnapshot, PlannerMetrics};
pub use scope::PhaseScope;

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields at its default severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
