//! Phase scopes for begin/complete logging around planner phases

use std::time::Instant;

use super::logger::{Logger, Severity};

/// Logs `{NAME}_BEGIN` on creation and `{NAME}_COMPLETE` with the
/// elapsed microseconds when completed.
///
/// ```ignore
/// let scope = PhaseScope::new("OPTIMIZE", Severity::Trace);
/// // ... do work ...
/// scope.complete(&[("strategy", "join")]);
/// ```
///
/// Dropping an uncompleted scope logs `{NAME}_INCOMPLETE` at WARN.
pub struct PhaseScope<'a> {
    name: &'a str,
    severity: Severity,
    started: Instant,
    fields: Vec<(&'a str, String)>,
    completed: bool,
}

impl<'a> PhaseScope<'a> {
    pub fn new(name: &'a str, severity: Severity) -> Self {
        Self::with_fields(name, severity, &[])
    }

    pub fn with_fields(name: &'a str, severity: Severity, fields: &[(&'a str, &str)]) -> Self {
        if Logger::enabled(severity) {
            Logger::log(severity, &format!("{}_BEGIN", name), fields);
        }
        Self {
            name,
            severity,
            started: Instant::now(),
            fields: fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            completed: false,
        }
    }

    /// Microseconds since the scope opened
    pub fn elapsed_us(&self) -> u128 {
        self.started.elapsed().as_micros()
    }

    pub fn complete(mut self, extra_fields: &[(&str, &str)]) {
        self.completed = true;
        if !Logger::enabled(self.severity) {
            return;
        }
        let elapsed = self.elapsed_us().to_string();
        let mut fields: Vec<(&str, &str)> =
            self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        fields.extend(extra_fields.iter().copied());
        fields.push(("elapsed_us", elapsed.as_str()));
        Logger::log(self.severity, &format!("{}_COMPLETE", self.name), &fields);
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl Drop for PhaseScope<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let event = format!("{}_INCOMPLETE", self.name);
            Logger::warn(&event, &[("reason", "phase ended early")]);
        }
    }
}
