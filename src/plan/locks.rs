//! Per-parameter lock state machine
//!
//! Each lockable parameter moves `Unlocked → Locking → Locked` exactly once.
//! While `Locking`, before-lock callbacks run and may still change the
//! parameter. After `Locked`, after-lock callbacks run. Registering a
//! callback for a parameter whose queue is draining is an internal error.

use std::fmt;

use super::errors::{PlanError, PlanResult};
use super::select::SelectPlan;

/// Callback fired around a parameter lock
pub type LockCallback = Box<dyn FnOnce(&mut SelectPlan) -> PlanResult<()> + Send + Sync>;

/// Lockable plan parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockParameter {
    OrderBy,
    GroupBy,
    First,
    Last,
    Offset,
}

impl LockParameter {
    /// Every parameter, in the order `lock_all` locks them
    pub const ALL: [LockParameter; 5] = [
        LockParameter::GroupBy,
        LockParameter::OrderBy,
        LockParameter::First,
        LockParameter::Last,
        LockParameter::Offset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockParameter::OrderBy => "orderBy",
            LockParameter::GroupBy => "groupBy",
            LockParameter::First => "first",
            LockParameter::Last => "last",
            LockParameter::Offset => "offset",
        }
    }

    fn slot(&self) -> usize {
        match self {
            LockParameter::OrderBy => 0,
            LockParameter::GroupBy => 1,
            LockParameter::First => 2,
            LockParameter::Last => 3,
            LockParameter::Offset => 4,
        }
    }
}

/// Lock state of one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// Before-lock callbacks are running
    Locking,
    Locked,
}

#[derive(Default)]
struct Entry {
    state: Option<LockState>,
    draining_after: bool,
    before: Vec<LockCallback>,
    after: Vec<LockCallback>,
}

impl Entry {
    fn state(&self) -> LockState {
        self.state.unwrap_or(LockState::Unlocked)
    }
}

/// Lock table for the five parameters
#[derive(Default)]
pub struct ParameterLocks {
    entries: [Entry; 5],
}

impl ParameterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh table with one before-lock callback already queued
    pub(crate) fn with_before(parameter: LockParameter, callback: LockCallback) -> Self {
        let mut locks = Self::default();
        locks.entries[parameter.slot()].before.push(callback);
        locks
    }

    pub fn state(&self, parameter: LockParameter) -> LockState {
        self.entries[parameter.slot()].state()
    }

    pub fn is_locked(&self, parameter: LockParameter) -> bool {
        self.state(parameter) == LockState::Locked
    }

    /// Fails if `parameter` can no longer be mutated
    pub fn ensure_mutable(&self, parameter: LockParameter) -> PlanResult<()> {
        match self.state(parameter) {
            LockState::Locked => Err(PlanError::parameter_locked(parameter.as_str())),
            LockState::Unlocked | LockState::Locking => Ok(()),
        }
    }

    /// Queues a before-lock callback
    pub(crate) fn push_before(
        &mut self,
        parameter: LockParameter,
        callback: LockCallback,
    ) -> PlanResult<()> {
        let entry = &mut self.entries[parameter.slot()];
        match entry.state() {
            LockState::Unlocked => {
                entry.before.push(callback);
                Ok(())
            }
            LockState::Locking | LockState::Locked => {
                Err(PlanError::callback_reentrant(parameter.as_str()))
            }
        }
    }

    /// Queues an after-lock callback. When the parameter is already locked
    /// (and not draining) the callback is handed back to be run at once.
    pub(crate) fn push_after(
        &mut self,
        parameter: LockParameter,
        callback: LockCallback,
    ) -> PlanResult<Option<LockCallback>> {
        let entry = &mut self.entries[parameter.slot()];
        match entry.state() {
            LockState::Unlocked => {
                entry.after.push(callback);
                Ok(None)
            }
            LockState::Locked if !entry.draining_after => Ok(Some(callback)),
            _ => Err(PlanError::callback_reentrant(parameter.as_str())),
        }
    }

    /// Starts locking; returns the before-lock queue, or `None` when the
    /// parameter is already locking or locked
    pub(crate) fn begin(&mut self, parameter: LockParameter) -> Option<Vec<LockCallback>> {
        let entry = &mut self.entries[parameter.slot()];
        match entry.state() {
            LockState::Unlocked => {
                entry.state = Some(LockState::Locking);
                Some(std::mem::take(&mut entry.before))
            }
            LockState::Locking | LockState::Locked => None,
        }
    }

    /// Marks the parameter locked; returns the after-lock queue
    pub(crate) fn finish(&mut self, parameter: LockParameter) -> Vec<LockCallback> {
        let entry = &mut self.entries[parameter.slot()];
        entry.state = Some(LockState::Locked);
        entry.draining_after = true;
        std::mem::take(&mut entry.after)
    }

    pub(crate) fn drained(&mut self, parameter: LockParameter) {
        self.entries[parameter.slot()].draining_after = false;
    }
}

impl fmt::Debug for ParameterLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for parameter in LockParameter::ALL {
            let entry = &self.entries[parameter.slot()];
            map.entry(
                &parameter.as_str(),
                &format_args!(
                    "{:?} (before: {}, after: {})",
                    entry.state(),
                    entry.before.len(),
                    entry.after.len()
                ),
            );
        }
        map.finish()
    }
}

impl SelectPlan {
    /// Registers a callback that runs just before `parameter` locks.
    ///
    /// The callback may still change `parameter`.
    pub fn before_lock(
        &mut self,
        parameter: LockParameter,
        callback: LockCallback,
    ) -> PlanResult<()> {
        self.locks.push_before(parameter, callback)
    }

    /// Registers a callback that runs just after `parameter` locks
    pub fn after_lock(&mut self, parameter: LockParameter, callback: LockCallback) -> PlanResult<()> {
        match self.locks.push_after(parameter, callback)? {
            Some(run_now) => run_now(self),
            None => Ok(()),
        }
    }

    /// Locks one parameter, firing its callbacks once.
    ///
    /// A failing callback poisons the plan: every later lock returns the
    /// same error, since the callback cannot run again.
    pub fn lock_parameter(&mut self, parameter: LockParameter) -> PlanResult<()> {
        if let Some(err) = &self.lock_failure {
            return Err(err.clone());
        }
        let before = match self.locks.begin(parameter) {
            Some(before) => before,
            None => return Ok(()),
        };
        for callback in before {
            if let Err(err) = callback(self) {
                return Err(self.poison(err));
            }
        }
        let after = self.locks.finish(parameter);
        let result = after.into_iter().try_for_each(|callback| callback(self));
        self.locks.drained(parameter);
        result.map_err(|err| self.poison(err))
    }

    fn poison(&mut self, err: PlanError) -> PlanError {
        self.lock_failure = Some(err.clone());
        err
    }

    /// Locks every parameter, then freezes the query shape
    pub fn lock_all(&mut self) -> PlanResult<()> {
        for parameter in LockParameter::ALL {
            self.lock_parameter(parameter)?;
        }
        self.locked = true;
        Ok(())
    }
}
