//! Select plans for selectplan
//!
//! A request builds a graph of plans in one `PlanArena`: selects, the rows
//! they produce, and columns of those rows feeding other selects. The
//! graph is then reduced and compiled:
//!
//! 1. `deduplicate`: equivalent sibling selects collapse into one
//! 2. `optimize`: children fold into their parent as a join or subquery
//! 3. `finalize`: each remaining select compiles once into batched SQL
//!
//! # Locking
//!
//! Every shape parameter (groupBy, orderBy, first, last, offset) locks
//! independently. Before-lock callbacks may still adjust the parameter;
//! after-lock callbacks see its final value. Once everything is locked
//! only the selection list may grow, until finalize.
//!
//! # Batching
//!
//! Values that are not known at planning time become components of a
//! per-entry key tuple. One query serves every key of a batch; each row
//! carries the index of the key it belongs to.

mod arena;
mod assemble;
mod cursor;
mod dedup;
mod errors;
mod explain;
mod finalize;
mod locks;
mod optimize;
mod select;
mod source;

pub use arena::{
    ColumnPlan, DependencyKind, InlinedPlan, PlanArena, PlanId, PlanNode, RowPlan, SelectOptions,
    Strategy,
};
pub use cursor::{decode_cursor, encode_cursor, order_digest, CursorKind};
pub use errors::{ErrorCategory, PlanError, PlanErrorCode, PlanResult, Severity};
pub use explain::ExplainPlan;
pub use finalize::{CompiledQuery, FinalizeResults, QueryValue, Row, StreamQueries};
pub use locks::{LockCallback, LockParameter, LockState};
pub use select::{
    Direction, IdentifierMatch, IdentifierSpec, Join, JoinKind, MatchTarget, NullsOrder,
    OrderSpec, PlaceholderSpec, SelectMode, SelectPlan, StreamOptions,
};
pub use source::{AccessPolicy, ArgumentSpec, SourceDescriptor, SourceKind};
