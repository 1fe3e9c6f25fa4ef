//! Execution of finalized plans for selectplan
//!
//! The planner only produces SQL. Running it is delegated to a
//! `SqlExecutor` supplied by the caller; this module batches entries,
//! routes rows back to them and builds streams.
//!
//! # Execution Flow
//!
//! 1. Group entries by context
//! 2. Bind distinct key tuples as one JSON array
//! 3. Run the statement (cached) or open cursors (streaming)
//! 4. Route rows by identifier index and strip that column
//! 5. Re-reverse rows of plans paginated from the end

mod cache;
mod errors;
mod executor;
mod result;

pub use cache::CachingExecutor;
pub use errors::{ExecutorError, ExecutorResult};
pub use executor::{BatchEntry, BatchExecutor, RowStream, SqlExecutor, SqlRequest};
pub use result::PageInfo;
