//! selectplan - batched, cursor-paginated SELECT planning for PostgreSQL
//!
//! Plans are built per request, deduplicated, folded into their parents
//! where possible and compiled once into parameterized SQL that serves a
//! whole batch of keys.

pub mod config;
pub mod executor;
pub mod observability;
pub mod plan;
pub mod sql;
