//! SQL fragment builder for selectplan
//!
//! Plans never concatenate SQL strings directly. They compose `SqlFragment`
//! trees which are compiled once, at finalize time, into parameterized text.
//!
//! # Principles
//!
//! - Values are always parameterized (`$1`, `$2`, ...)
//! - Identifiers are always quoted
//! - Table aliases are symbols, named only at compile time
//! - Two fragments can be compared structurally under a symbol substitution
//!
//! # Usage
//!
//! ```ignore
//! use selectplan::sql::{self, Symbol};
//!
//! let users = Symbol::new("users");
//! let condition = sql::concat(vec![
//!     sql::qualified(&users, "id"),
//!     sql::raw(" = "),
//!     sql::value(serde_json::json!(7)),
//! ]);
//! ```

mod codec;
mod compile;
mod equivalence;
mod errors;
mod fragment;

pub use codec::Codec;
pub use compile::{compile, CompileContext, CompiledSql};
pub use equivalence::SymbolSubstitution;
pub use errors::{SqlError, SqlResult};
pub use fragment::{
    alias, concat, ident, indent, join, param, parens, placeholder, qualified, raw, value,
    SqlFragment, Symbol,
};
