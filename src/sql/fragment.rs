//! Fragment tree and symbols

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

static NEXT_SYMBOL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque alias token.
///
/// Symbols compare by identity only; the name is a hint used when the
/// compiler picks the final SQL alias.
#[derive(Clone)]
pub struct Symbol {
    id: u64,
    name: Arc<str>,
}

impl Symbol {
    /// Allocates a new, process-unique symbol
    pub fn new(name: &str) -> Self {
        Self {
            id: NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        }
    }

    /// Returns the unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the name hint
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({}#{})", self.name, self.id)
    }
}

/// A composable piece of SQL
#[derive(Debug, Clone, PartialEq)]
pub enum SqlFragment {
    /// Trusted SQL text, emitted verbatim
    Raw(String),
    /// Identifier, emitted double-quoted
    Identifier(String),
    /// Table alias, named at compile time
    Alias(Symbol),
    /// Parameterized value
    Value(Value),
    /// Parameterized value whose position is reported after compilation.
    /// The value itself is supplied at execution time.
    Parameter(Symbol),
    /// Cell resolved from the compile context's placeholder map
    Placeholder(Symbol),
    /// Concatenation
    List(Vec<SqlFragment>),
    /// Indented block
    Indent(Box<SqlFragment>),
}

impl SqlFragment {
    /// True if this fragment renders no text
    pub fn is_empty(&self) -> bool {
        match self {
            SqlFragment::Raw(text) => text.is_empty(),
            SqlFragment::List(items) => items.iter().all(SqlFragment::is_empty),
            _ => false,
        }
    }
}

/// Trusted raw SQL
pub fn raw(text: impl Into<String>) -> SqlFragment {
    SqlFragment::Raw(text.into())
}

/// Quoted identifier
pub fn ident(name: impl Into<String>) -> SqlFragment {
    SqlFragment::Identifier(name.into())
}

/// Alias reference
pub fn alias(symbol: &Symbol) -> SqlFragment {
    SqlFragment::Alias(symbol.clone())
}

/// `alias."column"`
pub fn qualified(symbol: &Symbol, column: &str) -> SqlFragment {
    concat(vec![alias(symbol), raw("."), ident(column)])
}

/// Parameterized literal
pub fn value(value: Value) -> SqlFragment {
    SqlFragment::Value(value)
}

/// Execution-time parameter slot
pub fn param(symbol: &Symbol) -> SqlFragment {
    SqlFragment::Parameter(symbol.clone())
}

/// Compile-time placeholder cell
pub fn placeholder(symbol: &Symbol) -> SqlFragment {
    SqlFragment::Placeholder(symbol.clone())
}

/// Concatenates fragments, flattening nested lists
pub fn concat(parts: Vec<SqlFragment>) -> SqlFragment {
    let mut flat = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            SqlFragment::List(items) => flat.extend(items),
            other => flat.push(other),
        }
    }
    SqlFragment::List(flat)
}

/// Joins fragments with a raw separator
pub fn join<I>(parts: I, separator: &str) -> SqlFragment
where
    I: IntoIterator<Item = SqlFragment>,
{
    let mut out = Vec::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(raw(separator));
        }
        out.push(part);
    }
    concat(out)
}

/// Indented block
pub fn indent(fragment: SqlFragment) -> SqlFragment {
    SqlFragment::Indent(Box::new(fragment))
}

/// `(fragment)`
pub fn parens(fragment: SqlFragment) -> SqlFragment {
    concat(vec![raw("("), fragment, raw(")")])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_are_unique() {
        let a = Symbol::new("users");
        let b = Symbol::new("users");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.name(), "users");
    }

    #[test]
    fn test_concat_flattens() {
        let inner = concat(vec![raw("a"), raw("b")]);
        let outer = concat(vec![inner, raw("c")]);
        match outer {
            SqlFragment::List(items) => assert_eq!(items.len(), 3),
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_is_empty() {
        assert!(concat(vec![]).is_empty());
        assert!(raw("").is_empty());
        assert!(!ident("x").is_empty());
    }
}
