//! Structural equivalence under symbol substitution
//!
//! Two fragments are equivalent when they have the same shape and every
//! symbol on the left either equals, or is mapped by the substitution to,
//! the symbol at the same position on the right.

use std::collections::HashMap;

use super::errors::{SqlError, SqlResult};
use super::fragment::{SqlFragment, Symbol};

/// Bound on substitution chain length; anything longer is a cycle
const MAX_CHAIN: usize = 64;

/// Mapping from one symbol to another
#[derive(Debug, Clone, Default)]
pub struct SymbolSubstitution {
    map: HashMap<Symbol, Symbol>,
}

impl SymbolSubstitution {
    /// Creates an empty substitution
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `from → to`
    pub fn insert(&mut self, from: Symbol, to: Symbol) {
        if from != to {
            self.map.insert(from, to);
        }
    }

    /// Direct mapping for `symbol`, if any
    pub fn get(&self, symbol: &Symbol) -> Option<&Symbol> {
        self.map.get(symbol)
    }

    /// Follows the chain of substitutions to its end
    pub fn resolve(&self, symbol: &Symbol) -> SqlResult<Symbol> {
        let mut current = symbol;
        for _ in 0..MAX_CHAIN {
            match self.map.get(current) {
                Some(next) => current = next,
                None => return Ok(current.clone()),
            }
        }
        Err(SqlError::SubstitutionCycle(symbol.name().to_string()))
    }

    /// True if `left` is `right` or maps directly onto it
    pub fn matches(&self, left: &Symbol, right: &Symbol) -> bool {
        left == right || self.map.get(left) == Some(right)
    }

    /// Number of recorded substitutions
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Copies every entry of `other` into `self`
    pub fn extend(&mut self, other: &SymbolSubstitution) {
        for (from, to) in &other.map {
            self.insert(from.clone(), to.clone());
        }
    }
}

impl SqlFragment {
    /// Structural comparison under `substitution` (applied left → right)
    pub fn is_equivalent(&self, other: &SqlFragment, substitution: &SymbolSubstitution) -> bool {
        match (self, other) {
            (SqlFragment::Raw(a), SqlFragment::Raw(b)) => a == b,
            (SqlFragment::Identifier(a), SqlFragment::Identifier(b)) => a == b,
            (SqlFragment::Value(a), SqlFragment::Value(b)) => a == b,
            (SqlFragment::Alias(a), SqlFragment::Alias(b))
            | (SqlFragment::Parameter(a), SqlFragment::Parameter(b))
            | (SqlFragment::Placeholder(a), SqlFragment::Placeholder(b)) => {
                substitution.matches(a, b)
            }
            (SqlFragment::List(a), SqlFragment::List(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.is_equivalent(y, substitution))
            }
            (SqlFragment::Indent(a), SqlFragment::Indent(b)) => a.is_equivalent(b, substitution),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::fragment::{concat, qualified, raw, value};
    use serde_json::json;

    #[test]
    fn test_equivalent_with_substitution() {
        let a = Symbol::new("users");
        let b = Symbol::new("users");
        let left = concat(vec![qualified(&a, "id"), raw(" = "), value(json!(1))]);
        let right = concat(vec![qualified(&b, "id"), raw(" = "), value(json!(1))]);

        assert!(!left.is_equivalent(&right, &SymbolSubstitution::new()));

        let mut subs = SymbolSubstitution::new();
        subs.insert(a, b);
        assert!(left.is_equivalent(&right, &subs));
    }

    #[test]
    fn test_values_must_match() {
        let a = Symbol::new("users");
        let left = concat(vec![qualified(&a, "id"), raw(" = "), value(json!(1))]);
        let right = concat(vec![qualified(&a, "id"), raw(" = "), value(json!(2))]);
        assert!(!left.is_equivalent(&right, &SymbolSubstitution::new()));
    }

    #[test]
    fn test_resolve_follows_chain() {
        let a = Symbol::new("a");
        let b = Symbol::new("b");
        let c = Symbol::new("c");
        let mut subs = SymbolSubstitution::new();
        subs.insert(a.clone(), b.clone());
        subs.insert(b, c.clone());
        assert_eq!(subs.resolve(&a).unwrap(), c);
    }

    #[test]
    fn test_resolve_detects_cycle() {
        let a = Symbol::new("a");
        let b = Symbol::new("b");
        let mut subs = SymbolSubstitution::new();
        subs.insert(a.clone(), b.clone());
        subs.insert(b, a.clone());
        assert!(matches!(subs.resolve(&a), Err(SqlError::SubstitutionCycle(_))));
    }

    #[test]
    fn test_self_substitution_ignored() {
        let a = Symbol::new("a");
        let mut subs = SymbolSubstitution::new();
        subs.insert(a.clone(), a);
        assert!(subs.is_empty());
    }
}
