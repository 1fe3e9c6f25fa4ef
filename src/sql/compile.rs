//! Fragment compiler
//!
//! Turns a fragment tree into `(text, values)`. Compilation is
//! deterministic: the same tree and context always yield the same text.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::equivalence::SymbolSubstitution;
use super::errors::{SqlError, SqlResult};
use super::fragment::{SqlFragment, Symbol};

const INDENT: &str = "  ";

/// Inputs that resolve symbols while compiling
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileContext<'a> {
    /// Retired alias → replacement
    pub substitutions: Option<&'a SymbolSubstitution>,
    /// Placeholder symbol → fragment
    pub placeholders: Option<&'a HashMap<Symbol, SqlFragment>>,
}

impl<'a> CompileContext<'a> {
    /// Context with no substitutions and no placeholders
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sets the substitution map
    pub fn with_substitutions(mut self, substitutions: &'a SymbolSubstitution) -> Self {
        self.substitutions = Some(substitutions);
        self
    }

    /// Sets the placeholder map
    pub fn with_placeholders(mut self, placeholders: &'a HashMap<Symbol, SqlFragment>) -> Self {
        self.placeholders = Some(placeholders);
        self
    }
}

/// Compiled SQL
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSql {
    /// SQL text with `$n` markers
    pub text: String,
    /// Positional values (`values[0]` is `$1`)
    pub values: Vec<Value>,
    /// Zero-based value position of each `Parameter` symbol
    pub parameters: HashMap<Symbol, usize>,
}

/// Compiles a fragment tree
pub fn compile(fragment: &SqlFragment, ctx: &CompileContext<'_>) -> SqlResult<CompiledSql> {
    let mut compiler = Compiler {
        ctx,
        text: String::with_capacity(256),
        values: Vec::new(),
        parameters: HashMap::new(),
        names: HashMap::new(),
        taken: HashSet::new(),
        depth: 0,
        resolving: Vec::new(),
    };
    compiler.emit(fragment)?;
    Ok(CompiledSql {
        text: compiler.text,
        values: compiler.values,
        parameters: compiler.parameters,
    })
}

struct Compiler<'c, 'a> {
    ctx: &'c CompileContext<'a>,
    text: String,
    values: Vec<Value>,
    parameters: HashMap<Symbol, usize>,
    names: HashMap<Symbol, String>,
    taken: HashSet<String>,
    depth: usize,
    resolving: Vec<Symbol>,
}

impl Compiler<'_, '_> {
    fn emit(&mut self, fragment: &SqlFragment) -> SqlResult<()> {
        match fragment {
            SqlFragment::Raw(text) => self.push_text(text),
            SqlFragment::Identifier(name) => {
                self.text.push('"');
                self.text.push_str(&name.replace('"', "\"\""));
                self.text.push('"');
            }
            SqlFragment::Alias(symbol) => {
                let name = self.alias_name(symbol)?;
                self.text.push_str(&name);
            }
            SqlFragment::Value(value) => {
                self.values.push(value.clone());
                self.text.push('$');
                self.text.push_str(&self.values.len().to_string());
            }
            SqlFragment::Parameter(symbol) => {
                let position = match self.parameters.get(symbol) {
                    Some(position) => *position,
                    None => {
                        self.values.push(Value::Null);
                        let position = self.values.len() - 1;
                        self.parameters.insert(symbol.clone(), position);
                        position
                    }
                };
                self.text.push('$');
                self.text.push_str(&(position + 1).to_string());
            }
            SqlFragment::Placeholder(symbol) => {
                if self.resolving.contains(symbol) {
                    return Err(SqlError::RecursivePlaceholder(symbol.name().to_string()));
                }
                let resolved = self
                    .ctx
                    .placeholders
                    .and_then(|map| map.get(symbol))
                    .ok_or_else(|| SqlError::UnresolvedPlaceholder(symbol.name().to_string()))?;
                self.resolving.push(symbol.clone());
                self.emit(resolved)?;
                self.resolving.pop();
            }
            SqlFragment::List(items) => {
                for item in items {
                    self.emit(item)?;
                }
            }
            SqlFragment::Indent(inner) => {
                self.depth += 1;
                self.newline();
                self.emit(inner)?;
                self.depth -= 1;
                self.newline();
            }
        }
        Ok(())
    }

    fn push_text(&mut self, text: &str) {
        let mut lines = text.split('\n');
        if let Some(first) = lines.next() {
            self.text.push_str(first);
        }
        for line in lines {
            self.newline();
            self.text.push_str(line);
        }
    }

    fn newline(&mut self) {
        self.text.push('\n');
        for _ in 0..self.depth {
            self.text.push_str(INDENT);
        }
    }

    fn alias_name(&mut self, symbol: &Symbol) -> SqlResult<String> {
        let symbol = match self.ctx.substitutions {
            Some(substitutions) => substitutions.resolve(symbol)?,
            None => symbol.clone(),
        };
        if let Some(name) = self.names.get(&symbol) {
            return Ok(name.clone());
        }
        let base = sanitize(symbol.name());
        let mut candidate = format!("__{}__", base);
        let mut n = 2;
        while self.taken.contains(&candidate) {
            candidate = format!("__{}_{}__", base, n);
            n += 1;
        }
        self.taken.insert(candidate.clone());
        self.names.insert(symbol, candidate.clone());
        Ok(candidate)
    }
}

/// Reduces a name hint to `[a-z0-9_]`
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "t".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::fragment::{concat, ident, indent, param, placeholder, qualified, raw, value};
    use serde_json::json;

    #[test]
    fn test_values_are_parameterized() {
        let f = concat(vec![raw("select "), value(json!(1)), raw(", "), value(json!("a"))]);
        let compiled = compile(&f, &CompileContext::empty()).unwrap();
        assert_eq!(compiled.text, "select $1, $2");
        assert_eq!(compiled.values, vec![json!(1), json!("a")]);
    }

    #[test]
    fn test_identifiers_are_quoted() {
        let compiled = compile(&ident("we\"ird"), &CompileContext::empty()).unwrap();
        assert_eq!(compiled.text, "\"we\"\"ird\"");
    }

    #[test]
    fn test_alias_naming_is_deterministic() {
        let a = Symbol::new("users");
        let b = Symbol::new("users");
        let f = concat(vec![qualified(&a, "id"), raw(" = "), qualified(&b, "id")]);
        let compiled = compile(&f, &CompileContext::empty()).unwrap();
        assert_eq!(compiled.text, "__users__.\"id\" = __users_2__.\"id\"");
    }

    #[test]
    fn test_substitution_resolves_retired_alias() {
        let old = Symbol::new("posts");
        let new = Symbol::new("posts");
        let mut subs = SymbolSubstitution::new();
        subs.insert(old.clone(), new.clone());

        let f = concat(vec![qualified(&old, "id"), raw(" = "), qualified(&new, "id")]);
        let ctx = CompileContext::empty().with_substitutions(&subs);
        let compiled = compile(&f, &ctx).unwrap();
        assert_eq!(compiled.text, "__posts__.\"id\" = __posts__.\"id\"");
    }

    #[test]
    fn test_placeholders_resolve_from_context() {
        let p = Symbol::new("author");
        let mut map = HashMap::new();
        map.insert(p.clone(), value(json!(42)));

        let f = concat(vec![raw("x = "), placeholder(&p)]);
        let ctx = CompileContext::empty().with_placeholders(&map);
        let compiled = compile(&f, &ctx).unwrap();
        assert_eq!(compiled.text, "x = $1");
        assert_eq!(compiled.values, vec![json!(42)]);
    }

    #[test]
    fn test_unresolved_placeholder_fails() {
        let p = Symbol::new("author");
        let result = compile(&placeholder(&p), &CompileContext::empty());
        assert_eq!(
            result.unwrap_err(),
            SqlError::UnresolvedPlaceholder("author".into())
        );
    }

    #[test]
    fn test_recursive_placeholder_fails() {
        let p = Symbol::new("loop");
        let mut map = HashMap::new();
        map.insert(p.clone(), concat(vec![raw("1 + "), placeholder(&p)]));
        let ctx = CompileContext::empty().with_placeholders(&map);
        assert!(matches!(
            compile(&placeholder(&p), &ctx),
            Err(SqlError::RecursivePlaceholder(_))
        ));
    }

    #[test]
    fn test_parameter_position_reported() {
        let keys = Symbol::new("keys");
        let f = concat(vec![value(json!(true)), raw(" and "), param(&keys), raw("::json")]);
        let compiled = compile(&f, &CompileContext::empty()).unwrap();
        assert_eq!(compiled.text, "$1 and $2::json");
        assert_eq!(compiled.parameters.get(&keys), Some(&1));
        assert_eq!(compiled.values[1], Value::Null);
    }

    #[test]
    fn test_indent() {
        let f = concat(vec![raw("select"), indent(raw("a,\nb")), raw("from t")]);
        let compiled = compile(&f, &CompileContext::empty()).unwrap();
        assert_eq!(compiled.text, "select\n  a,\n  b\nfrom t");
    }
}
