//! Source descriptors and read policies
//!
//! A source is the relation a plan selects from: a table, a view or a
//! set-returning function. Read policies are row-level filters injected
//! during SQL assembly unless the plan is trusted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sql::{self, Codec, SqlFragment, Symbol};

/// Row-level read policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccessPolicy {
    /// No filter
    #[serde(rename = "unrestricted")]
    Unrestricted,

    /// Rows are visible only to their owner
    #[serde(rename = "ownership")]
    Ownership {
        /// Column holding the owner id
        owner_column: String,
        /// Session setting holding the current user id
        claim: String,
    },

    /// Everyone may read; ownership only matters for writes
    #[serde(rename = "public_read")]
    PublicRead,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::Unrestricted
    }
}

impl AccessPolicy {
    /// Filter condition for reading through `alias`, if any
    pub fn read_condition(&self, alias: &Symbol) -> Option<SqlFragment> {
        match self {
            AccessPolicy::Unrestricted | AccessPolicy::PublicRead => None,
            AccessPolicy::Ownership {
                owner_column,
                claim,
            } => Some(sql::concat(vec![
                sql::qualified(alias, owner_column),
                sql::raw(" = current_setting("),
                sql::value(serde_json::Value::String(claim.clone())),
                sql::raw(", true)"),
            ])),
        }
    }
}

/// Kind of relation a source reads from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// Table or view
    Table(SqlFragment),
    /// Set-returning function; arguments are supplied per plan
    Function(SqlFragment),
}

/// Shared description of a relation
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    name: String,
    kind: SourceKind,
    unique_columns: Vec<Vec<String>>,
    policy: AccessPolicy,
}

impl SourceDescriptor {
    /// Table source, optionally schema-qualified (`"app"."users"`)
    pub fn table(schema: Option<&str>, table: &str) -> Self {
        let from = match schema {
            Some(schema) => sql::concat(vec![sql::ident(schema), sql::raw("."), sql::ident(table)]),
            None => sql::ident(table),
        };
        Self {
            name: table.to_string(),
            kind: SourceKind::Table(from),
            unique_columns: Vec::new(),
            policy: AccessPolicy::Unrestricted,
        }
    }

    /// Function source (`"app"."search_posts"(...)`)
    pub fn function(schema: Option<&str>, function: &str) -> Self {
        let callee = match schema {
            Some(schema) => {
                sql::concat(vec![sql::ident(schema), sql::raw("."), sql::ident(function)])
            }
            None => sql::ident(function),
        };
        Self {
            name: function.to_string(),
            kind: SourceKind::Function(callee),
            unique_columns: Vec::new(),
            policy: AccessPolicy::Unrestricted,
        }
    }

    /// Declares a unique column set; the first one is the primary key
    pub fn with_unique(mut self, columns: &[&str]) -> Self {
        self.unique_columns
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Sets the read policy
    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Finishes the descriptor
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn unique_columns(&self) -> &[Vec<String>] {
        &self.unique_columns
    }

    /// First declared unique column set
    pub fn primary_key(&self) -> Option<&[String]> {
        self.unique_columns.first().map(|cols| cols.as_slice())
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, SourceKind::Function(_))
    }

    /// FROM expression; `args` are the compiled argument fragments for
    /// function sources and are ignored for tables
    pub fn from_expression(&self, args: &[(Option<String>, SqlFragment)]) -> SqlFragment {
        match &self.kind {
            SourceKind::Table(from) => from.clone(),
            SourceKind::Function(callee) => {
                let rendered = args.iter().map(|(name, fragment)| match name {
                    Some(name) => sql::concat(vec![sql::ident(name.as_str()), sql::raw(" => "), fragment.clone()]),
                    None => fragment.clone(),
                });
                sql::concat(vec![callee.clone(), sql::parens(sql::join(rendered, ", "))])
            }
        }
    }
}

/// Argument to a function source
#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    /// Plan providing the argument value
    pub dependency: crate::plan::PlanId,
    /// Argument type
    pub codec: Codec,
    /// Named-argument notation if set
    pub name: Option<String>,
}

impl ArgumentSpec {
    /// Positional argument
    pub fn positional(dependency: crate::plan::PlanId, codec: Codec) -> Self {
        Self {
            dependency,
            codec,
            name: None,
        }
    }

    /// Named argument (`name => value`)
    pub fn named(dependency: crate::plan::PlanId, codec: Codec, name: &str) -> Self {
        Self {
            dependency,
            codec,
            name: Some(name.to_string()),
        }
    }
}
