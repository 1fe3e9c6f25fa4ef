//! Plan arena
//!
//! Every plan node lives in one `Vec` and is addressed by `PlanId`.
//! Dependencies are ids, never references, so plans can be replaced
//! (after deduplication or inlining) by recording `old → new` in the
//! replacement table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::errors::{PlanError, PlanResult};
use super::finalize::{FinalizeResults, Row};
use super::select::{IdentifierMatch, IdentifierSpec, MatchTarget, SelectMode, SelectPlan};
use super::source::{ArgumentSpec, SourceDescriptor};
use crate::config::PlannerConfig;
use crate::observability::{log_event_with_fields, Event, PlannerMetrics};
use crate::sql::{self, compile, Codec, CompileContext, CompiledSql, SqlFragment, Symbol, SymbolSubstitution};

/// Index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanId(usize);

impl PlanId {
    /// The request context; always node 0
    pub const CONTEXT: PlanId = PlanId(0);

    pub fn index(&self) -> usize {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        PlanId(index)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One row of a select, as seen by its children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPlan {
    pub select: PlanId,
    /// Produced by `single()` rather than per list item
    pub single: bool,
}

/// One selected column of a row
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPlan {
    pub row: PlanId,
    pub expression: SqlFragment,
    pub codec: Codec,
    /// Index in the table plan's selection list
    pub attribute: usize,
}

/// What an inlined plan was replaced with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlinedPlan {
    /// Columns of the parent row; empty when `presence` is false
    Join {
        row: PlanId,
        attributes: Vec<usize>,
        presence: Option<usize>,
    },
    /// Array column of the parent row holding one JSON array per row
    Subquery {
        row: PlanId,
        attribute: usize,
        reverse: bool,
    },
}

impl InlinedPlan {
    pub fn row(&self) -> PlanId {
        match self {
            InlinedPlan::Join { row, .. } | InlinedPlan::Subquery { row, .. } => *row,
        }
    }
}

/// Node kinds
#[derive(Debug)]
pub enum PlanNode {
    Context,
    Constant(Value),
    /// Request variable, supplied per batch entry
    Variable(String),
    Select(Box<SelectPlan>),
    Row(RowPlan),
    Column(ColumnPlan),
    Inlined(InlinedPlan),
}

impl PlanNode {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PlanNode::Context => "context",
            PlanNode::Constant(_) => "constant",
            PlanNode::Variable(_) => "variable",
            PlanNode::Select(_) => "select",
            PlanNode::Row(_) => "row",
            PlanNode::Column(_) => "column",
            PlanNode::Inlined(_) => "inlined",
        }
    }
}

/// How a dependency looks to the optimizer
#[derive(Debug, Clone, Copy)]
pub enum DependencyKind<'a> {
    Literal(&'a Value),
    Variable,
    Context,
    /// Column `expression` of row `row` of select `table`
    ColumnOf {
        table: PlanId,
        row: PlanId,
        expression: &'a SqlFragment,
    },
    /// Anything the optimizer cannot see through
    Opaque,
}

/// How a select plan ended up being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Standalone,
    InlinedJoin,
    InlinedSubquery,
    /// Replaced by an equivalent plan
    Deduplicated(PlanId),
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Standalone => write!(f, "standalone"),
            Strategy::InlinedJoin => write!(f, "inlined join"),
            Strategy::InlinedSubquery => write!(f, "inlined subquery"),
            Strategy::Deduplicated(into) => write!(f, "deduplicated into {}", into),
        }
    }
}

/// Arguments to `PlanArena::select`
#[derive(Debug, Clone)]
pub struct SelectOptions {
    pub source: Arc<SourceDescriptor>,
    pub identifiers: Vec<IdentifierMatch>,
    pub args: Vec<ArgumentSpec>,
    /// Overrides the source's FROM expression
    pub from: Option<SqlFragment>,
    pub name: Option<String>,
    /// Pre-allocated alias, for match expressions built up front
    pub alias: Option<Symbol>,
    pub mode: SelectMode,
    /// Defaults to the arena's context node
    pub context: Option<PlanId>,
}

impl SelectOptions {
    pub fn new(source: Arc<SourceDescriptor>) -> Self {
        Self {
            source,
            identifiers: Vec::new(),
            args: Vec::new(),
            from: None,
            name: None,
            alias: None,
            mode: SelectMode::Normal,
            context: None,
        }
    }

    pub fn identifier(mut self, identifier: IdentifierMatch) -> Self {
        self.identifiers.push(identifier);
        self
    }

    pub fn arg(mut self, arg: ArgumentSpec) -> Self {
        self.args.push(arg);
        self
    }

    pub fn from(mut self, from: SqlFragment) -> Self {
        self.from = Some(from);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn alias(mut self, alias: Symbol) -> Self {
        self.alias = Some(alias);
        self
    }

    pub fn mode(mut self, mode: SelectMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn context(mut self, context: PlanId) -> Self {
        self.context = Some(context);
        self
    }
}

/// Owner of every plan node in one request
pub struct PlanArena {
    pub(crate) nodes: Vec<PlanNode>,
    pub(crate) replacements: HashMap<PlanId, PlanId>,
    pub(crate) substitutions: SymbolSubstitution,
    pub(crate) config: PlannerConfig,
    pub(crate) metrics: Arc<PlannerMetrics>,
}

impl PlanArena {
    /// Creates an arena holding only the context node.
    ///
    /// Leaves the process-wide log severity alone; see
    /// `PlannerConfig::apply_logging`.
    pub fn new(config: PlannerConfig) -> PlanResult<Self> {
        config.validate()?;
        Ok(Self {
            nodes: vec![PlanNode::Context],
            replacements: HashMap::new(),
            substitutions: SymbolSubstitution::new(),
            config,
            metrics: Arc::new(PlannerMetrics::new()),
        })
    }

    /// Shares counters with other arenas or executors; plans created
    /// before the call keep the old counters
    pub fn with_metrics(mut self, metrics: Arc<PlannerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<PlannerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn substitutions(&self) -> &SymbolSubstitution {
        &self.substitutions
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn context(&self) -> PlanId {
        PlanId::CONTEXT
    }

    pub fn constant(&mut self, value: Value) -> PlanId {
        self.push(PlanNode::Constant(value))
    }

    pub fn variable(&mut self, name: &str) -> PlanId {
        self.push(PlanNode::Variable(name.to_string()))
    }

    fn push(&mut self, node: PlanNode) -> PlanId {
        self.nodes.push(node);
        PlanId(self.nodes.len() - 1)
    }

    // ========== Lookup ==========

    /// Follows replacements to the live node
    pub fn resolve(&self, id: PlanId) -> PlanId {
        let mut current = id;
        // Replacement chains are acyclic and at most one hop per plan
        for _ in 0..self.nodes.len() {
            match self.replacements.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    pub fn node(&self, id: PlanId) -> PlanResult<&PlanNode> {
        let id = self.resolve(id);
        self.nodes
            .get(id.0)
            .ok_or_else(|| PlanError::unknown_plan(format!("no plan node {}", id)))
    }

    pub fn select_plan(&self, id: PlanId) -> PlanResult<&SelectPlan> {
        match self.node(id)? {
            PlanNode::Select(plan) => Ok(plan),
            other => Err(PlanError::unknown_plan(format!(
                "{} is a {} node, not a select",
                id,
                other.kind_name()
            ))),
        }
    }

    pub fn select_plan_mut(&mut self, id: PlanId) -> PlanResult<&mut SelectPlan> {
        let id = self.resolve(id);
        match self.nodes.get_mut(id.0) {
            Some(PlanNode::Select(plan)) => Ok(plan),
            Some(other) => Err(PlanError::unknown_plan(format!(
                "{} is a {} node, not a select",
                id,
                other.kind_name()
            ))),
            None => Err(PlanError::unknown_plan(format!("no plan node {}", id))),
        }
    }

    /// Classifies `id` for the optimizer
    pub fn dependency_kind(&self, id: PlanId) -> DependencyKind<'_> {
        match self.node(id) {
            Ok(PlanNode::Constant(value)) => DependencyKind::Literal(value),
            Ok(PlanNode::Variable(_)) => DependencyKind::Variable,
            Ok(PlanNode::Context) => DependencyKind::Context,
            Ok(PlanNode::Column(column)) => match self.node(column.row) {
                Ok(PlanNode::Row(row)) => DependencyKind::ColumnOf {
                    table: self.resolve(row.select),
                    row: self.resolve(column.row),
                    expression: &column.expression,
                },
                _ => DependencyKind::Opaque,
            },
            _ => DependencyKind::Opaque,
        }
    }

    /// How the select at `id` will be executed
    pub fn strategy(&self, id: PlanId) -> PlanResult<Strategy> {
        let resolved = self.resolve(id);
        if resolved != id {
            if let Ok(PlanNode::Select(_)) = self.node(resolved) {
                return Ok(Strategy::Deduplicated(resolved));
            }
        }
        match self.node(resolved)? {
            PlanNode::Select(_) => Ok(Strategy::Standalone),
            PlanNode::Inlined(InlinedPlan::Join { .. }) => Ok(Strategy::InlinedJoin),
            PlanNode::Inlined(InlinedPlan::Subquery { .. }) => Ok(Strategy::InlinedSubquery),
            other => Err(PlanError::unknown_plan(format!(
                "{} is a {} node, not a select",
                id,
                other.kind_name()
            ))),
        }
    }

    // ========== Construction ==========

    /// Adds a select plan
    pub fn select(&mut self, options: SelectOptions) -> PlanResult<PlanId> {
        let id = PlanId(self.nodes.len());
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| options.source.name().to_string());
        let alias = options.alias.clone().unwrap_or_else(|| Symbol::new(&name));
        let mut plan = SelectPlan::new(
            name,
            alias,
            Arc::clone(&options.source),
            options.mode,
            &self.config,
        )
        .with_metrics(Arc::clone(&self.metrics));

        let context = self.resolve(options.context.unwrap_or(PlanId::CONTEXT));
        self.check_dependency(id, &plan, context)?;
        plan.context_dependency = plan.push_dependency(context);

        for identifier in &options.identifiers {
            let dependency = self.resolve(identifier.dependency);
            self.check_dependency(id, &plan, dependency)?;
            let index = plan.push_dependency(dependency);
            let matches = match &identifier.target {
                MatchTarget::Column(column) => sql::qualified(&plan.alias, column),
                MatchTarget::Expression(expression) => expression.clone(),
            };
            plan.identifiers.push(IdentifierSpec {
                dependency: index,
                codec: identifier.codec.clone(),
                matches,
            });
        }

        let mut args = Vec::with_capacity(options.args.len());
        for arg in &options.args {
            let dependency = self.resolve(arg.dependency);
            self.check_dependency(id, &plan, dependency)?;
            let index = plan.push_dependency(dependency);
            let fragment = plan.push_placeholder(index, arg.codec.clone())?;
            args.push((arg.name.clone(), fragment));
        }
        plan.from = match options.from {
            Some(from) => from,
            None => options.source.from_expression(&args),
        };

        log_event_with_fields(
            Event::PlanCreated,
            &[("plan", plan.name()), ("id", &id.to_string())],
        );
        self.nodes.push(PlanNode::Select(Box::new(plan)));
        self.metrics.increment_plans_created();
        Ok(id)
    }

    /// Rejects dependencies that cannot supply a single value
    fn check_dependency(&self, owner: PlanId, plan: &SelectPlan, dependency: PlanId) -> PlanResult<()> {
        if dependency == owner {
            return Err(PlanError::recursive_dependency(plan.name()));
        }
        match self.node(dependency)? {
            PlanNode::Select(_) | PlanNode::Inlined(_) => Err(PlanError::multi_row_dependency(
                format!(
                    "plan '{}' cannot depend on {}: a list of rows is not a single value",
                    plan.name(),
                    dependency
                ),
            )),
            PlanNode::Row(_) => Err(PlanError::multi_row_dependency(format!(
                "plan '{}' cannot depend on row {} directly; select a column instead",
                plan.name(),
                dependency
            ))),
            PlanNode::Column(_) => {
                if let DependencyKind::ColumnOf { table, .. } = self.dependency_kind(dependency) {
                    if table == owner {
                        return Err(PlanError::recursive_dependency(plan.name()));
                    }
                }
                Ok(())
            }
            PlanNode::Context | PlanNode::Constant(_) | PlanNode::Variable(_) => Ok(()),
        }
    }

    /// Adds `dependency` to a select, returning its index
    pub fn add_dependency(&mut self, select: PlanId, dependency: PlanId) -> PlanResult<usize> {
        let select = self.resolve(select);
        let dependency = self.resolve(dependency);
        self.check_dependency(select, self.select_plan(select)?, dependency)?;
        Ok(self.select_plan_mut(select)?.push_dependency(dependency))
    }

    /// The only row of a unique select
    pub fn single(&mut self, select: PlanId) -> PlanResult<PlanId> {
        let select = self.resolve(select);
        let plan = self.select_plan(select)?;
        if !plan.is_unique() {
            return Err(PlanError::not_unique(plan.name()));
        }
        Ok(self.push(PlanNode::Row(RowPlan {
            select,
            single: true,
        })))
    }

    /// Each row of a select, one at a time
    pub fn list_item(&mut self, select: PlanId) -> PlanResult<PlanId> {
        let select = self.resolve(select);
        self.select_plan(select)?;
        Ok(self.push(PlanNode::Row(RowPlan {
            select,
            single: false,
        })))
    }

    /// Column `name` of the row's own alias
    pub fn column(&mut self, row: PlanId, name: &str, codec: Codec) -> PlanResult<PlanId> {
        let alias = match self.node(row)? {
            PlanNode::Row(r) => self.select_plan(r.select)?.alias().clone(),
            other => {
                return Err(PlanError::unknown_plan(format!(
                    "{} is a {} node, not a row",
                    row,
                    other.kind_name()
                )))
            }
        };
        self.column_expression(row, sql::qualified(&alias, name), codec)
    }

    /// Arbitrary expression selected from the row's plan
    pub fn column_expression(
        &mut self,
        row: PlanId,
        expression: SqlFragment,
        codec: Codec,
    ) -> PlanResult<PlanId> {
        let row = self.resolve(row);
        let select = match self.node(row)? {
            PlanNode::Row(r) => r.select,
            other => {
                return Err(PlanError::unknown_plan(format!(
                    "{} is a {} node, not a row",
                    row,
                    other.kind_name()
                )))
            }
        };
        let attribute = self.select_plan_mut(select)?.select(expression.clone())?;
        Ok(self.push(PlanNode::Column(ColumnPlan {
            row,
            expression,
            codec,
            attribute,
        })))
    }

    /// Copies a select, optionally switching mode
    pub fn clone_select(&mut self, id: PlanId, mode: Option<SelectMode>) -> PlanResult<PlanId> {
        let source = self.select_plan(id)?;
        let mode = mode.unwrap_or(source.mode);
        let same_mode = mode == source.mode;

        let mut plan = SelectPlan::new(
            source.name.clone(),
            source.alias.clone(),
            Arc::clone(&source.source),
            mode,
            &self.config,
        )
        .with_metrics(Arc::clone(&self.metrics));
        for (expected, dependency) in source.dependencies.iter().enumerate() {
            let actual = plan.push_dependency(*dependency);
            if actual != expected {
                return Err(PlanError::dependency_mismatch(expected, actual));
            }
        }
        plan.context_dependency = source.context_dependency;
        plan.from = source.from.clone();
        plan.joins = source.joins.clone();
        plan.conditions = source.conditions.clone();
        plan.identifiers = source.identifiers.clone();
        plan.placeholders = source.placeholders.clone();
        plan.placeholder_values = source.placeholder_values.clone();
        plan.trusted = source.trusted;
        plan.inlining_forbidden = source.inlining_forbidden;
        plan.has_side_effects = source.has_side_effects;

        let cursors = if same_mode {
            plan.unique = source.unique;
            plan.selects = source.selects.clone();
            plan.orders = source.orders.clone();
            plan.order_is_unique = source.order_is_unique;
            plan.groups = source.groups.clone();
            plan.having = source.having.clone();
            plan.first = source.first;
            plan.last = source.last;
            plan.offset = source.offset;
            plan.fetch_one_extra = source.fetch_one_extra;
            source.cursors.clone()
        } else {
            Vec::new()
        };
        for cursor in cursors {
            plan.register_cursor(cursor)?;
        }

        let id = self.push(PlanNode::Select(Box::new(plan)));
        self.metrics.increment_plans_created();
        Ok(id)
    }

    // ========== Finalize & rows ==========

    /// Compiles the select at `id` (once)
    pub fn finalize(&mut self, id: PlanId) -> PlanResult<&FinalizeResults> {
        let id = self.resolve(id);
        let Self {
            nodes,
            substitutions,
            metrics,
            ..
        } = self;
        let plan = match nodes.get_mut(id.0) {
            Some(PlanNode::Select(plan)) => plan,
            _ => return Err(PlanError::unknown_plan(format!("{} is not a select", id))),
        };
        let first_time = !plan.is_finalized();
        let results = plan.finalize(substitutions)?;
        if first_time {
            metrics.increment_plans_finalized();
            log_event_with_fields(
                Event::PlanFinalized,
                &[("id", &id.to_string()), ("sql", &results.query.text)],
            );
        }
        Ok(results)
    }

    /// Finalizes every select still executed as its own query
    pub fn finalize_all(&mut self) -> PlanResult<()> {
        let ids: Vec<PlanId> = (0..self.nodes.len())
            .map(PlanId)
            .filter(|id| !self.replacements.contains_key(id))
            .filter(|id| matches!(self.nodes[id.0], PlanNode::Select(_)))
            .collect();
        for id in ids {
            self.finalize(id)?;
        }
        Ok(())
    }

    /// Results of an already finalized select
    pub fn finalize_results(&self, id: PlanId) -> PlanResult<&FinalizeResults> {
        self.select_plan(id)?
            .finalize_results()
            .ok_or_else(|| PlanError::unknown_plan(format!("{} has not been finalized", id)))
    }

    /// Rows of an inlined plan, read out of its parent's row
    pub fn inlined_rows(&self, id: PlanId, parent_row: &[Value]) -> PlanResult<Vec<Row>> {
        let inlined = match self.node(id)? {
            PlanNode::Inlined(inlined) => inlined,
            other => {
                return Err(PlanError::unknown_plan(format!(
                    "{} is a {} node, not an inlined plan",
                    id,
                    other.kind_name()
                )))
            }
        };
        let cell = |index: usize| parent_row.get(index).cloned().unwrap_or(Value::Null);
        match inlined {
            InlinedPlan::Join {
                attributes,
                presence,
                ..
            } => {
                if let Some(presence) = presence {
                    if !is_truthy(&cell(*presence)) {
                        return Ok(Vec::new());
                    }
                }
                Ok(vec![attributes.iter().map(|i| cell(*i)).collect()])
            }
            InlinedPlan::Subquery {
                attribute, reverse, ..
            } => {
                let mut rows: Vec<Row> = match cell(*attribute) {
                    Value::Array(items) => items
                        .into_iter()
                        .map(|item| match item {
                            Value::Array(columns) => columns,
                            other => vec![other],
                        })
                        .collect(),
                    Value::Null => Vec::new(),
                    other => {
                        return Err(PlanError::unknown_plan(format!(
                            "expected an array for inlined plan {}, got {}",
                            id, other
                        )))
                    }
                };
                if *reverse {
                    rows.reverse();
                }
                Ok(rows)
            }
        }
    }

    /// Compiles a fragment against the arena's substitutions
    pub fn compile_fragment(&self, fragment: &SqlFragment) -> PlanResult<CompiledSql> {
        let ctx = CompileContext::empty().with_substitutions(&self.substitutions);
        Ok(compile(fragment, &ctx)?)
    }
}

/// Presence markers come back as booleans, or as text from text-protocol drivers
fn is_truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true)) || matches!(value, Value::String(s) if s == "t" || s == "true")
}
