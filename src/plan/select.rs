//! Select plan state and mutators
//!
//! A `SelectPlan` describes one `SELECT` over a source. It is mutable
//! until its parameters lock, after which only the selection list may
//! still grow, and only until the plan is finalized.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::cursor::{self, CursorKind};
use super::errors::{PlanError, PlanResult};
use super::finalize::FinalizeResults;
use super::locks::{LockParameter, ParameterLocks};
use super::source::SourceDescriptor;
use crate::config::PlannerConfig;
use crate::observability::PlannerMetrics;
use crate::sql::{self, Codec, SqlFragment, Symbol};
use crate::plan::PlanId;

/// Query mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Normal,
    /// Permits GROUP BY and HAVING, forbids cursors
    Aggregate,
}

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Cross,
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub(crate) fn keyword(&self) -> &'static str {
        match self {
            JoinKind::Cross => "cross join",
            JoinKind::Inner => "inner join",
            JoinKind::Left => "left outer join",
            JoinKind::Right => "right outer join",
            JoinKind::Full => "full outer join",
        }
    }
}

/// One joined relation
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub from: SqlFragment,
    pub alias: Symbol,
    /// Conjunction; ignored for cross joins
    pub conditions: Vec<SqlFragment>,
    pub lateral: bool,
}

impl Join {
    pub fn new(kind: JoinKind, from: SqlFragment, alias: Symbol) -> Self {
        Self {
            kind,
            from,
            alias,
            conditions: Vec::new(),
            lateral: false,
        }
    }

    pub fn on(mut self, condition: SqlFragment) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn lateral(mut self) -> Self {
        self.lateral = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn reverse(&self) -> Self {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }
}

/// Null placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

impl NullsOrder {
    pub fn reverse(&self) -> Self {
        match self {
            NullsOrder::First => NullsOrder::Last,
            NullsOrder::Last => NullsOrder::First,
        }
    }
}

/// One ORDER BY term
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub fragment: SqlFragment,
    pub direction: Direction,
    pub nulls: Option<NullsOrder>,
}

impl OrderSpec {
    pub fn asc(fragment: SqlFragment) -> Self {
        Self {
            fragment,
            direction: Direction::Asc,
            nulls: None,
        }
    }

    pub fn desc(fragment: SqlFragment) -> Self {
        Self {
            fragment,
            direction: Direction::Desc,
            nulls: None,
        }
    }

    pub fn nulls(mut self, nulls: NullsOrder) -> Self {
        self.nulls = Some(nulls);
        self
    }

    /// Same expression, opposite direction and null placement
    pub fn reversed(&self) -> Self {
        Self {
            fragment: self.fragment.clone(),
            direction: self.direction.reverse(),
            nulls: self.nulls.map(|n| n.reverse()),
        }
    }
}

/// What an identifier value is compared against
#[derive(Debug, Clone, PartialEq)]
pub enum MatchTarget {
    /// Column of the plan's own alias
    Column(String),
    /// Arbitrary expression; use `SelectOptions::alias` to refer to the plan
    Expression(SqlFragment),
}

/// Identifier as supplied by the resolver
#[derive(Debug, Clone)]
pub struct IdentifierMatch {
    pub dependency: PlanId,
    pub codec: Codec,
    pub target: MatchTarget,
}

impl IdentifierMatch {
    pub fn column(dependency: PlanId, codec: Codec, column: &str) -> Self {
        Self {
            dependency,
            codec,
            target: MatchTarget::Column(column.to_string()),
        }
    }

    pub fn expression(dependency: PlanId, codec: Codec, expression: SqlFragment) -> Self {
        Self {
            dependency,
            codec,
            target: MatchTarget::Expression(expression),
        }
    }
}

/// Identifier stored on the plan: the batch key component at `dependency`
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierSpec {
    pub dependency: usize,
    pub codec: Codec,
    pub matches: SqlFragment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderSpec {
    pub dependency: usize,
    pub codec: Codec,
    pub symbol: Symbol,
}

/// Stored cursor, replayed onto clones
#[derive(Debug, Clone, PartialEq)]
pub struct CursorSpec {
    pub kind: CursorKind,
    pub cursor: String,
}

/// Streaming request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOptions {
    /// Rows per key fetched eagerly before the cursor opens
    pub initial_count: u64,
}

/// A single SELECT
#[derive(Debug)]
pub struct SelectPlan {
    pub(crate) name: String,
    pub(crate) alias: Symbol,
    pub(crate) source: Arc<SourceDescriptor>,
    pub(crate) from: SqlFragment,
    pub(crate) mode: SelectMode,

    pub(crate) dependencies: Vec<PlanId>,
    pub(crate) context_dependency: usize,

    pub(crate) joins: Vec<Join>,
    pub(crate) conditions: Vec<SqlFragment>,
    pub(crate) groups: Vec<SqlFragment>,
    pub(crate) having: Vec<SqlFragment>,
    pub(crate) orders: Vec<OrderSpec>,
    pub(crate) order_is_unique: bool,
    pub(crate) first: Option<u64>,
    pub(crate) last: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) fetch_one_extra: bool,

    pub(crate) selects: Vec<SqlFragment>,
    pub(crate) identifiers: Vec<IdentifierSpec>,
    pub(crate) placeholders: Vec<PlaceholderSpec>,
    pub(crate) placeholder_values: HashMap<Symbol, SqlFragment>,
    pub(crate) cursors: Vec<CursorSpec>,
    /// Predicates decoded from `cursors`, applied once orderBy locks
    pub(crate) cursor_conditions: Vec<SqlFragment>,
    pub(crate) cursor_columns: Option<Vec<usize>>,
    pub(crate) stream: Option<StreamOptions>,

    pub(crate) trusted: bool,
    pub(crate) unique: bool,
    pub(crate) inlining_forbidden: bool,
    pub(crate) has_side_effects: bool,
    pub(crate) locked: bool,
    pub(crate) locks: ParameterLocks,
    /// First callback error raised while locking
    pub(crate) lock_failure: Option<PlanError>,

    pub(crate) max_placeholders: usize,
    pub(crate) digest_length: usize,
    pub(crate) metrics: Arc<PlannerMetrics>,
    pub(crate) finalized: Option<FinalizeResults>,
}

impl SelectPlan {
    /// Creates an unlocked plan with the default tie-break callback armed.
    ///
    /// `from` starts as the source's bare FROM expression; function
    /// arguments are filled in by the arena.
    pub(crate) fn new(
        name: String,
        alias: Symbol,
        source: Arc<SourceDescriptor>,
        mode: SelectMode,
        config: &PlannerConfig,
    ) -> Self {
        let from = source.from_expression(&[]);
        let locks = ParameterLocks::with_before(
            LockParameter::OrderBy,
            Box::new(|plan: &mut SelectPlan| {
                plan.lock_parameter(LockParameter::GroupBy)?;
                plan.apply_default_order();
                Ok(())
            }),
        );
        Self {
            name,
            alias,
            source,
            from,
            mode,
            dependencies: Vec::new(),
            context_dependency: 0,
            joins: Vec::new(),
            conditions: Vec::new(),
            groups: Vec::new(),
            having: Vec::new(),
            orders: Vec::new(),
            order_is_unique: false,
            first: None,
            last: None,
            offset: None,
            fetch_one_extra: false,
            selects: Vec::new(),
            identifiers: Vec::new(),
            placeholders: Vec::new(),
            placeholder_values: HashMap::new(),
            cursors: Vec::new(),
            cursor_conditions: Vec::new(),
            cursor_columns: None,
            stream: None,
            trusted: false,
            unique: false,
            inlining_forbidden: false,
            has_side_effects: false,
            locked: false,
            locks,
            lock_failure: None,
            max_placeholders: config.max_placeholders,
            digest_length: config.cursor_digest_length,
            metrics: Arc::new(PlannerMetrics::new()),
            finalized: None,
        }
    }

    /// Counts rejected cursors into shared counters
    pub(crate) fn with_metrics(mut self, metrics: Arc<PlannerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Appends the source's primary key as a tie-break
    fn apply_default_order(&mut self) {
        if self.mode != SelectMode::Normal || self.order_is_unique {
            return;
        }
        let key = match self.source.primary_key() {
            Some(key) => key.to_vec(),
            None => return,
        };
        for column in key {
            let fragment = sql::qualified(&self.alias, &column);
            if !self.orders.iter().any(|o| o.fragment == fragment) {
                self.orders.push(OrderSpec::asc(fragment));
            }
        }
        self.order_is_unique = true;
    }

    // ========== Accessors ==========

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The plan's alias symbol
    pub fn alias(&self) -> &Symbol {
        &self.alias
    }

    pub fn source(&self) -> &Arc<SourceDescriptor> {
        &self.source
    }

    pub fn mode(&self) -> SelectMode {
        self.mode
    }

    pub fn dependencies(&self) -> &[PlanId] {
        &self.dependencies
    }

    pub fn context_dependency(&self) -> PlanId {
        self.dependencies[self.context_dependency]
    }

    pub fn orders(&self) -> &[OrderSpec] {
        &self.orders
    }

    pub fn selects(&self) -> &[SqlFragment] {
        &self.selects
    }

    pub fn conditions(&self) -> &[SqlFragment] {
        &self.conditions
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn identifiers(&self) -> &[IdentifierSpec] {
        &self.identifiers
    }

    pub fn placeholders(&self) -> &[PlaceholderSpec] {
        &self.placeholders
    }

    pub fn first(&self) -> Option<u64> {
        self.first
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_order_unique(&self) -> bool {
        self.order_is_unique
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    pub fn stream_options(&self) -> Option<StreamOptions> {
        self.stream
    }

    pub fn finalize_results(&self) -> Option<&FinalizeResults> {
        self.finalized.as_ref()
    }

    // ========== Guards ==========

    fn ensure_shape_mutable(&self, what: &'static str) -> PlanResult<()> {
        if self.locked {
            return Err(PlanError::parameter_locked(what));
        }
        Ok(())
    }

    fn ensure_not_finalized(&self, what: &'static str) -> PlanResult<()> {
        if self.finalized.is_some() {
            return Err(PlanError::parameter_locked(what));
        }
        Ok(())
    }

    fn ensure_aggregate(&self, what: &str) -> PlanResult<()> {
        if self.mode != SelectMode::Aggregate {
            return Err(PlanError::not_aggregate(what));
        }
        Ok(())
    }

    // ========== Mutators ==========

    /// Adds a filter condition (conjunction)
    pub fn and_where(&mut self, condition: SqlFragment) -> PlanResult<()> {
        self.ensure_shape_mutable("where")?;
        self.conditions.push(condition);
        Ok(())
    }

    pub fn order_by(&mut self, order: OrderSpec) -> PlanResult<()> {
        self.locks.ensure_mutable(LockParameter::OrderBy)?;
        self.orders.push(order);
        Ok(())
    }

    /// Declares the current ordering unique; sticky, never re-validated
    pub fn set_order_is_unique(&mut self, unique: bool) -> PlanResult<()> {
        self.locks.ensure_mutable(LockParameter::OrderBy)?;
        self.order_is_unique = unique;
        Ok(())
    }

    pub fn group_by(&mut self, group: SqlFragment) -> PlanResult<()> {
        self.ensure_aggregate("groupBy")?;
        self.locks.ensure_mutable(LockParameter::GroupBy)?;
        self.groups.push(group);
        Ok(())
    }

    pub fn and_having(&mut self, condition: SqlFragment) -> PlanResult<()> {
        self.ensure_aggregate("having")?;
        self.locks.ensure_mutable(LockParameter::GroupBy)?;
        self.having.push(condition);
        Ok(())
    }

    pub fn set_first(&mut self, first: u64) -> PlanResult<()> {
        self.locks.ensure_mutable(LockParameter::First)?;
        if self.last.is_some() {
            return Err(PlanError::first_with_last());
        }
        self.first = Some(first);
        Ok(())
    }

    pub fn set_last(&mut self, last: u64) -> PlanResult<()> {
        self.locks.ensure_mutable(LockParameter::Last)?;
        if self.offset.is_some() {
            return Err(PlanError::last_with_offset());
        }
        if self.first.is_some() {
            return Err(PlanError::first_with_last());
        }
        self.last = Some(last);
        Ok(())
    }

    pub fn set_offset(&mut self, offset: u64) -> PlanResult<()> {
        self.locks.ensure_mutable(LockParameter::Offset)?;
        if self.last.is_some() {
            return Err(PlanError::last_with_offset());
        }
        self.offset = Some(offset);
        Ok(())
    }

    /// Fetch one row past `first`/`last` so callers can detect more pages
    pub fn set_fetch_one_extra(&mut self, enabled: bool) -> PlanResult<()> {
        self.locks.ensure_mutable(LockParameter::First)?;
        self.locks.ensure_mutable(LockParameter::Last)?;
        self.fetch_one_extra = enabled;
        Ok(())
    }

    /// Adds a join
    pub fn join(&mut self, join: Join) -> PlanResult<()> {
        self.ensure_shape_mutable("join")?;
        self.joins.push(join);
        Ok(())
    }

    /// `left outer join <from> as <alias> on <condition>`
    pub fn left_join(
        &mut self,
        from: SqlFragment,
        alias: &Symbol,
        condition: SqlFragment,
    ) -> PlanResult<()> {
        self.join(Join::new(JoinKind::Left, from, alias.clone()).on(condition))
    }

    pub fn inner_join(
        &mut self,
        from: SqlFragment,
        alias: &Symbol,
        condition: SqlFragment,
    ) -> PlanResult<()> {
        self.join(Join::new(JoinKind::Inner, from, alias.clone()).on(condition))
    }

    pub fn cross_join(&mut self, from: SqlFragment, alias: &Symbol) -> PlanResult<()> {
        self.join(Join::new(JoinKind::Cross, from, alias.clone()))
    }

    /// Placeholder for the value of dependency `dependency`, resolved at
    /// compile time
    pub fn placeholder(&mut self, dependency: usize, codec: Codec) -> PlanResult<SqlFragment> {
        self.ensure_shape_mutable("placeholder")?;
        self.push_placeholder(dependency, codec)
    }

    /// Adds `fragment` to the selection list, returning its index.
    ///
    /// A structurally equal expression returns the existing index.
    pub fn select(&mut self, fragment: SqlFragment) -> PlanResult<usize> {
        self.ensure_not_finalized("select")?;
        Ok(self.select_internal(fragment))
    }

    /// Applies an opaque cursor; rows strictly after it are returned
    pub fn set_after(&mut self, cursor: &str) -> PlanResult<()> {
        self.register_cursor(CursorSpec {
            kind: CursorKind::After,
            cursor: cursor.to_string(),
        })
    }

    /// Applies an opaque cursor; rows strictly before it are returned
    pub fn set_before(&mut self, cursor: &str) -> PlanResult<()> {
        self.register_cursor(CursorSpec {
            kind: CursorKind::Before,
            cursor: cursor.to_string(),
        })
    }

    pub(crate) fn register_cursor(&mut self, spec: CursorSpec) -> PlanResult<()> {
        self.ensure_not_finalized("cursor")?;
        self.ensure_shape_mutable("cursor")?;
        if self.mode == SelectMode::Aggregate {
            return Err(PlanError::cursor_unsupported(
                "cursor pagination is not available in aggregate mode",
            ));
        }
        self.cursors.push(spec.clone());
        self.after_lock(
            LockParameter::OrderBy,
            Box::new(move |plan: &mut SelectPlan| plan.apply_cursor(&spec)),
        )
    }

    fn apply_cursor(&mut self, spec: &CursorSpec) -> PlanResult<()> {
        if self.orders.is_empty() || !self.order_is_unique {
            return Err(PlanError::cursor_unsupported(format!(
                "plan '{}' has no unique ordering to paginate over",
                self.name
            )));
        }
        let digest = self.order_digest()?;
        let values = cursor::decode_cursor(&spec.cursor, &digest, self.orders.len())
            .inspect_err(|err| {
                if err.is_user_facing() {
                    self.metrics.increment_cursors_rejected();
                }
            })?;
        let condition = cursor::cursor_condition(&self.orders, &values, spec.kind);
        self.cursor_conditions.push(condition);
        Ok(())
    }

    /// Fingerprint of the current ordering
    pub fn order_digest(&self) -> PlanResult<String> {
        cursor::order_digest(
            &self.orders,
            &self.placeholders,
            &self.placeholder_values,
            self.digest_length,
        )
    }

    /// Selects every order expression so rows can carry their cursor.
    ///
    /// Call once the ordering is final; locks orderBy.
    pub fn select_cursor_columns(&mut self) -> PlanResult<Vec<usize>> {
        self.ensure_not_finalized("select")?;
        self.lock_parameter(LockParameter::OrderBy)?;
        if self.mode == SelectMode::Aggregate || !self.order_is_unique || self.orders.is_empty() {
            return Err(PlanError::cursor_unsupported(format!(
                "plan '{}' has no unique ordering to paginate over",
                self.name
            )));
        }
        let fragments: Vec<SqlFragment> = self.orders.iter().map(|o| o.fragment.clone()).collect();
        let columns: Vec<usize> = fragments
            .into_iter()
            .map(|f| self.select_internal(f))
            .collect();
        self.cursor_columns = Some(columns.clone());
        Ok(columns)
    }

    /// Requests streaming execution
    pub fn set_stream(&mut self, options: StreamOptions) -> PlanResult<()> {
        self.ensure_not_finalized("stream")?;
        self.stream = Some(options);
        Ok(())
    }

    /// Skips read policies for this plan
    pub fn set_trusted(&mut self) -> PlanResult<()> {
        self.ensure_shape_mutable("trusted")?;
        self.trusted = true;
        Ok(())
    }

    /// Declares that at most one row matches per key
    pub fn set_unique(&mut self, unique: bool) -> PlanResult<()> {
        self.ensure_shape_mutable("unique")?;
        self.unique = unique;
        Ok(())
    }

    pub fn forbid_inlining(&mut self) {
        self.inlining_forbidden = true;
    }

    pub fn set_has_side_effects(&mut self) {
        self.has_side_effects = true;
    }

    // ========== Internal mutation (bypasses locks) ==========

    pub(crate) fn select_internal(&mut self, fragment: SqlFragment) -> usize {
        if let Some(index) = self.selects.iter().position(|s| *s == fragment) {
            return index;
        }
        self.selects.push(fragment);
        self.selects.len() - 1
    }

    /// Index of `dependency`, adding it if new
    pub(crate) fn push_dependency(&mut self, dependency: PlanId) -> usize {
        if let Some(index) = self.dependencies.iter().position(|d| *d == dependency) {
            return index;
        }
        self.dependencies.push(dependency);
        self.dependencies.len() - 1
    }

    /// Placeholder creation for merges into an already locked plan
    pub(crate) fn push_placeholder(
        &mut self,
        dependency: usize,
        codec: Codec,
    ) -> PlanResult<SqlFragment> {
        if dependency >= self.dependencies.len() {
            return Err(PlanError::unknown_plan(format!(
                "plan '{}' has no dependency at index {}",
                self.name, dependency
            )));
        }
        if let Some(existing) = self
            .placeholders
            .iter()
            .find(|p| p.dependency == dependency && p.codec == codec)
        {
            return Ok(sql::placeholder(&existing.symbol));
        }
        if self.placeholders.len() >= self.max_placeholders {
            return Err(PlanError::too_many_placeholders(self.max_placeholders));
        }
        let symbol = Symbol::new(&format!("{}_placeholder", self.name));
        self.placeholders.push(PlaceholderSpec {
            dependency,
            codec,
            symbol: symbol.clone(),
        });
        Ok(sql::placeholder(&symbol))
    }

    /// Read-policy filter unless trusted
    pub(crate) fn policy_condition(&self) -> Option<SqlFragment> {
        if self.trusted {
            return None;
        }
        self.source.policy().read_condition(&self.alias)
    }

    /// Literal fragment for a constant dependency
    pub(crate) fn literal(value: &Value, codec: &Codec) -> SqlFragment {
        codec.cast(sql::value(value.clone()))
    }
}
