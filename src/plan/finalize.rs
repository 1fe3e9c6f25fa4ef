//! Finalize: compile a locked plan once
//!
//! Unresolved placeholders and identifier matches are rewritten against a
//! synthetic per-key relation:
//!
//! ```text
//! select r."0", .., ids.idx - 1
//! from json_array_elements($keys::json) with ordinality as ids(value, idx)
//! cross join lateral (<per-key query>) as r
//! order by ids.idx, r."__rn"
//! ```
//!
//! The per-key query is wrapped in a `row_number()` window when limits,
//! offsets or streaming have to apply per key.

use serde_json::Value;

use super::assemble::{nested, QueryShape, ROW_NUMBER_COLUMN};
use super::cursor::encode_cursor;
use super::errors::{PlanError, PlanResult};
use super::select::SelectPlan;
use crate::plan::PlanId;
use crate::sql::{self, compile, Codec, CompileContext, SqlFragment, Symbol, SymbolSubstitution};

/// One result row, columns in selection order
pub type Row = Vec<Value>;

/// Position column when `last` is combined with streaming
const POSITION_COLUMN: &str = "__pos";

/// Column carrying the key index in batched queries
const KEY_INDEX_COLUMN: &str = "__idx";

/// Compiled SQL text with its positional values
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub text: String,
    pub values: Vec<Value>,
    /// Slot in `values` receiving the JSON key array
    pub key_position: Option<usize>,
}

impl CompiledQuery {
    /// The "nothing to run" sentinel
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            values: Vec::new(),
            key_position: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Values with the key array bound
    pub fn bind(&self, keys: &[Row]) -> Vec<Value> {
        let mut values = self.values.clone();
        if let Some(position) = self.key_position {
            let array = keys.iter().cloned().map(Value::Array).collect();
            values[position] = Value::Array(array);
        }
        values
    }
}

/// One component of the batch key
#[derive(Debug, Clone, PartialEq)]
pub struct QueryValue {
    /// Index into the plan's dependency list
    pub dependency: usize,
    pub codec: Codec,
}

/// Texts used by streaming execution
#[derive(Debug, Clone, PartialEq)]
pub struct StreamQueries {
    /// First `initial_count` rows per key; empty when the count is zero
    pub initial: CompiledQuery,
    /// Everything after the initial rows, opened as a cursor
    pub cursor: CompiledQuery,
    pub initial_count: u64,
    /// Per-key row count the caller asked for, if bounded
    pub declared_count: Option<u64>,
}

/// Everything execution needs, produced once per plan
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeResults {
    pub query: CompiledQuery,
    /// Column routing rows back to their key; `None` when unbatched
    pub identifier_index: Option<usize>,
    /// Key tuple layout: position `i` holds dependency `query_values[i]`
    pub query_values: Vec<QueryValue>,
    /// Plan ids behind `query_values`
    pub key_dependencies: Vec<PlanId>,
    /// Rows come back in reverse and must be flipped per key
    pub reverse: bool,
    /// Selected columns per row, excluding the identifier index
    pub column_count: usize,
    pub stream: Option<StreamQueries>,
    pub cursor_columns: Vec<usize>,
    pub order_digest: Option<String>,
    /// Page size before the lookahead row; set with `fetch_one_extra`
    pub page_size: Option<u64>,
    /// Paginating from the end (`last`)
    pub backward: bool,
}

impl FinalizeResults {
    pub fn is_batched(&self) -> bool {
        self.identifier_index.is_some()
    }

    /// Cursor for a fetched row
    pub fn cursor_for_row(&self, row: &[Value]) -> PlanResult<String> {
        let digest = self.order_digest.as_ref().ok_or_else(|| {
            PlanError::cursor_unsupported("cursor columns were not selected for this plan")
        })?;
        let values: Vec<Value> = self
            .cursor_columns
            .iter()
            .map(|i| row.get(*i).cloned().unwrap_or(Value::Null))
            .collect();
        Ok(encode_cursor(digest, &values))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slice {
    Full,
    Initial(u64),
    Rest(u64),
}

/// Per-finalize symbols for the key relation
struct KeyRelation {
    ids: Symbol,
    keys: Symbol,
}

impl KeyRelation {
    /// `(ids.value->>N)::type`
    fn cell(&self, position: usize, codec: &Codec) -> SqlFragment {
        codec.cast(sql::concat(vec![
            sql::alias(&self.ids),
            sql::raw(format!(".value->>{}", position)),
        ]))
    }
}

impl SelectPlan {
    /// Locks everything and compiles. Idempotent.
    pub(crate) fn finalize(
        &mut self,
        substitutions: &SymbolSubstitution,
    ) -> PlanResult<&FinalizeResults> {
        if self.finalized.is_none() {
            let results = self.compute_finalize(substitutions)?;
            self.finalized = Some(results);
        }
        self.finalized
            .as_ref()
            .ok_or_else(|| PlanError::unknown_plan("finalize produced no results"))
    }

    fn compute_finalize(&mut self, substitutions: &SymbolSubstitution) -> PlanResult<FinalizeResults> {
        self.lock_all()?;

        let relation = KeyRelation {
            ids: Symbol::new(&format!("{}_identifiers", self.name)),
            keys: Symbol::new(&format!("{}_keys", self.name)),
        };

        let mut query_values: Vec<QueryValue> = Vec::new();
        let mut extra_conditions = Vec::new();
        for identifier in self.identifiers.clone() {
            let position = key_position(&mut query_values, identifier.dependency, &identifier.codec);
            extra_conditions.push(sql::concat(vec![
                identifier.matches,
                sql::raw(" = "),
                relation.cell(position, &identifier.codec),
            ]));
        }
        for placeholder in self.placeholders.clone() {
            if self.placeholder_values.contains_key(&placeholder.symbol) {
                continue;
            }
            let position = key_position(&mut query_values, placeholder.dependency, &placeholder.codec);
            self.placeholder_values
                .insert(placeholder.symbol, relation.cell(position, &placeholder.codec));
        }

        let batched = !query_values.is_empty();
        let windowed = self.stream.is_some()
            || (batched && (!self.orders.is_empty() || self.has_pagination()));

        let ctx = CompileContext::empty()
            .with_substitutions(substitutions)
            .with_placeholders(&self.placeholder_values);

        let variant = |slice: Slice| -> PlanResult<CompiledQuery> {
            let fragment = self.outer_query(&extra_conditions, &relation, batched, windowed, slice);
            let compiled = compile(&fragment, &ctx)?;
            Ok(CompiledQuery {
                key_position: compiled.parameters.get(&relation.keys).copied(),
                text: compiled.text,
                values: compiled.values,
            })
        };

        let query = variant(Slice::Full)?;
        let stream = match self.stream {
            Some(options) => Some(StreamQueries {
                initial: if options.initial_count > 0 {
                    variant(Slice::Initial(options.initial_count))?
                } else {
                    CompiledQuery::empty()
                },
                cursor: variant(Slice::Rest(options.initial_count))?,
                initial_count: options.initial_count,
                declared_count: self.limit_count(),
            }),
            None => None,
        };

        let cursor_columns = self.cursor_columns.clone().unwrap_or_default();
        let order_digest = if cursor_columns.is_empty() {
            None
        } else {
            Some(self.order_digest()?)
        };

        Ok(FinalizeResults {
            query,
            identifier_index: if batched { Some(self.selects.len()) } else { None },
            key_dependencies: query_values
                .iter()
                .map(|qv| self.dependencies[qv.dependency])
                .collect(),
            query_values,
            reverse: self.last.is_some() && self.stream.is_none(),
            column_count: self.selects.len(),
            stream,
            cursor_columns,
            order_digest,
            page_size: if self.fetch_one_extra {
                self.last.or(self.first)
            } else {
                None
            },
            backward: self.last.is_some(),
        })
    }

    /// Per-key query, paginated by row number when windowed. Returns the
    /// fragment and the column ordering rows within a key.
    fn paged_query(
        &self,
        extra_conditions: &[SqlFragment],
        windowed: bool,
        slice: Slice,
    ) -> (SqlFragment, Option<&'static str>) {
        if !windowed {
            let shape = QueryShape::standalone(extra_conditions.to_vec());
            return (self.build_query(&shape), None);
        }

        let inner = self.build_query(&QueryShape::windowed(extra_conditions.to_vec()));
        let page = Symbol::new(&format!("{}_page", self.name));
        let row_number = sql::qualified(&page, ROW_NUMBER_COLUMN);
        let lower = self.offset.unwrap_or(0);

        let mut filters = Vec::new();
        if self.last.is_some() {
            if let Some(limit) = self.limit_count() {
                filters.push(compare(&row_number, "<=", limit));
            }
        } else {
            if lower > 0 {
                filters.push(compare(&row_number, ">", lower));
            }
            if let Some(limit) = self.limit_count() {
                filters.push(compare(&row_number, "<=", lower + limit));
            }
        }
        let mut level = select_all(&page, inner, &filters);

        let (position, base) = if self.last.is_some() && self.stream.is_some() {
            let ordered = Symbol::new(&format!("{}_ordered", self.name));
            let query = sql::join(
                vec![
                    sql::concat(vec![
                        sql::raw("select "),
                        sql::alias(&ordered),
                        sql::raw(".*, row_number() over (order by "),
                        sql::qualified(&ordered, ROW_NUMBER_COLUMN),
                        sql::raw(" desc) as "),
                        sql::ident(POSITION_COLUMN),
                    ]),
                    sql::concat(vec![
                        sql::raw("from "),
                        nested(level),
                        sql::raw(" as "),
                        sql::alias(&ordered),
                    ]),
                ],
                "\n",
            );
            level = query;
            (POSITION_COLUMN, 0)
        } else if self.last.is_some() {
            (ROW_NUMBER_COLUMN, 0)
        } else {
            (ROW_NUMBER_COLUMN, lower)
        };

        let level = match slice {
            Slice::Full => level,
            Slice::Initial(count) | Slice::Rest(count) => {
                let sliced = Symbol::new(&format!("{}_slice", self.name));
                let op = if matches!(slice, Slice::Initial(_)) { "<=" } else { ">" };
                let filter = compare(&sql::qualified(&sliced, position), op, base + count);
                select_all(&sliced, level, &[filter])
            }
        };
        (level, Some(position))
    }

    fn outer_query(
        &self,
        extra_conditions: &[SqlFragment],
        relation: &KeyRelation,
        batched: bool,
        windowed: bool,
        slice: Slice,
    ) -> SqlFragment {
        let (level, position) = self.paged_query(extra_conditions, windowed, slice);
        if !batched && !windowed {
            return level;
        }

        let result = Symbol::new(&format!("{}_result", self.name));
        let mut columns: Vec<SqlFragment> = (0..self.selects.len())
            .map(|i| sql::qualified(&result, &i.to_string()))
            .collect();
        let mut order = Vec::new();
        let mut lines = Vec::new();

        if batched {
            columns.push(sql::concat(vec![
                sql::alias(&relation.ids),
                sql::raw(".idx - 1 as "),
                sql::ident(KEY_INDEX_COLUMN),
            ]));
            order.push(sql::concat(vec![sql::alias(&relation.ids), sql::raw(".idx")]));
        }
        if let Some(position) = position {
            order.push(sql::qualified(&result, position));
        }
        if columns.is_empty() {
            columns.push(sql::raw("1"));
        }

        lines.push(sql::concat(vec![sql::raw("select "), sql::join(columns, ", ")]));
        if batched {
            lines.push(sql::concat(vec![
                sql::raw("from json_array_elements("),
                sql::param(&relation.keys),
                sql::raw("::json) with ordinality as "),
                sql::alias(&relation.ids),
                sql::raw("(value, idx)"),
            ]));
            lines.push(sql::concat(vec![
                sql::raw("cross join lateral "),
                nested(level),
                sql::raw(" as "),
                sql::alias(&result),
            ]));
        } else {
            lines.push(sql::concat(vec![
                sql::raw("from "),
                nested(level),
                sql::raw(" as "),
                sql::alias(&result),
            ]));
        }
        if !order.is_empty() {
            lines.push(sql::concat(vec![sql::raw("order by "), sql::join(order, ", ")]));
        }
        sql::join(lines, "\n")
    }
}

/// Position of `(dependency, codec)` in the key tuple, adding it if new
fn key_position(query_values: &mut Vec<QueryValue>, dependency: usize, codec: &Codec) -> usize {
    if let Some(position) = query_values
        .iter()
        .position(|qv| qv.dependency == dependency && qv.codec == *codec)
    {
        return position;
    }
    query_values.push(QueryValue {
        dependency,
        codec: codec.clone(),
    });
    query_values.len() - 1
}

fn compare(column: &SqlFragment, op: &str, bound: u64) -> SqlFragment {
    sql::concat(vec![column.clone(), sql::raw(format!(" {} {}", op, bound))])
}

/// `select alias.* from (inner) as alias [where ...]`
fn select_all(alias: &Symbol, inner: SqlFragment, filters: &[SqlFragment]) -> SqlFragment {
    let mut lines = vec![
        sql::concat(vec![sql::raw("select "), sql::alias(alias), sql::raw(".*")]),
        sql::concat(vec![sql::raw("from "), nested(inner), sql::raw(" as "), sql::alias(alias)]),
    ];
    if !filters.is_empty() {
        lines.push(sql::concat(vec![
            sql::raw("where "),
            super::assemble::conjunction(filters),
        ]));
    }
    sql::join(lines, "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::plan::select::{OrderSpec, SelectMode, StreamOptions};
    use crate::plan::{PlanId, SourceDescriptor};
    use serde_json::json;

    fn posts_plan() -> SelectPlan {
        let source = SourceDescriptor::table(None, "posts").with_unique(&["id"]).build();
        let mut plan = SelectPlan::new(
            "posts".into(),
            Symbol::new("posts"),
            source,
            SelectMode::Normal,
            &PlannerConfig::default(),
        );
        plan.push_dependency(PlanId::CONTEXT);
        plan
    }

    fn with_author_key(plan: &mut SelectPlan) {
        let dep = plan.push_dependency(PlanId::from_index(1));
        let alias = plan.alias().clone();
        plan.identifiers.push(crate::plan::select::IdentifierSpec {
            dependency: dep,
            codec: Codec::int4(),
            matches: sql::qualified(&alias, "author_id"),
        });
    }

    #[test]
    fn test_unbatched_query_stands_alone() {
        let mut plan = posts_plan();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "title")).unwrap();
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap();
        assert!(!results.is_batched());
        assert_eq!(
            results.query.text,
            "select __posts__.\"title\" as \"0\"\nfrom \"posts\" as __posts__\norder by __posts__.\"id\" asc"
        );
        assert!(!results.reverse);
    }

    #[test]
    fn test_batched_query_uses_key_expansion() {
        let mut plan = posts_plan();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "title")).unwrap();
        with_author_key(&mut plan);
        plan.set_order_is_unique(true).unwrap();
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap();

        assert_eq!(results.identifier_index, Some(1));
        assert_eq!(results.query_values.len(), 1);
        assert_eq!(results.key_dependencies, vec![PlanId::from_index(1)]);
        let text = &results.query.text;
        assert!(text.contains(
            "from json_array_elements($1::json) with ordinality as __posts_identifiers__(value, idx)"
        ));
        assert!(text.contains("cross join lateral ("));
        assert!(text.contains(
            "where __posts__.\"author_id\" = (__posts_identifiers__.value->>0)::int4"
        ));
        assert!(text.ends_with("order by __posts_identifiers__.idx"));
        assert_eq!(results.query.key_position, Some(0));

        let values = results.query.bind(&[vec![json!(1)], vec![json!(2)]]);
        assert_eq!(values[0], json!([[1], [2]]));
    }

    #[test]
    fn test_per_key_pagination_is_windowed() {
        let mut plan = posts_plan();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "title")).unwrap();
        with_author_key(&mut plan);
        plan.set_first(2).unwrap();
        plan.set_offset(1).unwrap();
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap();
        let text = &results.query.text;

        assert!(text.contains("row_number() over (order by __posts__.\"id\" asc) as \"__rn\""));
        assert!(text.contains("where (__posts_page__.\"__rn\" > 1) and (__posts_page__.\"__rn\" <= 3)"));
        assert!(text.ends_with("order by __posts_identifiers__.idx, __posts_result__.\"__rn\""));
        assert!(!text.contains("limit"));
    }

    #[test]
    fn test_last_sets_reverse() {
        let mut plan = posts_plan();
        with_author_key(&mut plan);
        plan.set_last(2).unwrap();
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap();
        assert!(results.reverse);
        assert!(results.query.text.contains("row_number() over (order by __posts__.\"id\" desc)"));
        assert!(results.query.text.contains("where __posts_page__.\"__rn\" <= 2"));
    }

    #[test]
    fn test_stream_texts() {
        let mut plan = posts_plan();
        with_author_key(&mut plan);
        plan.set_stream(StreamOptions { initial_count: 2 }).unwrap();
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap();
        let stream = results.stream.as_ref().unwrap();

        assert!(stream.initial.text.contains("where __posts_slice__.\"__rn\" <= 2"));
        assert!(stream.cursor.text.contains("where __posts_slice__.\"__rn\" > 2"));
        assert_eq!(stream.initial.key_position, stream.cursor.key_position);
        assert_eq!(results.identifier_index, Some(0));
    }

    #[test]
    fn test_stream_zero_initial_is_sentinel() {
        let mut plan = posts_plan();
        plan.set_stream(StreamOptions { initial_count: 0 }).unwrap();
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap();
        let stream = results.stream.as_ref().unwrap();
        assert!(stream.initial.is_empty());
        assert!(!stream.cursor.is_empty());
        assert!(!results.is_batched());
    }

    #[test]
    fn test_stream_with_last_reverses_in_database() {
        let mut plan = posts_plan();
        plan.order_by(OrderSpec::asc(sql::raw("1"))).unwrap();
        plan.set_last(3).unwrap();
        plan.set_stream(StreamOptions { initial_count: 1 }).unwrap();
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap();
        assert!(!results.reverse);
        let stream = results.stream.as_ref().unwrap();
        assert!(stream.initial.text.contains("\"__pos\""));
        assert_eq!(stream.declared_count, Some(3));
    }

    #[test]
    fn test_finalize_is_cached() {
        let mut plan = posts_plan();
        let first = plan.finalize(&SymbolSubstitution::new()).unwrap().clone();
        let second = plan.finalize(&SymbolSubstitution::new()).unwrap().clone();
        assert_eq!(first, second);
        assert!(plan.select(sql::raw("1")).is_err());
    }

    #[test]
    fn test_cursor_for_row() {
        let mut plan = posts_plan();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "title")).unwrap();
        let columns = plan.select_cursor_columns().unwrap();
        assert_eq!(columns, vec![1]);
        let results = plan.finalize(&SymbolSubstitution::new()).unwrap().clone();
        let cursor = results.cursor_for_row(&[json!("hello"), json!(42)]).unwrap();

        let digest = results.order_digest.clone().unwrap();
        let decoded = crate::plan::cursor::decode_cursor(&cursor, &digest, 1).unwrap();
        assert_eq!(decoded, vec![json!(42)]);
    }
}
