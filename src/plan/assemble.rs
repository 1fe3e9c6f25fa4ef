//! SQL assembly
//!
//! Turns a plan's shape into a `SELECT` fragment. The same routine backs
//! standalone queries, per-key inner queries and inlined subqueries; the
//! `QueryShape` says which clauses to emit.

use super::cursor::order_term;
use super::select::{JoinKind, OrderSpec, SelectPlan};
use crate::sql::{self, SqlFragment};

/// Column holding the per-key row number
pub(crate) const ROW_NUMBER_COLUMN: &str = "__rn";

/// How the selection list is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// One column per select, named by index
    Columns,
    /// A single `json_build_array(...)` value
    JsonArray,
}

/// Which clauses to emit
#[derive(Debug, Clone)]
pub(crate) struct QueryShape {
    pub extra_conditions: Vec<SqlFragment>,
    pub selection: Selection,
    pub ordered: bool,
    /// Emit `limit`/`offset` directly
    pub limits: bool,
    /// Add a `row_number()` column over the plan's ordering
    pub window: bool,
}

impl QueryShape {
    /// Ordered, limited, no window
    pub(crate) fn standalone(extra_conditions: Vec<SqlFragment>) -> Self {
        Self {
            extra_conditions,
            selection: Selection::Columns,
            ordered: true,
            limits: true,
            window: false,
        }
    }

    /// Pagination is applied by an outer row-number filter
    pub(crate) fn windowed(extra_conditions: Vec<SqlFragment>) -> Self {
        Self {
            extra_conditions,
            selection: Selection::Columns,
            ordered: false,
            limits: false,
            window: true,
        }
    }
}

/// `a and b and c`, each wrapped in parens when there are several
pub(crate) fn conjunction(conditions: &[SqlFragment]) -> SqlFragment {
    if conditions.len() == 1 {
        return conditions[0].clone();
    }
    sql::join(conditions.iter().cloned().map(sql::parens), " and ")
}

/// `(\n  inner\n)` as a derived table or expression
pub(crate) fn nested(inner: SqlFragment) -> SqlFragment {
    sql::concat(vec![sql::raw("("), sql::indent(inner), sql::raw(")")])
}

impl SelectPlan {
    /// Order terms as executed; reversed when `last` is set
    pub(crate) fn effective_orders(&self) -> Vec<OrderSpec> {
        if self.last.is_some() {
            self.orders.iter().map(OrderSpec::reversed).collect()
        } else {
            self.orders.clone()
        }
    }

    /// Rows to fetch per key, including the lookahead row
    pub(crate) fn limit_count(&self) -> Option<u64> {
        let extra = u64::from(self.fetch_one_extra);
        self.last.or(self.first).map(|n| n + extra)
    }

    pub(crate) fn has_pagination(&self) -> bool {
        self.first.is_some() || self.last.is_some() || self.offset.is_some()
    }

    fn order_clause(&self) -> Option<SqlFragment> {
        let orders = self.effective_orders();
        if orders.is_empty() {
            return None;
        }
        Some(sql::join(orders.iter().map(order_term), ", "))
    }

    /// `row_number() over (order by ...)`
    pub(crate) fn row_number(&self) -> SqlFragment {
        match self.order_clause() {
            Some(order) => sql::concat(vec![
                sql::raw("row_number() over (order by "),
                order,
                sql::raw(")"),
            ]),
            None => sql::raw("row_number() over ()"),
        }
    }

    /// Filter conditions: the plan's own, cursors, the read policy, then `extra`
    pub(crate) fn where_conditions(&self, extra: &[SqlFragment]) -> Vec<SqlFragment> {
        let mut conditions = self.conditions.clone();
        conditions.extend(self.cursor_conditions.iter().cloned());
        if let Some(policy) = self.policy_condition() {
            conditions.push(policy);
        }
        conditions.extend(extra.iter().cloned());
        conditions
    }

    fn join_clauses(&self) -> Vec<SqlFragment> {
        self.joins
            .iter()
            .map(|join| {
                let mut parts = vec![sql::raw(join.kind.keyword()), sql::raw(" ")];
                if join.lateral {
                    parts.push(sql::raw("lateral "));
                }
                parts.push(join.from.clone());
                parts.push(sql::raw(" as "));
                parts.push(sql::alias(&join.alias));
                if join.kind != JoinKind::Cross {
                    parts.push(sql::raw(" on "));
                    if join.conditions.is_empty() {
                        parts.push(sql::raw("true"));
                    } else {
                        parts.push(sql::parens(conjunction(&join.conditions)));
                    }
                }
                sql::concat(parts)
            })
            .collect()
    }

    fn selection_list(&self, shape: &QueryShape) -> SqlFragment {
        let mut columns: Vec<SqlFragment> = match shape.selection {
            Selection::Columns => self
                .selects
                .iter()
                .enumerate()
                .map(|(i, s)| sql::concat(vec![s.clone(), sql::raw(" as "), sql::ident(i.to_string())]))
                .collect(),
            Selection::JsonArray => vec![sql::concat(vec![
                sql::raw("json_build_array("),
                sql::join(self.selects.iter().cloned(), ", "),
                sql::raw(")"),
            ])],
        };
        if shape.window {
            columns.push(sql::concat(vec![
                self.row_number(),
                sql::raw(" as "),
                sql::ident(ROW_NUMBER_COLUMN),
            ]));
        }
        if columns.is_empty() {
            // A row still has to come back for every match
            columns.push(sql::raw("1"));
        }
        sql::join(columns, ", ")
    }

    /// Builds the `SELECT` for this plan
    pub(crate) fn build_query(&self, shape: &QueryShape) -> SqlFragment {
        let mut lines = vec![
            sql::concat(vec![sql::raw("select "), self.selection_list(shape)]),
            sql::concat(vec![
                sql::raw("from "),
                self.from.clone(),
                sql::raw(" as "),
                sql::alias(&self.alias),
            ]),
        ];
        lines.extend(self.join_clauses());

        let conditions = self.where_conditions(&shape.extra_conditions);
        if !conditions.is_empty() {
            lines.push(sql::concat(vec![sql::raw("where "), conjunction(&conditions)]));
        }
        if !self.groups.is_empty() {
            lines.push(sql::concat(vec![
                sql::raw("group by "),
                sql::join(self.groups.iter().cloned(), ", "),
            ]));
        }
        if !self.having.is_empty() {
            lines.push(sql::concat(vec![sql::raw("having "), conjunction(&self.having)]));
        }
        if shape.ordered {
            if let Some(order) = self.order_clause() {
                lines.push(sql::concat(vec![sql::raw("order by "), order]));
            }
        }
        if shape.limits {
            if let Some(limit) = self.limit_count() {
                lines.push(sql::raw(format!("limit {}", limit)));
            }
            if let Some(offset) = self.offset.filter(|o| *o > 0) {
                lines.push(sql::raw(format!("offset {}", offset)));
            }
        }
        sql::join(lines, "\n")
    }

    /// `array(select json_build_array(...) ...)` for subquery inlining
    pub(crate) fn build_array_subquery(&self) -> SqlFragment {
        let shape = QueryShape {
            extra_conditions: Vec::new(),
            selection: Selection::JsonArray,
            ordered: true,
            limits: true,
            window: false,
        };
        sql::concat(vec![sql::raw("array"), nested(self.build_query(&shape))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::plan::select::{OrderSpec, SelectMode};
    use crate::plan::{PlanId, SourceDescriptor};
    use crate::sql::{compile, CompileContext, Symbol};
    use serde_json::json;

    fn plan() -> SelectPlan {
        let source = SourceDescriptor::table(None, "users").with_unique(&["id"]).build();
        let mut plan = SelectPlan::new(
            "users".into(),
            Symbol::new("users"),
            source,
            SelectMode::Normal,
            &PlannerConfig::default(),
        );
        plan.push_dependency(PlanId::CONTEXT);
        plan
    }

    fn text(fragment: &SqlFragment) -> String {
        compile(fragment, &CompileContext::empty()).unwrap().text
    }

    #[test]
    fn test_standalone_query() {
        let mut plan = plan();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "id")).unwrap();
        plan.select(sql::qualified(&alias, "name")).unwrap();
        plan.and_where(sql::concat(vec![
            sql::qualified(&alias, "active"),
            sql::raw(" = "),
            sql::value(json!(true)),
        ]))
        .unwrap();
        plan.set_first(10).unwrap();
        plan.lock_all().unwrap();

        let query = plan.build_query(&QueryShape::standalone(Vec::new()));
        assert_eq!(
            text(&query),
            "select __users__.\"id\" as \"0\", __users__.\"name\" as \"1\"\n\
             from \"users\" as __users__\n\
             where __users__.\"active\" = $1\n\
             order by __users__.\"id\" asc\n\
             limit 10"
        );
    }

    #[test]
    fn test_last_reverses_order() {
        let mut plan = plan();
        let alias = plan.alias().clone();
        plan.order_by(OrderSpec::desc(sql::qualified(&alias, "created_at")))
            .unwrap();
        plan.set_last(2).unwrap();
        plan.set_fetch_one_extra(true).unwrap();
        plan.lock_all().unwrap();

        let query = plan.build_query(&QueryShape::standalone(Vec::new()));
        let sql = text(&query);
        assert!(sql.contains(
            "order by __users__.\"created_at\" asc, __users__.\"id\" desc"
        ));
        assert!(sql.ends_with("limit 3"));
    }

    #[test]
    fn test_joins_and_conditions() {
        let mut plan = plan();
        let alias = plan.alias().clone();
        let teams = Symbol::new("teams");
        plan.left_join(
            sql::ident("teams"),
            &teams,
            sql::concat(vec![
                sql::qualified(&teams, "id"),
                sql::raw(" = "),
                sql::qualified(&alias, "team_id"),
            ]),
        )
        .unwrap();
        plan.and_where(sql::raw("true")).unwrap();
        plan.and_where(sql::raw("false")).unwrap();

        let sql = text(&plan.build_query(&QueryShape::standalone(Vec::new())));
        assert!(sql.contains(
            "left outer join \"teams\" as __teams__ on (__teams__.\"id\" = __users__.\"team_id\")"
        ));
        assert!(sql.contains("where (true) and (false)"));
    }

    #[test]
    fn test_window_column() {
        let mut plan = plan();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "id")).unwrap();
        plan.lock_all().unwrap();
        let sql = text(&plan.build_query(&QueryShape::windowed(Vec::new())));
        assert!(sql.starts_with(
            "select __users__.\"id\" as \"0\", row_number() over (order by __users__.\"id\" asc) as \"__rn\""
        ));
        assert!(!sql.contains("order by __users__.\"id\" asc\n"));
    }

    #[test]
    fn test_array_subquery() {
        let mut plan = plan();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "id")).unwrap();
        plan.select(sql::qualified(&alias, "name")).unwrap();
        plan.set_first(3).unwrap();
        plan.lock_all().unwrap();
        let sql = text(&plan.build_array_subquery());
        assert!(sql.starts_with(
            "array(\n  select json_build_array(__users__.\"id\", __users__.\"name\")\n  from \"users\" as __users__"
        ));
        assert!(sql.ends_with("  limit 3\n)"));
    }
}
