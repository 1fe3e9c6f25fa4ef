//! Optimizer: folds child plans into the plan whose rows they hang off
//!
//! A plan whose dependencies are all literals, variables, the context or
//! columns of one row `P` of one select `T` can be merged into `T`:
//! either as a LEFT JOIN (unique, unpaginated children) or as an
//! array-valued subquery selected per row of `T`. Anything else runs as
//! its own query.

use std::collections::HashSet;

use super::arena::{DependencyKind, InlinedPlan, PlanArena, PlanId, PlanNode, Strategy};
use super::errors::{PlanError, PlanResult};
use super::select::{Join, JoinKind, SelectMode, SelectPlan};
use crate::observability::{log_event_with_fields, Event};
use crate::sql::{self, Codec, SqlFragment};

/// How a child value is expressed inside the merge target
#[derive(Debug, Clone)]
enum Rebinding {
    /// Inline SQL: a cast literal or a column expression of `T`
    Fragment(SqlFragment),
    /// Still a runtime value; becomes a placeholder of `T`
    Dependency(PlanId, Codec),
}

impl Rebinding {
    fn into_fragment(self, target: &mut SelectPlan) -> PlanResult<SqlFragment> {
        match self {
            Rebinding::Fragment(fragment) => Ok(fragment),
            Rebinding::Dependency(dependency, codec) => {
                let index = target.push_dependency(dependency);
                target.push_placeholder(index, codec)
            }
        }
    }
}

/// Merge target found by the dependency walk
struct Target {
    table: PlanId,
    row: PlanId,
}

enum Branch {
    Join,
    Subquery,
}

impl PlanArena {
    /// Decides how the select at `id` executes, rewriting the arena when it
    /// can be inlined. Locks the plan.
    pub fn optimize(&mut self, id: PlanId) -> PlanResult<Strategy> {
        let id = self.resolve(id);
        if !matches!(self.nodes.get(id.index()), Some(PlanNode::Select(_))) {
            return self.strategy(id);
        }
        self.select_plan_mut(id)?.lock_all()?;

        let plan = self.select_plan(id)?;
        if !self.config.inlining_enabled {
            return self.keep_standalone(id, "inlining disabled");
        }
        if plan.inlining_forbidden {
            return self.keep_standalone(id, "inlining forbidden");
        }
        if plan.has_side_effects {
            return self.keep_standalone(id, "side effects");
        }
        if plan.stream.is_some() {
            return self.keep_standalone(id, "streaming");
        }

        let target = match self.merge_target(id)? {
            Some(target) => target,
            None => return self.keep_standalone(id, "no single parent row"),
        };

        let parent = match self.nodes.get(target.table.index()) {
            Some(PlanNode::Select(parent)) => parent,
            _ => return self.keep_standalone(id, "parent is not a select"),
        };
        if parent.is_finalized() {
            return Err(PlanError::unsupported_merge(format!(
                "plan '{}' is already compiled and cannot absorb '{}'",
                parent.name(),
                plan.name()
            )));
        }
        if self.resolve(plan.context_dependency()) != self.resolve(parent.context_dependency()) {
            return self.keep_standalone(id, "context differs from parent");
        }
        if self.depends_on(target.table, id) {
            return Err(PlanError::self_merge(plan.name()));
        }

        let joinable = plan.unique
            && !plan.has_pagination()
            && plan.mode == SelectMode::Normal
            && parent.mode == SelectMode::Normal
            && plan.joins.iter().all(|j| j.kind == JoinKind::Left)
            && (plan.selects.is_empty() || plan.source.primary_key().is_some());
        let branch = if joinable {
            Branch::Join
        } else if parent.mode != SelectMode::Aggregate {
            Branch::Subquery
        } else {
            return self.keep_standalone(id, "parent is an aggregate");
        };

        let name = plan.name().to_string();
        let placeholders = self.placeholder_rebindings(plan)?;
        let identifiers = self.identifier_rebindings(plan)?;
        let inlined = match branch {
            Branch::Join => self.merge_join(id, &target, placeholders, identifiers)?,
            Branch::Subquery => self.merge_subquery(id, &target, placeholders, identifiers)?,
        };

        let (strategy, event) = match inlined {
            InlinedPlan::Join { .. } => (Strategy::InlinedJoin, Event::PlanInlinedJoin),
            InlinedPlan::Subquery { .. } => (Strategy::InlinedSubquery, Event::PlanInlinedSubquery),
        };
        self.nodes[id.index()] = PlanNode::Inlined(inlined);
        self.metrics.increment_plans_inlined();
        log_event_with_fields(
            event,
            &[
                ("plan", &name),
                ("id", &id.to_string()),
                ("into", &target.table.to_string()),
            ],
        );
        Ok(strategy)
    }

    /// Optimizes every live select, children before parents
    pub fn optimize_all(&mut self) -> PlanResult<()> {
        let ids: Vec<PlanId> = (0..self.nodes.len())
            .rev()
            .map(PlanId::from_index)
            .filter(|id| !self.replacements.contains_key(id))
            .filter(|id| matches!(self.nodes[id.index()], PlanNode::Select(_)))
            .collect();
        for id in ids {
            self.optimize(id)?;
        }
        Ok(())
    }

    fn keep_standalone(&self, id: PlanId, reason: &str) -> PlanResult<Strategy> {
        self.metrics.increment_plans_standalone();
        log_event_with_fields(
            Event::PlanStandalone,
            &[("id", &id.to_string()), ("reason", reason)],
        );
        Ok(Strategy::Standalone)
    }

    /// The single `(T, P)` every column dependency points at
    fn merge_target(&self, id: PlanId) -> PlanResult<Option<Target>> {
        let plan = self.select_plan(id)?;
        let mut target: Option<Target> = None;
        for (index, dependency) in plan.dependencies.iter().enumerate() {
            if index == plan.context_dependency {
                continue;
            }
            let dependency = self.resolve(*dependency);
            if dependency == id {
                return Err(PlanError::recursive_dependency(plan.name()));
            }
            match self.dependency_kind(dependency) {
                DependencyKind::Literal(_) | DependencyKind::Variable | DependencyKind::Context => {}
                DependencyKind::ColumnOf { table, row, .. } => {
                    if table == id {
                        return Err(PlanError::recursive_dependency(plan.name()));
                    }
                    match &target {
                        None => target = Some(Target { table, row }),
                        Some(t) if t.table == table && t.row == row => {}
                        Some(_) => return Ok(None),
                    }
                }
                DependencyKind::Opaque => return Ok(None),
            }
        }
        Ok(target)
    }

    /// True when `from` reaches `to` through dependencies, rows or columns
    fn depends_on(&self, from: PlanId, to: PlanId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            let current = self.resolve(current);
            if !seen.insert(current) {
                continue;
            }
            let next: Vec<PlanId> = match self.nodes.get(current.index()) {
                Some(PlanNode::Select(plan)) => plan.dependencies.clone(),
                Some(PlanNode::Row(row)) => vec![row.select],
                Some(PlanNode::Column(column)) => vec![column.row],
                Some(PlanNode::Inlined(inlined)) => vec![inlined.row()],
                _ => Vec::new(),
            };
            for dependency in next {
                if self.resolve(dependency) == to {
                    return true;
                }
                stack.push(dependency);
            }
        }
        false
    }

    fn rebinding(&self, dependency: PlanId, codec: &Codec) -> Rebinding {
        let dependency = self.resolve(dependency);
        match self.dependency_kind(dependency) {
            DependencyKind::Literal(value) => Rebinding::Fragment(SelectPlan::literal(value, codec)),
            DependencyKind::ColumnOf { expression, .. } => Rebinding::Fragment(expression.clone()),
            _ => Rebinding::Dependency(dependency, codec.clone()),
        }
    }

    fn placeholder_rebindings(&self, plan: &SelectPlan) -> PlanResult<Vec<Rebinding>> {
        Ok(plan
            .placeholders
            .iter()
            .map(|p| self.rebinding(plan.dependencies[p.dependency], &p.codec))
            .collect())
    }

    fn identifier_rebindings(&self, plan: &SelectPlan) -> PlanResult<Vec<Rebinding>> {
        Ok(plan
            .identifiers
            .iter()
            .map(|i| self.rebinding(plan.dependencies[i.dependency], &i.codec))
            .collect())
    }

    /// Moves the child plan out of the arena for the duration of a merge.
    /// The child is put back if the merge fails.
    fn with_child_and_parent<F>(&mut self, id: PlanId, table: PlanId, merge: F) -> PlanResult<InlinedPlan>
    where
        F: FnOnce(&mut SelectPlan, &mut SelectPlan) -> PlanResult<InlinedPlan>,
    {
        let mut child = match std::mem::replace(&mut self.nodes[id.index()], PlanNode::Context) {
            PlanNode::Select(child) => child,
            other => {
                self.nodes[id.index()] = other;
                return Err(PlanError::unknown_plan(format!("{} is not a select", id)));
            }
        };
        let result = match self.nodes.get_mut(table.index()) {
            Some(PlanNode::Select(parent)) => merge(child.as_mut(), parent.as_mut()),
            _ => Err(PlanError::unsupported_merge(format!("{} is not a select", table))),
        };
        if result.is_err() {
            self.nodes[id.index()] = PlanNode::Select(child);
        }
        result
    }

    fn merge_join(
        &mut self,
        id: PlanId,
        target: &Target,
        placeholders: Vec<Rebinding>,
        identifiers: Vec<Rebinding>,
    ) -> PlanResult<InlinedPlan> {
        let row = target.row;
        self.with_child_and_parent(id, target.table, |child, parent| {
            if child.selects.is_empty() {
                return Ok(InlinedPlan::Join {
                    row,
                    attributes: Vec::new(),
                    presence: None,
                });
            }

            rebind_placeholders(child, parent, placeholders)?;
            let mut conditions = Vec::new();
            for (identifier, rebinding) in child.identifiers.iter().zip(identifiers) {
                conditions.push(equals(&identifier.matches, rebinding.into_fragment(parent)?));
            }
            conditions.extend(child.where_conditions(&[]));

            let mut join = Join::new(JoinKind::Left, child.from.clone(), child.alias.clone());
            join.conditions = conditions;
            join.lateral = child.source.is_function();
            parent.joins.push(join);
            parent.joins.extend(child.joins.iter().cloned());

            let attributes = child
                .selects
                .iter()
                .map(|s| parent.select_internal(s.clone()))
                .collect();
            let presence = match child.source.primary_key().and_then(|key| key.first()) {
                Some(column) => Some(parent.select_internal(sql::concat(vec![
                    sql::raw("("),
                    sql::qualified(&child.alias, column),
                    sql::raw(") is not null"),
                ]))),
                None => None,
            };
            Ok(InlinedPlan::Join {
                row,
                attributes,
                presence,
            })
        })
    }

    fn merge_subquery(
        &mut self,
        id: PlanId,
        target: &Target,
        placeholders: Vec<Rebinding>,
        identifiers: Vec<Rebinding>,
    ) -> PlanResult<InlinedPlan> {
        let row = target.row;
        self.with_child_and_parent(id, target.table, |child, parent| {
            rebind_placeholders(child, parent, placeholders)?;
            let mut matches = Vec::new();
            for (identifier, rebinding) in child.identifiers.iter().zip(identifiers) {
                matches.push(equals(&identifier.matches, rebinding.into_fragment(parent)?));
            }
            child.conditions.extend(matches);

            let attribute = parent.select_internal(child.build_array_subquery());
            Ok(InlinedPlan::Subquery {
                row,
                attribute,
                reverse: child.last.is_some(),
            })
        })
    }
}

/// Points the child's placeholder symbols at fragments valid in `parent`
fn rebind_placeholders(
    child: &SelectPlan,
    parent: &mut SelectPlan,
    rebindings: Vec<Rebinding>,
) -> PlanResult<()> {
    for (placeholder, rebinding) in child.placeholders.iter().zip(rebindings) {
        if child.placeholder_values.contains_key(&placeholder.symbol) {
            continue;
        }
        let fragment = rebinding.into_fragment(parent)?;
        parent.placeholder_values.insert(placeholder.symbol.clone(), fragment);
    }
    for (symbol, fragment) in &child.placeholder_values {
        parent.placeholder_values.insert(symbol.clone(), fragment.clone());
    }
    Ok(())
}

fn equals(left: &SqlFragment, right: SqlFragment) -> SqlFragment {
    sql::concat(vec![left.clone(), sql::raw(" = "), right])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::plan::errors::PlanErrorCode;
    use crate::plan::select::IdentifierMatch;
    use crate::plan::source::ArgumentSpec;
    use crate::plan::{SelectOptions, SourceDescriptor};
    use serde_json::json;

    struct Fixture {
        arena: PlanArena,
        users: PlanId,
        row: PlanId,
    }

    fn fixture(config: PlannerConfig) -> Fixture {
        let mut arena = PlanArena::new(config).unwrap();
        let users = arena
            .select(SelectOptions::new(
                SourceDescriptor::table(None, "users").with_unique(&["id"]).build(),
            ))
            .unwrap();
        let row = arena.list_item(users).unwrap();
        Fixture { arena, users, row }
    }

    fn team_of(f: &mut Fixture) -> PlanId {
        let team_id = f.arena.column(f.row, "team_id", Codec::int4()).unwrap();
        let teams = f
            .arena
            .select(
                SelectOptions::new(SourceDescriptor::table(None, "teams").with_unique(&["id"]).build())
                    .identifier(IdentifierMatch::column(team_id, Codec::int4(), "id")),
            )
            .unwrap();
        let plan = f.arena.select_plan_mut(teams).unwrap();
        plan.set_unique(true).unwrap();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "name")).unwrap();
        teams
    }

    fn posts_of(f: &mut Fixture) -> PlanId {
        let user_id = f.arena.column(f.row, "id", Codec::int4()).unwrap();
        let posts = f
            .arena
            .select(
                SelectOptions::new(SourceDescriptor::table(None, "posts").with_unique(&["id"]).build())
                    .identifier(IdentifierMatch::column(user_id, Codec::int4(), "author_id")),
            )
            .unwrap();
        let plan = f.arena.select_plan_mut(posts).unwrap();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "title")).unwrap();
        posts
    }

    #[test]
    fn test_unique_child_is_joined() {
        let mut f = fixture(PlannerConfig::default());
        let teams = team_of(&mut f);

        assert_eq!(f.arena.optimize(teams).unwrap(), Strategy::InlinedJoin);
        match f.arena.node(teams).unwrap() {
            PlanNode::Inlined(InlinedPlan::Join {
                attributes,
                presence,
                ..
            }) => {
                assert_eq!(attributes, &vec![1]);
                assert_eq!(*presence, Some(2));
            }
            other => panic!("unexpected node {}", other.kind_name()),
        }

        let sql = f.arena.finalize(f.users).unwrap().query.text.clone();
        assert!(sql.contains(
            "left outer join \"teams\" as __teams__ on (__teams__.\"id\" = __users__.\"team_id\")"
        ));
        assert!(sql.contains("(__teams__.\"id\") is not null as \"2\""));

        let rows = f
            .arena
            .inlined_rows(teams, &[json!(3), json!("red"), json!(true)])
            .unwrap();
        assert_eq!(rows, vec![vec![json!("red")]]);
    }

    #[test]
    fn test_list_child_becomes_subquery() {
        let mut f = fixture(PlannerConfig::default());
        let posts = posts_of(&mut f);
        f.arena.select_plan_mut(posts).unwrap().set_last(2).unwrap();

        assert_eq!(f.arena.optimize(posts).unwrap(), Strategy::InlinedSubquery);
        match f.arena.node(posts).unwrap() {
            PlanNode::Inlined(InlinedPlan::Subquery { reverse, .. }) => assert!(reverse),
            other => panic!("unexpected node {}", other.kind_name()),
        }

        let sql = f.arena.finalize(f.users).unwrap().query.text.clone();
        assert!(sql.contains("array(\n  select json_build_array(__posts__.\"title\")"));
        assert!(sql.contains("  where __posts__.\"author_id\" = __users__.\"id\""));
        assert!(sql.contains("  limit 2"));
    }

    #[test]
    fn test_literal_argument_is_cast_inline() {
        let mut f = fixture(PlannerConfig::default());
        let user_id = f.arena.column(f.row, "id", Codec::int4()).unwrap();
        let limit = f.arena.constant(json!(5));
        let recent = f
            .arena
            .select(
                SelectOptions::new(SourceDescriptor::function(None, "recent_posts").build())
                    .arg(ArgumentSpec::positional(user_id, Codec::int4()))
                    .arg(ArgumentSpec::named(limit, Codec::int4(), "max")),
            )
            .unwrap();
        {
            let plan = f.arena.select_plan_mut(recent).unwrap();
            let alias = plan.alias().clone();
            plan.select(sql::qualified(&alias, "title")).unwrap();
        }

        assert_eq!(f.arena.optimize(recent).unwrap(), Strategy::InlinedSubquery);
        let results = f.arena.finalize(f.users).unwrap();
        assert!(results
            .query
            .text
            .contains("from \"recent_posts\"(__users__.\"id\", \"max\" => ($1)::int4)"));
        assert_eq!(results.query.values, vec![json!(5)]);
        assert!(!results.is_batched());
    }

    #[test]
    fn test_variable_argument_becomes_parent_key() {
        let mut f = fixture(PlannerConfig::default());
        let user_id = f.arena.column(f.row, "id", Codec::int4()).unwrap();
        let term = f.arena.variable("term");
        let search = f
            .arena
            .select(
                SelectOptions::new(SourceDescriptor::function(None, "search_posts").build())
                    .arg(ArgumentSpec::positional(user_id, Codec::int4()))
                    .arg(ArgumentSpec::positional(term, Codec::text())),
            )
            .unwrap();

        f.arena.optimize(search).unwrap();
        let users = f.arena.select_plan(f.users).unwrap();
        assert_eq!(users.placeholders().len(), 1);
        assert!(users.dependencies().contains(&term));

        let results = f.arena.finalize(f.users).unwrap();
        assert!(results.is_batched());
        assert_eq!(results.key_dependencies, vec![term]);
    }

    #[test]
    fn test_preconditions_keep_plan_standalone() {
        let mut f = fixture(PlannerConfig::without_inlining());
        let teams = team_of(&mut f);
        assert_eq!(f.arena.optimize(teams).unwrap(), Strategy::Standalone);

        let mut f = fixture(PlannerConfig::default());
        let posts = posts_of(&mut f);
        f.arena.select_plan_mut(posts).unwrap().set_has_side_effects();
        assert_eq!(f.arena.optimize(posts).unwrap(), Strategy::Standalone);

        let mut f = fixture(PlannerConfig::default());
        let posts = posts_of(&mut f);
        f.arena.select_plan_mut(posts).unwrap().forbid_inlining();
        assert_eq!(f.arena.optimize(posts).unwrap(), Strategy::Standalone);
        assert_eq!(f.arena.metrics().snapshot().plans_standalone, 1);
    }

    #[test]
    fn test_two_parent_rows_keep_plan_standalone() {
        let mut f = fixture(PlannerConfig::default());
        let user_id = f.arena.column(f.row, "id", Codec::int4()).unwrap();
        let other_row = f.arena.list_item(f.users).unwrap();
        let other_id = f.arena.column(other_row, "id", Codec::int4()).unwrap();
        let posts = f
            .arena
            .select(
                SelectOptions::new(SourceDescriptor::table(None, "posts").build())
                    .identifier(IdentifierMatch::column(user_id, Codec::int4(), "author_id"))
                    .identifier(IdentifierMatch::column(other_id, Codec::int4(), "editor_id")),
            )
            .unwrap();
        assert_eq!(f.arena.optimize(posts).unwrap(), Strategy::Standalone);
    }

    #[test]
    fn test_mutual_dependency_is_self_merge() {
        let mut f = fixture(PlannerConfig::default());
        let posts = posts_of(&mut f);
        let post_row = f.arena.list_item(posts).unwrap();
        let post_id = f.arena.column(post_row, "id", Codec::int4()).unwrap();
        f.arena.add_dependency(f.users, post_id).unwrap();

        let err = f.arena.optimize(posts).unwrap_err();
        assert_eq!(err.code(), PlanErrorCode::SelfMerge);
        // the failed merge leaves the child in place
        assert!(f.arena.select_plan(posts).is_ok());
    }

    #[test]
    fn test_finalized_parent_is_unsupported() {
        let mut f = fixture(PlannerConfig::default());
        let posts = posts_of(&mut f);
        f.arena.finalize(f.users).unwrap();
        let err = f.arena.optimize(posts).unwrap_err();
        assert_eq!(err.code(), PlanErrorCode::UnsupportedMerge);
    }

    #[test]
    fn test_optimize_all_runs_children_first() {
        let mut f = fixture(PlannerConfig::default());
        let teams = team_of(&mut f);
        let posts = posts_of(&mut f);
        f.arena.optimize_all().unwrap();
        assert_eq!(f.arena.strategy(teams).unwrap(), Strategy::InlinedJoin);
        assert_eq!(f.arena.strategy(posts).unwrap(), Strategy::InlinedSubquery);
        assert_eq!(f.arena.strategy(f.users).unwrap(), Strategy::Standalone);
    }
}
