//! Human-readable account of how a plan executes

use std::fmt;

use super::arena::{PlanArena, PlanId, PlanNode, Strategy};
use super::errors::PlanResult;

/// Snapshot of one select's execution strategy and compiled text
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainPlan {
    pub id: PlanId,
    pub name: Option<String>,
    pub strategy: Strategy,
    /// `None` until the executing plan is finalized, and for inlined plans
    pub sql: Option<String>,
    pub identifier_index: Option<usize>,
    pub reverse: bool,
    pub stream_initial: Option<String>,
    pub stream_cursor: Option<String>,
}

impl ExplainPlan {
    pub fn from_arena(arena: &PlanArena, id: PlanId) -> PlanResult<Self> {
        let strategy = arena.strategy(id)?;
        let mut explain = Self {
            id,
            name: None,
            strategy,
            sql: None,
            identifier_index: None,
            reverse: false,
            stream_initial: None,
            stream_cursor: None,
        };

        if let PlanNode::Select(plan) = arena.node(id)? {
            explain.name = Some(plan.name().to_string());
            if let Some(results) = plan.finalize_results() {
                explain.sql = Some(results.query.text.clone());
                explain.identifier_index = results.identifier_index;
                explain.reverse = results.reverse;
                if let Some(stream) = &results.stream {
                    explain.stream_initial = Some(stream.initial.text.clone());
                    explain.stream_cursor = Some(stream.cursor.text.clone());
                }
            }
        }
        Ok(explain)
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, title: &str, text: &str) -> fmt::Result {
    writeln!(f, "{}:", title)?;
    if text.is_empty() {
        return writeln!(f, "  (empty)");
    }
    for line in text.lines() {
        writeln!(f, "  {}", line)?;
    }
    Ok(())
}

impl fmt::Display for ExplainPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => writeln!(f, "plan {} ({}): {}", self.id, name, self.strategy)?,
            None => writeln!(f, "plan {}: {}", self.id, self.strategy)?,
        }
        if matches!(self.strategy, Strategy::InlinedJoin | Strategy::InlinedSubquery) {
            return Ok(());
        }
        match self.identifier_index {
            Some(index) => writeln!(f, "identifier index: {}", index)?,
            None => writeln!(f, "identifier index: none")?,
        }
        writeln!(f, "reverse: {}", self.reverse)?;
        match &self.sql {
            Some(sql) => write_block(f, "sql", sql)?,
            None => writeln!(f, "sql: not finalized")?,
        }
        if let Some(initial) = &self.stream_initial {
            write_block(f, "stream initial", initial)?;
        }
        if let Some(cursor) = &self.stream_cursor {
            write_block(f, "stream cursor", cursor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::plan::select::StreamOptions;
    use crate::plan::{SelectOptions, SourceDescriptor};
    use crate::sql;

    fn arena_with_users() -> (PlanArena, PlanId) {
        let mut arena = PlanArena::new(PlannerConfig::default()).unwrap();
        let users = arena
            .select(SelectOptions::new(
                SourceDescriptor::table(None, "users").with_unique(&["id"]).build(),
            ))
            .unwrap();
        let plan = arena.select_plan_mut(users).unwrap();
        let alias = plan.alias().clone();
        plan.select(sql::qualified(&alias, "name")).unwrap();
        (arena, users)
    }

    #[test]
    fn test_explain_standalone() {
        let (mut arena, users) = arena_with_users();
        arena.finalize(users).unwrap();
        let explain = ExplainPlan::from_arena(&arena, users).unwrap();
        assert_eq!(explain.strategy, Strategy::Standalone);

        let text = explain.to_string();
        assert_eq!(
            text,
            "plan #1 (users): standalone\n\
             identifier index: none\n\
             reverse: false\n\
             sql:\n  \
             select __users__.\"name\" as \"0\"\n  \
             from \"users\" as __users__\n  \
             order by __users__.\"id\" asc\n"
        );
        // deterministic
        assert_eq!(text, ExplainPlan::from_arena(&arena, users).unwrap().to_string());
    }

    #[test]
    fn test_explain_before_finalize() {
        let (arena, users) = arena_with_users();
        let text = ExplainPlan::from_arena(&arena, users).unwrap().to_string();
        assert!(text.ends_with("sql: not finalized\n"));
    }

    #[test]
    fn test_explain_stream_with_empty_initial() {
        let (mut arena, users) = arena_with_users();
        arena
            .select_plan_mut(users)
            .unwrap()
            .set_stream(StreamOptions { initial_count: 0 })
            .unwrap();
        arena.finalize(users).unwrap();
        let text = ExplainPlan::from_arena(&arena, users).unwrap().to_string();
        assert!(text.contains("stream initial:\n  (empty)\n"));
        assert!(text.contains("stream cursor:\n  select"));
    }

    #[test]
    fn test_explain_deduplicated() {
        let (mut arena, users) = arena_with_users();
        let copy = arena.clone_select(users, None).unwrap();
        arena.deduplicate(copy, &[users]).unwrap();
        let explain = ExplainPlan::from_arena(&arena, copy).unwrap();
        assert_eq!(explain.strategy, Strategy::Deduplicated(users));
    }
}
