//! Deduplication of sibling plans
//!
//! Two selects are merged when they would compile to the same query up
//! to alias naming. Comparison is structural: each plan's alias, join
//! aliases and placeholder symbols are mapped onto the peer's in a
//! candidate substitution, then every fragment is compared under it.

use super::arena::{PlanArena, PlanId, PlanNode};
use super::errors::PlanResult;
use super::select::SelectPlan;
use crate::observability::{log_event_with_fields, Event};
use crate::sql::{SqlFragment, SymbolSubstitution};

fn fragments_equivalent(a: &[SqlFragment], b: &[SqlFragment], subs: &SymbolSubstitution) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_equivalent(y, subs))
}

impl PlanArena {
    /// Substitution under which `a` and `b` are the same query, if any
    pub(crate) fn equivalence(&self, a: &SelectPlan, b: &SelectPlan) -> Option<SymbolSubstitution> {
        let same_source = std::sync::Arc::ptr_eq(&a.source, &b.source) || *a.source == *b.source;
        if !same_source
            || a.mode != b.mode
            || a.trusted != b.trusted
            || a.inlining_forbidden != b.inlining_forbidden
            || a.unique != b.unique
            || a.has_side_effects
            || b.has_side_effects
            || a.stream != b.stream
            || a.fetch_one_extra != b.fetch_one_extra
            || a.first != b.first
            || a.last != b.last
            || a.offset != b.offset
            || a.order_is_unique != b.order_is_unique
        {
            return None;
        }

        let dependency = |plan: &SelectPlan, index: usize| self.resolve(plan.dependencies[index]);
        if dependency(a, a.context_dependency) != dependency(b, b.context_dependency) {
            return None;
        }

        let mut subs = SymbolSubstitution::new();
        subs.insert(a.alias.clone(), b.alias.clone());

        if a.placeholders.len() != b.placeholders.len() {
            return None;
        }
        for (pa, pb) in a.placeholders.iter().zip(&b.placeholders) {
            if pa.codec != pb.codec || dependency(a, pa.dependency) != dependency(b, pb.dependency) {
                return None;
            }
            subs.insert(pa.symbol.clone(), pb.symbol.clone());
        }

        if a.joins.len() != b.joins.len() {
            return None;
        }
        for (ja, jb) in a.joins.iter().zip(&b.joins) {
            if ja.kind != jb.kind || ja.lateral != jb.lateral {
                return None;
            }
            subs.insert(ja.alias.clone(), jb.alias.clone());
        }
        for (ja, jb) in a.joins.iter().zip(&b.joins) {
            if !ja.from.is_equivalent(&jb.from, &subs)
                || !fragments_equivalent(&ja.conditions, &jb.conditions, &subs)
            {
                return None;
            }
        }

        if a.identifiers.len() != b.identifiers.len() {
            return None;
        }
        for (ia, ib) in a.identifiers.iter().zip(&b.identifiers) {
            if ia.codec != ib.codec
                || dependency(a, ia.dependency) != dependency(b, ib.dependency)
                || !ia.matches.is_equivalent(&ib.matches, &subs)
            {
                return None;
            }
        }

        if a.orders.len() != b.orders.len() {
            return None;
        }
        for (oa, ob) in a.orders.iter().zip(&b.orders) {
            if oa.direction != ob.direction
                || oa.nulls != ob.nulls
                || !oa.fragment.is_equivalent(&ob.fragment, &subs)
            {
                return None;
            }
        }

        if !a.from.is_equivalent(&b.from, &subs)
            || !fragments_equivalent(&a.selects, &b.selects, &subs)
            || !fragments_equivalent(&a.conditions, &b.conditions, &subs)
            || !fragments_equivalent(&a.cursor_conditions, &b.cursor_conditions, &subs)
            || !fragments_equivalent(&a.groups, &b.groups, &subs)
            || !fragments_equivalent(&a.having, &b.having, &subs)
        {
            return None;
        }

        if a.placeholder_values.len() != b.placeholder_values.len() {
            return None;
        }
        for (symbol, value) in &a.placeholder_values {
            let target = subs.get(symbol).unwrap_or(symbol);
            match b.placeholder_values.get(target) {
                Some(other) if value.is_equivalent(other, &subs) => {}
                _ => return None,
            }
        }

        Some(subs)
    }

    /// Replaces `id` by the first equivalent peer, returning whichever
    /// plan is now live. Both plans are fully locked first.
    pub fn deduplicate(&mut self, id: PlanId, peers: &[PlanId]) -> PlanResult<PlanId> {
        let id = self.resolve(id);
        self.select_plan_mut(id)?.lock_all()?;

        for peer in peers {
            let peer = self.resolve(*peer);
            if peer == id || !matches!(self.nodes.get(peer.index()), Some(PlanNode::Select(_))) {
                continue;
            }
            self.select_plan_mut(peer)?.lock_all()?;

            let found = self.equivalence(self.select_plan(id)?, self.select_plan(peer)?);
            if let Some(subs) = found {
                self.substitutions.extend(&subs);
                self.replacements.insert(id, peer);
                self.metrics.increment_plans_deduplicated();
                log_event_with_fields(
                    Event::PlanDeduplicated,
                    &[
                        ("plan", self.select_plan(peer)?.name()),
                        ("from", &id.to_string()),
                        ("into", &peer.to_string()),
                    ],
                );
                return Ok(peer);
            }
        }
        Ok(id)
    }
}
