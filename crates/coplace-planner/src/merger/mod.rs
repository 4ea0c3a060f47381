//! Query merger rules.
//!
//! Every rule drains the pending queue of the global query plan. For each
//! pending query it scans the candidate bucket for the query's consumed
//! sources and placement strategy, grafts the query onto the first host that
//! yields a usable match, and otherwise creates a new shared query plan.
//! Failed and stopped plans are purged before returning.

mod default;
mod hash_partial;
mod syntax_complete;
mod syntax_partial;

use std::collections::BTreeMap;

use coplace_core::config::QueryMergerRuleType;
use coplace_core::id::OperatorId;
use coplace_core::plan::QueryPlan;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::global_plan::GlobalQueryPlan;
use crate::shared_plan::{MatchedOperatorPair, SharedQueryPlanStatus};

pub use default::DefaultQueryMergerRule;
pub use hash_partial::HashSignatureBasedPartialQueryMergerRule;
pub use syntax_complete::SyntaxBasedCompleteQueryMergerRule;
pub use syntax_partial::SyntaxBasedPartialQueryMergerRule;

pub trait QueryMergerRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, global: &mut GlobalQueryPlan) -> Result<bool>;
}

pub fn merger_rule_for(kind: QueryMergerRuleType) -> Box<dyn QueryMergerRule> {
    match kind {
        QueryMergerRuleType::DefaultQueryMergerRule => Box::new(DefaultQueryMergerRule),
        QueryMergerRuleType::SyntaxBasedCompleteQueryMergerRule => {
            Box::new(SyntaxBasedCompleteQueryMergerRule)
        }
        QueryMergerRuleType::SyntaxBasedPartialQueryMergerRule => {
            Box::new(SyntaxBasedPartialQueryMergerRule)
        }
        QueryMergerRuleType::HashSignatureBasedPartialQueryMergerRule => {
            Box::new(HashSignatureBasedPartialQueryMergerRule::default())
        }
    }
}

/// Shared driver: `matcher(host, target)` returns the pairs to graft, empty
/// when the host is unusable.
pub(crate) fn merge_pending<F>(rule: &str, global: &mut GlobalQueryPlan, matcher: F) -> Result<bool>
where
    F: Fn(&QueryPlan, &QueryPlan) -> Vec<MatchedOperatorPair>,
{
    let pending = global.take_query_plans_to_add();
    if pending.is_empty() {
        debug!(rule, "no pending query plans");
        return Ok(true);
    }
    info!(rule, pending = pending.len(), "applying query merger rule");

    let mut pending = pending.into_iter();
    while let Some(target) = pending.next() {
        match graft_onto_candidate(rule, global, &target, &matcher) {
            Ok(true) => {}
            Ok(false) => {
                global.create_new_shared_query_plan(target);
            }
            Err(e) => {
                // The failed query and everything after it stay queued.
                warn!(rule, query_id = %target.query_id, error = %e, "merge failed, requeueing unprocessed plans");
                global.requeue_query_plans(std::iter::once(target).chain(pending));
                return Err(e);
            }
        }
    }

    global.remove_failed_or_stopped_shared_query_plans();
    Ok(true)
}

/// Graft `target` onto the first usable candidate host. Returns false when
/// no candidate matched.
fn graft_onto_candidate<F>(
    rule: &str,
    global: &mut GlobalQueryPlan,
    target: &QueryPlan,
    matcher: &F,
) -> Result<bool>
where
    F: Fn(&QueryPlan, &QueryPlan) -> Vec<MatchedOperatorPair>,
{
    let candidates = global.shared_query_plans_consuming_sources_and_placement_strategy(
        &target.source_consumed(),
        target.placement_strategy,
    );
    for host_id in candidates {
        let Some(host) = global.shared_query_plan(host_id) else {
            continue;
        };
        if matches!(
            host.status(),
            SharedQueryPlanStatus::Failed | SharedQueryPlanStatus::Stopped
        ) {
            continue;
        }
        let pairs = matcher(host.query_plan(), target);
        if pairs.is_empty() || !host.is_graftable(target, &pairs) {
            continue;
        }
        if let Some(host) = global.shared_query_plan_mut(host_id) {
            host.add_query(target, &pairs)?;
        }
        global.update_shared_query_plan(host_id)?;
        info!(rule, query_id = %target.query_id, shared_query_id = %host_id, "merged query");
        return Ok(true);
    }
    Ok(false)
}

/// Keep only the most-downstream match per lineage: whenever one matched
/// target operator is upstream of another, drop the upstream one.
pub(crate) fn retain_downstream_matches(
    target: &QueryPlan,
    matches: BTreeMap<OperatorId, OperatorId>,
) -> Vec<MatchedOperatorPair> {
    let targets: Vec<OperatorId> = matches.keys().copied().collect();
    matches
        .into_iter()
        .filter(|(t, _)| !targets.iter().any(|other| target.is_upstream_of(*t, *other)))
        .map(|(target, host)| MatchedOperatorPair { host, target })
        .collect()
}

/// Partial matching walk shared by the syntax and signature partial rules.
///
/// Starting from each target leaf, find an equal host leaf and climb through
/// parents. An operator pair is recorded only where the match stops growing,
/// i.e. when fewer of its parents matched than it has.
pub(crate) fn partial_matches<E>(
    host: &QueryPlan,
    target: &QueryPlan,
    equal: &E,
) -> BTreeMap<OperatorId, OperatorId>
where
    E: Fn(OperatorId, OperatorId) -> bool,
{
    let mut out = BTreeMap::new();
    let host_leaves = host.leaf_operators();
    let target_leaves = target.leaf_operators();
    if host_leaves.len() != target_leaves.len() {
        return out;
    }
    for t in &target_leaves {
        for h in &host_leaves {
            let found = partial_walk(host, target, *t, *h, equal);
            if !found.is_empty() {
                for (k, v) in found {
                    out.entry(k).or_insert(v);
                }
                break;
            }
        }
    }
    out
}

fn partial_walk<E>(
    host: &QueryPlan,
    target: &QueryPlan,
    t: OperatorId,
    h: OperatorId,
    equal: &E,
) -> BTreeMap<OperatorId, OperatorId>
where
    E: Fn(OperatorId, OperatorId) -> bool,
{
    let mut out = BTreeMap::new();
    let (Some(t_op), Some(h_op)) = (target.operator(t), host.operator(h)) else {
        return out;
    };
    if t_op.kind.is_sink() && h_op.kind.is_sink() {
        return out;
    }
    if !equal(t, h) {
        return out;
    }
    let mut match_count = 0;
    for tp in &t_op.parents {
        for hp in &h_op.parents {
            let found = partial_walk(host, target, *tp, *hp, equal);
            if !found.is_empty() {
                for (k, v) in found {
                    out.entry(k).or_insert(v);
                }
                match_count += 1;
                break;
            }
        }
    }
    if match_count < t_op.parents.len() {
        out.insert(t, h);
    }
    out
}
