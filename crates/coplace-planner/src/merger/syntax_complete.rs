use std::collections::BTreeMap;

use coplace_core::id::OperatorId;
use coplace_core::plan::QueryPlan;
use tracing::trace;

use crate::error::Result;
use crate::global_plan::GlobalQueryPlan;
use crate::shared_plan::MatchedOperatorPair;

use super::{merge_pending, QueryMergerRule};

/// Merges a query only when every operator, from each source up to each
/// sink, has a structurally identical counterpart in the host. The new sinks
/// are then hung off the host's matched sink inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntaxBasedCompleteQueryMergerRule;

impl QueryMergerRule for SyntaxBasedCompleteQueryMergerRule {
    fn name(&self) -> &'static str {
        "SyntaxBasedCompleteQueryMergerRule"
    }

    fn apply(&self, global: &mut GlobalQueryPlan) -> Result<bool> {
        merge_pending(self.name(), global, complete_match)
    }
}

fn complete_match(host: &QueryPlan, target: &QueryPlan) -> Vec<MatchedOperatorPair> {
    let mut map = BTreeMap::new();
    let host_leaves = host.leaf_operators();
    let target_leaves = target.leaf_operators();
    if host_leaves.len() != target_leaves.len() {
        trace!("leaf counts differ");
        return Vec::new();
    }
    for t in &target_leaves {
        let matched = host_leaves
            .iter()
            .any(|h| operators_equal(host, target, *t, *h, &mut map));
        if !matched {
            return Vec::new();
        }
    }

    let mut pairs = Vec::new();
    for sink in target.sink_operators() {
        match map.get(&sink) {
            Some(host_sink) => pairs.push(MatchedOperatorPair {
                host: *host_sink,
                target: sink,
            }),
            None => return Vec::new(),
        }
    }
    pairs
}

fn operators_equal(
    host: &QueryPlan,
    target: &QueryPlan,
    t: OperatorId,
    h: OperatorId,
    map: &mut BTreeMap<OperatorId, OperatorId>,
) -> bool {
    if let Some(existing) = map.get(&t) {
        return *existing == h;
    }
    let (Some(t_op), Some(h_op)) = (target.operator(t), host.operator(h)) else {
        return false;
    };
    if t_op.kind.is_sink() && h_op.kind.is_sink() {
        map.insert(t, h);
        return true;
    }
    if !t_op.syntax_equal(h_op) {
        return false;
    }
    map.insert(t, h);

    for tp in &t_op.parents {
        if !h_op
            .parents
            .iter()
            .any(|hp| operators_equal(host, target, *tp, *hp, map))
        {
            map.remove(&t);
            return false;
        }
    }
    for tc in &t_op.children {
        if !h_op
            .children
            .iter()
            .any(|hc| operators_equal(host, target, *tc, *hc, map))
        {
            map.remove(&t);
            return false;
        }
    }
    true
}
