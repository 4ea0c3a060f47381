use coplace_core::id::OperatorId;
use coplace_core::plan::QueryPlan;

use crate::error::Result;
use crate::global_plan::GlobalQueryPlan;
use crate::shared_plan::MatchedOperatorPair;

use super::{merge_pending, partial_matches, retain_downstream_matches, QueryMergerRule};

/// Shares the longest structurally equal prefix (from the sources up) of an
/// incoming query with a host and grafts the rest of the query onto it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntaxBasedPartialQueryMergerRule;

impl QueryMergerRule for SyntaxBasedPartialQueryMergerRule {
    fn name(&self) -> &'static str {
        "SyntaxBasedPartialQueryMergerRule"
    }

    fn apply(&self, global: &mut GlobalQueryPlan) -> Result<bool> {
        merge_pending(self.name(), global, syntax_partial_match)
    }
}

fn syntax_partial_match(host: &QueryPlan, target: &QueryPlan) -> Vec<MatchedOperatorPair> {
    let equal = |t: OperatorId, h: OperatorId| match (target.operator(t), host.operator(h)) {
        (Some(t_op), Some(h_op)) => t_op.syntax_equal(h_op),
        _ => false,
    };
    retain_downstream_matches(target, partial_matches(host, target, &equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coplace_core::builder::QueryPlanBuilder;
    use coplace_core::id::QueryId;

    #[test]
    fn test_shared_prefix_matches_at_its_top() {
        let host = QueryPlanBuilder::from_source("a")
            .filter("v > 5")
            .sink("s1")
            .build(QueryId::new(1));
        let target = QueryPlanBuilder::from_source("a")
            .filter("v > 5")
            .project(&["v"])
            .sink("s2")
            .build(QueryId::new(2));
        let pairs = syntax_partial_match(&host, &target);
        assert_eq!(pairs.len(), 1);
        let target_filter = target
            .operators()
            .find(|op| op.kind.name() == "filter")
            .map(|op| op.id);
        assert_eq!(Some(pairs[0].target), target_filter);
    }

    #[test]
    fn test_different_source_has_no_match() {
        let host = QueryPlanBuilder::from_source("a").sink("s1").build(QueryId::new(1));
        let target = QueryPlanBuilder::from_source("b").sink("s2").build(QueryId::new(2));
        assert!(syntax_partial_match(&host, &target).is_empty());
    }
}
