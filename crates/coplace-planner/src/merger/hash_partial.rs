use coplace_core::id::OperatorId;
use coplace_core::plan::QueryPlan;
use tracing::warn;

use crate::error::Result;
use crate::global_plan::GlobalQueryPlan;
use crate::shared_plan::MatchedOperatorPair;
use crate::signature::SignatureInferencePhase;

use super::{merge_pending, partial_matches, retain_downstream_matches, QueryMergerRule};

/// Partial merging where operator equality means equal subtree signatures,
/// so reordered but equivalent expressions still share work.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSignatureBasedPartialQueryMergerRule {
    inference: SignatureInferencePhase,
}

impl QueryMergerRule for HashSignatureBasedPartialQueryMergerRule {
    fn name(&self) -> &'static str {
        "HashSignatureBasedPartialQueryMergerRule"
    }

    fn apply(&self, global: &mut GlobalQueryPlan) -> Result<bool> {
        // Signatures must exist on the incoming plans before matching.
        for plan in global.query_plans_to_add_mut() {
            self.inference.execute(plan)?;
        }
        merge_pending(self.name(), global, signature_partial_match)
    }
}

fn signature_partial_match(host: &QueryPlan, target: &QueryPlan) -> Vec<MatchedOperatorPair> {
    let equal = |t: OperatorId, h: OperatorId| match (target.operator(t), host.operator(h)) {
        (Some(t_op), Some(h_op)) => match (&t_op.signature, &h_op.signature) {
            (Some(a), Some(b)) => a == b,
            _ => {
                warn!(target = %t, host = %h, "operator without signature");
                false
            }
        },
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
    fn test_reordered_map_assignments_match() {
        let phase = SignatureInferencePhase::new();
        let mut host = QueryPlanBuilder::from_source("a")
            .map(&[("x", "v + 1"), ("y", "v * 2")])
            .sink("s1")
            .build(QueryId::new(1));
        let mut target = QueryPlanBuilder::from_source("a")
            .map(&[("y", "v * 2"), ("x", "v + 1")])
            .filter("x > 3")
            .sink("s2")
            .build(QueryId::new(2));
        phase.execute(&mut host).expect("host signatures");
        phase.execute(&mut target).expect("target signatures");

        let pairs = signature_partial_match(&host, &target);
        assert_eq!(pairs.len(), 1);
        let target_map = target
            .operators()
            .find(|op| op.kind.name() == "map")
            .map(|op| op.id);
        assert_eq!(Some(pairs[0].target), target_map);
    }

    #[test]
    fn test_queued_plans_gain_signatures_and_share_the_source() {
        let mut global = GlobalQueryPlan::new();
        for (id, predicate) in [(1, "v > 1"), (2, "v > 2")] {
            let plan = QueryPlanBuilder::from_source("a")
                .filter(predicate)
                .sink(format!("s{id}"))
                .build(QueryId::new(id));
            global.add_query_plan(plan).expect("queue");
        }
        let rule = HashSignatureBasedPartialQueryMergerRule::default();
        assert!(rule.apply(&mut global).expect("apply"));

        assert!(global.query_plans_to_add().is_empty());
        let first = global.shared_query_id_for(QueryId::new(1)).expect("first merged");
        let second = global.shared_query_id_for(QueryId::new(2)).expect("second merged");
        assert_eq!(first, second);
        for shared in global.all_shared_query_plans() {
            assert!(shared.query_plan().operators().all(|op| op.signature.is_some()));
        }
    }
}
