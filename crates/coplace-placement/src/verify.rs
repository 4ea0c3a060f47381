//! Debug-time verification helpers for placed plans.
//!
//! Intended for tests and debug builds. They panic on the first violation.

use coplace_core::id::SharedQueryId;
use coplace_core::plan::QueryPlan;
use coplace_topology::Topology;

use crate::execution_plan::GlobalExecutionPlan;

/// Every operator is placed and carries a pinned node.
pub fn assert_all_placed(plan: &QueryPlan) {
    for op in plan.operators() {
        assert!(op.is_placed(), "operator {} is not placed", op.id);
        assert!(
            op.pinned_node().is_some(),
            "placed operator {} has no node",
            op.id
        );
    }
}

/// Data only flows upwards: each parent runs on the node of its child or on
/// an ancestor of it.
pub fn assert_parent_on_ancestor_node(plan: &QueryPlan, topology: &Topology) {
    for op in plan.operators() {
        let Some(node) = op.pinned_node() else {
            continue;
        };
        for parent in &op.parents {
            let Some(parent_node) = plan.operator(*parent).and_then(|p| p.pinned_node()) else {
                continue;
            };
            assert!(
                topology.is_ancestor_or_self(parent_node, node),
                "parent {parent} on {parent_node} is not above child {} on {node}",
                op.id
            );
        }
    }
}

/// Slots recorded in the ledger match what the execution nodes host, not
/// counting network operators.
pub fn assert_ledger_matches_sub_plans(gep: &GlobalExecutionPlan, shared_query_id: SharedQueryId) {
    let ledger = gep.map_of_topology_node_id_to_occupied_resource(shared_query_id);
    for node in gep.execution_nodes_by_query_id(shared_query_id) {
        let hosted = node
            .sub_plans(shared_query_id)
            .iter()
            .flat_map(|p| p.operators())
            .filter(|op| !op.kind.is_system_generated())
            .count() as u32;
        let recorded = ledger.get(&node.id).copied().unwrap_or(0);
        assert_eq!(
            hosted, recorded,
            "node {} hosts {hosted} operators but the ledger records {recorded}",
            node.id
        );
    }
}
