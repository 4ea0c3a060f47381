//! Bottom-up placement: keep every operator as close to its sources as
//! capacity allows.
//!
//! Two passes. The pin pass walks upwards from the upstream bounds and picks
//! a node per operator, tracking slots promised in this run so two pins
//! never count the same free slot. The place pass then takes those slots in
//! children-first order.

use std::sync::Arc;

use coplace_core::id::{OperatorId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use coplace_topology::Topology;
use tracing::debug;

use super::{run_staged, PlacementRequest, PlacementRun, PlacementStrategy};
use crate::error::Result;
use crate::execution_plan::GlobalExecutionPlan;
use crate::type_inference::TypeInferencePhase;

pub struct BottomUpStrategy {
    topology: Arc<Topology>,
    type_inference: Arc<dyn TypeInferencePhase>,
}

impl BottomUpStrategy {
    pub fn new(topology: Arc<Topology>, type_inference: Arc<dyn TypeInferencePhase>) -> Self {
        Self {
            topology,
            type_inference,
        }
    }
}

impl PlacementStrategy for BottomUpStrategy {
    fn name(&self) -> &'static str {
        "BottomUp"
    }

    fn update_global_execution_plan(
        &self,
        request: &PlacementRequest<'_>,
        plan: &mut QueryPlan,
        global_execution_plan: &mut GlobalExecutionPlan,
    ) -> Result<bool> {
        debug!(shared_query = %request.shared_query_id, "bottom-up placement");
        run_staged(
            &self.topology,
            self.type_inference.as_ref(),
            request,
            plan,
            global_execution_plan,
            |run| {
                pin_operators(run, request)?;
                for id in run.pinned_in_topological_order() {
                    let node = run.pinned_node(id)?;
                    run.place_operator(id, node)?;
                }
                Ok(())
            },
        )
    }
}

fn pin_operators(run: &mut PlacementRun<'_>, request: &PlacementRequest<'_>) -> Result<()> {
    for upstream in request.pinned_upstream {
        let node = run.pinned_node(*upstream)?;
        let op = run.operator(*upstream)?;
        if op.is_placed() {
            for parent in &op.parents {
                identify_pinning_location(run, request, *parent, node)?;
            }
        } else {
            identify_pinning_location(run, request, *upstream, node)?;
        }
    }
    Ok(())
}

fn identify_pinning_location(
    run: &mut PlacementRun<'_>,
    request: &PlacementRequest<'_>,
    id: OperatorId,
    candidate: TopologyNodeId,
) -> Result<()> {
    let op = run.operator(id)?;
    if op.is_placed() || run.is_pinned_now(id) {
        return Ok(());
    }

    let mut candidate = candidate;
    if op.requires_all_children() {
        let mut child_nodes = Vec::with_capacity(op.children.len());
        for child in &op.children {
            match run.resolved_node(*child) {
                Some(node) => {
                    if !child_nodes.contains(&node) {
                        child_nodes.push(node);
                    }
                }
                // Revisited once the last child is pinned.
                None => return Ok(()),
            }
        }
        if child_nodes.len() > 1 {
            candidate = run
                .topology
                .find_common_ancestor(&child_nodes)
                .ok_or_else(|| run.fail(format!("no common ancestor for the inputs of {id}")))?;
        } else if let Some(only) = child_nodes.first() {
            candidate = *only;
        }
    }

    if op.kind.is_sink() {
        let target = run.pinned_node(id)?;
        if target != candidate && !run.topology.is_ancestor_or_self(target, candidate) {
            return Err(run.fail(format!(
                "sink {id} is pinned to {target}, which is not reachable from {candidate}"
            )));
        }
        if run.effective_available(target) == 0 {
            return Err(run.fail(format!("no capacity for sink {id} on {target}")));
        }
        candidate = target;
    } else if run.effective_available(candidate) == 0 {
        if op.kind.is_source() {
            return Err(run.fail(format!("no capacity for source {id} on {candidate}")));
        }
        candidate = walk_up_to_capacity(run, candidate)
            .ok_or_else(|| run.fail(format!("no node with free capacity above {candidate} for {id}")))?;
    }

    run.pin(id, candidate)?;
    if request.pinned_downstream.contains(&id) {
        return Ok(());
    }
    for parent in &op.parents {
        identify_pinning_location(run, request, *parent, candidate)?;
    }
    Ok(())
}

/// First ancestor of `from`, following first parents, with a free slot.
fn walk_up_to_capacity(run: &PlacementRun<'_>, from: TopologyNodeId) -> Option<TopologyNodeId> {
    let mut current = from;
    loop {
        current = *run.topology.parents(current).first()?;
        if run.effective_available(current) > 0 {
            return Some(current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{chain_topology, full_request, simple_plan};
    use super::*;
    use crate::type_inference::StructuralTypeInference;
    use coplace_core::id::SharedQueryId;
    use coplace_core::operator::OperatorKind;
    use coplace_core::plan::{FaultToleranceType, LineageType};

    fn strategy(topology: Arc<Topology>) -> BottomUpStrategy {
        BottomUpStrategy::new(topology, Arc::new(StructuralTypeInference))
    }

    #[test]
    fn test_places_on_source_node_and_bridges_to_sink() {
        let topology = Arc::new(chain_topology());
        let mut plan = simple_plan();
        let (up, down) = full_request(&plan);
        let request = PlacementRequest {
            shared_query_id: SharedQueryId::new(1),
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            pinned_upstream: &up,
            pinned_downstream: &down,
        };
        let mut gep = GlobalExecutionPlan::new();

        let placed = strategy(topology.clone())
            .update_global_execution_plan(&request, &mut plan, &mut gep)
            .unwrap();
        assert!(placed);
        assert!(plan.operators().all(|op| op.is_placed()));

        let filter = plan
            .operators()
            .find(|op| matches!(op.kind, OperatorKind::Filter { .. }))
            .unwrap();
        assert_eq!(filter.pinned_node(), Some(TopologyNodeId::new(4)));
        // Network operators take no slots.
        assert_eq!(topology.available_resources(TopologyNodeId::new(4)), 8);
        assert_eq!(topology.available_resources(TopologyNodeId::new(2)), 10);
        assert_eq!(topology.available_resources(TopologyNodeId::new(1)), 9);
        assert_eq!(gep.execution_nodes_by_query_id(SharedQueryId::new(1)).len(), 3);
        assert_eq!(gep.root_nodes(), &[TopologyNodeId::new(1)]);
    }

    #[test]
    fn test_full_node_pushes_operators_upwards() {
        let mut t = Topology::new();
        t.add_node(TopologyNodeId::new(1), "h", 1, 10).unwrap();
        t.add_node(TopologyNodeId::new(2), "h", 2, 10).unwrap();
        t.add_node(TopologyNodeId::new(4), "h", 4, 1).unwrap();
        t.add_link(TopologyNodeId::new(4), TopologyNodeId::new(2), Default::default())
            .unwrap();
        t.add_link(TopologyNodeId::new(2), TopologyNodeId::new(1), Default::default())
            .unwrap();
        let topology = Arc::new(t);
        let mut plan = simple_plan();
        let (up, down) = full_request(&plan);
        let request = PlacementRequest {
            shared_query_id: SharedQueryId::new(2),
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            pinned_upstream: &up,
            pinned_downstream: &down,
        };
        let mut gep = GlobalExecutionPlan::new();
        strategy(topology.clone())
            .update_global_execution_plan(&request, &mut plan, &mut gep)
            .unwrap();

        let filter = plan
            .operators()
            .find(|op| matches!(op.kind, OperatorKind::Filter { .. }))
            .unwrap();
        assert_eq!(filter.pinned_node(), Some(TopologyNodeId::new(2)));
        assert_eq!(topology.available_resources(TopologyNodeId::new(4)), 0);
    }

    #[test]
    fn test_failure_leaves_plan_and_capacity_untouched() {
        let mut t = Topology::new();
        t.add_node(TopologyNodeId::new(1), "h", 1, 0).unwrap();
        t.add_node(TopologyNodeId::new(4), "h", 4, 10).unwrap();
        t.add_link(TopologyNodeId::new(4), TopologyNodeId::new(1), Default::default())
            .unwrap();
        let topology = Arc::new(t);
        let mut plan = simple_plan();
        let before = plan.clone();
        let (up, down) = full_request(&plan);
        let request = PlacementRequest {
            shared_query_id: SharedQueryId::new(3),
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            pinned_upstream: &up,
            pinned_downstream: &down,
        };
        let mut gep = GlobalExecutionPlan::new();

        let err = strategy(topology.clone()).update_global_execution_plan(&request, &mut plan, &mut gep);
        assert!(err.is_err());
        assert_eq!(topology.available_resources(TopologyNodeId::new(4)), 10);
        assert!(gep.all_execution_nodes().next().is_none());
        for op in before.operators() {
            let now = plan.get(op.id).unwrap();
            assert_eq!(now.state, op.state);
            assert_eq!(now.pinned_node(), op.pinned_node());
        }
    }
}
