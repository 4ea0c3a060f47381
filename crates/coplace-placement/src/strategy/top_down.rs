//! Top-down placement: keep every operator as close to its sinks as
//! capacity allows.
//!
//! The pin pass starts at the downstream bounds and walks into children.
//! An operator inherits its parent's node unless that node cannot reach all
//! of its inputs or has no free slot, in which case it moves down towards
//! the inputs. Sources never move. The place pass matches bottom-up.

use std::sync::Arc;

use coplace_core::id::{OperatorId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use coplace_topology::Topology;
use tracing::debug;

use super::{run_staged, PlacementRequest, PlacementRun, PlacementStrategy};
use crate::error::Result;
use crate::execution_plan::GlobalExecutionPlan;
use crate::type_inference::TypeInferencePhase;

pub struct TopDownStrategy {
    topology: Arc<Topology>,
    type_inference: Arc<dyn TypeInferencePhase>,
}

impl TopDownStrategy {
    pub fn new(topology: Arc<Topology>, type_inference: Arc<dyn TypeInferencePhase>) -> Self {
        Self {
            topology,
            type_inference,
        }
    }
}

impl PlacementStrategy for TopDownStrategy {
    fn name(&self) -> &'static str {
        "TopDown"
    }

    fn update_global_execution_plan(
        &self,
        request: &PlacementRequest<'_>,
        plan: &mut QueryPlan,
        global_execution_plan: &mut GlobalExecutionPlan,
    ) -> Result<bool> {
        debug!(shared_query = %request.shared_query_id, "top-down placement");
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
    for downstream in request.pinned_downstream {
        let node = run.pinned_node(*downstream)?;
        let op = run.operator(*downstream)?;
        if op.is_placed() {
            for child in &op.children {
                identify_pinning_location(run, request, *child, node)?;
            }
        } else {
            if run.effective_available(node) == 0 {
                return Err(run.fail(format!("no capacity for {downstream} on {node}")));
            }
            identify_pinning_location(run, request, *downstream, node)?;
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
    if op.kind.is_sink() {
        candidate = run.pinned_node(id)?;
    } else {
        if op.parents.len() > 1 {
            let mut parent_nodes = Vec::with_capacity(op.parents.len());
            for parent in &op.parents {
                match run.resolved_node(*parent) {
                    Some(node) => parent_nodes.push(node),
                    // Revisited once the last parent is pinned.
                    None => return Ok(()),
                }
            }
            candidate = lowest_of(run, &parent_nodes)
                .ok_or_else(|| run.fail(format!("the consumers of {id} share no node below them")))?;
        }

        if op.kind.is_source() {
            let pinned = run.pinned_node(id)?;
            if !run.topology.is_ancestor_or_self(candidate, pinned) {
                return Err(run.fail(format!(
                    "source {id} is pinned to {pinned}, which cannot reach {candidate}"
                )));
            }
            if run.effective_available(pinned) == 0 {
                return Err(run.fail(format!("no capacity for source {id} on {pinned}")));
            }
            candidate = pinned;
        } else {
            let inputs = upstream_pinned_nodes(run, id)?;
            let above = candidate;
            if !reaches_all(run, candidate, &inputs) {
                candidate = run
                    .topology
                    .find_common_ancestor(&inputs)
                    .filter(|c| run.topology.is_ancestor_or_self(above, *c))
                    .ok_or_else(|| run.fail(format!("no node between the inputs of {id} and {above}")))?;
            }
            if run.effective_available(candidate) == 0 {
                candidate = walk_down_to_capacity(run, candidate, &inputs)
                    .ok_or_else(|| run.fail(format!("no node with free capacity below {candidate} for {id}")))?;
            }
        }
    }

    run.pin(id, candidate)?;
    if request.pinned_upstream.contains(&id) {
        return Ok(());
    }
    for child in &op.children {
        identify_pinning_location(run, request, *child, candidate)?;
    }
    Ok(())
}

/// Nodes of the nearest pinned operators upstream of `id`.
fn upstream_pinned_nodes(run: &PlacementRun<'_>, id: OperatorId) -> Result<Vec<TopologyNodeId>> {
    let mut nodes = Vec::new();
    let mut stack = run.operator(id)?.children;
    while let Some(next) = stack.pop() {
        let op = run.operator(next)?;
        match op.pinned_node() {
            Some(node) => {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
            None => stack.extend(op.children),
        }
    }
    if nodes.is_empty() {
        return Err(run.fail(format!("no pinned operator upstream of {id}")));
    }
    Ok(nodes)
}

fn reaches_all(run: &PlacementRun<'_>, node: TopologyNodeId, inputs: &[TopologyNodeId]) -> bool {
    inputs
        .iter()
        .all(|input| run.topology.is_ancestor_or_self(node, *input))
}

/// The node among `nodes` that every other one sits above.
fn lowest_of(run: &PlacementRun<'_>, nodes: &[TopologyNodeId]) -> Option<TopologyNodeId> {
    nodes.iter().copied().find(|candidate| {
        nodes
            .iter()
            .all(|other| run.topology.is_ancestor_or_self(*other, *candidate))
    })
}

/// Highest node below `from`, on the path from the first input, that still
/// reaches every input and has a free slot.
fn walk_down_to_capacity(
    run: &PlacementRun<'_>,
    from: TopologyNodeId,
    inputs: &[TopologyNodeId],
) -> Option<TopologyNodeId> {
    let path = run.topology.find_nodes_between(*inputs.first()?, from).ok()?;
    path.into_iter()
        .rev()
        .filter(|node| *node != from)
        .find(|node| reaches_all(run, *node, inputs) && run.effective_available(*node) > 0)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{chain_topology, full_request, simple_plan};
    use super::*;
    use crate::error::PlacementError;
    use crate::type_inference::StructuralTypeInference;
    use coplace_core::id::SharedQueryId;
    use coplace_core::operator::OperatorKind;
    use coplace_core::plan::{FaultToleranceType, LineageType};

    fn place(topology: Arc<Topology>, plan: &mut QueryPlan) -> Result<bool> {
        let (up, down) = full_request(plan);
        let request = PlacementRequest {
            shared_query_id: SharedQueryId::new(1),
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            pinned_upstream: &up,
            pinned_downstream: &down,
        };
        let mut gep = GlobalExecutionPlan::new();
        TopDownStrategy::new(topology, Arc::new(StructuralTypeInference))
            .update_global_execution_plan(&request, plan, &mut gep)
    }

    fn filter_node(plan: &QueryPlan) -> Option<TopologyNodeId> {
        plan.operators()
            .find(|op| matches!(op.kind, OperatorKind::Filter { .. }))
            .and_then(|op| op.pinned_node())
    }

    #[test]
    fn test_places_next_to_the_sink() {
        let topology = Arc::new(chain_topology());
        let mut plan = simple_plan();

        assert!(place(topology.clone(), &mut plan).unwrap());

        assert!(plan.operators().all(|op| op.is_placed()));
        assert_eq!(filter_node(&plan), Some(TopologyNodeId::new(1)));
        assert_eq!(topology.available_resources(TopologyNodeId::new(1)), 8);
        assert_eq!(topology.available_resources(TopologyNodeId::new(2)), 10);
        assert_eq!(topology.available_resources(TopologyNodeId::new(4)), 9);
    }

    #[test]
    fn test_full_sink_node_pushes_operator_down() {
        let mut t = Topology::new();
        t.add_node(TopologyNodeId::new(1), "h", 1, 1).unwrap();
        t.add_node(TopologyNodeId::new(2), "h", 2, 10).unwrap();
        t.add_node(TopologyNodeId::new(4), "h", 4, 10).unwrap();
        t.add_link(TopologyNodeId::new(4), TopologyNodeId::new(2), Default::default())
            .unwrap();
        t.add_link(TopologyNodeId::new(2), TopologyNodeId::new(1), Default::default())
            .unwrap();
        let topology = Arc::new(t);
        let mut plan = simple_plan();

        place(topology.clone(), &mut plan).unwrap();

        assert_eq!(filter_node(&plan), Some(TopologyNodeId::new(2)));
        assert_eq!(topology.available_resources(TopologyNodeId::new(1)), 0);
        assert_eq!(topology.available_resources(TopologyNodeId::new(2)), 9);
    }

    #[test]
    fn test_full_source_node_fails_and_releases_slots() {
        let mut t = Topology::new();
        t.add_node(TopologyNodeId::new(1), "h", 1, 10).unwrap();
        t.add_node(TopologyNodeId::new(4), "h", 4, 0).unwrap();
        t.add_link(TopologyNodeId::new(4), TopologyNodeId::new(1), Default::default())
            .unwrap();
        let topology = Arc::new(t);
        let mut plan = simple_plan();

        let err = place(topology.clone(), &mut plan);
        assert!(matches!(err, Err(PlacementError::QueryPlacement { .. })));
        assert_eq!(topology.available_resources(TopologyNodeId::new(1)), 10);
        assert!(plan.operators().all(|op| !op.is_placed()));
    }
}
