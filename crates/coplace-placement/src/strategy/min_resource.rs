//! Minimum-resource-consumption placement.
//!
//! Packs the non-boundary operators onto as few nodes as possible by only
//! using nodes that lie on every source-to-target path, lowest first.

use std::sync::Arc;

use coplace_core::id::TopologyNodeId;
use coplace_core::plan::QueryPlan;
use coplace_topology::Topology;
use tracing::debug;

use super::{run_staged, target_node, PlacementRequest, PlacementRun, PlacementStrategy};
use crate::error::Result;
use crate::execution_plan::GlobalExecutionPlan;
use crate::type_inference::TypeInferencePhase;

pub struct MinimumResourceConsumptionStrategy {
    topology: Arc<Topology>,
    type_inference: Arc<dyn TypeInferencePhase>,
}

impl MinimumResourceConsumptionStrategy {
    pub fn new(topology: Arc<Topology>, type_inference: Arc<dyn TypeInferencePhase>) -> Self {
        Self {
            topology,
            type_inference,
        }
    }
}

impl PlacementStrategy for MinimumResourceConsumptionStrategy {
    fn name(&self) -> &'static str {
        "MinimumResourceConsumption"
    }

    fn update_global_execution_plan(
        &self,
        request: &PlacementRequest<'_>,
        plan: &mut QueryPlan,
        global_execution_plan: &mut GlobalExecutionPlan,
    ) -> Result<bool> {
        debug!(shared_query = %request.shared_query_id, "minimum resource placement");
        run_staged(
            &self.topology,
            self.type_inference.as_ref(),
            request,
            plan,
            global_execution_plan,
            |run| {
                let common = common_path_nodes(run, request)?;
                let order = run
                    .plan()
                    .topological_between(request.pinned_upstream, request.pinned_downstream);
                for id in order {
                    let op = run.operator(id)?;
                    if op.is_placed() {
                        continue;
                    }
                    let mut child_nodes = Vec::with_capacity(op.children.len());
                    for child in &op.children {
                        if let Some(node) = run.resolved_node(*child) {
                            child_nodes.push(node);
                        } else if op.requires_all_children() {
                            return Err(run.fail(format!("inputs of {id} are not placed")));
                        }
                    }
                    let node = if op.kind.is_source() || op.kind.is_sink() {
                        let pinned = run.pinned_node(id)?;
                        if run.effective_available(pinned) == 0 {
                            return Err(run.fail(format!("no capacity for {id} on {pinned}")));
                        }
                        pinned
                    } else {
                        pick_common_node(run, &common, &child_nodes)
                            .ok_or_else(|| run.fail(format!("no shared node with free capacity for {id}")))?
                    };
                    run.place_operator(id, node)?;
                }
                Ok(())
            },
        )
    }
}

/// Nodes on every upward path from an upstream bound to its target, in the
/// order they appear on the first path.
fn common_path_nodes(run: &PlacementRun<'_>, request: &PlacementRequest<'_>) -> Result<Vec<TopologyNodeId>> {
    let mut paths = Vec::new();
    for upstream in request.pinned_upstream {
        let from = run.pinned_node(*upstream)?;
        let to = target_node(run, request, *upstream)?;
        let path = run
            .topology
            .find_path_to(from, to)
            .ok_or_else(|| run.fail(format!("no path from {from} to {to}")))?;
        paths.push(path);
    }
    let Some((first, rest)) = paths.split_first() else {
        return Ok(Vec::new());
    };
    Ok(first
        .iter()
        .copied()
        .filter(|n| rest.iter().all(|p| p.contains(n)))
        .collect())
}

/// Lowest common node with a free slot that sits above every input.
fn pick_common_node(
    run: &PlacementRun<'_>,
    common: &[TopologyNodeId],
    child_nodes: &[TopologyNodeId],
) -> Option<TopologyNodeId> {
    common.iter().copied().find(|n| {
        run.effective_available(*n) > 0
            && child_nodes
                .iter()
                .all(|c| run.topology.is_ancestor_or_self(*n, *c))
    })
}
