//! Path-based placement for the high-throughput and low-latency strategies.
//!
//! Each upstream operator gets one upward path to the node of the
//! downstream bound it feeds: the path with the widest bottleneck link, or
//! the one with the smallest summed latency. Operators are then laid along
//! that path, skipping nodes without free slots. An operator with inputs on
//! several nodes restarts on a fresh path from their common ancestor.

use std::sync::Arc;

use coplace_core::id::{OperatorId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use coplace_topology::Topology;
use tracing::debug;

use super::{run_staged, target_node, PlacementRequest, PlacementRun, PlacementStrategy};
use crate::error::Result;
use crate::execution_plan::GlobalExecutionPlan;
use crate::type_inference::TypeInferencePhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMetric {
    MaxBandwidth,
    MinLatency,
}

impl PathMetric {
    fn path(self, topology: &Topology, from: TopologyNodeId, to: TopologyNodeId) -> Option<Vec<TopologyNodeId>> {
        match self {
            PathMetric::MaxBandwidth => topology.find_path_with_max_bandwidth(from, to),
            PathMetric::MinLatency => topology.find_path_with_min_latency(from, to),
        }
    }
}

pub struct PathStrategy {
    metric: PathMetric,
    topology: Arc<Topology>,
    type_inference: Arc<dyn TypeInferencePhase>,
}

impl PathStrategy {
    pub fn new(
        metric: PathMetric,
        topology: Arc<Topology>,
        type_inference: Arc<dyn TypeInferencePhase>,
    ) -> Self {
        Self {
            metric,
            topology,
            type_inference,
        }
    }
}

impl PlacementStrategy for PathStrategy {
    fn name(&self) -> &'static str {
        match self.metric {
            PathMetric::MaxBandwidth => "HighThroughput",
            PathMetric::MinLatency => "LowLatency",
        }
    }

    fn update_global_execution_plan(
        &self,
        request: &PlacementRequest<'_>,
        plan: &mut QueryPlan,
        global_execution_plan: &mut GlobalExecutionPlan,
    ) -> Result<bool> {
        debug!(shared_query = %request.shared_query_id, strategy = self.name(), "path placement");
        run_staged(
            &self.topology,
            self.type_inference.as_ref(),
            request,
            plan,
            global_execution_plan,
            |run| {
                for upstream in request.pinned_upstream {
                    let start = run.pinned_node(*upstream)?;
                    let op = run.operator(*upstream)?;
                    if op.is_placed() {
                        for parent in &op.parents {
                            let path = self.path_to_target(run, request, start, *parent)?;
                            self.place_along(run, request, *parent, &path, 0)?;
                        }
                    } else {
                        let path = self.path_to_target(run, request, start, *upstream)?;
                        self.place_along(run, request, *upstream, &path, 0)?;
                    }
                }
                Ok(())
            },
        )
    }
}

impl PathStrategy {
    fn path_to_target(
        &self,
        run: &PlacementRun<'_>,
        request: &PlacementRequest<'_>,
        from: TopologyNodeId,
        op: OperatorId,
    ) -> Result<Vec<TopologyNodeId>> {
        let to = target_node(run, request, op)?;
        self.metric
            .path(run.topology, from, to)
            .ok_or_else(|| run.fail(format!("no path from {from} to {to}")))
    }

    fn place_along(
        &self,
        run: &mut PlacementRun<'_>,
        request: &PlacementRequest<'_>,
        id: OperatorId,
        path: &[TopologyNodeId],
        index: usize,
    ) -> Result<()> {
        let op = run.operator(id)?;
        if op.is_placed() {
            return Ok(());
        }

        let mut owned_path = None;
        let mut index = index;
        if op.requires_all_children() {
            let mut child_nodes = Vec::with_capacity(op.children.len());
            for child in &op.children {
                match run.resolved_node(*child) {
                    Some(node) if !child_nodes.contains(&node) => child_nodes.push(node),
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
            if child_nodes.len() > 1 {
                let anchor = run
                    .topology
                    .find_common_ancestor(&child_nodes)
                    .ok_or_else(|| run.fail(format!("no common ancestor for the inputs of {id}")))?;
                owned_path = Some(self.path_to_target(run, request, anchor, id)?);
                index = 0;
            }
        }
        let path = owned_path.as_deref().unwrap_or(path);

        let node = if op.kind.is_sink() {
            let target = run.pinned_node(id)?;
            if run.effective_available(target) == 0 {
                return Err(run.fail(format!("no capacity for sink {id} on {target}")));
            }
            target
        } else if op.kind.is_source() {
            let pinned = run.pinned_node(id)?;
            if run.effective_available(pinned) == 0 {
                return Err(run.fail(format!("no capacity for source {id} on {pinned}")));
            }
            pinned
        } else {
            while index < path.len() && run.effective_available(path[index]) == 0 {
                index += 1;
            }
            *path
                .get(index)
                .ok_or_else(|| run.fail(format!("no node with free capacity on the path for {id}")))?
        };

        run.place_operator(id, node)?;
        if request.pinned_downstream.contains(&id) {
            return Ok(());
        }
        for parent in &op.parents {
            if path.last() == Some(&target_node(run, request, *parent)?) {
                self.place_along(run, request, *parent, path, index)?;
            } else {
                let branch = self.path_to_target(run, request, node, *parent)?;
                self.place_along(run, request, *parent, &branch, 0)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::type_inference::StructuralTypeInference;
    use coplace_core::builder::QueryPlanBuilder;
    use coplace_core::id::{QueryId, SharedQueryId};
    use coplace_core::operator::OperatorKind;
    use coplace_core::plan::{FaultToleranceType, LineageType};
    use coplace_topology::LinkProperty;

    fn id(v: u64) -> TopologyNodeId {
        TopologyNodeId::new(v)
    }

    /// Diamond 4 -> {2, 3} -> 1. Node 4 has no spare slot after its source.
    /// Link 4->2 is wide but slow, 4->3 narrow but fast.
    fn diamond() -> Topology {
        let mut t = Topology::new();
        t.add_node(id(1), "h", 1, 10).unwrap();
        t.add_node(id(2), "h", 2, 10).unwrap();
        t.add_node(id(3), "h", 3, 10).unwrap();
        t.add_node(id(4), "h", 4, 1).unwrap();
        let wide_slow = LinkProperty {
            bandwidth_mbps: 1000,
            latency_ms: 50,
        };
        let narrow_fast = LinkProperty {
            bandwidth_mbps: 10,
            latency_ms: 1,
        };
        t.add_link(id(4), id(2), wide_slow).unwrap();
        t.add_link(id(4), id(3), narrow_fast).unwrap();
        t.add_link(id(2), id(1), wide_slow).unwrap();
        t.add_link(id(3), id(1), narrow_fast).unwrap();
        t
    }

    fn place(metric: PathMetric) -> (QueryPlan, Arc<Topology>) {
        let topology = Arc::new(diamond());
        let mut plan = QueryPlanBuilder::from_source("car")
            .pinned_at(id(4))
            .filter("speed > 60")
            .sink("out")
            .pinned_at(id(1))
            .build(QueryId::new(1));
        let up: BTreeSet<_> = plan.leaf_operators().into_iter().collect();
        let down: BTreeSet<_> = plan.root_operators().into_iter().collect();
        let request = PlacementRequest {
            shared_query_id: SharedQueryId::new(1),
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            pinned_upstream: &up,
            pinned_downstream: &down,
        };
        let mut gep = GlobalExecutionPlan::new();
        PathStrategy::new(metric, topology.clone(), Arc::new(StructuralTypeInference))
            .update_global_execution_plan(&request, &mut plan, &mut gep)
            .unwrap();
        (plan, topology)
    }

    fn filter_node(plan: &QueryPlan) -> Option<TopologyNodeId> {
        plan.operators()
            .find(|op| matches!(op.kind, OperatorKind::Filter { .. }))
            .and_then(|op| op.pinned_node())
    }

    #[test]
    fn test_high_throughput_follows_widest_path() {
        let (plan, _) = place(PathMetric::MaxBandwidth);
        assert_eq!(filter_node(&plan), Some(id(2)));
        assert!(plan.operators().all(|op| op.is_placed()));
    }

    #[test]
    fn test_low_latency_follows_fastest_path() {
        let (plan, topology) = place(PathMetric::MinLatency);
        assert_eq!(filter_node(&plan), Some(id(3)));
        assert_eq!(topology.available_resources(id(3)), 9);
        assert_eq!(topology.available_resources(id(2)), 10);
    }
}
