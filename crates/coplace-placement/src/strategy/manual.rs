//! Manual placement: the submitter pinned every operator, so the strategy
//! only takes the slots and bridges the edges.

use std::sync::Arc;

use coplace_core::plan::QueryPlan;
use coplace_topology::Topology;
use tracing::debug;

use super::{run_staged, PlacementRequest, PlacementStrategy};
use crate::error::Result;
use crate::execution_plan::GlobalExecutionPlan;
use crate::type_inference::TypeInferencePhase;

pub struct ManualPlacementStrategy {
    topology: Arc<Topology>,
    type_inference: Arc<dyn TypeInferencePhase>,
}

impl ManualPlacementStrategy {
    pub fn new(topology: Arc<Topology>, type_inference: Arc<dyn TypeInferencePhase>) -> Self {
        Self {
            topology,
            type_inference,
        }
    }
}

impl PlacementStrategy for ManualPlacementStrategy {
    fn name(&self) -> &'static str {
        "Manual"
    }

    fn update_global_execution_plan(
        &self,
        request: &PlacementRequest<'_>,
        plan: &mut QueryPlan,
        global_execution_plan: &mut GlobalExecutionPlan,
    ) -> Result<bool> {
        debug!(shared_query = %request.shared_query_id, "manual placement");
        run_staged(
            &self.topology,
            self.type_inference.as_ref(),
            request,
            plan,
            global_execution_plan,
            |run| {
                let order = run
                    .plan()
                    .topological_between(request.pinned_upstream, request.pinned_downstream);
                for id in order {
                    let op = run.operator(id)?;
                    if op.is_placed() {
                        continue;
                    }
                    let node = op
                        .pinned_node()
                        .ok_or_else(|| run.fail(format!("{id} was submitted without a node")))?;
                    run.place_operator(id, node)?;
                }
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{chain_topology, full_request};
    use super::*;
    use crate::error::PlacementError;
    use crate::type_inference::StructuralTypeInference;
    use coplace_core::builder::QueryPlanBuilder;
    use coplace_core::id::{QueryId, SharedQueryId, TopologyNodeId};
    use coplace_core::operator::OperatorKind;
    use coplace_core::plan::{FaultToleranceType, LineageType, PlacementStrategyType};

    fn place(topology: Arc<Topology>, plan: &mut QueryPlan, gep: &mut GlobalExecutionPlan) -> Result<bool> {
        let (up, down) = full_request(plan);
        let request = PlacementRequest {
            shared_query_id: SharedQueryId::new(1),
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            pinned_upstream: &up,
            pinned_downstream: &down,
        };
        ManualPlacementStrategy::new(topology, Arc::new(StructuralTypeInference))
            .update_global_execution_plan(&request, plan, gep)
    }

    fn plan(filter_at: Option<u64>) -> QueryPlan {
        let builder = QueryPlanBuilder::from_source("car")
            .pinned_at(TopologyNodeId::new(4))
            .filter("speed > 60");
        let builder = match filter_at {
            Some(node) => builder.pinned_at(TopologyNodeId::new(node)),
            None => builder,
        };
        builder
            .sink("out")
            .pinned_at(TopologyNodeId::new(1))
            .placement(PlacementStrategyType::Manual)
            .build(QueryId::new(1))
    }

    #[test]
    fn test_operators_land_where_they_were_pinned() {
        let topology = Arc::new(chain_topology());
        let mut plan = plan(Some(2));
        let mut gep = GlobalExecutionPlan::new();

        place(topology.clone(), &mut plan, &mut gep).unwrap();

        let filter = plan
            .operators()
            .find(|op| matches!(op.kind, OperatorKind::Filter { .. }))
            .unwrap();
        assert!(filter.is_placed());
        assert_eq!(filter.pinned_node(), Some(TopologyNodeId::new(2)));
        assert_eq!(topology.available_resources(TopologyNodeId::new(2)), 9);
        assert_eq!(gep.execution_nodes_by_query_id(SharedQueryId::new(1)).len(), 3);
    }

    #[test]
    fn test_unpinned_operator_is_rejected() {
        let topology = Arc::new(chain_topology());
        let mut plan = plan(None);
        let mut gep = GlobalExecutionPlan::new();

        let err = place(topology.clone(), &mut plan, &mut gep);

        assert!(matches!(err, Err(PlacementError::QueryPlacement { .. })));
        assert_eq!(topology.available_resources(TopologyNodeId::new(4)), 10);
        assert!(gep.all_execution_nodes().next().is_none());
    }
}
