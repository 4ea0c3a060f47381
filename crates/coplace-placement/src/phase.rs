//! Query placement phase: drives a strategy over one shared query plan.
//!
//! With reconfiguration enabled only the unprocessed change-log entries are
//! placed, one bounded region at a time. Otherwise the whole graph is placed
//! from its leaves to its roots. Either way the processed watermark is
//! advanced to the time the phase started and the log is compacted.

use std::collections::BTreeSet;
use std::sync::Arc;

use coplace_core::config::CoordinatorConfig;
use coplace_core::id::{OperatorId, SharedQueryId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use coplace_planner::{now_micros, SharedQueryPlan};
use coplace_topology::Topology;
use tracing::{debug, info};

use crate::error::{PlacementError, Result};
use crate::execution_plan::GlobalExecutionPlan;
use crate::strategy::{strategy_for, PlacementRequest};
use crate::type_inference::TypeInferencePhase;

pub struct QueryPlacementPhase {
    topology: Arc<Topology>,
    type_inference: Arc<dyn TypeInferencePhase>,
    incremental: bool,
}

impl QueryPlacementPhase {
    pub fn new(
        topology: Arc<Topology>,
        type_inference: Arc<dyn TypeInferencePhase>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            topology,
            type_inference,
            incremental: config.enable_query_reconfiguration,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Place `shared_query_plan` into `global_execution_plan`.
    ///
    /// Each region is all-or-nothing, but regions already placed before a
    /// failing one stay placed; callers mark the plan failed and undeploy.
    pub fn execute(
        &self,
        shared_query_plan: &mut SharedQueryPlan,
        global_execution_plan: &mut GlobalExecutionPlan,
    ) -> Result<bool> {
        let shared_query_id = shared_query_plan.id();
        let root = self
            .topology
            .root()
            .ok_or_else(|| PlacementError::placement(shared_query_id, "topology has no root node"))?;
        let strategy = strategy_for(
            shared_query_plan.placement_strategy(),
            self.topology.clone(),
            self.type_inference.clone(),
        );
        let now = now_micros().max(shared_query_plan.change_log().last_timestamp());

        let regions: Vec<(BTreeSet<OperatorId>, BTreeSet<OperatorId>)> = if self.incremental {
            shared_query_plan
                .change_log_entries(now)
                .into_iter()
                .map(|(_, entry)| (entry.upstream_operators, entry.downstream_operators))
                .collect()
        } else {
            let plan = shared_query_plan.query_plan();
            vec![(
                plan.leaf_operators().into_iter().collect(),
                plan.root_operators().into_iter().collect(),
            )]
        };
        info!(
            shared_query = %shared_query_id,
            strategy = strategy.name(),
            incremental = self.incremental,
            regions = regions.len(),
            "placing shared query plan"
        );

        for (upstream, downstream) in regions {
            // Removal entries can refer to operators that are gone since.
            let plan = shared_query_plan.query_plan();
            let upstream: BTreeSet<_> = upstream.into_iter().filter(|id| plan.contains(*id)).collect();
            let downstream: BTreeSet<_> = downstream.into_iter().filter(|id| plan.contains(*id)).collect();
            if upstream.is_empty() || downstream.is_empty() {
                continue;
            }

            let plan = shared_query_plan.query_plan_mut();
            ensure_pinned(plan, &upstream, shared_query_id)?;
            pin_sinks_to(plan, &downstream, root);
            ensure_pinned(plan, &downstream, shared_query_id)?;

            let request = PlacementRequest {
                shared_query_id,
                fault_tolerance: plan.fault_tolerance,
                lineage: plan.lineage,
                pinned_upstream: &upstream,
                pinned_downstream: &downstream,
            };
            strategy.update_global_execution_plan(&request, plan, global_execution_plan)?;
            debug!(shared_query = %shared_query_id, upstream = upstream.len(), downstream = downstream.len(), "placed region");
        }

        shared_query_plan.update_processed_change_log_timestamp(now);
        let dropped = shared_query_plan.compact_change_log();
        debug!(shared_query = %shared_query_id, dropped, "compacted change log");
        Ok(true)
    }
}

fn pin_sinks_to(plan: &mut QueryPlan, ids: &BTreeSet<OperatorId>, root: TopologyNodeId) {
    for id in ids {
        if let Some(op) = plan.operator_mut(*id) {
            if op.kind.is_sink() && op.pinned_node().is_none() {
                op.pin(root);
            }
        }
    }
}

fn ensure_pinned(
    plan: &QueryPlan,
    ids: &BTreeSet<OperatorId>,
    shared_query_id: SharedQueryId,
) -> Result<()> {
    for id in ids {
        if plan.get(*id)?.pinned_node().is_none() {
            return Err(PlacementError::placement(
                shared_query_id,
                format!("{id} has no pinned node"),
            ));
        }
    }
    Ok(())
}
