//! Query undeployment phase: stop and unregister a shared query on every
//! execution node hosting it, then give its slots back.
//!
//! The stop fan-out must fully succeed before unregistering starts, and the
//! unregister fan-out must fully succeed before any slot is released. Nodes
//! already stopped when a later step fails stay stopped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use coplace_core::id::SharedQueryId;
use coplace_placement::GlobalExecutionPlan;
use coplace_planner::SharedQueryPlanStatus;
use coplace_topology::Topology;
use tracing::{debug, info, warn};

use crate::error::{ExecError, Result};
use crate::metrics::emit_span;
use crate::rpc::{fan_out, RpcMode, RpcRequest, TerminationType, WorkerRpcClient};

pub struct QueryUndeploymentPhase {
    topology: Arc<Topology>,
    global_execution_plan: Arc<Mutex<GlobalExecutionPlan>>,
    client: Arc<dyn WorkerRpcClient>,
    rpc_timeout: Duration,
}

/// Termination a worker should apply for a plan that reached `status`.
pub fn termination_for(status: SharedQueryPlanStatus) -> TerminationType {
    match status {
        SharedQueryPlanStatus::Failed => TerminationType::Failure,
        SharedQueryPlanStatus::Updated | SharedQueryPlanStatus::Stopped => TerminationType::HardStop,
        SharedQueryPlanStatus::Created | SharedQueryPlanStatus::Deployed => TerminationType::Graceful,
    }
}

impl QueryUndeploymentPhase {
    pub fn new(
        topology: Arc<Topology>,
        global_execution_plan: Arc<Mutex<GlobalExecutionPlan>>,
        client: Arc<dyn WorkerRpcClient>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            global_execution_plan,
            client,
            rpc_timeout,
        }
    }

    pub async fn execute(
        &self,
        shared_query_id: SharedQueryId,
        status: SharedQueryPlanStatus,
    ) -> Result<()> {
        let requests = self.requests_for(shared_query_id)?;
        let termination = termination_for(status);
        info!(
            shared_query = %shared_query_id,
            nodes = requests.len(),
            ?termination,
            "undeploying shared query"
        );

        for mode in [RpcMode::Stop, RpcMode::Unregister] {
            let failed = fan_out(
                self.client.as_ref(),
                mode,
                termination,
                requests.clone(),
                self.rpc_timeout,
            )
            .await;
            if !failed.is_empty() {
                warn!(shared_query = %shared_query_id, %mode, failed = failed.len(), "undeployment rpc failed");
                return Err(ExecError::RpcQueryUndeployment { failed, mode });
            }
        }

        self.release_resources(shared_query_id)?;
        emit_span(
            "undeploy",
            &[
                ("shared_query_id", shared_query_id.get().to_string()),
                ("nodes", requests.len().to_string()),
            ],
        );
        Ok(())
    }

    fn requests_for(&self, shared_query_id: SharedQueryId) -> Result<Vec<RpcRequest>> {
        let gep = self
            .global_execution_plan
            .lock()
            .map_err(|_| ExecError::LockPoisoned("global execution plan"))?;
        let nodes = gep.execution_nodes_by_query_id(shared_query_id);
        if nodes.is_empty() {
            return Err(ExecError::ExecutionNodeNotFound(shared_query_id));
        }
        let requests = nodes
            .into_iter()
            .map(|n| RpcRequest {
                node: n.id,
                address: n.rpc_address.clone(),
                shared_query_id,
                sub_plans: Vec::new(),
            })
            .collect();
        Ok(requests)
    }

    fn release_resources(&self, shared_query_id: SharedQueryId) -> Result<()> {
        let mut gep = self
            .global_execution_plan
            .lock()
            .map_err(|_| ExecError::LockPoisoned("global execution plan"))?;
        // Each ledger entry goes as soon as its slots are back, so a retry
        // after a partial release never frees the same slots twice.
        for (node, slots) in gep.map_of_topology_node_id_to_occupied_resource(shared_query_id) {
            self.topology.increase_resources(node, slots)?;
            gep.release_occupied_resource(shared_query_id, node);
            debug!(shared_query = %shared_query_id, %node, slots, "released slots");
        }
        if !gep.remove_query_sub_plans(shared_query_id) {
            return Err(ExecError::QueryUndeployment(format!(
                "failed to remove sub-plans of {shared_query_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RecordingWorkerClient;
    use coplace_core::id::{QueryId, TopologyNodeId};
    use coplace_core::plan::QueryPlan;
    use coplace_placement::ExecutionNode;

    #[test]
    fn test_termination_type_follows_status() {
        assert_eq!(termination_for(SharedQueryPlanStatus::Failed), TerminationType::Failure);
        assert_eq!(termination_for(SharedQueryPlanStatus::Stopped), TerminationType::HardStop);
        assert_eq!(termination_for(SharedQueryPlanStatus::Updated), TerminationType::HardStop);
    }

    #[tokio::test]
    async fn test_unknown_query_is_rejected() {
        let phase = QueryUndeploymentPhase::new(
            Arc::new(Topology::new()),
            Arc::new(Mutex::new(GlobalExecutionPlan::new())),
            Arc::new(RecordingWorkerClient::new()),
            Duration::from_secs(1),
        );
        let err = phase
            .execute(SharedQueryId::new(42), SharedQueryPlanStatus::Stopped)
            .await;
        assert!(matches!(err, Err(ExecError::ExecutionNodeNotFound(id)) if id == SharedQueryId::new(42)));
    }

    #[tokio::test]
    async fn test_releases_ledger_slots() {
        let node = TopologyNodeId::new(1);
        let shared = SharedQueryId::new(7);
        let mut topology = Topology::new();
        topology.add_node(node, "w", 1, 4).unwrap();
        topology.reduce_cpu_capacity(node, 3).unwrap();
        let topology = Arc::new(topology);

        let mut gep = GlobalExecutionPlan::new();
        let mut exec = ExecutionNode::new(node, "w:1");
        exec.new_sub_plan(shared, &QueryPlan::new(QueryId::new(1)));
        gep.add_execution_node(exec);
        gep.occupy(shared, node, 3);
        let gep = Arc::new(Mutex::new(gep));

        let client = Arc::new(RecordingWorkerClient::new());
        let phase = QueryUndeploymentPhase::new(topology.clone(), gep.clone(), client.clone(), Duration::from_secs(1));
        phase.execute(shared, SharedQueryPlanStatus::Stopped).await.unwrap();

        assert_eq!(topology.available_resources(node), 4);
        assert!(!gep.lock().unwrap().contains(node));
        let stops = client.calls_with_mode(RpcMode::Stop);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].termination, Some(TerminationType::HardStop));
        assert_eq!(client.calls_with_mode(RpcMode::Unregister).len(), 1);
    }

    #[tokio::test]
    async fn test_partial_release_is_not_repeated_on_retry() {
        let node = TopologyNodeId::new(1);
        let missing = TopologyNodeId::new(9);
        let shared = SharedQueryId::new(8);
        let mut topology = Topology::new();
        topology.add_node(node, "w", 1, 4).unwrap();
        // Three slots for this query, one for some other query.
        topology.reduce_cpu_capacity(node, 4).unwrap();
        let topology = Arc::new(topology);

        let mut gep = GlobalExecutionPlan::new();
        let mut exec = ExecutionNode::new(node, "w:1");
        exec.new_sub_plan(shared, &QueryPlan::new(QueryId::new(1)));
        gep.add_execution_node(exec);
        gep.occupy(shared, node, 3);
        gep.occupy(shared, missing, 1);
        let gep = Arc::new(Mutex::new(gep));

        let client = Arc::new(RecordingWorkerClient::new());
        let phase = QueryUndeploymentPhase::new(topology.clone(), gep.clone(), client, Duration::from_secs(1));
        for _ in 0..2 {
            let err = phase.execute(shared, SharedQueryPlanStatus::Stopped).await;
            assert!(matches!(err, Err(ExecError::Topology(_))));
            assert_eq!(topology.available_resources(node), 3);
        }
        let ledger = gep
            .lock()
            .unwrap()
            .map_of_topology_node_id_to_occupied_resource(shared);
        assert_eq!(ledger.into_iter().collect::<Vec<_>>(), vec![(missing, 1)]);
    }
}
