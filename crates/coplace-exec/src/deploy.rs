//! Query deployment phase: register a shared query's sub-plans on every
//! execution node hosting them, then start them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use coplace_core::id::SharedQueryId;
use coplace_placement::GlobalExecutionPlan;
use tracing::{info, warn};

use crate::error::{ExecError, Result};
use crate::metrics::emit_span;
use crate::rpc::{fan_out, RpcMode, RpcRequest, TerminationType, WorkerRpcClient};

pub struct QueryDeploymentPhase {
    global_execution_plan: Arc<Mutex<GlobalExecutionPlan>>,
    client: Arc<dyn WorkerRpcClient>,
    rpc_timeout: Duration,
}

impl QueryDeploymentPhase {
    pub fn new(
        global_execution_plan: Arc<Mutex<GlobalExecutionPlan>>,
        client: Arc<dyn WorkerRpcClient>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            global_execution_plan,
            client,
            rpc_timeout,
        }
    }

    pub async fn execute(&self, shared_query_id: SharedQueryId) -> Result<()> {
        let requests = {
            let gep = self
                .global_execution_plan
                .lock()
                .map_err(|_| ExecError::LockPoisoned("global execution plan"))?;
            let nodes = gep.execution_nodes_by_query_id(shared_query_id);
            if nodes.is_empty() {
                return Err(ExecError::ExecutionNodeNotFound(shared_query_id));
            }
            let requests: Vec<RpcRequest> = nodes
                .into_iter()
                .map(|n| RpcRequest {
                    node: n.id,
                    address: n.rpc_address.clone(),
                    shared_query_id,
                    sub_plans: n.sub_plans(shared_query_id).to_vec(),
                })
                .collect();
            requests
        };
        info!(shared_query = %shared_query_id, nodes = requests.len(), "deploying shared query");

        for mode in [RpcMode::Register, RpcMode::Start] {
            let failed = fan_out(
                self.client.as_ref(),
                mode,
                TerminationType::Graceful,
                requests.clone(),
                self.rpc_timeout,
            )
            .await;
            if !failed.is_empty() {
                warn!(shared_query = %shared_query_id, %mode, failed = failed.len(), "deployment rpc failed");
                return Err(ExecError::RpcQueryDeployment { failed, mode });
            }
        }

        let deployed: Vec<_> = requests.iter().map(|r| r.node).collect();
        self.global_execution_plan
            .lock()
            .map_err(|_| ExecError::LockPoisoned("global execution plan"))?
            .mark_deployed(&deployed);
        emit_span(
            "deploy",
            &[
                ("shared_query_id", shared_query_id.get().to_string()),
                ("nodes", deployed.len().to_string()),
            ],
        );
        Ok(())
    }
}
