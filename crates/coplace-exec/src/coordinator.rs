//! Coordinator: the request-processing layer around merging and placement.
//!
//! One async mutex around the global query plan serializes every request,
//! so merge-candidate lookup, plan mutation, placement and deployment of a
//! request never interleave with another request. The global execution plan
//! sits behind its own short-lived lock shared with the deployment phases.

use std::sync::{Arc, Mutex};

use coplace_core::config::CoordinatorConfig;
use coplace_core::id::{QueryId, SharedQueryId};
use coplace_core::operator::OperatorKind;
use coplace_core::plan::QueryPlan;
use coplace_placement::{GlobalExecutionPlan, QueryPlacementPhase, StructuralTypeInference, TypeInferencePhase};
use coplace_planner::{
    merger_rule_for, parse_yaml_query_with_default, GlobalQueryPlan, PlanError, QueryMergerRule,
    RequestType, SharedQueryPlan, SharedQueryPlanStatus,
};
use coplace_topology::{SourceCatalog, Topology};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::deploy::QueryDeploymentPhase;
use crate::error::{ExecError, Result};
use crate::metrics::emit_span;
use crate::rpc::WorkerRpcClient;
use crate::undeploy::QueryUndeploymentPhase;

pub struct Coordinator {
    config: CoordinatorConfig,
    topology: Arc<Topology>,
    source_catalog: SourceCatalog,
    global_query_plan: AsyncMutex<GlobalQueryPlan>,
    global_execution_plan: Arc<Mutex<GlobalExecutionPlan>>,
    merger_rule: Box<dyn QueryMergerRule>,
    placement: QueryPlacementPhase,
    deployment: QueryDeploymentPhase,
    undeployment: QueryUndeploymentPhase,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        topology: Arc<Topology>,
        source_catalog: SourceCatalog,
        client: Arc<dyn WorkerRpcClient>,
    ) -> Result<Self> {
        Self::with_type_inference(
            config,
            topology,
            source_catalog,
            client,
            Arc::new(StructuralTypeInference),
        )
    }

    pub fn with_type_inference(
        config: CoordinatorConfig,
        topology: Arc<Topology>,
        source_catalog: SourceCatalog,
        client: Arc<dyn WorkerRpcClient>,
        type_inference: Arc<dyn TypeInferencePhase>,
    ) -> Result<Self> {
        config.validate()?;
        let global_execution_plan = Arc::new(Mutex::new(GlobalExecutionPlan::new()));
        let placement = QueryPlacementPhase::new(topology.clone(), type_inference, &config);
        let deployment = QueryDeploymentPhase::new(
            global_execution_plan.clone(),
            client.clone(),
            config.rpc_timeout(),
        );
        let undeployment = QueryUndeploymentPhase::new(
            topology.clone(),
            global_execution_plan.clone(),
            client,
            config.rpc_timeout(),
        );
        Ok(Self {
            merger_rule: merger_rule_for(config.query_merger_rule),
            config,
            topology,
            source_catalog,
            global_query_plan: AsyncMutex::new(GlobalQueryPlan::new()),
            global_execution_plan,
            placement,
            deployment,
            undeployment,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn global_execution_plan(&self) -> Arc<Mutex<GlobalExecutionPlan>> {
        self.global_execution_plan.clone()
    }

    /// Run `f` against the global query plan while holding the request lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&GlobalQueryPlan) -> R) -> R {
        let gqp = self.global_query_plan.lock().await;
        f(&gqp)
    }

    /// Merge, place and deploy one query. Returns the shared query plan the
    /// query ended up in.
    pub async fn submit(&self, plan: QueryPlan) -> Result<SharedQueryId> {
        let mut plan = plan;
        self.pin_sources(&mut plan)?;
        let query_id = plan.query_id;

        let mut gqp = self.global_query_plan.lock().await;
        gqp.add_query_plan(plan)?;
        self.merger_rule.apply(&mut gqp)?;
        emit_span(
            "merge",
            &[
                ("rule", self.merger_rule.name().to_string()),
                ("query_id", query_id.get().to_string()),
            ],
        );
        let shared_query_id = gqp
            .shared_query_id_for(query_id)
            .ok_or(PlanError::QueryNotFound(query_id))?;
        info!(%query_id, shared_query = %shared_query_id, "query merged");

        for id in gqp.shared_query_plans_to_deploy() {
            let Some(shared) = gqp.shared_query_plan_mut(id) else {
                continue;
            };
            let full_reset = shared.status() == SharedQueryPlanStatus::Updated
                && !self.placement.is_incremental();
            self.place_and_deploy(shared, full_reset).await?;
        }
        Ok(shared_query_id)
    }

    /// Parse a YAML query and submit it; the configured default strategy
    /// applies when the document names none.
    pub async fn submit_yaml(&self, yaml_src: &str) -> Result<SharedQueryId> {
        let plan = parse_yaml_query_with_default(yaml_src, self.config.default_placement_strategy)?;
        self.submit(plan).await
    }

    /// Stop one query. Its shared plan is torn down if it was the last
    /// member, otherwise redeployed without the query's operators.
    ///
    /// The running deployment is undeployed before the query leaves the
    /// global plan, so a failed undeployment leaves the query in place and
    /// the call can be retried.
    pub async fn stop(&self, query_id: QueryId) -> Result<()> {
        let mut gqp = self.global_query_plan.lock().await;
        let Some(shared_query_id) = gqp.shared_query_id_for(query_id) else {
            // Still pending, or unknown.
            gqp.remove_query(query_id, RequestType::Stop)?;
            info!(%query_id, "stopped query before it was merged");
            return Ok(());
        };
        let last_member = gqp
            .shared_query_plan(shared_query_id)
            .map_or(true, |shared| matches!(shared.query_ids(), [only] if *only == query_id));
        let status = if last_member {
            SharedQueryPlanStatus::Stopped
        } else {
            SharedQueryPlanStatus::Updated
        };
        self.undeploy_if_deployed(shared_query_id, status).await?;

        gqp.remove_query(query_id, RequestType::Stop)?;
        let shared = gqp
            .shared_query_plan_mut(shared_query_id)
            .ok_or(PlanError::SharedQueryPlanNotFound(shared_query_id))?;
        match shared.status() {
            SharedQueryPlanStatus::Stopped => {
                gqp.remove_shared_query_plan(shared_query_id);
            }
            _ => self.place_and_deploy(shared, true).await?,
        }
        info!(%query_id, shared_query = %shared_query_id, "stopped query");
        Ok(())
    }

    /// Mark the shared plan of `query_id` failed and tear it down. As with
    /// [`Coordinator::stop`], nothing leaves the global plan until the
    /// undeployment went through.
    pub async fn fail(&self, query_id: QueryId) -> Result<()> {
        let mut gqp = self.global_query_plan.lock().await;
        let Some(shared_query_id) = gqp.shared_query_id_for(query_id) else {
            gqp.remove_query(query_id, RequestType::Fail)?;
            return Ok(());
        };
        self.undeploy_if_deployed(shared_query_id, SharedQueryPlanStatus::Failed)
            .await?;
        gqp.remove_query(query_id, RequestType::Fail)?;
        gqp.remove_shared_query_plan(shared_query_id);
        warn!(%query_id, shared_query = %shared_query_id, "failed shared query plan");
        Ok(())
    }

    fn pin_sources(&self, plan: &mut QueryPlan) -> Result<()> {
        for op in plan.operators_mut() {
            let OperatorKind::Source { logical_source } = &op.kind else {
                continue;
            };
            if op.pinned_node().is_some() {
                continue;
            }
            let node = *self
                .source_catalog
                .nodes_for(logical_source)
                .first()
                .ok_or_else(|| {
                    coplace_core::Error::Plan(format!(
                        "logical source '{logical_source}' has no physical source"
                    ))
                })?;
            op.pin(node);
        }
        Ok(())
    }

    fn is_deployed(&self, shared_query_id: SharedQueryId) -> Result<bool> {
        let gep = self
            .global_execution_plan
            .lock()
            .map_err(|_| ExecError::LockPoisoned("global execution plan"))?;
        Ok(!gep.execution_nodes_by_query_id(shared_query_id).is_empty())
    }

    async fn undeploy_if_deployed(
        &self,
        shared_query_id: SharedQueryId,
        status: SharedQueryPlanStatus,
    ) -> Result<()> {
        if self.is_deployed(shared_query_id)? {
            self.undeployment.execute(shared_query_id, status).await?;
        }
        Ok(())
    }

    /// Place and deploy `shared`. With `full_reset` a running deployment is
    /// torn down first and the whole graph is placed again.
    async fn place_and_deploy(&self, shared: &mut SharedQueryPlan, full_reset: bool) -> Result<()> {
        let shared_query_id = shared.id();
        let outcome = self.try_place_and_deploy(shared, full_reset).await;
        match outcome {
            Ok(()) => {
                shared.set_status(SharedQueryPlanStatus::Deployed);
                Ok(())
            }
            Err(e) => {
                error!(shared_query = %shared_query_id, error = %e, "placement or deployment failed");
                shared.set_status(SharedQueryPlanStatus::Failed);
                if let Err(cleanup) = self
                    .undeploy_if_deployed(shared_query_id, SharedQueryPlanStatus::Failed)
                    .await
                {
                    warn!(shared_query = %shared_query_id, error = %cleanup, "cleanup after failure incomplete");
                }
                Err(e)
            }
        }
    }

    async fn try_place_and_deploy(&self, shared: &mut SharedQueryPlan, full_reset: bool) -> Result<()> {
        let shared_query_id = shared.id();
        if full_reset {
            self.undeploy_if_deployed(shared_query_id, SharedQueryPlanStatus::Updated)
                .await?;
            shared.reset_placement();
        }
        {
            let mut gep = self
                .global_execution_plan
                .lock()
                .map_err(|_| ExecError::LockPoisoned("global execution plan"))?;
            self.placement.execute(shared, &mut gep)?;
        }
        emit_span(
            "place",
            &[
                ("shared_query_id", shared_query_id.get().to_string()),
                ("strategy", shared.placement_strategy().to_string()),
            ],
        );
        self.deployment.execute(shared_query_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RecordingWorkerClient, RpcMode, TerminationType};
    use coplace_core::builder::QueryPlanBuilder;
    use coplace_core::id::TopologyNodeId;

    fn id(v: u64) -> TopologyNodeId {
        TopologyNodeId::new(v)
    }

    fn coordinator(client: Arc<RecordingWorkerClient>) -> Coordinator {
        let mut topology = Topology::new();
        topology.add_node(id(1), "127.0.0.1", 3001, 10).unwrap();
        topology.add_node(id(2), "127.0.0.1", 3002, 10).unwrap();
        topology.add_link(id(2), id(1), Default::default()).unwrap();
        let mut catalog = SourceCatalog::new();
        catalog.add_physical_source("car", id(2));
        Coordinator::new(CoordinatorConfig::default(), Arc::new(topology), catalog, client).unwrap()
    }

    fn query(qid: u64, sink: &str) -> QueryPlan {
        QueryPlanBuilder::from_source("car")
            .filter("speed > 60")
            .sink(sink)
            .build(QueryId::new(qid))
    }

    #[tokio::test]
    async fn test_submit_places_and_deploys() {
        let client = Arc::new(RecordingWorkerClient::new());
        let coordinator = coordinator(client.clone());

        let shared = coordinator.submit(query(1, "out")).await.unwrap();

        let status = coordinator
            .inspect(|g| g.shared_query_plan(shared).map(|s| s.status()))
            .await;
        assert_eq!(status, Some(SharedQueryPlanStatus::Deployed));
        assert_eq!(client.calls_with_mode(RpcMode::Register).len(), 2);
        assert_eq!(client.calls_with_mode(RpcMode::Start).len(), 2);
        let gep = coordinator.global_execution_plan();
        assert_eq!(gep.lock().unwrap().execution_nodes_by_query_id(shared).len(), 2);
    }

    #[tokio::test]
    async fn test_identical_query_joins_running_plan() {
        let client = Arc::new(RecordingWorkerClient::new());
        let coordinator = coordinator(client.clone());

        let first = coordinator.submit(query(1, "a")).await.unwrap();
        let second = coordinator.submit(query(2, "b")).await.unwrap();

        assert_eq!(first, second);
        // Without reconfiguration the running plan is torn down and redeployed.
        assert!(client
            .calls_with_mode(RpcMode::Stop)
            .iter()
            .all(|c| c.termination == Some(TerminationType::HardStop)));
        assert!(!client.calls_with_mode(RpcMode::Stop).is_empty());
    }

    #[tokio::test]
    async fn test_stopping_last_query_frees_everything() {
        let client = Arc::new(RecordingWorkerClient::new());
        let coordinator = coordinator(client.clone());
        let shared = coordinator.submit(query(1, "out")).await.unwrap();

        coordinator.stop(QueryId::new(1)).await.unwrap();

        assert!(coordinator.inspect(|g| g.shared_query_plan(shared).is_none()).await);
        assert!(coordinator
            .global_execution_plan()
            .lock()
            .unwrap()
            .all_execution_nodes()
            .next()
            .is_none());
        assert_eq!(coordinator.topology().available_resources(id(1)), 10);
        assert_eq!(coordinator.topology().available_resources(id(2)), 10);
    }

    #[tokio::test]
    async fn test_unknown_logical_source_is_rejected() {
        let coordinator = coordinator(Arc::new(RecordingWorkerClient::new()));
        let plan = QueryPlanBuilder::from_source("bike")
            .sink("out")
            .build(QueryId::new(9));
        assert!(matches!(coordinator.submit(plan).await, Err(ExecError::Core(_))));
    }

    #[tokio::test]
    async fn test_failed_registration_marks_plan_failed() {
        let client = Arc::new(RecordingWorkerClient::new());
        client.fail_address("127.0.0.1:3002");
        let coordinator = coordinator(client.clone());

        let err = coordinator.submit(query(1, "out")).await;
        assert!(matches!(err, Err(ExecError::RpcQueryDeployment { mode: RpcMode::Register, .. })));
        let status = coordinator
            .inspect(|g| {
                g.shared_query_id_for(QueryId::new(1))
                    .and_then(|s| g.shared_query_plan(s))
                    .map(|s| s.status())
            })
            .await;
        assert_eq!(status, Some(SharedQueryPlanStatus::Failed));
    }

    #[tokio::test]
    async fn test_failed_undeployment_keeps_query_stoppable() {
        let client = Arc::new(RecordingWorkerClient::new());
        let coordinator = coordinator(client.clone());
        let shared = coordinator.submit(query(1, "out")).await.unwrap();

        client.fail_address("127.0.0.1:3002");
        let err = coordinator.stop(QueryId::new(1)).await;
        assert!(matches!(err, Err(ExecError::RpcQueryUndeployment { mode: RpcMode::Stop, .. })));
        let still_mapped = coordinator
            .inspect(|g| g.shared_query_id_for(QueryId::new(1)))
            .await;
        assert_eq!(still_mapped, Some(shared));
        assert!(coordinator.topology().available_resources(id(2)) < 10);

        client.heal_address("127.0.0.1:3002");
        coordinator.stop(QueryId::new(1)).await.unwrap();
        assert_eq!(coordinator.topology().available_resources(id(1)), 10);
        assert_eq!(coordinator.topology().available_resources(id(2)), 10);
        assert!(coordinator.inspect(|g| g.shared_query_plan(shared).is_none()).await);
    }
}
