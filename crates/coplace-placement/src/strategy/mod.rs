//! Placement strategies and the machinery they share.
//!
//! A strategy decides *where* each operator goes. Everything else (slot
//! accounting, sub-plan bookkeeping, bridging cross-node edges, type
//! inference and rollback) lives in [`PlacementRun`], so strategies only
//! drive `pin`/`place` decisions.

mod bottom_up;
mod manual;
mod min_resource;
mod path;
mod top_down;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use coplace_core::id::{OperatorId, SharedQueryId, TopologyNodeId};
use coplace_core::operator::{LogicalOperator, OperatorKind, OperatorState};
use coplace_core::plan::{FaultToleranceType, LineageType, PlacementStrategyType, QueryPlan};
use coplace_topology::Topology;
use tracing::{debug, trace, warn};

use crate::error::{PlacementError, Result};
use crate::execution_plan::GlobalExecutionPlan;
use crate::type_inference::TypeInferencePhase;

pub use bottom_up::BottomUpStrategy;
pub use manual::ManualPlacementStrategy;
pub use min_resource::MinimumResourceConsumptionStrategy;
pub use path::{PathMetric, PathStrategy};
pub use top_down::TopDownStrategy;

/// One bounded placement job: place everything between the two operator
/// sets, bounds included.
#[derive(Debug, Clone)]
pub struct PlacementRequest<'a> {
    pub shared_query_id: SharedQueryId,
    pub fault_tolerance: FaultToleranceType,
    pub lineage: LineageType,
    pub pinned_upstream: &'a BTreeSet<OperatorId>,
    pub pinned_downstream: &'a BTreeSet<OperatorId>,
}

pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Place the requested region of `plan` and record the result in
    /// `global_execution_plan`.
    ///
    /// On error neither `plan` nor `global_execution_plan` is modified and
    /// every slot taken during the call is given back.
    fn update_global_execution_plan(
        &self,
        request: &PlacementRequest<'_>,
        plan: &mut QueryPlan,
        global_execution_plan: &mut GlobalExecutionPlan,
    ) -> Result<bool>;
}

/// Build the strategy for `strategy_type`.
pub fn strategy_for(
    strategy_type: PlacementStrategyType,
    topology: Arc<Topology>,
    type_inference: Arc<dyn TypeInferencePhase>,
) -> Box<dyn PlacementStrategy> {
    match strategy_type {
        PlacementStrategyType::BottomUp => Box::new(BottomUpStrategy::new(topology, type_inference)),
        PlacementStrategyType::TopDown => Box::new(TopDownStrategy::new(topology, type_inference)),
        PlacementStrategyType::Manual => Box::new(ManualPlacementStrategy::new(topology, type_inference)),
        PlacementStrategyType::HighThroughput => Box::new(PathStrategy::new(
            PathMetric::MaxBandwidth,
            topology,
            type_inference,
        )),
        PlacementStrategyType::LowLatency => Box::new(PathStrategy::new(
            PathMetric::MinLatency,
            topology,
            type_inference,
        )),
        PlacementStrategyType::MinimumResourceConsumption => Box::new(
            MinimumResourceConsumptionStrategy::new(topology, type_inference),
        ),
    }
}

/// Run `body` inside a staged placement and commit only if it, network
/// operator insertion and type inference all succeed.
pub(crate) fn run_staged<F>(
    topology: &Topology,
    type_inference: &dyn TypeInferencePhase,
    request: &PlacementRequest<'_>,
    plan: &mut QueryPlan,
    global_execution_plan: &mut GlobalExecutionPlan,
    body: F,
) -> Result<bool>
where
    F: FnOnce(&mut PlacementRun<'_>) -> Result<()>,
{
    let mut run = PlacementRun::new(topology, request, plan, global_execution_plan);
    let outcome = body(&mut run)
        .and_then(|()| run.add_network_operators())
        .and_then(|()| run.run_type_inference(type_inference));
    match outcome {
        Ok(()) => {
            *global_execution_plan = run.commit();
            Ok(true)
        }
        Err(e) => {
            warn!(shared_query = %request.shared_query_id, error = %e, "placement rolled back");
            run.rollback();
            Err(e)
        }
    }
}

/// Staging area for one strategy invocation.
pub(crate) struct PlacementRun<'a> {
    pub(crate) topology: &'a Topology,
    shared_query_id: SharedQueryId,
    header: QueryPlan,
    plan: &'a mut QueryPlan,
    snapshot: QueryPlan,
    staged: GlobalExecutionPlan,
    acquired: Vec<TopologyNodeId>,
    placed_now: BTreeSet<OperatorId>,
    pinned_now: BTreeSet<OperatorId>,
    reserved: BTreeMap<TopologyNodeId, u32>,
    touched: BTreeSet<TopologyNodeId>,
}

impl<'a> PlacementRun<'a> {
    fn new(
        topology: &'a Topology,
        request: &PlacementRequest<'_>,
        plan: &'a mut QueryPlan,
        global_execution_plan: &GlobalExecutionPlan,
    ) -> Self {
        let mut header = plan.empty_like();
        header.fault_tolerance = request.fault_tolerance;
        header.lineage = request.lineage;
        let snapshot = plan.clone();
        Self {
            topology,
            shared_query_id: request.shared_query_id,
            header,
            plan,
            snapshot,
            staged: global_execution_plan.clone(),
            acquired: Vec::new(),
            placed_now: BTreeSet::new(),
            pinned_now: BTreeSet::new(),
            reserved: BTreeMap::new(),
            touched: BTreeSet::new(),
        }
    }

    pub(crate) fn fail(&self, message: impl Into<String>) -> PlacementError {
        PlacementError::placement(self.shared_query_id, message)
    }

    pub(crate) fn plan(&self) -> &QueryPlan {
        self.plan
    }

    /// Owned copy of an operator so callers can keep mutating the run.
    pub(crate) fn operator(&self, id: OperatorId) -> Result<LogicalOperator> {
        Ok(self.plan.get(id)?.clone())
    }

    pub(crate) fn pinned_node(&self, id: OperatorId) -> Result<TopologyNodeId> {
        self.plan
            .get(id)?
            .pinned_node()
            .ok_or_else(|| self.fail(format!("{id} is not pinned")))
    }

    /// Node of an operator that is placed, or pinned earlier in this run.
    pub(crate) fn resolved_node(&self, id: OperatorId) -> Option<TopologyNodeId> {
        let op = self.plan.operator(id)?;
        if op.is_placed() || self.pinned_now.contains(&id) {
            op.pinned_node()
        } else {
            None
        }
    }

    pub(crate) fn is_pinned_now(&self, id: OperatorId) -> bool {
        self.pinned_now.contains(&id)
    }

    /// Free slots on `node` minus those promised to pins in this run.
    pub(crate) fn effective_available(&self, node: TopologyNodeId) -> u32 {
        let reserved = self.reserved.get(&node).copied().unwrap_or(0);
        self.topology.available_resources(node).saturating_sub(reserved)
    }

    /// Promise a slot on `node` to `id` without taking it yet.
    pub(crate) fn pin(&mut self, id: OperatorId, node: TopologyNodeId) -> Result<()> {
        self.plan.get_mut(id)?.pin(node);
        *self.reserved.entry(node).or_insert(0) += 1;
        self.pinned_now.insert(id);
        trace!(op = %id, node = %node, "pinned operator");
        Ok(())
    }

    /// Operators pinned in this run, children before parents.
    pub(crate) fn pinned_in_topological_order(&self) -> Vec<OperatorId> {
        self.plan
            .topological_order()
            .into_iter()
            .filter(|id| self.pinned_now.contains(id))
            .collect()
    }

    /// Take a slot on `node` and record `id` there in the staged plan.
    pub(crate) fn place_operator(&mut self, id: OperatorId, node: TopologyNodeId) -> Result<()> {
        self.topology
            .reduce_cpu_capacity(node, 1)
            .map_err(|e| self.fail(format!("cannot place {id} on {node}: {e}")))?;
        self.acquired.push(node);
        if let Some(reserved) = self.reserved.get_mut(&node) {
            *reserved = reserved.saturating_sub(u32::from(self.pinned_now.contains(&id)));
        }

        let op = self.plan.get_mut(id)?;
        op.pin(node);
        op.state = OperatorState::Placed;
        let copy = op.detached_copy();
        let children = op.children.clone();

        let address = self.topology.get(node)?.rpc_address();
        let shared = self.shared_query_id;
        let exec = self.staged.execution_node_or_insert(node, address);
        let sub_plan_id = exec.sub_plan_for(shared, &self.header, &children);
        let sub_plan = exec
            .sub_plan_mut(shared, sub_plan_id)
            .ok_or_else(|| PlacementError::placement(shared, "sub-plan vanished"))?;
        sub_plan.add_operator(copy);
        for child in children {
            if sub_plan.contains(child) {
                sub_plan.connect(child, id)?;
            }
        }

        if self.topology.parents(node).is_empty() {
            self.staged.mark_root(node);
        }
        self.staged.occupy(shared, node, 1);
        self.staged.schedule_execution_node(node);
        self.placed_now.insert(id);
        self.touched.insert(node);
        debug!(op = %id, node = %node, sub_plan = %sub_plan_id, "placed operator");
        Ok(())
    }

    /// Bridge every edge touching an operator placed in this run whose
    /// endpoints landed on different nodes.
    fn add_network_operators(&mut self) -> Result<()> {
        let mut edges = BTreeSet::new();
        for id in &self.placed_now {
            let op = self.plan.get(*id)?;
            edges.extend(op.children.iter().map(|c| (*c, *id)));
            edges.extend(op.parents.iter().map(|p| (*id, *p)));
        }
        for (child, parent) in edges {
            let (Some(child_node), Some(parent_node)) =
                (self.placed_node(child), self.placed_node(parent))
            else {
                continue;
            };
            if child_node == parent_node || self.already_bridged(child, parent, parent_node) {
                continue;
            }
            let path = self
                .topology
                .find_nodes_between(child_node, parent_node)
                .map_err(|e| self.fail(format!("cannot connect {child} to {parent}: {e}")))?;
            self.bridge(child, parent, &path)?;
        }
        Ok(())
    }

    fn placed_node(&self, id: OperatorId) -> Option<TopologyNodeId> {
        self.plan
            .operator(id)
            .filter(|op| op.is_placed())
            .and_then(LogicalOperator::pinned_node)
    }

    fn already_bridged(&self, child: OperatorId, parent: OperatorId, parent_node: TopologyNodeId) -> bool {
        let Some(exec) = self.staged.execution_node(parent_node) else {
            return false;
        };
        exec.sub_plans(self.shared_query_id).iter().any(|sp| {
            sp.operator(parent).is_some_and(|p| {
                p.children.iter().any(|c| {
                    matches!(
                        sp.operator(*c).map(|op| &op.kind),
                        Some(OperatorKind::NetworkSource { origin, .. }) if *origin == child
                    )
                })
            })
        })
    }

    /// Chain network sink/source pairs along `path`, forwarding through
    /// every intermediate node.
    fn bridge(&mut self, child: OperatorId, parent: OperatorId, path: &[TopologyNodeId]) -> Result<()> {
        let shared = self.shared_query_id;
        let hops = path.len().saturating_sub(1);
        // (sub-plan, operator) the next network sink attaches to.
        let (first_node, last_node) = match (path.first(), path.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return Err(self.fail("empty path between operators")),
        };
        let mut upstream = self
            .staged
            .execution_node(first_node)
            .and_then(|n| n.sub_plan_containing(shared, child))
            .map(|sp| (sp, child))
            .ok_or_else(|| self.fail(format!("{child} missing on {first_node}")))?;

        for (hop, pair) in path.windows(2).enumerate() {
            let (from, to) = (pair[0], pair[1]);
            let source_id = OperatorId::next();
            let sink_id = OperatorId::next();

            let mut sink = LogicalOperator::new(
                sink_id,
                OperatorKind::NetworkSink {
                    partition: source_id,
                    origin: child,
                    downstream_node: to,
                },
            );
            sink.state = OperatorState::Placed;
            sink.pin(from);
            let mut source = LogicalOperator::new(
                source_id,
                OperatorKind::NetworkSource {
                    partition: source_id,
                    origin: child,
                    upstream_node: from,
                },
            );
            source.state = OperatorState::Placed;
            source.pin(to);

            let (up_plan, up_op) = upstream;
            let from_plan = self
                .staged
                .execution_node_mut(from)
                .and_then(|n| n.sub_plan_mut(shared, up_plan))
                .ok_or_else(|| PlacementError::placement(shared, format!("sub-plan missing on {from}")))?;
            from_plan.add_operator(sink);
            from_plan.connect(up_op, sink_id)?;

            let address = self.topology.get(to)?.rpc_address();
            let exec = self.staged.execution_node_or_insert(to, address);
            if hop + 1 == hops {
                let target = exec
                    .sub_plan_containing(shared, parent)
                    .ok_or_else(|| PlacementError::placement(shared, format!("{parent} missing on {last_node}")))?;
                let to_plan = exec
                    .sub_plan_mut(shared, target)
                    .ok_or_else(|| PlacementError::placement(shared, "sub-plan vanished"))?;
                to_plan.add_operator(source);
                to_plan.connect(source_id, parent)?;
            } else {
                let forward = exec.new_sub_plan(shared, &self.header);
                if let Some(to_plan) = exec.sub_plan_mut(shared, forward) {
                    to_plan.add_operator(source);
                }
                upstream = (forward, source_id);
            }

            self.staged.add_execution_node_as_parent_to(from, to);
            self.staged.schedule_execution_node(from);
            self.staged.schedule_execution_node(to);
            if self.topology.parents(to).is_empty() {
                self.staged.mark_root(to);
            }
            self.touched.insert(from);
            self.touched.insert(to);
        }
        debug!(%child, %parent, hops, "bridged cross-node edge");
        Ok(())
    }

    fn run_type_inference(&mut self, type_inference: &dyn TypeInferencePhase) -> Result<()> {
        let shared = self.shared_query_id;
        for node in &self.touched {
            let ids: Vec<_> = self
                .staged
                .execution_node(*node)
                .map(|n| n.sub_plans(shared).iter().map(|p| p.sub_plan_id).collect())
                .unwrap_or_default();
            for id in ids {
                if let Some(sub_plan) = self
                    .staged
                    .execution_node_mut(*node)
                    .and_then(|n| n.sub_plan_mut(shared, id))
                {
                    type_inference.execute(sub_plan)?;
                }
            }
        }
        Ok(())
    }

    fn commit(self) -> GlobalExecutionPlan {
        self.staged
    }

    fn rollback(self) {
        for node in &self.acquired {
            if let Err(e) = self.topology.increase_resources(*node, 1) {
                warn!(node = %node, error = %e, "failed to release slot during rollback");
            }
        }
        *self.plan = self.snapshot;
    }
}

/// Pinned node of the first downstream bound reachable from `id`, falling
/// back to the topology root.
pub(crate) fn target_node(
    run: &PlacementRun<'_>,
    request: &PlacementRequest<'_>,
    id: OperatorId,
) -> Result<TopologyNodeId> {
    let reachable = run.plan().downstream_closure(&[id]);
    if let Some(bound) = request
        .pinned_downstream
        .iter()
        .find(|d| reachable.contains(d))
    {
        return run.pinned_node(*bound);
    }
    run.topology
        .root()
        .ok_or_else(|| run.fail("topology has no root"))
}
