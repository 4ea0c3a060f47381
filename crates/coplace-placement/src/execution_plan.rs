//! Global execution plan: the per-node view of what is deployed where.
//!
//! An `ExecutionNode` mirrors one topology node and holds, per shared query,
//! the sub-plans that node runs. The plan keeps a reverse index from shared
//! query to nodes, the list of nodes whose sub-plans changed since the last
//! deployment, and the number of slots each shared query holds on each node.

use std::collections::{BTreeMap, BTreeSet};

use coplace_core::id::{OperatorId, SharedQueryId, SubPlanId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: TopologyNodeId,
    pub rpc_address: String,
    sub_plans: BTreeMap<SharedQueryId, Vec<QueryPlan>>,
    parents: Vec<TopologyNodeId>,
    children: Vec<TopologyNodeId>,
}

impl ExecutionNode {
    pub fn new(id: TopologyNodeId, rpc_address: impl Into<String>) -> Self {
        Self {
            id,
            rpc_address: rpc_address.into(),
            sub_plans: BTreeMap::new(),
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn parents(&self) -> &[TopologyNodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[TopologyNodeId] {
        &self.children
    }

    /// Sub-plans of `shared_query_id` on this node; empty if none.
    pub fn sub_plans(&self, shared_query_id: SharedQueryId) -> &[QueryPlan] {
        self.sub_plans
            .get(&shared_query_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn shared_query_ids(&self) -> Vec<SharedQueryId> {
        self.sub_plans.keys().copied().collect()
    }

    pub fn has_query(&self, shared_query_id: SharedQueryId) -> bool {
        self.sub_plans.contains_key(&shared_query_id)
    }

    pub fn is_empty(&self) -> bool {
        self.sub_plans.is_empty()
    }

    /// Drop every sub-plan of `shared_query_id`. Returns false if there were none.
    pub fn remove_sub_plans(&mut self, shared_query_id: SharedQueryId) -> bool {
        self.sub_plans.remove(&shared_query_id).is_some()
    }

    pub fn sub_plan_mut(
        &mut self,
        shared_query_id: SharedQueryId,
        sub_plan_id: SubPlanId,
    ) -> Option<&mut QueryPlan> {
        self.sub_plans
            .get_mut(&shared_query_id)?
            .iter_mut()
            .find(|p| p.sub_plan_id == sub_plan_id)
    }

    pub fn sub_plan_containing(
        &self,
        shared_query_id: SharedQueryId,
        op: OperatorId,
    ) -> Option<SubPlanId> {
        self.sub_plans(shared_query_id)
            .iter()
            .find(|p| p.contains(op))
            .map(|p| p.sub_plan_id)
    }

    /// Start an empty sub-plan carrying `header`'s query settings.
    pub fn new_sub_plan(&mut self, shared_query_id: SharedQueryId, header: &QueryPlan) -> SubPlanId {
        let mut plan = header.empty_like();
        plan.sub_plan_id = SubPlanId::next();
        let id = plan.sub_plan_id;
        self.sub_plans.entry(shared_query_id).or_default().push(plan);
        id
    }

    /// Sub-plan an operator with the given children should join.
    ///
    /// Reuses the sub-plan already holding one of the children. When the
    /// children are spread over several local sub-plans those are merged into
    /// the first. With no local child a fresh sub-plan is started.
    pub fn sub_plan_for(
        &mut self,
        shared_query_id: SharedQueryId,
        header: &QueryPlan,
        children: &[OperatorId],
    ) -> SubPlanId {
        let mut holders: Vec<SubPlanId> = Vec::new();
        for child in children {
            if let Some(id) = self.sub_plan_containing(shared_query_id, *child) {
                if !holders.contains(&id) {
                    holders.push(id);
                }
            }
        }
        let Some((&keep, rest)) = holders.split_first() else {
            return self.new_sub_plan(shared_query_id, header);
        };
        if !rest.is_empty() {
            self.merge_sub_plans(shared_query_id, keep, rest);
        }
        keep
    }

    fn merge_sub_plans(&mut self, shared_query_id: SharedQueryId, keep: SubPlanId, others: &[SubPlanId]) {
        let Some(plans) = self.sub_plans.get_mut(&shared_query_id) else {
            return;
        };
        let mut absorbed = Vec::new();
        plans.retain(|p| {
            if others.contains(&p.sub_plan_id) {
                absorbed.push(p.clone());
                false
            } else {
                true
            }
        });
        if let Some(target) = plans.iter_mut().find(|p| p.sub_plan_id == keep) {
            for plan in absorbed {
                trace!(node = %self.id, from = %plan.sub_plan_id, into = %keep, "merging sub-plans");
                target.absorb(plan);
            }
        }
    }

    fn link_parent(&mut self, parent: TopologyNodeId) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    fn link_child(&mut self, child: TopologyNodeId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalExecutionPlan {
    nodes: BTreeMap<TopologyNodeId, ExecutionNode>,
    root_nodes: Vec<TopologyNodeId>,
    query_index: BTreeMap<SharedQueryId, BTreeSet<TopologyNodeId>>,
    to_schedule: Vec<TopologyNodeId>,
    occupancy: BTreeMap<SharedQueryId, BTreeMap<TopologyNodeId, u32>>,
}

impl GlobalExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Returns false and leaves the plan unchanged if a node
    /// with the same id is already present.
    pub fn add_execution_node(&mut self, node: ExecutionNode) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        let id = node.id;
        for shared in node.shared_query_ids() {
            self.query_index.entry(shared).or_default().insert(id);
        }
        self.nodes.insert(id, node);
        debug!(node = %id, "added execution node");
        true
    }

    pub fn add_execution_node_as_root(&mut self, node: ExecutionNode) -> bool {
        let id = node.id;
        if !self.add_execution_node(node) {
            return false;
        }
        if !self.root_nodes.contains(&id) {
            self.root_nodes.push(id);
        }
        true
    }

    /// Record `parent` as the upstream neighbour of `child`. Both must exist.
    pub fn add_execution_node_as_parent_to(
        &mut self,
        child: TopologyNodeId,
        parent: TopologyNodeId,
    ) -> bool {
        if !self.nodes.contains_key(&child) || !self.nodes.contains_key(&parent) {
            return false;
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.link_parent(parent);
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.link_child(child);
        }
        true
    }

    /// The node for `id`, created with `rpc_address` if absent.
    pub fn execution_node_or_insert(
        &mut self,
        id: TopologyNodeId,
        rpc_address: impl Into<String>,
    ) -> &mut ExecutionNode {
        self.nodes
            .entry(id)
            .or_insert_with(|| ExecutionNode::new(id, rpc_address))
    }

    pub fn mark_root(&mut self, id: TopologyNodeId) {
        if self.nodes.contains_key(&id) && !self.root_nodes.contains(&id) {
            self.root_nodes.push(id);
        }
    }

    pub fn root_nodes(&self) -> &[TopologyNodeId] {
        &self.root_nodes
    }

    pub fn contains(&self, id: TopologyNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn execution_node(&self, id: TopologyNodeId) -> Option<&ExecutionNode> {
        self.nodes.get(&id)
    }

    pub fn execution_node_mut(&mut self, id: TopologyNodeId) -> Option<&mut ExecutionNode> {
        self.nodes.get_mut(&id)
    }

    pub fn all_execution_nodes(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.values()
    }

    /// Queue `id` for deployment and refresh the query index for its
    /// sub-plans. A node already queued is not queued twice.
    pub fn schedule_execution_node(&mut self, id: TopologyNodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        for shared in node.shared_query_ids() {
            self.query_index.entry(shared).or_default().insert(id);
        }
        if self.to_schedule.contains(&id) {
            debug!(node = %id, "execution node already scheduled");
        } else {
            self.to_schedule.push(id);
        }
    }

    pub fn execution_nodes_to_schedule(&self) -> &[TopologyNodeId] {
        &self.to_schedule
    }

    pub fn take_execution_nodes_to_schedule(&mut self) -> Vec<TopologyNodeId> {
        std::mem::take(&mut self.to_schedule)
    }

    /// Drop `deployed` from the pending schedule.
    pub fn mark_deployed(&mut self, deployed: &[TopologyNodeId]) {
        self.to_schedule.retain(|n| !deployed.contains(n));
    }

    /// Remove a node outright, with its links and index entries.
    pub fn remove_execution_node(&mut self, id: TopologyNodeId) -> bool {
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        self.root_nodes.retain(|n| *n != id);
        self.to_schedule.retain(|n| *n != id);
        for nodes in self.query_index.values_mut() {
            nodes.remove(&id);
        }
        self.query_index.retain(|_, nodes| !nodes.is_empty());
        for node in self.nodes.values_mut() {
            node.parents.retain(|n| *n != id);
            node.children.retain(|n| *n != id);
        }
        debug!(node = %id, "removed execution node");
        true
    }

    /// Drop every sub-plan of `shared_query_id`, and any node left without
    /// sub-plans. Returns false if the query was not deployed anywhere.
    pub fn remove_query_sub_plans(&mut self, shared_query_id: SharedQueryId) -> bool {
        let Some(nodes) = self.query_index.remove(&shared_query_id) else {
            return false;
        };
        let mut emptied = Vec::new();
        for id in nodes {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.remove_sub_plans(shared_query_id);
                if node.is_empty() {
                    emptied.push(id);
                }
            }
        }
        for id in emptied {
            self.remove_execution_node(id);
        }
        self.occupancy.remove(&shared_query_id);
        debug!(shared_query = %shared_query_id, "removed query sub-plans");
        true
    }

    /// Nodes hosting at least one sub-plan of `shared_query_id`.
    pub fn execution_nodes_by_query_id(&self, shared_query_id: SharedQueryId) -> Vec<&ExecutionNode> {
        self.query_index
            .get(&shared_query_id)
            .map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    /// Record `slots` more slots held by `shared_query_id` on `node`.
    pub fn occupy(&mut self, shared_query_id: SharedQueryId, node: TopologyNodeId, slots: u32) {
        *self
            .occupancy
            .entry(shared_query_id)
            .or_default()
            .entry(node)
            .or_insert(0) += slots;
    }

    /// Forget the slots `shared_query_id` holds on `node`, once they have
    /// been given back to the topology.
    pub fn release_occupied_resource(
        &mut self,
        shared_query_id: SharedQueryId,
        node: TopologyNodeId,
    ) -> Option<u32> {
        let ledger = self.occupancy.get_mut(&shared_query_id)?;
        let slots = ledger.remove(&node);
        if ledger.is_empty() {
            self.occupancy.remove(&shared_query_id);
        }
        slots
    }

    /// Slots held by `shared_query_id`, per topology node.
    pub fn map_of_topology_node_id_to_occupied_resource(
        &self,
        shared_query_id: SharedQueryId,
    ) -> BTreeMap<TopologyNodeId, u32> {
        self.occupancy
            .get(&shared_query_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coplace_core::id::QueryId;
    use coplace_core::operator::{LogicalOperator, OperatorKind};

    fn node(id: u64) -> TopologyNodeId {
        TopologyNodeId::new(id)
    }

    fn filter(id: u64) -> LogicalOperator {
        LogicalOperator::new(
            OperatorId::new(id),
            OperatorKind::Filter {
                predicate: "x".into(),
            },
        )
    }

    #[test]
    fn test_duplicate_node_is_rejected() {
        let mut gep = GlobalExecutionPlan::new();
        assert!(gep.add_execution_node(ExecutionNode::new(node(1), "a:1")));
        assert!(!gep.add_execution_node(ExecutionNode::new(node(1), "b:2")));
        assert_eq!(gep.execution_node(node(1)).map(|n| n.rpc_address.as_str()), Some("a:1"));
    }

    #[test]
    fn test_schedule_is_add_if_absent() {
        let mut gep = GlobalExecutionPlan::new();
        gep.add_execution_node(ExecutionNode::new(node(1), "a:1"));
        gep.schedule_execution_node(node(1));
        gep.schedule_execution_node(node(1));
        gep.schedule_execution_node(node(9));
        assert_eq!(gep.execution_nodes_to_schedule(), &[node(1)]);
    }

    #[test]
    fn test_remove_query_sub_plans_drops_empty_nodes() {
        let shared_a = SharedQueryId::new(1);
        let shared_b = SharedQueryId::new(2);
        let header = QueryPlan::new(QueryId::new(1));
        let mut gep = GlobalExecutionPlan::new();
        for (id, queries) in [(1, vec![shared_a]), (2, vec![shared_a, shared_b])] {
            let exec = gep.execution_node_or_insert(node(id), "h:1");
            for q in queries {
                exec.new_sub_plan(q, &header);
            }
            gep.schedule_execution_node(node(id));
        }

        assert!(gep.remove_query_sub_plans(shared_a));
        assert!(!gep.contains(node(1)));
        assert!(gep.contains(node(2)));
        assert!(gep.execution_nodes_by_query_id(shared_a).is_empty());
        assert_eq!(gep.execution_nodes_by_query_id(shared_b).len(), 1);
        assert!(!gep.remove_query_sub_plans(shared_a));
    }

    #[test]
    fn test_sub_plan_for_merges_sibling_sub_plans() {
        let shared = SharedQueryId::new(1);
        let header = QueryPlan::new(QueryId::new(1));
        let mut exec = ExecutionNode::new(node(1), "h:1");
        let first = exec.new_sub_plan(shared, &header);
        let second = exec.new_sub_plan(shared, &header);
        if let Some(p) = exec.sub_plan_mut(shared, first) {
            p.add_operator(filter(10));
        }
        if let Some(p) = exec.sub_plan_mut(shared, second) {
            p.add_operator(filter(11));
        }

        let chosen = exec.sub_plan_for(shared, &header, &[OperatorId::new(10), OperatorId::new(11)]);
        assert_eq!(chosen, first);
        assert_eq!(exec.sub_plans(shared).len(), 1);
        assert_eq!(exec.sub_plans(shared)[0].len(), 2);
    }

    #[test]
    fn test_occupancy_ledger_accumulates() {
        let shared = SharedQueryId::new(4);
        let mut gep = GlobalExecutionPlan::new();
        gep.occupy(shared, node(1), 1);
        gep.occupy(shared, node(1), 2);
        gep.occupy(shared, node(2), 1);
        let map = gep.map_of_topology_node_id_to_occupied_resource(shared);
        assert_eq!(map.get(&node(1)), Some(&3));
        assert_eq!(map.get(&node(2)), Some(&1));
        assert!(gep
            .map_of_topology_node_id_to_occupied_resource(SharedQueryId::new(99))
            .is_empty());
    }
}
