//! `QueryPlan`: an arena of operators keyed by id.
//!
//! The same type backs a submitted query, the merged graph of a shared query
//! plan, and a sub-plan deployed on one execution node.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{OperatorId, QueryId, SubPlanId};
use crate::operator::LogicalOperator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlacementStrategyType {
    BottomUp,
    TopDown,
    /// Every operator carries a user-chosen pinned node.
    Manual,
    HighThroughput,
    LowLatency,
    MinimumResourceConsumption,
}

impl std::fmt::Display for PlacementStrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BottomUp => "BottomUp",
            Self::TopDown => "TopDown",
            Self::Manual => "Manual",
            Self::HighThroughput => "HighThroughput",
            Self::LowLatency => "LowLatency",
            Self::MinimumResourceConsumption => "MinimumResourceConsumption",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PlacementStrategyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BottomUp" => Ok(Self::BottomUp),
            "TopDown" => Ok(Self::TopDown),
            "Manual" => Ok(Self::Manual),
            "HighThroughput" => Ok(Self::HighThroughput),
            "LowLatency" => Ok(Self::LowLatency),
            "MinimumResourceConsumption" => Ok(Self::MinimumResourceConsumption),
            other => Err(Error::Config(format!("unknown placement strategy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FaultToleranceType {
    #[default]
    None,
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LineageType {
    #[default]
    None,
    InMemory,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query_id: QueryId,
    /// `SubPlanId::INVALID` unless this plan is deployed on an execution node.
    pub sub_plan_id: SubPlanId,
    pub placement_strategy: PlacementStrategyType,
    pub fault_tolerance: FaultToleranceType,
    pub lineage: LineageType,
    operators: BTreeMap<OperatorId, LogicalOperator>,
}

impl QueryPlan {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            sub_plan_id: SubPlanId::INVALID,
            placement_strategy: PlacementStrategyType::BottomUp,
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            operators: BTreeMap::new(),
        }
    }

    /// An empty plan that inherits this plan's query settings.
    pub fn empty_like(&self) -> Self {
        Self {
            query_id: self.query_id,
            sub_plan_id: self.sub_plan_id,
            placement_strategy: self.placement_strategy,
            fault_tolerance: self.fault_tolerance,
            lineage: self.lineage,
            operators: BTreeMap::new(),
        }
    }

    /// Insert an operator. Existing edges on `op` are kept as-is.
    pub fn add_operator(&mut self, op: LogicalOperator) -> OperatorId {
        let id = op.id;
        self.operators.insert(id, op);
        id
    }

    /// Move every operator of `other` into this plan.
    pub fn absorb(&mut self, other: QueryPlan) {
        self.operators.extend(other.operators);
    }

    /// Remove an operator and unlink it from every neighbour still in the plan.
    pub fn remove_operator(&mut self, id: OperatorId) -> Option<LogicalOperator> {
        let op = self.operators.remove(&id)?;
        for p in &op.parents {
            if let Some(parent) = self.operators.get_mut(p) {
                parent.children.retain(|c| *c != id);
            }
        }
        for c in &op.children {
            if let Some(child) = self.operators.get_mut(c) {
                child.parents.retain(|p| *p != id);
            }
        }
        Some(op)
    }

    /// Add the edge `child -> parent` (data flows from child to parent).
    pub fn connect(&mut self, child: OperatorId, parent: OperatorId) -> Result<()> {
        if !self.operators.contains_key(&parent) {
            return Err(Error::OperatorNotFound(parent));
        }
        let c = self
            .operators
            .get_mut(&child)
            .ok_or(Error::OperatorNotFound(child))?;
        if !c.parents.contains(&parent) {
            c.parents.push(parent);
        }
        let p = self
            .operators
            .get_mut(&parent)
            .ok_or(Error::OperatorNotFound(parent))?;
        if !p.children.contains(&child) {
            p.children.push(child);
        }
        Ok(())
    }

    pub fn operator(&self, id: OperatorId) -> Option<&LogicalOperator> {
        self.operators.get(&id)
    }

    pub fn operator_mut(&mut self, id: OperatorId) -> Option<&mut LogicalOperator> {
        self.operators.get_mut(&id)
    }

    pub fn get(&self, id: OperatorId) -> Result<&LogicalOperator> {
        self.operators.get(&id).ok_or(Error::OperatorNotFound(id))
    }

    pub fn get_mut(&mut self, id: OperatorId) -> Result<&mut LogicalOperator> {
        self.operators.get_mut(&id).ok_or(Error::OperatorNotFound(id))
    }

    pub fn contains(&self, id: OperatorId) -> bool {
        self.operators.contains_key(&id)
    }

    pub fn operators(&self) -> impl Iterator<Item = &LogicalOperator> {
        self.operators.values()
    }

    pub fn operators_mut(&mut self) -> impl Iterator<Item = &mut LogicalOperator> {
        self.operators.values_mut()
    }

    pub fn operator_ids(&self) -> Vec<OperatorId> {
        self.operators.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Operators without parents.
    pub fn root_operators(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.parents.is_empty())
            .map(|op| op.id)
            .collect()
    }

    /// Operators without children.
    pub fn leaf_operators(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.children.is_empty())
            .map(|op| op.id)
            .collect()
    }

    pub fn sink_operators(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.kind.is_sink())
            .map(|op| op.id)
            .collect()
    }

    pub fn source_operators(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.kind.is_source())
            .map(|op| op.id)
            .collect()
    }

    /// Sorted, de-duplicated logical source names joined by `_`.
    pub fn source_consumed(&self) -> String {
        let names: BTreeSet<&str> = self
            .operators
            .values()
            .filter_map(|op| match &op.kind {
                crate::operator::OperatorKind::Source { logical_source } => {
                    Some(logical_source.as_str())
                }
                _ => None,
            })
            .collect();
        names.into_iter().collect::<Vec<_>>().join("_")
    }

    /// Every operator reachable from `start` by following parent edges, `start` included.
    pub fn downstream_closure(&self, start: &[OperatorId]) -> BTreeSet<OperatorId> {
        self.closure(start, |op| &op.parents)
    }

    /// Every operator reachable from `start` by following child edges, `start` included.
    pub fn upstream_closure(&self, start: &[OperatorId]) -> BTreeSet<OperatorId> {
        self.closure(start, |op| &op.children)
    }

    fn closure<F>(&self, start: &[OperatorId], next: F) -> BTreeSet<OperatorId>
    where
        F: Fn(&LogicalOperator) -> &Vec<OperatorId>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<OperatorId> = start.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(op) = self.operators.get(&id) {
                queue.extend(next(op).iter().copied());
            }
        }
        seen
    }

    /// True if `upstream` is a strict transitive child of `downstream`.
    pub fn is_upstream_of(&self, upstream: OperatorId, downstream: OperatorId) -> bool {
        if upstream == downstream {
            return false;
        }
        let children = match self.operators.get(&downstream) {
            Some(op) => op.children.clone(),
            None => return false,
        };
        self.upstream_closure(&children).contains(&upstream)
    }

    /// Operators lying strictly between the two bounds.
    pub fn operators_between(
        &self,
        upstream: &BTreeSet<OperatorId>,
        downstream: &BTreeSet<OperatorId>,
    ) -> BTreeSet<OperatorId> {
        let up: Vec<_> = upstream.iter().copied().collect();
        let down: Vec<_> = downstream.iter().copied().collect();
        let above = self.downstream_closure(&up);
        let below = self.upstream_closure(&down);
        above
            .intersection(&below)
            .filter(|id| !upstream.contains(id) && !downstream.contains(id))
            .copied()
            .collect()
    }

    /// Bounds plus everything between them, ordered children-first.
    pub fn topological_between(
        &self,
        upstream: &BTreeSet<OperatorId>,
        downstream: &BTreeSet<OperatorId>,
    ) -> Vec<OperatorId> {
        let mut scope = self.operators_between(upstream, downstream);
        scope.extend(upstream.iter().copied().filter(|id| self.contains(*id)));
        scope.extend(downstream.iter().copied().filter(|id| self.contains(*id)));
        self.topological_order_of(&scope)
    }

    /// Kahn's algorithm over the whole plan, children before parents.
    pub fn topological_order(&self) -> Vec<OperatorId> {
        let scope: BTreeSet<OperatorId> = self.operators.keys().copied().collect();
        self.topological_order_of(&scope)
    }

    fn topological_order_of(&self, scope: &BTreeSet<OperatorId>) -> Vec<OperatorId> {
        let mut pending: BTreeMap<OperatorId, usize> = BTreeMap::new();
        for id in scope {
            let deg = self
                .operators
                .get(id)
                .map(|op| op.children.iter().filter(|c| scope.contains(c)).count())
                .unwrap_or(0);
            pending.insert(*id, deg);
        }
        let mut ready: VecDeque<OperatorId> = pending
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(scope.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            if let Some(op) = self.operators.get(&id) {
                for p in &op.parents {
                    if let Some(deg) = pending.get_mut(p) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push_back(*p);
                        }
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::QueryPlanBuilder;

    fn chain() -> (QueryPlan, Vec<OperatorId>) {
        let plan = QueryPlanBuilder::from_source("cars")
            .filter("speed > 50")
            .map(&[("kmh", "speed * 1.6")])
            .sink("out")
            .build(QueryId::new(1));
        let order = plan.topological_order();
        (plan, order)
    }

    #[test]
    fn test_topological_order_is_source_first() {
        let (plan, order) = chain();
        assert_eq!(order.len(), 4);
        assert!(plan.get(order[0]).expect("source").kind.is_source());
        assert!(plan.get(order[3]).expect("sink").kind.is_sink());
    }

    #[test]
    fn test_operators_between_excludes_bounds() {
        let (plan, order) = chain();
        let up: BTreeSet<_> = [order[0]].into();
        let down: BTreeSet<_> = [order[3]].into();
        let between = plan.operators_between(&up, &down);
        assert_eq!(between, [order[1], order[2]].into());
    }

    #[test]
    fn test_is_upstream_of() {
        let (plan, order) = chain();
        assert!(plan.is_upstream_of(order[0], order[3]));
        assert!(!plan.is_upstream_of(order[3], order[0]));
        assert!(!plan.is_upstream_of(order[1], order[1]));
    }

    #[test]
    fn test_remove_operator_unlinks_neighbours() {
        let (mut plan, order) = chain();
        plan.remove_operator(order[3]);
        assert!(plan.get(order[2]).expect("map").parents.is_empty());
        assert_eq!(plan.root_operators(), vec![order[2]]);
    }

    #[test]
    fn test_source_consumed_is_sorted_and_unique() {
        let left = QueryPlanBuilder::from_source("zeta");
        let plan = QueryPlanBuilder::from_source("alpha")
            .union_with(left)
            .sink("s")
            .build(QueryId::new(2));
        assert_eq!(plan.source_consumed(), "alpha_zeta");
    }
}
