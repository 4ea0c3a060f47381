//! Fluent construction of query plans, mostly for tests and the YAML DSL.

use crate::id::{OperatorId, QueryId, TopologyNodeId};
use crate::operator::{LogicalOperator, OperatorKind};
use crate::plan::{FaultToleranceType, LineageType, PlacementStrategyType, QueryPlan};

/// Builds a plan from sources towards a single head operator.
///
/// Every operator gets a fresh process-unique `OperatorId`, so plans built
/// independently can later be merged into one arena without id clashes.
pub struct QueryPlanBuilder {
    plan: QueryPlan,
    head: OperatorId,
}

impl QueryPlanBuilder {
    pub fn from_source(logical_source: impl Into<String>) -> Self {
        let mut plan = QueryPlan::new(QueryId::INVALID);
        let head = plan.add_operator(LogicalOperator::new(
            OperatorId::next(),
            OperatorKind::Source {
                logical_source: logical_source.into(),
            },
        ));
        Self { plan, head }
    }

    /// Id of the most recently appended operator.
    pub fn head(&self) -> OperatorId {
        self.head
    }

    /// Append an operator of any kind on top of the current head.
    pub fn then(mut self, kind: OperatorKind) -> Self {
        let id = self
            .plan
            .add_operator(LogicalOperator::new(OperatorId::next(), kind));
        self.link(self.head, id);
        self.head = id;
        self
    }

    pub fn filter(self, predicate: impl Into<String>) -> Self {
        self.then(OperatorKind::Filter {
            predicate: predicate.into(),
        })
    }

    pub fn map(self, assignments: &[(&str, &str)]) -> Self {
        self.then(OperatorKind::Map {
            assignments: assignments
                .iter()
                .map(|(f, e)| (f.to_string(), e.to_string()))
                .collect(),
        })
    }

    pub fn project(self, columns: &[&str]) -> Self {
        self.then(OperatorKind::Project {
            columns: columns.iter().map(|c| c.to_string()).collect(),
        })
    }

    pub fn window(self, size_ms: u64, slide_ms: u64, keys: &[&str], aggregation: &str) -> Self {
        self.then(OperatorKind::Window {
            size_ms,
            slide_ms,
            keys: keys.iter().map(|k| k.to_string()).collect(),
            aggregation: aggregation.to_string(),
        })
    }

    pub fn join_with(
        self,
        right: QueryPlanBuilder,
        left_key: &str,
        right_key: &str,
        window_ms: u64,
    ) -> Self {
        self.combine(
            right,
            OperatorKind::Join {
                left_key: left_key.to_string(),
                right_key: right_key.to_string(),
                window_ms,
            },
        )
    }

    pub fn union_with(self, other: QueryPlanBuilder) -> Self {
        self.combine(other, OperatorKind::Union)
    }

    fn combine(mut self, other: QueryPlanBuilder, kind: OperatorKind) -> Self {
        let other_head = other.head;
        for op in other.plan.operators() {
            self.plan.add_operator(op.clone());
        }
        let id = self
            .plan
            .add_operator(LogicalOperator::new(OperatorId::next(), kind));
        self.link(self.head, id);
        self.link(other_head, id);
        self.head = id;
        self
    }

    /// Pin the current head to a topology node.
    pub fn pinned_at(mut self, node: TopologyNodeId) -> Self {
        if let Some(op) = self.plan.operator_mut(self.head) {
            op.pin(node);
        }
        self
    }

    pub fn placement(mut self, strategy: PlacementStrategyType) -> Self {
        self.plan.placement_strategy = strategy;
        self
    }

    pub fn fault_tolerance(mut self, ft: FaultToleranceType, lineage: LineageType) -> Self {
        self.plan.fault_tolerance = ft;
        self.plan.lineage = lineage;
        self
    }

    pub fn sink(self, name: impl Into<String>) -> Self {
        self.then(OperatorKind::Sink { name: name.into() })
    }

    pub fn build(mut self, query_id: QueryId) -> QueryPlan {
        self.plan.query_id = query_id;
        self.plan
    }

    fn link(&mut self, child: OperatorId, parent: OperatorId) {
        // Both ids were inserted by this builder.
        let _ = self.plan.connect(child, parent);
    }
}
