//! Convenient re-exports for downstream crates.

pub use crate::builder::QueryPlanBuilder;
pub use crate::config::{CoordinatorConfig, QueryMergerRuleType};
pub use crate::error::{Error, Result};
pub use crate::hash::{Hash256, Signature};
pub use crate::id::{OperatorId, QueryId, SharedQueryId, SubPlanId, TopologyNodeId};
pub use crate::operator::{LogicalOperator, OperatorKind, OperatorState, PINNED_NODE_ID};
pub use crate::plan::{FaultToleranceType, LineageType, PlacementStrategyType, QueryPlan};
