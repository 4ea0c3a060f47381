#![forbid(unsafe_code)]
//! coplace-core: shared vocabulary for the query-sharing and placement crates.
//!
//! Responsibilities:
//! - Strongly-typed ids (operators, queries, shared queries, topology nodes, sub-plans).
//! - The operator arena (`QueryPlan`) whose edges are id references, so merged
//!   queries can share upstream operators without ownership ambiguity.
//! - Canonical operator signatures (blake3) used by signature-based merging.
//! - Coordinator configuration with env overrides.
//!
//! No I/O and no async here.

pub mod builder;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod operator;
pub mod plan;
pub mod prelude;

pub use builder::QueryPlanBuilder;
pub use config::{CoordinatorConfig, QueryMergerRuleType};
pub use error::{Error, Result};
pub use operator::{LogicalOperator, OperatorKind, OperatorState, PINNED_NODE_ID};
pub use plan::{FaultToleranceType, LineageType, PlacementStrategyType, QueryPlan};
