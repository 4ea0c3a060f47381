#![forbid(unsafe_code)]
//! coplace-placement: mapping shared operator graphs onto topology nodes.
//!
//! Responsibilities:
//! - `GlobalExecutionPlan`: which sub-plans run on which topology node, per
//!   shared query, plus the slot-occupancy ledger used on undeployment.
//! - Placement strategies (bottom-up, path-based high-throughput/low-latency,
//!   minimum-resource-consumption) behind one trait.
//! - Bridging cross-node edges with network source/sink operators.
//! - `QueryPlacementPhase`: full or change-log-driven placement of a shared
//!   query plan.
//! - Debug-time verification helpers.
//!
//! Every strategy invocation is all-or-nothing: work is staged on a copy of
//! the execution plan and a snapshot of the operator graph, and on error the
//! acquired slots are released and both are left untouched.

pub mod error;
pub mod execution_plan;
pub mod phase;
pub mod strategy;
pub mod type_inference;
pub mod verify;

pub use error::{PlacementError, Result};
pub use execution_plan::{ExecutionNode, GlobalExecutionPlan};
pub use phase::QueryPlacementPhase;
pub use strategy::{strategy_for, PlacementRequest, PlacementStrategy};
pub use type_inference::{StructuralTypeInference, TypeInferencePhase};
