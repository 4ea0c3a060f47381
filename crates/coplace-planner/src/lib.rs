#![forbid(unsafe_code)]
//! coplace-planner: deciding which running computation a new query can reuse.
//!
//! Design:
//! - A `SharedQueryPlan` owns one merged operator arena plus per-query sink
//!   membership and a timestamped change log of graph edits.
//! - The `GlobalQueryPlan` is the registry of shared plans, of queries waiting
//!   to be merged, and of merge candidates bucketed by (consumed sources,
//!   placement strategy).
//! - Merger rules drain the pending queue, grafting each query onto the first
//!   compatible host or creating a new shared plan.
//! - A tiny YAML DSL builds query plans and topologies for tests and tools.

pub mod change_log;
pub mod dsl;
pub mod error;
pub mod global_plan;
pub mod merger;
pub mod shared_plan;
pub mod signature;

pub use change_log::{now_micros, ChangeLog, ChangeLogEntry};
pub use dsl::yaml::{parse_yaml_query, parse_yaml_query_with_default, parse_yaml_topology};
pub use error::{PlanError, Result};
pub use global_plan::{GlobalQueryPlan, RequestType};
pub use merger::{merger_rule_for, QueryMergerRule};
pub use shared_plan::{MatchedOperatorPair, SharedQueryPlan, SharedQueryPlanStatus};
pub use signature::SignatureInferencePhase;
