use coplace_core::id::{QueryId, SharedQueryId};
use thiserror::Error;

/// Result type local to coplace-planner.
pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("global query plan update rejected: {0}")]
    GlobalQueryPlanUpdate(String),

    #[error("query {0} is not registered")]
    QueryNotFound(QueryId),

    #[error("shared query plan {0} not found")]
    SharedQueryPlanNotFound(SharedQueryId),

    #[error("matched operators cannot be grafted: {0}")]
    InconsistentMatch(String),

    #[error("query DSL: {0}")]
    Dsl(String),

    #[error(transparent)]
    Core(#[from] coplace_core::Error),

    #[error(transparent)]
    Topology(#[from] coplace_topology::TopologyError),
}
