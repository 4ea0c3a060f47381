use coplace_core::id::SharedQueryId;
use thiserror::Error;

/// Result type local to coplace-placement.
pub type Result<T> = std::result::Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// Aborts placement of one shared query: no capacity, no common
    /// ancestor, an unpinned boundary operator, or an unreachable node.
    #[error("query placement failed for {shared_query_id}: {message}")]
    QueryPlacement {
        shared_query_id: SharedQueryId,
        message: String,
    },

    #[error("type inference failed: {0}")]
    TypeInference(String),

    #[error(transparent)]
    Core(#[from] coplace_core::Error),

    #[error(transparent)]
    Topology(#[from] coplace_topology::TopologyError),

    #[error(transparent)]
    Plan(#[from] coplace_planner::PlanError),
}

impl PlacementError {
    pub fn placement(shared_query_id: SharedQueryId, message: impl Into<String>) -> Self {
        Self::QueryPlacement {
            shared_query_id,
            message: message.into(),
        }
    }
}
