use coplace_core::id::{SharedQueryId, TopologyNodeId};
use thiserror::Error;

use crate::rpc::RpcMode;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no execution nodes found for {0}")]
    ExecutionNodeNotFound(SharedQueryId),

    /// Nodes whose stop or unregister call failed or timed out.
    #[error("{mode} failed during undeployment on {} node(s): {failed:?}", .failed.len())]
    RpcQueryUndeployment {
        failed: Vec<TopologyNodeId>,
        mode: RpcMode,
    },

    #[error("{mode} failed during deployment on {} node(s): {failed:?}", .failed.len())]
    RpcQueryDeployment {
        failed: Vec<TopologyNodeId>,
        mode: RpcMode,
    },

    #[error("query undeployment: {0}")]
    QueryUndeployment(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Core(#[from] coplace_core::Error),

    #[error(transparent)]
    Plan(#[from] coplace_planner::PlanError),

    #[error(transparent)]
    Placement(#[from] coplace_placement::PlacementError),

    #[error(transparent)]
    Topology(#[from] coplace_topology::TopologyError),
}
