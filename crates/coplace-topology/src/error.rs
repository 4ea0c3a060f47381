use coplace_core::id::TopologyNodeId;
use thiserror::Error;

/// Result type local to coplace-topology.
pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology node {0} not found")]
    NodeNotFound(TopologyNodeId),

    #[error("topology node {0} already exists")]
    DuplicateNode(TopologyNodeId),

    #[error("no path from {from} to {to}")]
    NoPath {
        from: TopologyNodeId,
        to: TopologyNodeId,
    },

    #[error("node {node}: requested {requested} slots, {available} available")]
    InsufficientResources {
        node: TopologyNodeId,
        requested: u32,
        available: u32,
    },
}
