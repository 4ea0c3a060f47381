//! Logical source name → topology nodes hosting a physical instance.

use std::collections::BTreeMap;

use coplace_core::id::TopologyNodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceCatalog {
    sources: BTreeMap<String, Vec<TopologyNodeId>>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_physical_source(&mut self, logical_source: impl Into<String>, node: TopologyNodeId) {
        let nodes = self.sources.entry(logical_source.into()).or_default();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }

    /// Nodes hosting `logical_source`, in registration order.
    pub fn nodes_for(&self, logical_source: &str) -> &[TopologyNodeId] {
        self.sources
            .get(logical_source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, logical_source: &str) -> bool {
        self.sources.contains_key(logical_source)
    }
}
