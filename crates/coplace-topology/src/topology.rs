//! Topology graph: nodes with slot capacity, upward links with bandwidth and
//! latency, and the path queries placement strategies rely on.
//!
//! Links point from a child towards the root. A node may have more than one
//! parent; the root is the node without parents.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use coplace_core::id::TopologyNodeId;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, TopologyError};
use crate::slots::SlotCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkProperty {
    pub bandwidth_mbps: u64,
    pub latency_ms: u64,
}

impl Default for LinkProperty {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 100,
            latency_ms: 1,
        }
    }
}

#[derive(Debug)]
pub struct TopologyNode {
    pub id: TopologyNodeId,
    pub ip: String,
    pub grpc_port: u16,
    slots: SlotCounter,
    parents: Vec<TopologyNodeId>,
    children: Vec<TopologyNodeId>,
}

impl TopologyNode {
    /// `host:port` the worker's RPC server listens on.
    pub fn rpc_address(&self) -> String {
        format!("{}:{}", self.ip, self.grpc_port)
    }

    pub fn available_resources(&self) -> u32 {
        self.slots.available()
    }

    pub fn capacity(&self) -> u32 {
        self.slots.capacity()
    }

    pub fn parents(&self) -> &[TopologyNodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[TopologyNodeId] {
        &self.children
    }
}

/// Serializable description used to build a topology from config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub links: Vec<LinkDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: u64,
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    pub slots: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDescriptor {
    pub child: u64,
    pub parent: u64,
    #[serde(default)]
    pub bandwidth_mbps: Option<u64>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_grpc_port() -> u16 {
    4000
}

#[derive(Debug, Default)]
pub struct Topology {
    nodes: BTreeMap<TopologyNodeId, TopologyNode>,
    links: HashMap<(TopologyNodeId, TopologyNodeId), LinkProperty>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptor(desc: &TopologyDescriptor) -> Result<Self> {
        let mut topology = Self::new();
        for n in &desc.nodes {
            topology.add_node(TopologyNodeId::new(n.id), n.ip.clone(), n.grpc_port, n.slots)?;
        }
        for l in &desc.links {
            let default = LinkProperty::default();
            topology.add_link(
                TopologyNodeId::new(l.child),
                TopologyNodeId::new(l.parent),
                LinkProperty {
                    bandwidth_mbps: l.bandwidth_mbps.unwrap_or(default.bandwidth_mbps),
                    latency_ms: l.latency_ms.unwrap_or(default.latency_ms),
                },
            )?;
        }
        Ok(topology)
    }

    pub fn add_node(
        &mut self,
        id: TopologyNodeId,
        ip: impl Into<String>,
        grpc_port: u16,
        slots: u32,
    ) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(TopologyError::DuplicateNode(id));
        }
        self.nodes.insert(
            id,
            TopologyNode {
                id,
                ip: ip.into(),
                grpc_port,
                slots: SlotCounter::new(slots),
                parents: Vec::new(),
                children: Vec::new(),
            },
        );
        Ok(())
    }

    /// Link `child` under `parent`. Data flows child → parent.
    pub fn add_link(
        &mut self,
        child: TopologyNodeId,
        parent: TopologyNodeId,
        property: LinkProperty,
    ) -> Result<()> {
        if !self.nodes.contains_key(&parent) {
            return Err(TopologyError::NodeNotFound(parent));
        }
        let c = self
            .nodes
            .get_mut(&child)
            .ok_or(TopologyError::NodeNotFound(child))?;
        if !c.parents.contains(&parent) {
            c.parents.push(parent);
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
        self.links.insert((child, parent), property);
        Ok(())
    }

    pub fn node(&self, id: TopologyNodeId) -> Option<&TopologyNode> {
        self.nodes.get(&id)
    }

    pub fn get(&self, id: TopologyNodeId) -> Result<&TopologyNode> {
        self.nodes.get(&id).ok_or(TopologyError::NodeNotFound(id))
    }

    pub fn contains(&self, id: TopologyNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// The lowest-id node without parents.
    pub fn root(&self) -> Option<TopologyNodeId> {
        self.nodes
            .values()
            .find(|n| n.parents.is_empty())
            .map(|n| n.id)
    }

    pub fn parents(&self, id: TopologyNodeId) -> &[TopologyNodeId] {
        self.nodes.get(&id).map(|n| n.parents()).unwrap_or(&[])
    }

    pub fn children(&self, id: TopologyNodeId) -> &[TopologyNodeId] {
        self.nodes.get(&id).map(|n| n.children()).unwrap_or(&[])
    }

    pub fn link(&self, child: TopologyNodeId, parent: TopologyNodeId) -> Option<LinkProperty> {
        self.links.get(&(child, parent)).copied()
    }

    /// Free slots on `id`; zero for unknown nodes.
    pub fn available_resources(&self, id: TopologyNodeId) -> u32 {
        self.nodes
            .get(&id)
            .map(TopologyNode::available_resources)
            .unwrap_or(0)
    }

    /// Atomically take `slots` from `id`, failing without side effects if
    /// fewer are available.
    pub fn reduce_cpu_capacity(&self, id: TopologyNodeId, slots: u32) -> Result<()> {
        let node = self.get(id)?;
        if node.slots.try_acquire(slots) {
            trace!(node = %id, slots, "reduced topology node capacity");
            Ok(())
        } else {
            Err(TopologyError::InsufficientResources {
                node: id,
                requested: slots,
                available: node.available_resources(),
            })
        }
    }

    pub fn increase_resources(&self, id: TopologyNodeId, slots: u32) -> Result<()> {
        let node = self.get(id)?;
        let released = node.slots.release(slots);
        trace!(node = %id, slots, released, "increased topology node capacity");
        Ok(())
    }

    /// Hop distance from `id` to every node reachable by following parents.
    fn ancestors_with_distance(&self, id: TopologyNodeId) -> BTreeMap<TopologyNodeId, usize> {
        let mut dist = BTreeMap::new();
        let mut queue = VecDeque::from([(id, 0usize)]);
        while let Some((cur, d)) = queue.pop_front() {
            if dist.contains_key(&cur) {
                continue;
            }
            dist.insert(cur, d);
            for p in self.parents(cur) {
                queue.push_back((*p, d + 1));
            }
        }
        dist
    }

    /// True if `ancestor` is `node` itself or reachable from it upwards.
    pub fn is_ancestor_or_self(&self, ancestor: TopologyNodeId, node: TopologyNodeId) -> bool {
        self.ancestors_with_distance(node).contains_key(&ancestor)
    }

    /// Lowest node reachable upwards from all of `nodes`.
    ///
    /// "Lowest" minimises the largest hop distance from any input node; ties
    /// go to the smaller id.
    pub fn find_common_ancestor(&self, nodes: &[TopologyNodeId]) -> Option<TopologyNodeId> {
        let (first, rest) = nodes.split_first()?;
        let mut common: BTreeMap<TopologyNodeId, usize> = self.ancestors_with_distance(*first);
        for n in rest {
            let other = self.ancestors_with_distance(*n);
            common = common
                .into_iter()
                .filter_map(|(id, d)| other.get(&id).map(|d2| (id, d.max(*d2))))
                .collect();
        }
        common
            .into_iter()
            .min_by_key(|(id, d)| (*d, *id))
            .map(|(id, _)| id)
    }

    /// Fewest-hop upward path from `from` to `to`, both included.
    pub fn find_path_to(&self, from: TopologyNodeId, to: TopologyNodeId) -> Option<Vec<TopologyNodeId>> {
        let mut prev: HashMap<TopologyNodeId, TopologyNodeId> = HashMap::new();
        let mut seen = BTreeSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(cur) = queue.pop_front() {
            if cur == to {
                let mut path = vec![cur];
                let mut at = cur;
                while let Some(p) = prev.get(&at) {
                    path.push(*p);
                    at = *p;
                }
                path.reverse();
                return Some(path);
            }
            for p in self.parents(cur) {
                if seen.insert(*p) {
                    prev.insert(*p, cur);
                    queue.push_back(*p);
                }
            }
        }
        None
    }

    /// Nodes on the upward path between two nodes, both included.
    pub fn find_nodes_between(
        &self,
        from: TopologyNodeId,
        to: TopologyNodeId,
    ) -> Result<Vec<TopologyNodeId>> {
        self.find_path_to(from, to)
            .ok_or(TopologyError::NoPath { from, to })
    }

    /// Every simple upward path from `from` to `to`.
    pub fn all_paths_to(&self, from: TopologyNodeId, to: TopologyNodeId) -> Vec<Vec<TopologyNodeId>> {
        let mut out = Vec::new();
        let mut path = vec![from];
        self.walk_paths(from, to, &mut path, &mut out);
        out
    }

    fn walk_paths(
        &self,
        cur: TopologyNodeId,
        to: TopologyNodeId,
        path: &mut Vec<TopologyNodeId>,
        out: &mut Vec<Vec<TopologyNodeId>>,
    ) {
        if cur == to {
            out.push(path.clone());
            return;
        }
        for p in self.parents(cur) {
            if path.contains(p) {
                continue;
            }
            path.push(*p);
            self.walk_paths(*p, to, path, out);
            path.pop();
        }
    }

    fn link_or_default(&self, child: TopologyNodeId, parent: TopologyNodeId) -> LinkProperty {
        self.link(child, parent).unwrap_or_default()
    }

    /// Upward path whose narrowest link is widest; fewer hops break ties.
    pub fn find_path_with_max_bandwidth(
        &self,
        from: TopologyNodeId,
        to: TopologyNodeId,
    ) -> Option<Vec<TopologyNodeId>> {
        self.all_paths_to(from, to).into_iter().max_by(|a, b| {
            let (ba, bb) = (self.bottleneck(a), self.bottleneck(b));
            ba.cmp(&bb).then(b.len().cmp(&a.len()))
        })
    }

    /// Upward path with the smallest summed link latency; fewer hops break ties.
    pub fn find_path_with_min_latency(
        &self,
        from: TopologyNodeId,
        to: TopologyNodeId,
    ) -> Option<Vec<TopologyNodeId>> {
        self.all_paths_to(from, to)
            .into_iter()
            .min_by_key(|p| (self.latency(p), p.len()))
    }

    fn bottleneck(&self, path: &[TopologyNodeId]) -> u64 {
        path.windows(2)
            .map(|w| self.link_or_default(w[0], w[1]).bandwidth_mbps)
            .min()
            .unwrap_or(u64::MAX)
    }

    fn latency(&self, path: &[TopologyNodeId]) -> u64 {
        path.windows(2)
            .map(|w| self.link_or_default(w[0], w[1]).latency_ms)
            .sum()
    }
}
