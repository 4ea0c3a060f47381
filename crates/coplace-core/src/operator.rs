//! Logical operator records stored in a plan arena.
//!
//! Edges are `OperatorId` lists, never owning pointers: after a merge the same
//! upstream operator is referenced by the sinks of several queries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::Signature;
use crate::id::{OperatorId, TopologyNodeId};

/// Property key holding the topology node an operator must (or does) run on.
pub const PINNED_NODE_ID: &str = "PINNED_NODE_ID";

/// Closed set of operator kinds understood by merging and placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorKind {
    Source {
        logical_source: String,
    },
    Sink {
        name: String,
    },
    Filter {
        predicate: String,
    },
    Map {
        assignments: Vec<(String, String)>,
    },
    Project {
        columns: Vec<String>,
    },
    Window {
        size_ms: u64,
        slide_ms: u64,
        keys: Vec<String>,
        aggregation: String,
    },
    Join {
        left_key: String,
        right_key: String,
        window_ms: u64,
    },
    Union,
    /// Receiving end of a cross-node edge, inserted by placement.
    NetworkSource {
        partition: OperatorId,
        origin: OperatorId,
        upstream_node: TopologyNodeId,
    },
    /// Sending end of a cross-node edge, inserted by placement.
    NetworkSink {
        partition: OperatorId,
        origin: OperatorId,
        downstream_node: TopologyNodeId,
    },
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Source { .. } => "source",
            OperatorKind::Sink { .. } => "sink",
            OperatorKind::Filter { .. } => "filter",
            OperatorKind::Map { .. } => "map",
            OperatorKind::Project { .. } => "project",
            OperatorKind::Window { .. } => "window",
            OperatorKind::Join { .. } => "join",
            OperatorKind::Union => "union",
            OperatorKind::NetworkSource { .. } => "network_source",
            OperatorKind::NetworkSink { .. } => "network_sink",
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, OperatorKind::Source { .. })
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, OperatorKind::Sink { .. })
    }

    /// Join and union consume more than one input stream.
    pub fn is_binary(&self) -> bool {
        matches!(self, OperatorKind::Join { .. } | OperatorKind::Union)
    }

    /// Operators added by placement rather than by the submitter.
    pub fn is_system_generated(&self) -> bool {
        matches!(
            self,
            OperatorKind::NetworkSource { .. } | OperatorKind::NetworkSink { .. }
        )
    }

    /// Normalized text of the operator's own semantics (children excluded).
    ///
    /// Conjunctions, assignments, projected columns and grouping keys are sorted
    /// so that reordered but equivalent expressions produce the same text.
    pub fn canonical(&self) -> String {
        match self {
            OperatorKind::Source { logical_source } => format!("source[{logical_source}]"),
            OperatorKind::Sink { .. } => "sink".to_string(),
            OperatorKind::Filter { predicate } => {
                format!("filter[{}]", normalize_predicate(predicate))
            }
            OperatorKind::Map { assignments } => {
                let mut parts: Vec<String> = assignments
                    .iter()
                    .map(|(field, expr)| format!("{}={}", field.trim(), squash(expr)))
                    .collect();
                parts.sort();
                format!("map[{}]", parts.join(";"))
            }
            OperatorKind::Project { columns } => {
                let mut cols: Vec<&str> = columns.iter().map(|c| c.trim()).collect();
                cols.sort_unstable();
                format!("project[{}]", cols.join(","))
            }
            OperatorKind::Window {
                size_ms,
                slide_ms,
                keys,
                aggregation,
            } => {
                let mut keys: Vec<&str> = keys.iter().map(|k| k.trim()).collect();
                keys.sort_unstable();
                format!(
                    "window[{size_ms},{slide_ms};{};{}]",
                    keys.join(","),
                    squash(aggregation)
                )
            }
            OperatorKind::Join {
                left_key,
                right_key,
                window_ms,
            } => {
                let (a, b) = if left_key <= right_key {
                    (left_key, right_key)
                } else {
                    (right_key, left_key)
                };
                format!("join[{}={};{window_ms}]", a.trim(), b.trim())
            }
            OperatorKind::Union => "union".to_string(),
            OperatorKind::NetworkSource { partition, .. } => {
                format!("network_source[{}]", partition.get())
            }
            OperatorKind::NetworkSink { partition, .. } => {
                format!("network_sink[{}]", partition.get())
            }
        }
    }
}

/// Collapse runs of whitespace so `a  >  5` and `a > 5` compare equal.
fn squash(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_predicate(predicate: &str) -> String {
    let unified = predicate.replace(" AND ", " && ").replace(" and ", " && ");
    let mut terms: Vec<String> = unified
        .split("&&")
        .map(squash)
        .filter(|t| !t.is_empty())
        .collect();
    terms.sort();
    terms.join(" && ")
}

/// Placement lifecycle of a single operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorState {
    ToBePlaced,
    Placed,
    /// Pin cleared for re-placement; treated like `ToBePlaced` by strategies.
    ToBeReplaced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalOperator {
    pub id: OperatorId,
    pub kind: OperatorKind,
    pub state: OperatorState,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub parents: Vec<OperatorId>,
    pub children: Vec<OperatorId>,
    pub signature: Option<Signature>,
}

impl LogicalOperator {
    pub fn new(id: OperatorId, kind: OperatorKind) -> Self {
        Self {
            id,
            kind,
            state: OperatorState::ToBePlaced,
            properties: BTreeMap::new(),
            parents: Vec::new(),
            children: Vec::new(),
            signature: None,
        }
    }

    pub fn pinned_node(&self) -> Option<TopologyNodeId> {
        self.properties
            .get(PINNED_NODE_ID)
            .and_then(serde_json::Value::as_u64)
            .map(TopologyNodeId::new)
    }

    pub fn pin(&mut self, node: TopologyNodeId) {
        self.properties
            .insert(PINNED_NODE_ID.to_string(), serde_json::Value::from(node.get()));
    }

    pub fn unpin(&mut self) {
        self.properties.remove(PINNED_NODE_ID);
    }

    pub fn is_placed(&self) -> bool {
        self.state == OperatorState::Placed
    }

    /// True when placement must wait for every child before choosing a node.
    pub fn requires_all_children(&self) -> bool {
        !self.kind.is_source()
            && (self.children.len() > 1
                || self.parents.len() > 1
                || self.kind.is_sink()
                || self.kind.is_binary())
    }

    /// Same id, kind, state and properties, with no edges.
    pub fn detached_copy(&self) -> Self {
        Self {
            parents: Vec::new(),
            children: Vec::new(),
            ..self.clone()
        }
    }

    /// Structural equality used by syntax-based merging: same kind and
    /// parameters plus the same number of children. Sinks are compared by
    /// kind only.
    pub fn syntax_equal(&self, other: &Self) -> bool {
        if self.children.len() != other.children.len() {
            return false;
        }
        match (&self.kind, &other.kind) {
            (OperatorKind::Sink { .. }, OperatorKind::Sink { .. }) => true,
            (a, b) => a == b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_roundtrip() {
        let mut op = LogicalOperator::new(
            OperatorId::new(1),
            OperatorKind::Filter {
                predicate: "v > 5".into(),
            },
        );
        assert_eq!(op.pinned_node(), None);
        op.pin(TopologyNodeId::new(3));
        assert_eq!(op.pinned_node(), Some(TopologyNodeId::new(3)));
        op.unpin();
        assert_eq!(op.pinned_node(), None);
    }

    #[test]
    fn test_conjunction_order_does_not_change_canonical_text() {
        let a = OperatorKind::Filter {
            predicate: "a > 5 && b < 3".into(),
        };
        let b = OperatorKind::Filter {
            predicate: "b <  3 AND a > 5".into(),
        };
        assert_eq!(a.canonical(), b.canonical());
        assert_ne!(a, b);
    }

    #[test]
    fn test_sink_needs_all_children_but_source_does_not() {
        let sink = LogicalOperator::new(OperatorId::new(1), OperatorKind::Sink { name: "s".into() });
        let mut src = LogicalOperator::new(
            OperatorId::new(2),
            OperatorKind::Source {
                logical_source: "a".into(),
            },
        );
        src.parents = vec![OperatorId::new(3), OperatorId::new(4)];
        assert!(sink.requires_all_children());
        assert!(!src.requires_all_children());
    }
}
