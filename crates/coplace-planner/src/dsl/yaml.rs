//! Minimal YAML → QueryPlan parser for *linear* queries, plus topology files.
//!
//! Example:
//! ```yaml
//! query_id: 7
//! placement: BottomUp
//! steps:
//!   - { op: source, name: "cars", pinned_node: 3 }
//!   - { op: filter, predicate: "speed > 50" }
//!   - { op: map, assignments: [ { field: "kmh", expr: "speed * 1.6" } ] }
//!   - { op: sink, name: "fast-cars" }
//! ```

use serde::{Deserialize, Serialize};

use coplace_core::builder::QueryPlanBuilder;
use coplace_core::id::{QueryId, TopologyNodeId};
use coplace_core::operator::OperatorKind;
use coplace_core::plan::{PlacementStrategyType, QueryPlan};
use coplace_topology::{Topology, TopologyDescriptor};

use crate::error::{PlanError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDoc {
    pub query_id: u64,
    #[serde(default)]
    pub placement: Option<PlacementStrategyType>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum Step {
    Source {
        name: String,
        #[serde(default)]
        pinned_node: Option<u64>,
    },
    Filter {
        predicate: String,
    },
    Map {
        assignments: Vec<AssignmentDef>,
    },
    Project {
        columns: Vec<String>,
    },
    Window {
        size_ms: u64,
        #[serde(default)]
        slide_ms: Option<u64>,
        #[serde(default)]
        keys: Vec<String>,
        aggregation: String,
    },
    Sink {
        name: String,
        #[serde(default)]
        pinned_node: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentDef {
    pub field: String,
    pub expr: String,
}

/// Parse a YAML document into a `QueryPlan`.
/// Only linear queries are supported; the first step must be a source.
pub fn parse_yaml_query(yaml_src: &str) -> Result<QueryPlan> {
    parse_yaml_query_with_default(yaml_src, PlacementStrategyType::BottomUp)
}

/// Like [`parse_yaml_query`], using `default_strategy` when the document
/// has no `placement:` key.
pub fn parse_yaml_query_with_default(
    yaml_src: &str,
    default_strategy: PlacementStrategyType,
) -> Result<QueryPlan> {
    let doc: QueryDoc = serde_yaml::from_str(yaml_src).map_err(|e| PlanError::Dsl(e.to_string()))?;
    let mut steps = doc.steps.into_iter();

    let mut builder = match steps.next() {
        Some(Step::Source { name, pinned_node }) => {
            let b = QueryPlanBuilder::from_source(name);
            match pinned_node {
                Some(n) => b.pinned_at(TopologyNodeId::new(n)),
                None => b,
            }
        }
        Some(other) => {
            return Err(PlanError::Dsl(format!(
                "first step must be 'source', got {other:?}"
            )))
        }
        None => return Err(PlanError::Dsl("empty query".into())),
    };

    for step in steps {
        builder = match step {
            Step::Source { .. } => {
                return Err(PlanError::Dsl("multiple sources not supported".into()))
            }
            Step::Filter { predicate } => builder.filter(predicate),
            Step::Map { assignments } => builder.then(OperatorKind::Map {
                assignments: assignments.into_iter().map(|a| (a.field, a.expr)).collect(),
            }),
            Step::Project { columns } => builder.then(OperatorKind::Project { columns }),
            Step::Window {
                size_ms,
                slide_ms,
                keys,
                aggregation,
            } => builder.then(OperatorKind::Window {
                size_ms,
                slide_ms: slide_ms.unwrap_or(size_ms),
                keys,
                aggregation,
            }),
            Step::Sink { name, pinned_node } => {
                let b = builder.sink(name);
                match pinned_node {
                    Some(n) => b.pinned_at(TopologyNodeId::new(n)),
                    None => b,
                }
            }
        };
    }

    builder = builder.placement(doc.placement.unwrap_or(default_strategy));
    let plan = builder.build(QueryId::new(doc.query_id));
    if plan.sink_operators().is_empty() {
        return Err(PlanError::Dsl("query has no sink".into()));
    }
    Ok(plan)
}

/// Parse a YAML topology description (`nodes:` and `links:`).
pub fn parse_yaml_topology(yaml_src: &str) -> Result<Topology> {
    let desc: TopologyDescriptor =
        serde_yaml::from_str(yaml_src).map_err(|e| PlanError::Dsl(e.to_string()))?;
    Ok(Topology::from_descriptor(&desc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_query_parses() {
        let plan = parse_yaml_query(
            r#"
query_id: 7
placement: LowLatency
steps:
  - { op: source, name: "cars", pinned_node: 3 }
  - { op: filter, predicate: "speed > 50" }
  - { op: map, assignments: [ { field: "kmh", expr: "speed * 1.6" } ] }
  - { op: sink, name: "fast" }
"#,
        )
        .expect("parse");
        assert_eq!(plan.query_id, QueryId::new(7));
        assert_eq!(plan.placement_strategy, PlacementStrategyType::LowLatency);
        assert_eq!(plan.len(), 4);
        let source = plan.get(plan.source_operators()[0]).expect("source");
        assert_eq!(source.pinned_node(), Some(TopologyNodeId::new(3)));
    }

    #[test]
    fn test_query_must_start_with_source() {
        let err = parse_yaml_query("query_id: 1\nsteps:\n  - { op: sink, name: x }\n");
        assert!(matches!(err, Err(PlanError::Dsl(_))));
    }

    #[test]
    fn test_topology_parses() {
        let topology = parse_yaml_topology(
            r#"
nodes:
  - { id: 1, slots: 4 }
  - { id: 2, slots: 2, grpc_port: 4100 }
links:
  - { child: 2, parent: 1, bandwidth_mbps: 50 }
"#,
        )
        .expect("topology");
        assert_eq!(topology.root(), Some(TopologyNodeId::new(1)));
        assert_eq!(topology.available_resources(TopologyNodeId::new(2)), 2);
    }
}
