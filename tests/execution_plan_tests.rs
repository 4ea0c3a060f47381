//! Global execution plan tests

use std::sync::Arc;

use coplace_core::builder::QueryPlanBuilder;
use coplace_core::config::CoordinatorConfig;
use coplace_core::id::{QueryId, SharedQueryId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use coplace_placement::verify::assert_ledger_matches_sub_plans;
use coplace_placement::{ExecutionNode, GlobalExecutionPlan, QueryPlacementPhase, StructuralTypeInference};
use coplace_planner::SharedQueryPlan;
use coplace_topology::{LinkProperty, Topology};

fn id(v: u64) -> TopologyNodeId {
    TopologyNodeId::new(v)
}

fn two_level() -> Arc<Topology> {
    let mut t = Topology::new();
    t.add_node(id(1), "10.0.0.1", 4000, 8).unwrap();
    t.add_node(id(2), "10.0.0.2", 4000, 8).unwrap();
    t.add_link(id(2), id(1), LinkProperty::default()).unwrap();
    Arc::new(t)
}

fn place(topology: &Arc<Topology>, gep: &mut GlobalExecutionPlan, qid: u64) -> SharedQueryPlan {
    let plan = QueryPlanBuilder::from_source("car")
        .pinned_at(id(2))
        .filter(format!("speed > {qid}"))
        .sink(format!("out-{qid}"))
        .build(QueryId::new(qid));
    let mut shared = SharedQueryPlan::create(plan);
    QueryPlacementPhase::new(
        topology.clone(),
        Arc::new(StructuralTypeInference),
        &CoordinatorConfig::default(),
    )
    .execute(&mut shared, gep)
    .unwrap();
    shared
}

#[test]
fn test_unknown_query_has_no_nodes() {
    let gep = GlobalExecutionPlan::new();
    assert!(gep
        .execution_nodes_by_query_id(SharedQueryId::new(12345))
        .is_empty());
    assert!(gep
        .map_of_topology_node_id_to_occupied_resource(SharedQueryId::new(12345))
        .is_empty());
}

#[test]
fn test_two_queries_share_nodes_but_not_sub_plans() {
    let topology = two_level();
    let mut gep = GlobalExecutionPlan::new();
    let a = place(&topology, &mut gep, 1);
    let b = place(&topology, &mut gep, 2);

    assert_eq!(gep.all_execution_nodes().count(), 2);
    for node in gep.all_execution_nodes() {
        assert!(node.has_query(a.id()));
        assert!(node.has_query(b.id()));
    }
    assert_ledger_matches_sub_plans(&gep, a.id());
    assert_ledger_matches_sub_plans(&gep, b.id());
    // source + filter on 2, sink on 1, for each query
    assert_eq!(topology.available_resources(id(2)), 4);
    assert_eq!(topology.available_resources(id(1)), 6);

    assert!(gep.remove_query_sub_plans(a.id()));
    assert!(gep.execution_nodes_by_query_id(a.id()).is_empty());
    assert_eq!(gep.execution_nodes_by_query_id(b.id()).len(), 2);
    assert!(gep.map_of_topology_node_id_to_occupied_resource(a.id()).is_empty());
    assert!(!gep.remove_query_sub_plans(a.id()));

    assert!(gep.remove_query_sub_plans(b.id()));
    assert!(gep.all_execution_nodes().next().is_none());
}

#[test]
fn test_placed_nodes_are_scheduled_once() {
    let topology = two_level();
    let mut gep = GlobalExecutionPlan::new();
    place(&topology, &mut gep, 1);
    place(&topology, &mut gep, 2);

    let mut scheduled = gep.execution_nodes_to_schedule().to_vec();
    scheduled.sort();
    assert_eq!(scheduled, vec![id(1), id(2)]);

    gep.mark_deployed(&[id(2)]);
    assert_eq!(gep.execution_nodes_to_schedule(), &[id(1)]);
    assert_eq!(gep.take_execution_nodes_to_schedule(), vec![id(1)]);
    assert!(gep.execution_nodes_to_schedule().is_empty());
}

#[test]
fn test_duplicate_node_and_dangling_links_are_rejected() {
    let shared = SharedQueryId::new(77);
    let mut gep = GlobalExecutionPlan::new();
    let mut root = ExecutionNode::new(id(1), "10.0.0.1:4000");
    root.new_sub_plan(shared, &QueryPlan::new(QueryId::new(1)));
    assert!(gep.add_execution_node_as_root(root));
    assert!(!gep.add_execution_node(ExecutionNode::new(id(1), "elsewhere:1")));
    assert_eq!(
        gep.execution_node(id(1)).map(|n| n.rpc_address.as_str()),
        Some("10.0.0.1:4000")
    );

    assert!(!gep.add_execution_node_as_parent_to(id(2), id(1)));
    assert!(gep.add_execution_node(ExecutionNode::new(id(2), "10.0.0.2:4000")));
    assert!(gep.add_execution_node_as_parent_to(id(2), id(1)));
    assert_eq!(gep.execution_node(id(2)).unwrap().parents(), &[id(1)]);
    assert_eq!(gep.execution_node(id(1)).unwrap().children(), &[id(2)]);

    assert!(gep.remove_execution_node(id(1)));
    assert!(gep.root_nodes().is_empty());
    assert!(gep.execution_node(id(2)).unwrap().parents().is_empty());
}
