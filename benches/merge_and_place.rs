use std::sync::Arc;

use coplace_core::builder::QueryPlanBuilder;
use coplace_core::config::{CoordinatorConfig, QueryMergerRuleType};
use coplace_core::id::{QueryId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use coplace_placement::{GlobalExecutionPlan, QueryPlacementPhase, StructuralTypeInference};
use coplace_planner::{merger_rule_for, GlobalQueryPlan, SharedQueryPlan};
use coplace_topology::{LinkProperty, Topology};
use criterion::{criterion_group, criterion_main, Criterion};

fn make_queries(count: u64) -> Vec<QueryPlan> {
    (1..=count)
        .map(|i| {
            QueryPlanBuilder::from_source(format!("sensor-{}", i % 4))
                .pinned_at(TopologyNodeId::new(10 + i % 4))
                .filter(format!("value > {}", i % 8))
                .map(&[("scaled", "value * 10")])
                .sink(format!("out-{i}"))
                .build(QueryId::new(i))
        })
        .collect()
}

/// Root 1, four mid nodes 2..=5, one leaf 10..=13 under each mid node.
fn make_topology() -> Topology {
    let mut t = Topology::new();
    t.add_node(TopologyNodeId::new(1), "10.0.0.1", 4000, 4096).unwrap();
    for m in 2..=5u64 {
        t.add_node(TopologyNodeId::new(m), "10.0.1.1", 4000 + m as u16, 4096)
            .unwrap();
        t.add_link(TopologyNodeId::new(m), TopologyNodeId::new(1), LinkProperty::default())
            .unwrap();
        let leaf = 8 + m;
        t.add_node(TopologyNodeId::new(leaf), "10.0.2.1", 4000 + leaf as u16, 4096)
            .unwrap();
        t.add_link(TopologyNodeId::new(leaf), TopologyNodeId::new(m), LinkProperty::default())
            .unwrap();
    }
    t
}

fn bench_merge(c: &mut Criterion) {
    let queries = make_queries(200);
    for rule in [
        QueryMergerRuleType::SyntaxBasedCompleteQueryMergerRule,
        QueryMergerRuleType::SyntaxBasedPartialQueryMergerRule,
        QueryMergerRuleType::HashSignatureBasedPartialQueryMergerRule,
    ] {
        let merger = merger_rule_for(rule);
        c.bench_function(&format!("merge_200/{}", merger.name()), |b| {
            b.iter(|| {
                let mut global = GlobalQueryPlan::new();
                for q in &queries {
                    global.add_query_plan(q.clone()).unwrap();
                }
                merger.apply(&mut global).unwrap();
            })
        });
    }
}

fn bench_bottom_up_placement(c: &mut Criterion) {
    let queries = make_queries(32);
    c.bench_function("place_32_bottom_up", |b| {
        b.iter(|| {
            let topology = Arc::new(make_topology());
            let phase = QueryPlacementPhase::new(
                topology,
                Arc::new(StructuralTypeInference),
                &CoordinatorConfig::default(),
            );
            let mut gep = GlobalExecutionPlan::new();
            for q in &queries {
                let mut shared = SharedQueryPlan::create(q.clone());
                phase.execute(&mut shared, &mut gep).unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_merge, bench_bottom_up_placement);
criterion_main!(benches);
