// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use optd_search::cascades::{Engine, OptimizerTrace, SearchStage};
use optd_search::config::{OptimizerProperties, StatisticsConfig};
use optd_search::cost::{Cost, CostInput, CostModel, Statistics};
use optd_search::error::OptimizerError;
use optd_search::nodes::NodeType;
use optd_search::optimizer::Optimizer;
use optd_search::testing::{
    join, join_tables, logical_property_builders, query, scan, TestCatalog, TestCostModel,
    TestNode, TestPropertyBuilder, TestProps, TestStatistics,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn catalog() -> TestCatalog {
    TestCatalog::new()
        .table("t1", 1000.0)
        .table("t2", 10.0)
        .table("t3", 200.0)
        .table("t4", 50.0)
        .index("t1", "t1.a")
}

fn search_modes() -> Vec<OptimizerProperties> {
    vec![
        OptimizerProperties::default(),
        OptimizerProperties::with_workers(1),
        OptimizerProperties::with_workers(4),
    ]
}

#[test]
fn optimize_single_scan() {
    init_tracing();
    for properties in search_modes() {
        let mut engine = catalog().engine(properties, true);
        let plan = engine.optimize(query(scan("t2")), TestProps::any()).unwrap();
        assert_eq!(plan.shape(), "(TableScan(t2))");
        assert_eq!(plan.cost, Cost::new(10.0));
        assert!(plan.is_physical());
    }
}

#[test]
fn index_scan_beats_sort_on_large_tables() {
    init_tracing();
    for properties in search_modes() {
        let mut engine = catalog().engine(properties, false);
        let plan = engine
            .optimize(query(scan("t1")), TestProps::ordered("t1.a"))
            .unwrap();
        assert_eq!(plan.shape(), "(IndexScan(t1, t1.a))");
        assert_eq!(plan.cost, Cost::new(1600.0));
    }
}

#[test]
fn sort_beats_index_scan_on_small_tables() {
    init_tracing();
    let catalog = TestCatalog::new().table("t1", 10.0).index("t1", "t1.a");
    for properties in search_modes() {
        let mut engine = catalog.engine(properties, false);
        let plan = engine
            .optimize(query(scan("t1")), TestProps::ordered("t1.a"))
            .unwrap();
        // The sort sits on its own group, optimized without the order it provides.
        assert_eq!(plan.shape(), "(Sort(t1.a) (TableScan(t1)))");
        assert_eq!(plan.group_id, plan.child(0).group_id);
        assert_eq!(plan.properties.order.as_deref(), Some("t1.a"));
        assert!(engine.stats().snapshot().enforcer_count >= 1);
    }
}

#[test]
fn prohibited_candidates_are_never_enforced() {
    init_tracing();
    let catalog = TestCatalog::new().table("t1", 10.0);
    let builder = TestPropertyBuilder::prohibiting(|typ| matches!(typ, TestNode::TableScan(_)));
    let mut engine = catalog.engine_with(OptimizerProperties::default(), false, builder);
    let err = engine
        .optimize(query(scan("t1")), TestProps::ordered("t1.a"))
        .unwrap_err();
    assert!(OptimizerError::matches(&err, |e| *e == OptimizerError::NoPlanFound));
    assert_eq!(engine.stats().snapshot().enforcer_count, 0);
    assert!(engine
        .memo()
        .group_exprs(engine.root_group().unwrap())
        .into_iter()
        .all(|expr_id| !engine.memo().expr(expr_id).typ().is_enforcer()));

    // An order on a table the plan does not read cannot be enforced either.
    let mut engine = catalog.engine(OptimizerProperties::default(), false);
    let err = engine
        .optimize(query(scan("t1")), TestProps::ordered("t9.x"))
        .unwrap_err();
    assert!(OptimizerError::matches(&err, |e| *e == OptimizerError::NoPlanFound));
}

#[test]
fn ordered_join_delivers_order() {
    init_tracing();
    for properties in search_modes() {
        let mut engine = catalog().engine(properties, true);
        let plan = engine
            .optimize(query(join(scan("t1"), scan("t2"))), TestProps::ordered("t1.a"))
            .unwrap();
        assert_eq!(plan.properties.order.as_deref(), Some("t1.a"));
        for node in plan.nodes() {
            if let TestNode::Sort(_) = node.typ {
                assert!(!node.child(0).typ.is_enforcer());
            }
        }
    }
}

#[test]
fn join_reordering_explores_alternatives() {
    init_tracing();
    let mut engine = catalog().engine(OptimizerProperties::default(), true);
    let plan = engine
        .optimize(query(join_tables("t1", &["t2", "t3"])), TestProps::any())
        .unwrap();
    let root = engine.root_group().unwrap();
    let joins = engine
        .memo()
        .group_exprs(root)
        .into_iter()
        .filter(|expr_id| *engine.memo().expr(*expr_id).typ() == TestNode::Join)
        .count();
    assert!(joins >= 2, "expected join alternatives, found {}", joins);
    assert!(engine.plan_count().unwrap() > 1);
    assert_eq!(plan.typ, TestNode::HashJoin);
    engine.memo().verify_integrity();
}

#[test]
fn without_exploration_the_input_order_is_kept() {
    init_tracing();
    let mut engine = catalog().engine(OptimizerProperties::default(), false);
    let plan = engine
        .optimize(query(join_tables("t1", &["t2", "t3"])), TestProps::any())
        .unwrap();
    assert_eq!(
        plan.shape(),
        "(HashJoin (HashJoin (TableScan(t1)) (TableScan(t2))) (TableScan(t3)))"
    );
    // The join and its two implementations.
    let root = engine.root_group().unwrap();
    assert_eq!(engine.memo().group_exprs(root).len(), 3);
}

#[test]
fn search_modes_agree_on_cost() {
    init_tracing();
    let costs: Vec<Cost> = search_modes()
        .into_iter()
        .map(|properties| {
            let mut engine = catalog().engine(properties, true);
            engine
                .optimize(
                    query(join_tables("t1", &["t2", "t3", "t4"])),
                    TestProps::any(),
                )
                .unwrap()
                .cost
        })
        .collect();
    assert_eq!(costs[0], costs[1]);
    assert_eq!(costs[0], costs[2]);
}

#[test]
fn pruning_does_not_change_the_winner() {
    init_tracing();
    let optimize = |disable_pruning: bool| {
        let properties = OptimizerProperties {
            disable_pruning,
            ..Default::default()
        };
        let mut engine = catalog().engine(properties, true);
        let plan = engine
            .optimize(query(join_tables("t1", &["t2", "t3"])), TestProps::ordered("t1.a"))
            .unwrap();
        (plan.cost, engine.stats().snapshot())
    };
    let (pruned_cost, pruned_stats) = optimize(false);
    let (full_cost, full_stats) = optimize(true);
    assert_eq!(pruned_cost, full_cost);
    assert_eq!(full_stats.pruned_count, 0);
    assert!(pruned_stats.cost_context_count <= full_stats.cost_context_count);
}

#[test]
fn sort_that_cannot_beat_the_index_is_pruned() {
    init_tracing();
    for properties in search_modes() {
        let optimize = |disable_pruning: bool| {
            let properties = OptimizerProperties {
                disable_pruning,
                ..properties.clone()
            };
            let mut engine = catalog().engine(properties, false);
            let plan = engine
                .optimize(query(scan("t1")), TestProps::ordered("t1.a"))
                .unwrap();
            let count = engine.plan_count().unwrap();
            (plan.shape(), plan.cost, count, engine.stats().snapshot())
        };
        let (pruned_shape, pruned_cost, pruned_count, pruned_stats) = optimize(false);
        let (full_shape, full_cost, full_count, full_stats) = optimize(true);
        assert_eq!(pruned_shape, "(IndexScan(t1, t1.a))");
        assert_eq!(pruned_shape, full_shape);
        assert_eq!(pruned_cost, full_cost);

        // Sorting 1000 rows costs more than the index scan before its input is even read.
        assert!(pruned_stats.pruned_count > 0);
        assert_eq!(full_stats.pruned_count, 0);
        assert_eq!(pruned_count, 1);
        // The index scan, and the sort over either scan.
        assert_eq!(full_count, 3);
        assert!(pruned_stats.cost_context_count < full_stats.cost_context_count);
    }
}

/// Wraps the test cost model and records the input statistics every operator was costed with.
struct RecordingCostModel {
    inner: TestCostModel,
    seen: Mutex<Vec<(TestNode, Vec<f64>)>>,
}

impl RecordingCostModel {
    fn rows_seen(&self, node: &TestNode) -> Vec<Vec<f64>> {
        self.seen
            .lock()
            .iter()
            .filter(|(seen, _)| seen == node)
            .map(|(_, rows)| rows.clone())
            .collect()
    }
}

impl CostModel<TestNode> for RecordingCostModel {
    fn compute_operation_cost(&self, input: &CostInput<'_, TestNode>) -> Result<Cost> {
        let rows = input
            .stats_context
            .iter()
            .filter_map(|stats| stats.downcast_ref::<TestStatistics>())
            .map(|stats| stats.rows)
            .collect();
        self.seen.lock().push((input.node.clone(), rows));
        self.inner.compute_operation_cost(input)
    }

    fn lower_bound(&self, node: &TestNode, stats: Option<&Statistics>) -> Cost {
        self.inner.lower_bound(node, stats)
    }

    fn derive_statistics(
        &self,
        node: &TestNode,
        children: &[Option<&Statistics>],
        config: &StatisticsConfig,
    ) -> Result<Statistics> {
        self.inner.derive_statistics(node, children, config)
    }
}

#[test]
fn later_join_inputs_see_earlier_input_statistics() {
    init_tracing();
    let catalog = catalog();
    for properties in [
        OptimizerProperties::default(),
        OptimizerProperties::with_workers(1),
    ] {
        let cost = Arc::new(RecordingCostModel {
            inner: TestCostModel::new(catalog.tables.clone()),
            seen: Mutex::new(Vec::new()),
        });
        let mut engine = Engine::new(
            catalog.rules(false),
            cost.clone(),
            Arc::new(TestPropertyBuilder::new()),
            logical_property_builders(),
            properties,
        );
        let plan = engine
            .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
            .unwrap();
        assert_eq!(plan.shape(), "(HashJoin (TableScan(t1)) (TableScan(t2)))");

        let outer = cost.rows_seen(&TestNode::TableScan("t1".into()));
        let inner = cost.rows_seen(&TestNode::TableScan("t2".into()));
        assert!(!outer.is_empty());
        assert!(!inner.is_empty());
        assert!(outer.iter().all(|rows| rows.is_empty()));
        assert!(inner.iter().all(|rows| *rows == vec![1000.0]));
        assert!(cost
            .rows_seen(&TestNode::HashJoin)
            .iter()
            .all(|rows| rows.is_empty()));
    }
}

#[test]
fn zero_budget_stage_yields_no_plan() {
    init_tracing();
    let mut engine = catalog()
        .engine(OptimizerProperties::default(), true)
        .with_stages(vec![SearchStage::new().with_time_budget(Duration::ZERO)]);
    let err = engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap_err();
    assert!(OptimizerError::matches(&err, |e| *e == OptimizerError::NoPlanFound));
    assert_eq!(engine.stages()[0].best(), None);

    // A following unbounded stage still finds the plan.
    engine.set_stages(vec![
        SearchStage::new().with_time_budget(Duration::ZERO),
        SearchStage::new(),
    ]);
    let plan = engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    assert_eq!(engine.stages()[0].best(), None);
    assert_eq!(engine.stages()[1].best_cost(), Some(plan.cost));
}

#[test]
fn cost_threshold_stops_the_search() {
    init_tracing();
    let mut engine = catalog().engine(OptimizerProperties::default(), true);
    let commute = engine.rules().find("join_commute").unwrap();
    engine.set_stages(vec![
        SearchStage::new()
            .with_rules(vec![])
            .with_cost_threshold(Cost::new(1e9)),
        SearchStage::new(),
    ]);
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    assert!(engine.stages()[0].reached_cost_threshold());
    assert_eq!(engine.stages()[1].best(), None);
    assert_eq!(engine.stats().rule_invocations(commute), 0);

    engine.set_stages(vec![
        SearchStage::new()
            .with_rules(vec![])
            .with_cost_threshold(Cost::new(1.0)),
        SearchStage::new(),
    ]);
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    assert!(engine.stages()[1].best().is_some());
    assert!(engine.stats().rule_invocations(commute) > 0);
}

#[test]
fn disabled_rules_are_not_fired() {
    init_tracing();
    let mut engine = catalog().engine(OptimizerProperties::default(), true);
    let commute = engine.rules().find("join_commute").unwrap();
    let assoc = engine.rules().find("join_assoc").unwrap();
    engine.rules_mut().disable(commute);
    engine.rules_mut().disable(assoc);
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let snapshot = engine.stats().snapshot();
    assert_eq!(snapshot.rules["join_commute"], (0, 0));
    assert!(snapshot.rules["hash_join"].0 >= 1);
}

#[test]
fn recursion_limit_is_reported() {
    init_tracing();
    let properties = OptimizerProperties {
        max_recursion_depth: 1,
        ..Default::default()
    };
    let mut engine = catalog().engine(properties, true);
    let err = engine
        .optimize(query(join_tables("t1", &["t2", "t3"])), TestProps::any())
        .unwrap_err();
    assert!(OptimizerError::matches(&err, |e| matches!(
        e,
        OptimizerError::RecursionLimitExceeded { .. }
    )));
}

#[test]
fn aborted_runs_are_cancelled() {
    init_tracing();
    let mut engine = catalog().engine(OptimizerProperties::default(), true);
    engine
        .init(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    engine.abort_handle().abort();
    let err = engine.run().unwrap_err();
    assert!(OptimizerError::matches(&err, |e| *e == OptimizerError::Cancelled));

    // A fresh optimization clears the flag.
    let plan = engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    assert_eq!(plan.typ, TestNode::HashJoin);
}

#[test]
fn run_requires_init() {
    let mut engine = catalog().engine(OptimizerProperties::default(), true);
    let err = engine.run().unwrap_err();
    assert!(OptimizerError::matches(&err, |e| *e == OptimizerError::NotInitialized));
}

#[test]
fn job_pool_grows_when_exhausted() {
    init_tracing();
    let properties = OptimizerProperties {
        max_jobs: 1,
        ..OptimizerProperties::with_workers(2)
    };
    let mut engine = catalog().engine(properties, true);
    engine
        .optimize(query(join_tables("t1", &["t2", "t3"])), TestProps::any())
        .unwrap();
    let snapshot = engine.stats().snapshot();
    assert!(snapshot.job_count > 1);
    assert!(snapshot.job_overflow_count > 0);
}

#[test]
fn traces_record_winners() {
    init_tracing();
    let properties = OptimizerProperties {
        enable_tracing: true,
        ..Default::default()
    };
    let mut engine = catalog().engine(properties, true);
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let traces = engine.stats().traces();
    assert!(traces
        .iter()
        .any(|trace| matches!(trace, OptimizerTrace::DecideWinner { .. })));
    assert!(traces
        .iter()
        .any(|trace| matches!(trace, OptimizerTrace::ApplyRule { .. })));
    let dump = engine.memo().to_string();
    assert!(dump.contains("HashJoin"));
}

#[test]
fn catalog_from_json() {
    init_tracing();
    let catalog = TestCatalog::from_json(
        r#"{ "tables": { "t1": 10.0, "t2": 20.0 }, "indexes": [["t1", "t1.a"]] }"#,
    )
    .unwrap();
    assert_eq!(catalog.tables.len(), 2);
    let mut engine = catalog.engine(OptimizerProperties::default(), true);
    let plan = engine
        .optimize(query(scan("t1")), TestProps::ordered("t1.a"))
        .unwrap();
    assert_eq!(plan.shape(), "(Sort(t1.a) (TableScan(t1)))");
}
