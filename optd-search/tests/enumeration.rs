// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::{BTreeSet, HashSet};

use optd_search::cascades::PlanSamples;
use optd_search::config::{EnumeratorConfig, OptimizerProperties};
use optd_search::error::OptimizerError;
use optd_search::optimizer::Optimizer;
use optd_search::physical_property::{EnforcingType, PhysicalPropertyBuilder, PropertyDimension};
use optd_search::testing::{
    join, query, scan, TestCatalog, TestNode, TestPropertyBuilder, TestProps,
};
use pretty_assertions::assert_eq;

fn catalog() -> TestCatalog {
    TestCatalog::new()
        .table("t1", 1000.0)
        .table("t2", 10.0)
        .index("t1", "t1.a")
        .index("t2", "t2.b")
}

/// Keeps every costed alternative in the plan space.
fn properties() -> OptimizerProperties {
    OptimizerProperties {
        disable_pruning: true,
        ..Default::default()
    }
}

/// Costs plans like the default builder, but refuses any plan delivering `order` once it is
/// extracted, as a builder with a stricter notion of satisfaction would.
struct RejectingOrder {
    inner: TestPropertyBuilder,
    order: &'static str,
}

impl RejectingOrder {
    fn new(order: &'static str) -> Self {
        Self {
            inner: TestPropertyBuilder::new(),
            order,
        }
    }
}

impl PhysicalPropertyBuilder<TestNode> for RejectingOrder {
    type Prop = TestProps;

    fn any(&self) -> TestProps {
        self.inner.any()
    }

    fn num_requests(&self, typ: &TestNode) -> usize {
        self.inner.num_requests(typ)
    }

    fn required_child(
        &self,
        typ: &TestNode,
        required: &TestProps,
        request: usize,
        child_idx: usize,
        derived_children: &[TestProps],
    ) -> TestProps {
        self.inner
            .required_child(typ, required, request, child_idx, derived_children)
    }

    fn derive(&self, typ: &TestNode, children: &[TestProps]) -> TestProps {
        self.inner.derive(typ, children)
    }

    fn satisfies(&self, derived: &TestProps, required: &TestProps) -> bool {
        derived.order.as_deref() != Some(self.order) && self.inner.satisfies(derived, required)
    }

    fn enforcing_type(
        &self,
        dimension: PropertyDimension,
        typ: &TestNode,
        derived: &TestProps,
        required: &TestProps,
    ) -> EnforcingType {
        self.inner.enforcing_type(dimension, typ, derived, required)
    }

    fn enforce(
        &self,
        dimension: PropertyDimension,
        required: &TestProps,
        derived: &TestProps,
    ) -> Vec<TestNode> {
        self.inner.enforce(dimension, required, derived)
    }

    fn check_required(&self, typ: &TestNode, required: &TestProps, request: usize) -> bool {
        self.inner.check_required(typ, required, request)
    }

    fn property_name(&self) -> &'static str {
        self.inner.property_name()
    }
}

#[test]
fn every_rank_decodes_to_a_distinct_plan() {
    let mut engine = catalog().engine(properties(), true);
    let best = engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let count = engine.plan_count().unwrap();
    // Two join orders over two scans of each table.
    assert_eq!(count, 8);
    let mut shapes = HashSet::new();
    for rank in 0..count {
        let plan = engine.unrank(rank).unwrap();
        assert!(plan.cost >= best.cost);
        shapes.insert(plan.shape());
    }
    assert_eq!(shapes.len() as u64, count);

    let err = engine.unrank(count).unwrap_err();
    assert!(OptimizerError::matches(&err, |e| matches!(
        e,
        OptimizerError::PlanIdOutOfRange { .. }
    )));
}

#[test]
fn unranked_costs_match_the_winner() {
    let mut engine = catalog().engine(properties(), false);
    let best = engine
        .optimize(query(scan("t1")), TestProps::ordered("t1.a"))
        .unwrap();
    let count = engine.plan_count().unwrap();
    let costs: Vec<_> = (0..count)
        .map(|rank| engine.unrank(rank).unwrap().cost)
        .collect();
    assert!(costs.contains(&best.cost));
    assert!(costs.iter().all(|cost| *cost >= best.cost));
}

#[test]
fn forced_plan_is_extracted() {
    let mut engine = catalog().engine(properties(), true);
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let first = engine.unrank(0).unwrap();
    let last = engine.unrank(7).unwrap();

    let mut forced = catalog()
        .engine(properties(), true)
        .with_enumerator(EnumeratorConfig::forced_plan(1));
    let plan = forced
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    assert_eq!(plan.shape(), first.shape());

    forced.enumerator_mut().plan_id = 8;
    assert_eq!(forced.extract_plan().unwrap().shape(), last.shape());

    forced.enumerator_mut().plan_id = 9;
    let err = forced.extract_plan().unwrap_err();
    assert!(OptimizerError::matches(&err, |e| *e
        == OptimizerError::InvalidPlanAlternative {
            plan_id: 9,
            count: 8
        }));
}

#[test]
fn sampling_lists_small_plan_spaces() {
    let mut engine = catalog()
        .engine(properties(), true)
        .with_enumerator(EnumeratorConfig::sampling(100));
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let samples = engine.samples().unwrap();
    assert_eq!(samples.plan_space_size, 8);
    assert_eq!(samples.plan_ids(), (1..=8).collect::<Vec<_>>());
    assert!(samples
        .samples
        .iter()
        .all(|sample| sample.cost >= samples.best_cost));
}

#[test]
fn sampling_draws_distinct_plans() {
    let mut engine = catalog()
        .engine(properties(), true)
        .with_enumerator(EnumeratorConfig {
            seed: Some(7),
            ..EnumeratorConfig::sampling(3)
        });
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let samples = engine.samples().unwrap().clone();
    assert_eq!(samples.samples.len(), 3);
    let ids: HashSet<u64> = samples.plan_ids().into_iter().collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| (1..=8).contains(id)));

    // Same seed, same sample.
    let again = engine.sample_plans().unwrap().unwrap();
    assert_eq!(again.plan_ids(), samples.plan_ids());

    let parsed: PlanSamples = serde_json::from_str(&samples.to_json().unwrap()).unwrap();
    assert_eq!(parsed, samples);
}

#[test]
fn cost_threshold_filters_samples() {
    let mut engine = catalog()
        .engine(properties(), true)
        .with_enumerator(EnumeratorConfig {
            seed: Some(11),
            cost_threshold: 1.0,
            ..EnumeratorConfig::sampling(4)
        });
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let samples = engine.samples().unwrap();
    assert!(samples.samples.len() <= 4);
    assert!(samples
        .samples
        .iter()
        .all(|sample| sample.cost <= samples.best_cost));
}

#[test]
fn cost_threshold_applies_when_listing_every_plan() {
    let mut engine = catalog()
        .engine(properties(), true)
        .with_enumerator(EnumeratorConfig {
            cost_threshold: 1.0,
            ..EnumeratorConfig::sampling(100)
        });
    engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    let samples = engine.samples().unwrap();
    assert_eq!(samples.plan_space_size, 8);
    assert_eq!(samples.best_cost, 2020.0);
    // Only the two join orders over table scans cost as much as the winner.
    assert_eq!(samples.samples.len(), 2);
    assert!(samples
        .samples
        .iter()
        .all(|sample| sample.cost <= samples.best_cost));
}

#[test]
fn invalid_plans_are_skipped_when_sampling_valid_plans() {
    let mut engine = catalog()
        .engine_with(properties(), true, RejectingOrder::new("t2.b"))
        .with_enumerator(EnumeratorConfig::sampling(100));
    let best = engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap();
    assert_eq!(best.cost.value(), 2020.0);
    let samples = engine.samples().unwrap();
    assert_eq!(samples.plan_space_size, 8);
    // Half of the plans read t2 through its index.
    assert_eq!(samples.samples.len(), 4);
    let valid: BTreeSet<u64> = samples.plan_ids().into_iter().collect();
    for plan_id in 1..=8u64 {
        assert_eq!(engine.unrank(plan_id - 1).is_ok(), valid.contains(&plan_id));
    }
}

#[test]
fn invalid_plans_fail_sampling_unless_skipped() {
    let mut engine = catalog()
        .engine_with(properties(), true, RejectingOrder::new("t2.b"))
        .with_enumerator(EnumeratorConfig {
            sample_valid_plans: false,
            ..EnumeratorConfig::sampling(100)
        });
    let err = engine
        .optimize(query(join(scan("t1"), scan("t2"))), TestProps::any())
        .unwrap_err();
    assert!(OptimizerError::matches(&err, |e| matches!(
        e,
        OptimizerError::UnsatisfiedRequiredProperties { .. }
    )));
    assert_eq!(engine.samples(), None);
}

#[test]
fn enumeration_requires_a_query() {
    let mut engine = catalog().engine(properties(), true);
    let err = engine.plan_count().unwrap_err();
    assert!(OptimizerError::matches(&err, |e| *e == OptimizerError::NotInitialized));
}
