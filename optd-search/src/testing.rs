// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A small join-ordering world for tests: scans and joins over a catalog of tables, an order
//! property enforced by sorts, and a row-count cost model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cascades::Engine;
use crate::config::{OptimizerProperties, StatisticsConfig};
use crate::cost::{Cost, CostInput, CostModel, Statistics};
use crate::logical_property::{LogicalPropertyBuilder, LogicalPropertyBuilderAny};
use crate::nodes::{ArcPlanNode, NodeType, OptimizationLevel, PlanNode, PlanNodeOrGroup};
use crate::physical_property::{EnforcingType, PhysicalPropertyBuilder, PropertyDimension};
use crate::rules::{Rule, RuleMatcher, RuleRegistry};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestNode {
    Scan(String),
    Join,
    TableScan(String),
    /// Delivers the table ordered on `column`.
    IndexScan { table: String, column: String },
    HashJoin,
    /// Keeps the order of its outer input.
    NestedLoopJoin,
    Sort(String),
}

impl Display for TestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestNode::Scan(table) => write!(f, "Scan({})", table),
            TestNode::Join => write!(f, "Join"),
            TestNode::TableScan(table) => write!(f, "TableScan({})", table),
            TestNode::IndexScan { table, column } => write!(f, "IndexScan({}, {})", table, column),
            TestNode::HashJoin => write!(f, "HashJoin"),
            TestNode::NestedLoopJoin => write!(f, "NestedLoopJoin"),
            TestNode::Sort(column) => write!(f, "Sort({})", column),
        }
    }
}

impl NodeType for TestNode {
    fn is_logical(&self) -> bool {
        matches!(self, TestNode::Scan(_) | TestNode::Join)
    }

    fn is_enforcer(&self) -> bool {
        matches!(self, TestNode::Sort(_))
    }

    fn optimization_level(&self) -> OptimizationLevel {
        match self {
            TestNode::HashJoin => OptimizationLevel::High,
            _ => OptimizationLevel::Low,
        }
    }

    fn accepts_child(&self, child: &Self) -> bool {
        !(self.is_enforcer() && child.is_enforcer())
    }
}

pub fn scan(table: &str) -> PlanNodeOrGroup<TestNode> {
    PlanNode::leaf(TestNode::Scan(table.to_string())).into()
}

pub fn join(
    left: impl Into<PlanNodeOrGroup<TestNode>>,
    right: impl Into<PlanNodeOrGroup<TestNode>>,
) -> PlanNodeOrGroup<TestNode> {
    PlanNode::new(TestNode::Join, vec![left.into(), right.into()]).into()
}

/// Left-deep join of `first` and then every table of `rest`, in order.
pub fn join_tables(first: &str, rest: &[&str]) -> PlanNodeOrGroup<TestNode> {
    rest.iter()
        .fold(scan(first), |acc, table| join(acc, scan(table)))
}

/// Unwraps a tree built with the helpers above.
pub fn query(node: PlanNodeOrGroup<TestNode>) -> ArcPlanNode<TestNode> {
    node.unwrap_plan_node()
        .expect("test queries are materialized trees")
}

/// The tables an expression reads.
pub struct TablesPropertyBuilder;

impl LogicalPropertyBuilder<TestNode> for TablesPropertyBuilder {
    type Prop = BTreeSet<String>;

    fn derive(&self, typ: &TestNode, children: &[&Self::Prop]) -> Self::Prop {
        match typ {
            TestNode::Scan(table) | TestNode::TableScan(table) => BTreeSet::from([table.clone()]),
            TestNode::IndexScan { table, .. } => BTreeSet::from([table.clone()]),
            _ => children.iter().flat_map(|child| child.iter().cloned()).collect(),
        }
    }

    fn property_name(&self) -> &'static str {
        "tables"
    }
}

pub fn logical_property_builders() -> Arc<[Box<dyn LogicalPropertyBuilderAny<TestNode>>]> {
    Arc::from(vec![Box::new(TablesPropertyBuilder) as Box<dyn LogicalPropertyBuilderAny<TestNode>>])
}

/// Required or delivered physical properties. `tables` is only filled when derived, so that
/// an order on a column of a table the plan does not read can be rejected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TestProps {
    pub order: Option<String>,
    pub tables: BTreeSet<String>,
}

impl TestProps {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn ordered(column: &str) -> Self {
        Self {
            order: Some(column.to_string()),
            tables: BTreeSet::new(),
        }
    }
}

fn column_table(column: &str) -> &str {
    column.split('.').next().unwrap_or(column)
}

#[derive(Clone, Default)]
pub struct TestPropertyBuilder {
    /// Operators that must never be costed under an order requirement.
    prohibited: Option<fn(&TestNode) -> bool>,
}

impl TestPropertyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prohibiting(prohibited: fn(&TestNode) -> bool) -> Self {
        Self {
            prohibited: Some(prohibited),
        }
    }
}

impl PhysicalPropertyBuilder<TestNode> for TestPropertyBuilder {
    type Prop = TestProps;

    fn any(&self) -> TestProps {
        TestProps::any()
    }

    fn num_requests(&self, typ: &TestNode) -> usize {
        match typ {
            TestNode::NestedLoopJoin => 2,
            _ => 1,
        }
    }

    fn required_child(
        &self,
        typ: &TestNode,
        required: &TestProps,
        request: usize,
        child_idx: usize,
        _derived_children: &[TestProps],
    ) -> TestProps {
        match typ {
            TestNode::NestedLoopJoin if request == 0 && child_idx == 0 => TestProps {
                order: required.order.clone(),
                tables: BTreeSet::new(),
            },
            _ => TestProps::any(),
        }
    }

    fn derive(&self, typ: &TestNode, children: &[TestProps]) -> TestProps {
        let tables = match typ {
            TestNode::TableScan(table) | TestNode::IndexScan { table, .. } => {
                BTreeSet::from([table.clone()])
            }
            _ => children
                .iter()
                .flat_map(|child| child.tables.iter().cloned())
                .collect(),
        };
        let order = match typ {
            TestNode::IndexScan { column, .. } | TestNode::Sort(column) => Some(column.clone()),
            TestNode::NestedLoopJoin => children.first().and_then(|outer| outer.order.clone()),
            _ => None,
        };
        TestProps { order, tables }
    }

    fn satisfies(&self, derived: &TestProps, required: &TestProps) -> bool {
        required.order.is_none() || derived.order == required.order
    }

    fn enforcing_type(
        &self,
        dimension: PropertyDimension,
        typ: &TestNode,
        derived: &TestProps,
        required: &TestProps,
    ) -> EnforcingType {
        if dimension != PropertyDimension::Order {
            return EnforcingType::Unnecessary;
        }
        let Some(column) = &required.order else {
            return EnforcingType::Unnecessary;
        };
        if self.prohibited.map_or(false, |prohibited| prohibited(typ)) {
            return EnforcingType::Prohibited;
        }
        if self.satisfies(derived, required) {
            return EnforcingType::Unnecessary;
        }
        if !derived.tables.contains(column_table(column)) {
            return EnforcingType::Prohibited;
        }
        EnforcingType::Required
    }

    fn enforce(
        &self,
        dimension: PropertyDimension,
        required: &TestProps,
        _derived: &TestProps,
    ) -> Vec<TestNode> {
        match (&dimension, &required.order) {
            (PropertyDimension::Order, Some(column)) => vec![TestNode::Sort(column.clone())],
            _ => vec![],
        }
    }

    fn check_required(&self, typ: &TestNode, required: &TestProps, _request: usize) -> bool {
        match typ {
            TestNode::Sort(column) => required.order.as_ref() == Some(column),
            _ => true,
        }
    }

    fn property_name(&self) -> &'static str {
        "order"
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TestStatistics {
    pub rows: f64,
}

pub struct TestCostModel {
    rows: BTreeMap<String, f64>,
}

impl TestCostModel {
    pub fn new(rows: BTreeMap<String, f64>) -> Self {
        Self { rows }
    }

    fn rows(stats: Option<&Statistics>) -> f64 {
        stats
            .and_then(|stats| stats.downcast_ref::<TestStatistics>())
            .map_or(1.0, |stats| stats.rows)
    }
}

impl CostModel<TestNode> for TestCostModel {
    fn compute_operation_cost(&self, input: &CostInput<'_, TestNode>) -> Result<Cost> {
        let rows = Self::rows(input.stats);
        let child_rows =
            |idx: usize| Self::rows(input.children_stats.get(idx).copied().flatten());
        let cost = match input.node {
            TestNode::TableScan(_) => rows,
            TestNode::IndexScan { .. } => rows * 1.5 + 100.0,
            TestNode::Sort(_) => rows * rows.max(2.0).log2(),
            TestNode::HashJoin => child_rows(0) + child_rows(1),
            TestNode::NestedLoopJoin => child_rows(0) * child_rows(1),
            TestNode::Scan(_) | TestNode::Join => f64::INFINITY,
        };
        Ok(Cost::new(cost))
    }

    /// Group rows never exceed the rows of any input, so joins cost at least that much.
    fn lower_bound(&self, node: &TestNode, stats: Option<&Statistics>) -> Cost {
        let rows = Self::rows(stats);
        let bound = match node {
            TestNode::TableScan(_) | TestNode::HashJoin | TestNode::NestedLoopJoin => rows,
            TestNode::IndexScan { .. } => rows * 1.5 + 100.0,
            TestNode::Sort(_) => rows * rows.max(2.0).log2(),
            TestNode::Scan(_) | TestNode::Join => 0.0,
        };
        Cost::new(bound)
    }

    fn derive_statistics(
        &self,
        node: &TestNode,
        children: &[Option<&Statistics>],
        _config: &StatisticsConfig,
    ) -> Result<Statistics> {
        let rows = match node {
            TestNode::Scan(table) => self.rows.get(table).copied().unwrap_or(1.0),
            _ => children
                .iter()
                .map(|child| Self::rows(*child))
                .fold(1.0, f64::max),
        };
        Ok(Statistics::new(TestStatistics { rows }))
    }
}

pub struct JoinCommuteRule {
    matcher: RuleMatcher<TestNode>,
}

impl JoinCommuteRule {
    pub fn new() -> Self {
        Self {
            matcher: RuleMatcher::of_variant(&TestNode::Join, 2),
        }
    }
}

impl Rule<TestNode> for JoinCommuteRule {
    fn matcher(&self) -> &RuleMatcher<TestNode> {
        &self.matcher
    }

    fn apply(&self, binding: ArcPlanNode<TestNode>) -> Result<Vec<PlanNodeOrGroup<TestNode>>> {
        Ok(vec![join(binding.child(1).clone(), binding.child(0).clone())])
    }

    fn name(&self) -> &'static str {
        "join_commute"
    }
}

/// (A join B) join C to A join (B join C).
pub struct JoinAssocRule {
    matcher: RuleMatcher<TestNode>,
}

impl JoinAssocRule {
    pub fn new() -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: TestNode::Join,
                children: vec![RuleMatcher::of_variant(&TestNode::Join, 2), RuleMatcher::Any],
            },
        }
    }
}

impl Rule<TestNode> for JoinAssocRule {
    fn matcher(&self) -> &RuleMatcher<TestNode> {
        &self.matcher
    }

    fn apply(&self, binding: ArcPlanNode<TestNode>) -> Result<Vec<PlanNodeOrGroup<TestNode>>> {
        let Some(left) = binding.child(0).unwrap_plan_node() else {
            return Ok(vec![]);
        };
        let (a, b, c) = (left.child(0).clone(), left.child(1).clone(), binding.child(1).clone());
        Ok(vec![join(a, join(b, c))])
    }

    fn name(&self) -> &'static str {
        "join_assoc"
    }
}

/// Maps one logical operator to one physical operator with the same children.
pub struct ImplRule {
    matcher: RuleMatcher<TestNode>,
    name: &'static str,
    implement: fn(&TestNode) -> Vec<TestNode>,
}

impl ImplRule {
    pub fn new(
        pattern: TestNode,
        arity: usize,
        name: &'static str,
        implement: fn(&TestNode) -> Vec<TestNode>,
    ) -> Self {
        Self {
            matcher: RuleMatcher::of_variant(&pattern, arity),
            name,
            implement,
        }
    }

    pub fn table_scan() -> Self {
        Self::new(TestNode::Scan(String::new()), 0, "table_scan", |typ| match typ {
            TestNode::Scan(table) => vec![TestNode::TableScan(table.clone())],
            _ => vec![],
        })
    }

    pub fn hash_join() -> Self {
        Self::new(TestNode::Join, 2, "hash_join", |_| vec![TestNode::HashJoin])
    }

    pub fn nested_loop_join() -> Self {
        Self::new(TestNode::Join, 2, "nested_loop_join", |_| {
            vec![TestNode::NestedLoopJoin]
        })
    }
}

impl Rule<TestNode> for ImplRule {
    fn matcher(&self) -> &RuleMatcher<TestNode> {
        &self.matcher
    }

    fn apply(&self, binding: ArcPlanNode<TestNode>) -> Result<Vec<PlanNodeOrGroup<TestNode>>> {
        Ok((self.implement)(&binding.typ)
            .into_iter()
            .map(|typ| PlanNode::new(typ, binding.children.clone()).into())
            .collect())
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_impl_rule(&self) -> bool {
        true
    }
}

/// Implements a scan through every index of its table.
pub struct IndexScanRule {
    matcher: RuleMatcher<TestNode>,
    indexes: Vec<(String, String)>,
}

impl IndexScanRule {
    pub fn new(indexes: Vec<(String, String)>) -> Self {
        Self {
            matcher: RuleMatcher::of_variant(&TestNode::Scan(String::new()), 0),
            indexes,
        }
    }
}

impl Rule<TestNode> for IndexScanRule {
    fn matcher(&self) -> &RuleMatcher<TestNode> {
        &self.matcher
    }

    fn apply(&self, binding: ArcPlanNode<TestNode>) -> Result<Vec<PlanNodeOrGroup<TestNode>>> {
        let TestNode::Scan(table) = &binding.typ else {
            return Ok(vec![]);
        };
        Ok(self
            .indexes
            .iter()
            .filter(|(indexed, _)| indexed == table)
            .map(|(_, column)| {
                PlanNode::leaf(TestNode::IndexScan {
                    table: table.clone(),
                    column: column.clone(),
                })
                .into()
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "index_scan"
    }

    fn is_impl_rule(&self) -> bool {
        true
    }
}

/// Tables and indexes the test optimizer knows about.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCatalog {
    pub tables: BTreeMap<String, f64>,
    /// (table, column) pairs.
    pub indexes: Vec<(String, String)>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn table(mut self, name: &str, rows: f64) -> Self {
        self.tables.insert(name.to_string(), rows);
        self
    }

    pub fn index(mut self, table: &str, column: &str) -> Self {
        self.indexes.push((table.to_string(), column.to_string()));
        self
    }

    /// Implementation rules, plus the join reordering rules if `explore` is set.
    pub fn rules(&self, explore: bool) -> RuleRegistry<TestNode> {
        let mut rules = RuleRegistry::new();
        if explore {
            rules.register(Arc::new(JoinCommuteRule::new()));
            rules.register(Arc::new(JoinAssocRule::new()));
        }
        rules
            .with_rule(Arc::new(ImplRule::table_scan()))
            .with_rule(Arc::new(IndexScanRule::new(self.indexes.clone())))
            .with_rule(Arc::new(ImplRule::hash_join()))
            .with_rule(Arc::new(ImplRule::nested_loop_join()))
    }

    pub fn engine(
        &self,
        properties: OptimizerProperties,
        explore: bool,
    ) -> Engine<TestNode, TestPropertyBuilder> {
        self.engine_with(properties, explore, TestPropertyBuilder::new())
    }

    pub fn engine_with<P: PhysicalPropertyBuilder<TestNode>>(
        &self,
        properties: OptimizerProperties,
        explore: bool,
        builder: P,
    ) -> Engine<TestNode, P> {
        Engine::new(
            self.rules(explore),
            Arc::new(TestCostModel::new(self.tables.clone())),
            Arc::new(builder),
            logical_property_builders(),
            properties,
        )
    }
}
