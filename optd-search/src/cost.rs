// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::any::Any;
use std::fmt::{Debug, Display};
use std::ops::Add;
use std::sync::Arc;

use anyhow::Result;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::cascades::{ExprId, GroupId};
use crate::config::StatisticsConfig;
use crate::nodes::NodeType;

/// A totally ordered cost. The engine only compares and adds costs, the unit is up to the model.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(pub OrderedFloat<f64>);

impl Cost {
    pub fn new(value: f64) -> Self {
        Self(OrderedFloat(value))
    }

    pub fn zero() -> Self {
        Self::new(0.0)
    }

    pub fn infinite() -> Self {
        Self::new(f64::INFINITY)
    }

    pub fn value(&self) -> f64 {
        self.0 .0
    }

    pub fn is_infinite(&self) -> bool {
        self.value().is_infinite()
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0 + rhs.0)
    }
}

impl Debug for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl Display for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.value())
    }
}

/// Opaque statistics attached to a group. Only the cost model knows what is inside.
#[derive(Clone)]
pub struct Statistics(pub Arc<dyn Any + Send + Sync>);

impl Statistics {
    pub fn new<S: Any + Send + Sync>(stats: S) -> Self {
        Self(Arc::new(stats))
    }

    pub fn downcast_ref<S: Any>(&self) -> Option<&S> {
        self.0.downcast_ref::<S>()
    }
}

impl Debug for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Statistics")
    }
}

/// Everything the cost model may look at when costing one operator of a candidate plan.
pub struct CostInput<'a, T: NodeType> {
    pub node: &'a T,
    pub group_id: GroupId,
    pub expr_id: ExprId,
    /// Statistics of the group the operator belongs to.
    pub stats: Option<&'a Statistics>,
    /// Statistics of the optimized children, `None` for scalar children.
    pub children_stats: &'a [Option<&'a Statistics>],
    /// Total costs of the chosen child plans, scalar children excluded.
    pub children_costs: &'a [Cost],
    /// Statistics of the inputs optimized before this operator, in order.
    pub stats_context: &'a [Statistics],
}

pub trait CostModel<T: NodeType>: 'static + Send + Sync {
    /// Cost of the operator alone, excluding its inputs.
    fn compute_operation_cost(&self, input: &CostInput<'_, T>) -> Result<Cost>;

    /// A lower bound on the operator's own cost, computed from the statistics of its group
    /// alone. Used for pruning; the default never prunes.
    fn lower_bound(&self, _node: &T, _stats: Option<&Statistics>) -> Cost {
        Cost::zero()
    }

    /// Derives the statistics of a logical operator from the statistics of its children.
    fn derive_statistics(
        &self,
        node: &T,
        children: &[Option<&Statistics>],
        config: &StatisticsConfig,
    ) -> Result<Statistics>;

    fn explain(&self, cost: &Cost) -> String {
        format!("{}", cost)
    }

    fn sum(&self, operation_cost: Cost, inputs_cost: &[Cost]) -> Cost {
        inputs_cost
            .iter()
            .fold(operation_cost, |total, cost| total + *cost)
    }
}
