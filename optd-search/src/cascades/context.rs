// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use super::{ExprId, GroupId};
use crate::cost::{Cost, Statistics};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct OptContextId(pub usize);

impl Display for OptContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct CostContextId(pub usize);

impl Display for CostContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cc{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextState {
    #[default]
    New,
    Optimizing,
    Optimized,
}

/// A group to optimize together with the requirements it is optimized for. Two contexts are
/// the same memoization entry when group, requirement and stage agree; the statistics context
/// is carried along but not part of the key.
#[derive(Clone, Debug)]
pub struct OptimizationContext<Prop> {
    pub id: OptContextId,
    pub group_id: GroupId,
    pub required: Prop,
    pub stats_context: Vec<Statistics>,
    pub stage: usize,
    pub state: ContextState,
    /// The winner of this context.
    pub best: Option<CostContextId>,
}

/// Outcome of asking the memo for a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextLookup {
    /// The context is new and the caller now owns its optimization.
    Started(OptContextId),
    /// Someone is optimizing the context right now.
    InFlight(OptContextId),
    /// The context is optimized; its winner is final for this stage.
    Optimized(OptContextId),
}

impl ContextLookup {
    pub fn context_id(self) -> OptContextId {
        match self {
            ContextLookup::Started(id)
            | ContextLookup::InFlight(id)
            | ContextLookup::Optimized(id) => id,
        }
    }
}

/// One costed implementation of an optimization context: a group expression, the request it
/// was optimized with and the contexts its children were optimized under.
#[derive(Clone, Debug)]
pub struct CostContext<Prop> {
    pub id: CostContextId,
    pub expr_id: ExprId,
    pub context: OptContextId,
    pub request: usize,
    /// Child contexts in child order, `None` for scalar children.
    pub children: Vec<Option<OptContextId>>,
    /// Total cost of the plan; for a pruned entry, the lower bound that got it pruned.
    pub cost: Cost,
    /// Cost of the operator alone.
    pub operation_cost: Cost,
    pub derived: Option<Prop>,
    pub stats: Option<Statistics>,
    pub pruned: bool,
}

impl<Prop> CostContext<Prop> {
    /// The order of the winners table. A cheaper plan wins; exact ties go to the lower
    /// expression id, then to the lower request. Pruned entries never beat costed ones.
    pub fn is_better_than(&self, other: &CostContext<Prop>) -> bool {
        if self.pruned != other.pruned {
            return !self.pruned;
        }
        (self.cost, self.expr_id, self.request) < (other.cost, other.expr_id, other.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cost_context(expr: usize, request: usize, cost: f64, pruned: bool) -> CostContext<()> {
        CostContext {
            id: CostContextId(0),
            expr_id: ExprId(expr),
            context: OptContextId(0),
            request,
            children: vec![],
            cost: Cost::new(cost),
            operation_cost: Cost::new(cost),
            derived: None,
            stats: None,
            pruned,
        }
    }

    #[test]
    fn cheaper_wins() {
        assert!(cost_context(5, 0, 1.0, false).is_better_than(&cost_context(1, 0, 2.0, false)));
        assert!(!cost_context(1, 0, 2.0, false).is_better_than(&cost_context(5, 0, 1.0, false)));
    }

    #[test]
    fn ties_are_deterministic() {
        let a = cost_context(1, 0, 3.0, false);
        let b = cost_context(2, 0, 3.0, false);
        assert!(a.is_better_than(&b));
        assert!(!b.is_better_than(&a));
        assert!(!a.is_better_than(&a));
        assert!(cost_context(1, 0, 3.0, false).is_better_than(&cost_context(1, 1, 3.0, false)));
    }

    #[test]
    fn pruned_never_wins() {
        assert!(!cost_context(1, 0, 1.0, true).is_better_than(&cost_context(2, 0, 10.0, false)));
        assert!(cost_context(2, 0, 10.0, false).is_better_than(&cost_context(1, 0, 1.0, true)));
    }
}
