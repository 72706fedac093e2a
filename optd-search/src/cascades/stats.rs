// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

use itertools::Itertools;
use parking_lot::Mutex;
use serde::Serialize;

use super::context::OptContextId;
use super::memo::{ExprId, GroupId};
use crate::cost::Cost;
use crate::rules::RuleId;

#[derive(Clone, Debug, PartialEq)]
pub enum OptimizerTrace {
    /// A winner decision is made
    DecideWinner {
        stage: usize,
        group_id: GroupId,
        context: OptContextId,
        expr_id: ExprId,
        cost: Cost,
        /// The winners of the children, scalar children excluded.
        children_winner: Vec<ExprId>,
    },
    /// An expression was produced by applying a rule
    ApplyRule {
        stage: usize,
        group_id: GroupId,
        applied_expr_id: ExprId,
        produced_expr_id: ExprId,
        rule_id: RuleId,
    },
}

impl OptimizerTrace {
    pub fn stage(&self) -> usize {
        match self {
            OptimizerTrace::DecideWinner { stage, .. }
            | OptimizerTrace::ApplyRule { stage, .. } => *stage,
        }
    }
}

impl Display for OptimizerTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerTrace::DecideWinner {
                stage,
                group_id,
                context,
                expr_id,
                cost,
                children_winner,
            } => write!(
                f,
                "stage={} decide_winner group_id={} context={} expr_id={} \
                 children_winner_exprs=[{}] cost={}",
                stage,
                group_id,
                context,
                expr_id,
                children_winner.iter().join(","),
                cost
            ),
            OptimizerTrace::ApplyRule {
                stage,
                group_id,
                applied_expr_id,
                produced_expr_id,
                rule_id,
            } => write!(
                f,
                "stage={} apply_rule group_id={} applied_expr_id={} produced_expr_id={} rule_id={}",
                stage, group_id, applied_expr_id, produced_expr_id, rule_id
            ),
        }
    }
}

#[derive(Default)]
struct RuleCounters {
    invocations: AtomicUsize,
    produced: AtomicUsize,
}

/// Counters of one optimization run. Workers bump them concurrently, so every counter is an
/// atomic and traces sit behind a mutex.
#[derive(Default)]
pub struct CascadesStats {
    explore_group_count: AtomicUsize,
    explore_expr_count: AtomicUsize,
    implement_group_count: AtomicUsize,
    implement_expr_count: AtomicUsize,
    optimize_group_count: AtomicUsize,
    optimize_expr_count: AtomicUsize,
    cost_context_count: AtomicUsize,
    pruned_count: AtomicUsize,
    enforcer_count: AtomicUsize,
    job_count: AtomicUsize,
    job_overflow_count: AtomicUsize,
    rules: Vec<RuleCounters>,
    rule_names: Vec<&'static str>,
    trace: Mutex<Vec<OptimizerTrace>>,
}

/// A point-in-time copy of [`CascadesStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub explore_group_count: usize,
    pub explore_expr_count: usize,
    pub implement_group_count: usize,
    pub implement_expr_count: usize,
    pub optimize_group_count: usize,
    pub optimize_expr_count: usize,
    pub cost_context_count: usize,
    pub pruned_count: usize,
    pub enforcer_count: usize,
    pub job_count: usize,
    pub job_overflow_count: usize,
    /// Rule name to (invocations, produced expressions).
    pub rules: BTreeMap<String, (usize, usize)>,
}

macro_rules! counter {
    ($incr:ident, $field:ident) => {
        pub fn $incr(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl CascadesStats {
    pub fn new(rule_names: Vec<&'static str>) -> Self {
        Self {
            rules: rule_names.iter().map(|_| RuleCounters::default()).collect(),
            rule_names,
            ..Default::default()
        }
    }

    counter!(incr_explore_group, explore_group_count);
    counter!(incr_explore_expr, explore_expr_count);
    counter!(incr_implement_group, implement_group_count);
    counter!(incr_implement_expr, implement_expr_count);
    counter!(incr_optimize_group, optimize_group_count);
    counter!(incr_optimize_expr, optimize_expr_count);
    counter!(incr_cost_context, cost_context_count);
    counter!(incr_pruned, pruned_count);
    counter!(incr_enforcer, enforcer_count);
    counter!(incr_job, job_count);
    counter!(incr_job_overflow, job_overflow_count);

    pub fn record_rule(&self, rule_id: RuleId, produced: usize) {
        if let Some(counters) = self.rules.get(rule_id) {
            counters.invocations.fetch_add(1, Ordering::Relaxed);
            counters.produced.fetch_add(produced, Ordering::Relaxed);
        }
    }

    pub fn rule_invocations(&self, rule_id: RuleId) -> usize {
        self.rules
            .get(rule_id)
            .map_or(0, |counters| counters.invocations.load(Ordering::Relaxed))
    }

    pub fn add_trace(&self, trace: OptimizerTrace) {
        self.trace.lock().push(trace);
    }

    pub fn traces(&self) -> Vec<OptimizerTrace> {
        self.trace.lock().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            explore_group_count: load(&self.explore_group_count),
            explore_expr_count: load(&self.explore_expr_count),
            implement_group_count: load(&self.implement_group_count),
            implement_expr_count: load(&self.implement_expr_count),
            optimize_group_count: load(&self.optimize_group_count),
            optimize_expr_count: load(&self.optimize_expr_count),
            cost_context_count: load(&self.cost_context_count),
            pruned_count: load(&self.pruned_count),
            enforcer_count: load(&self.enforcer_count),
            job_count: load(&self.job_count),
            job_overflow_count: load(&self.job_overflow_count),
            rules: self
                .rule_names
                .iter()
                .zip(self.rules.iter())
                .map(|(name, counters)| {
                    (
                        name.to_string(),
                        (load(&counters.invocations), load(&counters.produced)),
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn per_rule_counters() {
        let stats = CascadesStats::new(vec!["join_commute", "scan_impl"]);
        stats.record_rule(0, 2);
        stats.record_rule(0, 1);
        stats.record_rule(1, 1);
        stats.record_rule(7, 1);
        stats.incr_optimize_group();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rules["join_commute"], (2, 3));
        assert_eq!(snapshot.rules["scan_impl"], (1, 1));
        assert_eq!(snapshot.optimize_group_count, 1);
        assert_eq!(stats.rule_invocations(0), 2);
    }

    #[test]
    fn traces_display() {
        let stats = CascadesStats::new(vec![]);
        stats.add_trace(OptimizerTrace::ApplyRule {
            stage: 0,
            group_id: GroupId(1),
            applied_expr_id: ExprId(2),
            produced_expr_id: ExprId(3),
            rule_id: 0,
        });
        let traces = stats.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(
            traces[0].to_string(),
            "stage=0 apply_rule group_id=!1 applied_expr_id=2 produced_expr_id=3 rule_id=0"
        );
    }
}
