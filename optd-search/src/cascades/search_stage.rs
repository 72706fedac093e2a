// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use super::context::{CostContextId, OptContextId};
use crate::cost::Cost;
use crate::rules::{RuleId, RuleKind};

/// The winner a stage found for the root group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageResult {
    pub context: OptContextId,
    pub cost_context: CostContextId,
    pub cost: Cost,
}

/// A bounded phase of the search. Each stage runs explore, implement and optimize over the
/// memo left behind by the previous stage, with its own subset of exploration rules.
/// Implementation rules are never split across stages.
#[derive(Clone, Debug, Default)]
pub struct SearchStage {
    /// Exploration rules allowed in this stage, every registered one when `None`.
    exploration_rules: Option<HashSet<RuleId>>,
    time_budget: Option<Duration>,
    /// The search stops after this stage if it found a plan at most this expensive.
    cost_threshold: Option<Cost>,
    best: Option<StageResult>,
    started_at: Option<Instant>,
}

impl SearchStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default search: one unbounded stage with every exploration rule.
    pub fn default_stages() -> Vec<SearchStage> {
        vec![SearchStage::new()]
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = RuleId>) -> Self {
        self.exploration_rules = Some(rules.into_iter().collect());
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_cost_threshold(mut self, threshold: Cost) -> Self {
        self.cost_threshold = Some(threshold);
        self
    }

    pub fn allows_rule(&self, rule_id: RuleId, kind: RuleKind) -> bool {
        match (kind, &self.exploration_rules) {
            (RuleKind::Implementation, _) | (RuleKind::Exploration, None) => true,
            (RuleKind::Exploration, Some(rules)) => rules.contains(&rule_id),
        }
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget
    }

    pub fn restart_timer(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Whether the stage has used up its time budget. A stage that has not started has not
    /// timed out.
    pub fn is_timed_out(&self) -> bool {
        match (self.time_budget, self.started_at) {
            (Some(budget), Some(started)) => started.elapsed() >= budget,
            _ => false,
        }
    }

    /// Records the stage result if it is cheaper than the one already recorded.
    pub fn set_best(&mut self, result: StageResult) {
        if self.best.map_or(true, |best| result.cost < best.cost) {
            self.best = Some(result);
        }
    }

    pub fn best(&self) -> Option<StageResult> {
        self.best
    }

    pub fn best_cost(&self) -> Option<Cost> {
        self.best.map(|best| best.cost)
    }

    pub fn reached_cost_threshold(&self) -> bool {
        match (self.cost_threshold, self.best) {
            (Some(threshold), Some(best)) => best.cost <= threshold,
            _ => false,
        }
    }

    /// Forgets the result of a previous run so the stage can be reused.
    pub fn reset(&mut self) {
        self.best = None;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_subsets_only_restrict_exploration() {
        let stage = SearchStage::new().with_rules([1, 3]);
        assert!(stage.allows_rule(1, RuleKind::Exploration));
        assert!(!stage.allows_rule(2, RuleKind::Exploration));
        assert!(stage.allows_rule(2, RuleKind::Implementation));
        assert!(SearchStage::new().allows_rule(2, RuleKind::Exploration));
    }

    #[test]
    fn zero_budget_times_out_once_started() {
        let mut stage = SearchStage::new().with_time_budget(Duration::ZERO);
        assert!(!stage.is_timed_out());
        stage.restart_timer();
        assert!(stage.is_timed_out());
    }

    #[test]
    fn best_only_improves() {
        let result = |cost: f64| StageResult {
            context: OptContextId(0),
            cost_context: CostContextId(0),
            cost: Cost::new(cost),
        };
        let mut stage = SearchStage::new().with_cost_threshold(Cost::new(5.0));
        stage.set_best(result(10.0));
        assert!(!stage.reached_cost_threshold());
        stage.set_best(result(20.0));
        assert_eq!(stage.best_cost(), Some(Cost::new(10.0)));
        stage.set_best(result(4.0));
        assert!(stage.reached_cost_threshold());
    }
}
