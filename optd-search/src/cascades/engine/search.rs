// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The steps of the search shared by the recursive path and the job scheduler.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use tracing::trace;

use super::Engine;
use crate::cascades::context::{
    ContextState, CostContext, CostContextId, OptContextId, OptimizationContext,
};
use crate::cascades::jobs::{Job, JobKey, JobSpec, TransitionGroupJob};
use crate::cascades::memo::{ExprId, ExprInfo, ExprOrigin, GroupId, Memo, TransitionAxis};
use crate::cascades::scheduler::Scheduler;
use crate::cascades::search_stage::{SearchStage, StageResult};
use crate::cascades::stats::{CascadesStats, OptimizerTrace};
use crate::config::{OptimizerProperties, SearchMode};
use crate::cost::{Cost, CostInput, Statistics};
use crate::nodes::{NodeType, OptimizationLevel, PlanNode, PlanNodeOrGroup};
use crate::physical_property::{PhysicalPropertyBuilder, PropertyDimension};
use crate::rules::RuleId;

/// Progress of one optimization request of a group expression: the children optimized so far
/// and what their winners deliver.
#[derive(Clone, Debug)]
pub(crate) struct RequestState<Prop> {
    pub request: usize,
    pub child_idx: usize,
    /// Winner of every child handled so far, `None` for scalar children.
    pub children: Vec<Option<(OptContextId, CostContextId)>>,
    /// Delivered properties of the non-scalar children.
    pub derived: Vec<Prop>,
    /// Total costs of the non-scalar children.
    pub costs: Vec<Cost>,
    pub child_stats: Vec<Option<Statistics>>,
    /// Statistics of the children optimized so far, handed to the next child.
    pub stats_context: Vec<Statistics>,
}

impl<Prop> RequestState<Prop> {
    pub fn new(request: usize) -> Self {
        Self {
            request,
            child_idx: 0,
            children: Vec::new(),
            derived: Vec::new(),
            costs: Vec::new(),
            child_stats: Vec::new(),
            stats_context: Vec::new(),
        }
    }
}

pub(crate) enum RequestStep<Prop> {
    /// The next child group must be optimized under `required`.
    OptimizeChild { group_id: GroupId, required: Prop },
    /// The lower bound of the request exceeds the best plan of the context.
    Pruned,
    /// Every child is optimized.
    Ready,
}

/// One search stage in progress. Shared by reference between all workers of the stage.
pub(crate) struct Search<'a, T: NodeType, P: PhysicalPropertyBuilder<T>> {
    engine: &'a Engine<T, P>,
    stage: &'a SearchStage,
    stage_idx: usize,
}

impl<'a, T: NodeType, P: PhysicalPropertyBuilder<T>> Search<'a, T, P> {
    pub fn new(engine: &'a Engine<T, P>, stage: &'a SearchStage, stage_idx: usize) -> Self {
        Self {
            engine,
            stage,
            stage_idx,
        }
    }

    pub fn memo(&self) -> &'a Memo<T, P> {
        &self.engine.memo
    }

    pub fn property_builder(&self) -> &'a P {
        &self.engine.property_builder
    }

    pub fn properties(&self) -> &'a OptimizerProperties {
        &self.engine.properties
    }

    pub fn stats(&self) -> &'a CascadesStats {
        &self.engine.stats
    }

    pub fn stage_idx(&self) -> usize {
        self.stage_idx
    }

    pub fn is_cancelled(&self) -> bool {
        self.engine.abort.is_aborted()
            || self.stage.is_timed_out()
            || self
                .engine
                .deadline
                .map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Explores the root group, merges the duplicate groups found on the way and derives
    /// statistics for the groups that lack them.
    pub fn explore(&self, root: GroupId) -> Result<()> {
        self.transition(root, TransitionAxis::Exploration)?;
        self.derive_statistics()
    }

    pub fn implement(&self, root: GroupId) -> Result<()> {
        self.transition(root, TransitionAxis::Implementation)?;
        // Implementation rules may introduce groups without logical expressions.
        self.derive_statistics()?;
        if cfg!(debug_assertions) {
            self.memo().verify_integrity();
        }
        Ok(())
    }

    /// Optimizes the root group under `required` and reports the winner of this stage.
    pub fn optimize(&self, root: GroupId, required: &P::Prop) -> Result<Option<StageResult>> {
        let context = match self.properties().search_mode {
            SearchMode::Recursive => self.optimize_group(root, required, &[], None, 0)?,
            SearchMode::Jobs { workers } => {
                let spec = JobSpec::OptimizeChild {
                    group_id: root,
                    required: required.clone(),
                    stats_context: Vec::new(),
                    origin: None,
                };
                Scheduler::new(self, self.job_capacity()).run(spec, workers)?;
                self.memo()
                    .find_context(root, required, self.stage_idx)
                    .map(|(ctx_id, _)| ctx_id)
            }
        };
        let Some(context) = context else {
            return Ok(None);
        };
        Ok(self.memo().context_best(context).map(|cost_context| StageResult {
            context,
            cost_context,
            cost: self.memo().cost_context(cost_context).cost,
        }))
    }

    /// Brings every group reachable from `root` to done on `axis`. Groups merged on the way
    /// are folded and the pass repeats until no merge happens.
    fn transition(&self, root: GroupId, axis: TransitionAxis) -> Result<()> {
        loop {
            let root = self.memo().resolve(root);
            match self.properties().search_mode {
                SearchMode::Recursive => self.transition_group(root, axis, 0)?,
                SearchMode::Jobs { workers } => {
                    let spec = JobSpec::Shared(
                        JobKey::TransitionGroup(root, axis),
                        Job::TransitionGroup(TransitionGroupJob::new(root, axis)),
                    );
                    Scheduler::new(self, self.job_capacity()).run(spec, workers)?;
                }
            }
            let folded = self.memo().merge_duplicates();
            if folded == 0 || self.is_cancelled() {
                return Ok(());
            }
            trace!(event = "memo_merged", stage = self.stage_idx, axis = %axis, folded = folded);
            self.memo().reset_group_states(axis);
        }
    }

    fn job_capacity(&self) -> usize {
        let properties = self.properties();
        properties
            .max_jobs
            .min(self.memo().num_groups().saturating_mul(properties.jobs_per_group))
    }

    pub fn count_group_transition(&self, axis: TransitionAxis) {
        match axis {
            TransitionAxis::Exploration => self.stats().incr_explore_group(),
            TransitionAxis::Implementation => self.stats().incr_implement_group(),
        }
    }

    pub fn count_expr_transition(&self, axis: TransitionAxis) {
        match axis {
            TransitionAxis::Exploration => self.stats().incr_explore_expr(),
            TransitionAxis::Implementation => self.stats().incr_implement_expr(),
        }
    }

    /// Rules to fire on a logical expression: enabled, of the axis' kind, matching the
    /// operator and allowed in this stage.
    pub fn candidate_rules(&self, expr: &ExprInfo<T>, axis: TransitionAxis) -> Vec<RuleId> {
        let kind = axis.rule_kind();
        self.engine
            .rules
            .candidates(expr.typ(), kind)
            .filter(|rule_id| self.stage.allows_rule(*rule_id, kind))
            .filter(|rule_id| !self.memo().is_rule_applied(expr.id, *rule_id))
            .collect()
    }

    /// Fires one rule on every binding of the expression and adds the results to its group.
    /// Returns the number of new expressions.
    pub fn apply_rule(&self, expr_id: ExprId, rule_id: RuleId) -> Result<usize> {
        let memo = self.memo();
        if !memo.mark_rule_applied(expr_id, rule_id) {
            return Ok(0);
        }
        let rule = self.engine.rules.rule(rule_id);
        let mut produced = 0;
        for binding in memo.bindings(expr_id, rule.matcher()) {
            trace!(event = "apply_rule", stage = self.stage_idx, expr_id = %expr_id, rule = rule.name(), binding = %binding);
            for alternative in rule.apply(binding)? {
                let group_id = memo.get_group_id(expr_id);
                let result = memo.insert_with_result(
                    Some(group_id),
                    &alternative,
                    ExprOrigin::rule(rule_id, expr_id),
                )?;
                let Some(produced_expr_id) = result.expr_id.filter(|_| result.is_new) else {
                    continue;
                };
                produced += 1;
                if self.properties().enable_tracing {
                    self.stats().add_trace(OptimizerTrace::ApplyRule {
                        stage: self.stage_idx,
                        group_id: result.group_id,
                        applied_expr_id: expr_id,
                        produced_expr_id,
                        rule_id,
                    });
                }
            }
        }
        self.stats().record_rule(rule_id, produced);
        Ok(produced)
    }

    /// Whether `child` may be optimized in the band `level` on behalf of `parent`, the
    /// expression that requested the context.
    pub fn can_optimize_child(
        &self,
        parent: Option<&ExprInfo<T>>,
        child: &ExprInfo<T>,
        required: &P::Prop,
        level: OptimizationLevel,
    ) -> bool {
        if child.is_logical() || child.level() != level {
            return false;
        }
        if let Some(parent) = parent {
            if parent.id == child.id || !parent.typ().accepts_child(child.typ()) {
                return false;
            }
        }
        self.property_builder()
            .may_optimize(parent.map(|parent| parent.typ()), child.typ(), required)
    }

    /// Advances a request to its next non-scalar child, checking the cost bound before every
    /// child.
    pub fn next_child(
        &self,
        expr: &ExprInfo<T>,
        context: &OptimizationContext<P::Prop>,
        state: &mut RequestState<P::Prop>,
    ) -> RequestStep<P::Prop> {
        let memo = self.memo();
        while let Some(child_group) = expr.children().get(state.child_idx) {
            if !memo.is_scalar_group(*child_group) {
                break;
            }
            state.children.push(None);
            state.child_stats.push(None);
            state.child_idx += 1;
        }
        if let Some(bound) = self.prune_bound(expr, context, state) {
            trace!(event = "prune", stage = self.stage_idx, expr_id = %expr.id, context = %context.id, bound = %bound);
            if memo.record_pruned(expr.id, context.id, state.request, bound) {
                self.stats().incr_pruned();
            }
            return RequestStep::Pruned;
        }
        let Some(child_group) = expr.children().get(state.child_idx) else {
            return RequestStep::Ready;
        };
        let required = self.property_builder().required_child(
            expr.typ(),
            &context.required,
            state.request,
            state.child_idx,
            &state.derived,
        );
        RequestStep::OptimizeChild {
            group_id: *child_group,
            required,
        }
    }

    /// Records the best plan of the child just optimized. Returns false if the child has no
    /// plan under `required`, which ends the request.
    pub fn accept_child(
        &self,
        state: &mut RequestState<P::Prop>,
        group_id: GroupId,
        required: &P::Prop,
    ) -> bool {
        let memo = self.memo();
        let Some((ctx_id, cc_id)) = memo.lookup_best(group_id, required) else {
            return false;
        };
        let cost_context = memo.cost_context(cc_id);
        let Some(derived) = cost_context.derived else {
            return false;
        };
        let stats = memo.group_stats(group_id);
        if let Some(stats) = &stats {
            state.stats_context.push(stats.clone());
        }
        state.children.push(Some((ctx_id, cc_id)));
        state.derived.push(derived);
        state.costs.push(cost_context.cost);
        state.child_stats.push(stats);
        state.child_idx += 1;
        true
    }

    /// Whether the request can already be abandoned: the actual cost of the children done
    /// so far plus lower bounds for the rest exceed the best plan of the context.
    fn prune_bound(
        &self,
        expr: &ExprInfo<T>,
        context: &OptimizationContext<P::Prop>,
        state: &RequestState<P::Prop>,
    ) -> Option<Cost> {
        if self.properties().disable_pruning {
            return None;
        }
        let memo = self.memo();
        let (_, best) = memo.lookup_best(context.group_id, &context.required)?;
        let best_cost = memo.cost_context(best).cost;
        let stats = memo.group_stats(expr.group_id);
        let mut bound = self.engine.cost.lower_bound(expr.typ(), stats.as_ref());
        for cost in &state.costs {
            bound = bound + *cost;
        }
        for child_group in expr.children().iter().skip(state.child_idx) {
            if !memo.is_scalar_group(*child_group) {
                bound = bound + self.group_lower_bound(*child_group);
            }
        }
        (bound > best_cost).then_some(bound)
    }

    /// The cheapest local bound of any physical operator of the group, enforcers excluded.
    fn group_lower_bound(&self, group_id: GroupId) -> Cost {
        let memo = self.memo();
        let stats = memo.group_stats(group_id);
        memo.group_exprs(group_id)
            .into_iter()
            .map(|expr_id| memo.get_expr_memoed(expr_id))
            .filter(|node| !node.typ.is_logical() && !node.typ.is_enforcer())
            .map(|node| self.engine.cost.lower_bound(&node.typ, stats.as_ref()))
            .min()
            .unwrap_or_default()
    }

    /// Enforces the required properties on the expression and costs it if it can deliver them
    /// itself. Returns the cost context kept for the request, if any.
    pub fn finish_request(
        &self,
        expr: &ExprInfo<T>,
        context: &OptimizationContext<P::Prop>,
        state: &RequestState<P::Prop>,
    ) -> Result<Option<CostContextId>> {
        let memo = self.memo();
        let builder = self.property_builder();
        let typ = expr.typ();
        let derived = builder.derive(typ, &state.derived);

        let mut enforcing = Vec::with_capacity(PropertyDimension::ALL.len());
        for dimension in PropertyDimension::ALL {
            let enforcing_type =
                builder.enforcing_type(dimension, typ, &derived, &context.required);
            if enforcing_type.is_prohibited() {
                trace!(event = "enforce_prohibited", expr_id = %expr.id, context = %context.id, dimension = %dimension);
                return Ok(None);
            }
            enforcing.push((dimension, enforcing_type));
        }
        for (dimension, enforcing_type) in &enforcing {
            if enforcing_type.needs_enforcer() {
                self.add_enforcers(expr, *dimension, &context.required, &derived)?;
            }
        }
        if !enforcing
            .iter()
            .all(|(_, enforcing_type)| enforcing_type.can_optimize())
        {
            return Ok(None);
        }
        if !builder.valid_context(typ, &context.required, &state.derived) {
            return Ok(None);
        }

        let children: Vec<Option<OptContextId>> = state
            .children
            .iter()
            .map(|child| child.map(|(ctx_id, _)| ctx_id))
            .collect();
        if memo.cost_context_exists(expr.id, context.id, &children) {
            return Ok(None);
        }
        let stats = memo.group_stats(expr.group_id);
        let children_stats: Vec<Option<&Statistics>> =
            state.child_stats.iter().map(Option::as_ref).collect();
        let input = CostInput {
            node: typ,
            group_id: expr.group_id,
            expr_id: expr.id,
            stats: stats.as_ref(),
            children_stats: &children_stats,
            children_costs: &state.costs,
            stats_context: &context.stats_context,
        };
        let operation_cost = self.engine.cost.compute_operation_cost(&input)?;
        let cost = self.engine.cost.sum(operation_cost, &state.costs);
        let cc_id = memo.insert_cost_context(CostContext {
            id: CostContextId::default(),
            expr_id: expr.id,
            context: context.id,
            request: state.request,
            children,
            cost,
            operation_cost,
            derived: Some(derived),
            stats,
            pruned: false,
        });
        self.stats().incr_cost_context();
        if memo.update_best(context.id, cc_id) {
            trace!(
                event = "decide_winner",
                stage = self.stage_idx,
                group_id = %expr.group_id,
                context = %context.id,
                expr_id = %expr.id,
                cost = %cost
            );
            if self.properties().enable_tracing {
                self.stats().add_trace(OptimizerTrace::DecideWinner {
                    stage: self.stage_idx,
                    group_id: expr.group_id,
                    context: context.id,
                    expr_id: expr.id,
                    cost,
                    children_winner: state
                        .children
                        .iter()
                        .flatten()
                        .map(|(_, cc_id)| memo.cost_context(*cc_id).expr_id)
                        .collect(),
                });
            }
        }
        Ok(Some(cc_id))
    }

    /// Adds the enforcers of one dimension on top of the expression's group.
    fn add_enforcers(
        &self,
        expr: &ExprInfo<T>,
        dimension: PropertyDimension,
        required: &P::Prop,
        derived: &P::Prop,
    ) -> Result<()> {
        for enforcer in self.property_builder().enforce(dimension, required, derived) {
            let node = PlanNode::new(enforcer, vec![PlanNodeOrGroup::Group(expr.group_id)]);
            let result = self.memo().insert_with_result(
                Some(expr.group_id),
                &node.into(),
                ExprOrigin::enforcer(expr.id),
            )?;
            if result.is_new {
                trace!(event = "add_enforcer", group_id = %result.group_id, dimension = %dimension);
                self.stats().incr_enforcer();
            }
        }
        Ok(())
    }

    /// Derives statistics bottom-up for every group that has none yet.
    fn derive_statistics(&self) -> Result<()> {
        let mut visited = HashSet::new();
        for group_id in self.memo().group_ids() {
            self.derive_group_statistics(group_id, &mut visited)?;
        }
        Ok(())
    }

    fn derive_group_statistics(
        &self,
        group_id: GroupId,
        visited: &mut HashSet<GroupId>,
    ) -> Result<Option<Statistics>> {
        let memo = self.memo();
        if let Some(stats) = memo.group_stats(group_id) {
            return Ok(Some(stats));
        }
        if memo.is_scalar_group(group_id) || !visited.insert(memo.resolve(group_id)) {
            return Ok(None);
        }
        let Some(expr) = memo
            .group_exprs(group_id)
            .into_iter()
            .map(|expr_id| memo.expr(expr_id))
            .find(|expr| expr.is_logical())
        else {
            return Ok(None);
        };
        let mut children = Vec::with_capacity(expr.children().len());
        for child in expr.children() {
            children.push(stacker::maybe_grow(128 * 1024, 4 * 1024 * 1024, || {
                self.derive_group_statistics(*child, visited)
            })?);
        }
        let children: Vec<Option<&Statistics>> = children.iter().map(Option::as_ref).collect();
        let stats = self
            .engine
            .cost
            .derive_statistics(expr.typ(), &children, &self.engine.statistics)?;
        memo.set_group_stats(group_id, stats.clone());
        Ok(Some(stats))
    }

    pub fn context_is_optimized(&self, group_id: GroupId, required: &P::Prop) -> bool {
        matches!(
            self.memo().find_context(group_id, required, self.stage_idx),
            Some((_, ContextState::Optimized))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{join, query, scan, TestCatalog, TestNode, TestProps};

    #[test]
    fn expression_never_optimizes_itself() {
        let catalog = TestCatalog::new().table("t1", 10.0).table("t2", 20.0);
        let mut engine = catalog.engine(OptimizerProperties::default(), false);
        let root = engine
            .init(query(join(scan("t1"), scan("t2"))), TestProps::any())
            .unwrap();
        engine.run().unwrap();
        let stage = SearchStage::new();
        let search = Search::new(&engine, &stage, 0);
        let memo = search.memo();
        let exprs: Vec<ExprInfo<TestNode>> = memo
            .group_exprs(root)
            .into_iter()
            .map(|expr_id| memo.expr(expr_id))
            .collect();
        for expr in &exprs {
            for level in OptimizationLevel::SCAN_ORDER {
                for required in [TestProps::any(), TestProps::ordered("t1.a")] {
                    assert!(!search.can_optimize_child(Some(expr), expr, &required, level));
                }
            }
        }
        let hash_join = exprs
            .iter()
            .find(|expr| *expr.typ() == TestNode::HashJoin)
            .unwrap();
        let any = TestProps::any();
        assert!(search.can_optimize_child(None, hash_join, &any, OptimizationLevel::High));
        assert!(!search.can_optimize_child(None, hash_join, &any, OptimizationLevel::Low));
        assert!(exprs
            .iter()
            .filter(|expr| expr.is_logical())
            .all(|expr| !search.can_optimize_child(None, expr, &any, OptimizationLevel::Low)));
    }
}
