// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Plan extraction from the memo: the winner, a ranked plan, or a sample of the plan space.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use super::Engine;
use crate::cascades::context::CostContextId;
use crate::cascades::memo::GroupId;
use crate::cascades::tree_map::{PlanChoice, PlanLink, PlanSample, PlanSamples, TreeMap};
use crate::cascades::PhysicalPlan;
use crate::cost::{Cost, CostInput, Statistics};
use crate::error::OptimizerError;
use crate::nodes::NodeType;
use crate::physical_property::PhysicalPropertyBuilder;

/// Random draws per requested sample before sampling gives up.
const SAMPLING_MAX_ITERS: u64 = 30;

impl<T: NodeType, P: PhysicalPropertyBuilder<T>> Engine<T, P> {
    fn root_or_err(&self) -> Result<(GroupId, P::Prop)> {
        match &self.root {
            Some((group_id, required)) => Ok((self.memo.resolve(*group_id), required.clone())),
            None => bail!(OptimizerError::NotInitialized),
        }
    }

    /// The plan the optimization produced: the winner of the root group, or the forced plan
    /// alternative when enumeration asks for one.
    pub fn extract_plan(&mut self) -> Result<PhysicalPlan<T, P::Prop>> {
        let (root, required) = self.root_or_err()?;
        let plan_id = self.enumerator.plan_id;
        if self.enumerator.enumerate && plan_id > 0 {
            let count = self.plan_count()?;
            if plan_id > count {
                bail!(OptimizerError::InvalidPlanAlternative { plan_id, count });
            }
            debug!(event = "extract_forced_plan", plan_id = plan_id, count = count);
            return self.unrank(plan_id - 1);
        }
        let Some((_, cost_context)) = self.memo.lookup_best(root, &required) else {
            bail!(OptimizerError::NoPlanFound);
        };
        self.materialize_winner(cost_context)
    }

    fn materialize_winner(&self, cc_id: CostContextId) -> Result<PhysicalPlan<T, P::Prop>> {
        let cost_context = self.memo.cost_context(cc_id);
        let expr = self.memo.expr(cost_context.expr_id);
        let mut children = Vec::with_capacity(expr.children().len());
        for (idx, child_group) in expr.children().iter().enumerate() {
            let child = match cost_context.children.get(idx).copied().flatten() {
                Some(child_ctx) => {
                    let Some(best) = self.memo.context_best(child_ctx) else {
                        bail!(OptimizerError::NoPlanFound);
                    };
                    stacker::maybe_grow(128 * 1024, 4 * 1024 * 1024, || {
                        self.materialize_winner(best)
                    })?
                }
                None => self.materialize_scalar(*child_group)?,
            };
            children.push(Arc::new(child));
        }
        Ok(PhysicalPlan {
            typ: expr.typ().clone(),
            children,
            group_id: expr.group_id,
            expr_id: expr.id,
            cost: cost_context.cost,
            properties: cost_context
                .derived
                .unwrap_or_else(|| self.property_builder.any()),
        })
    }

    /// Scalar subtrees are not optimized; the first expression of each scalar group stands
    /// for it.
    fn materialize_scalar(&self, group_id: GroupId) -> Result<PhysicalPlan<T, P::Prop>> {
        let Some(expr_id) = self.memo.group_expr_at(group_id, 0) else {
            bail!(OptimizerError::NoPlanFound);
        };
        let expr = self.memo.expr(expr_id);
        let mut children = Vec::with_capacity(expr.children().len());
        for child in expr.children() {
            children.push(Arc::new(self.materialize_scalar(*child)?));
        }
        Ok(PhysicalPlan {
            typ: expr.typ().clone(),
            children,
            group_id: expr.group_id,
            expr_id,
            cost: Cost::zero(),
            properties: self.property_builder.any(),
        })
    }

    /// The tree map over every costed plan of the root group, built on first use after a run.
    pub fn tree_map(&mut self) -> Result<&TreeMap<P::Prop>> {
        let (root, required) = self.root_or_err()?;
        let memo = &self.memo;
        Ok(self.tree_map.get_or_insert_with(|| {
            let tree_map = TreeMap::build(root, required, |group_id, required| {
                memo.implementations(group_id, required)
                    .into_iter()
                    .map(|cost_context| PlanLink {
                        expr_id: cost_context.expr_id,
                        cost_context: cost_context.id,
                        children: cost_context
                            .children
                            .iter()
                            .map(|child| {
                                child.map(|ctx_id| {
                                    let context = memo.context(ctx_id);
                                    (context.group_id, context.required)
                                })
                            })
                            .collect(),
                    })
                    .collect()
            });
            debug!(event = "tree_map_built", classes = tree_map.num_classes(), count = tree_map.count());
            tree_map
        }))
    }

    /// Number of distinct complete plans in the memo.
    pub fn plan_count(&mut self) -> Result<u64> {
        Ok(self.tree_map()?.count())
    }

    /// Materializes the plan with 0-based id `plan_id`, recomputing costs and checking that
    /// every node delivers what its parent requires.
    pub fn unrank(&mut self, plan_id: u64) -> Result<PhysicalPlan<T, P::Prop>> {
        let choice = self.tree_map()?.unrank(plan_id)?;
        self.materialize_choice(&choice)
    }

    fn materialize_choice(&self, choice: &PlanChoice<P::Prop>) -> Result<PhysicalPlan<T, P::Prop>> {
        let memo = &self.memo;
        let expr = memo.expr(choice.expr_id);
        let mut children = Vec::with_capacity(choice.children.len());
        let mut derived = Vec::new();
        let mut costs = Vec::new();
        let mut child_stats: Vec<Option<Statistics>> = Vec::with_capacity(choice.children.len());
        for (idx, child) in choice.children.iter().enumerate() {
            let plan = match child {
                Some(child) => {
                    let plan = stacker::maybe_grow(128 * 1024, 4 * 1024 * 1024, || {
                        self.materialize_choice(child)
                    })?;
                    derived.push(plan.properties.clone());
                    costs.push(plan.cost);
                    child_stats.push(memo.group_stats(child.group_id));
                    plan
                }
                None => {
                    child_stats.push(None);
                    self.materialize_scalar(expr.children()[idx])?
                }
            };
            children.push(Arc::new(plan));
        }

        let properties = self.property_builder.derive(expr.typ(), &derived);
        if !self.property_builder.satisfies(&properties, &choice.required) {
            bail!(OptimizerError::UnsatisfiedRequiredProperties {
                group_id: expr.group_id
            });
        }
        let cost_context = memo.cost_context(choice.cost_context);
        let context = memo.context(cost_context.context);
        let stats = memo.group_stats(expr.group_id);
        let children_stats: Vec<Option<&Statistics>> =
            child_stats.iter().map(Option::as_ref).collect();
        let operation_cost = self.cost.compute_operation_cost(&CostInput {
            node: expr.typ(),
            group_id: expr.group_id,
            expr_id: expr.id,
            stats: stats.as_ref(),
            children_stats: &children_stats,
            children_costs: &costs,
            stats_context: &context.stats_context,
        })?;
        Ok(PhysicalPlan {
            typ: expr.typ().clone(),
            children,
            group_id: expr.group_id,
            expr_id: expr.id,
            cost: self.cost.sum(operation_cost, &costs),
            properties,
        })
    }

    /// Draws plans from the plan space and records their costs. The whole space is listed
    /// when it is not larger than the number of samples requested.
    pub fn sample_plans(&mut self) -> Result<Option<PlanSamples>> {
        let target = self.enumerator.samples;
        if target == 0 {
            return Ok(None);
        }
        let count = self.plan_count()?;
        if count == 0 {
            return Ok(None);
        }
        let (root, required) = self.root_or_err()?;
        let best_cost = self
            .memo
            .lookup_best(root, &required)
            .map_or(f64::INFINITY, |(_, cc_id)| self.memo.cost_context(cc_id).cost.value());

        let mut samples = Vec::new();
        if target >= count {
            for rank in 0..count {
                if let Some(sample) = self.try_sample(rank, best_cost)? {
                    samples.push(sample);
                }
            }
        } else {
            let mut rng = match self.enumerator.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut drawn = HashSet::new();
            let max_iters = target.saturating_mul(SAMPLING_MAX_ITERS);
            let mut iters = 0;
            while (samples.len() as u64) < target && iters < max_iters {
                iters += 1;
                let rank = rng.gen_range(0..count);
                if !drawn.insert(rank) {
                    continue;
                }
                if let Some(sample) = self.try_sample(rank, best_cost)? {
                    samples.push(sample);
                }
            }
        }
        debug!(event = "plans_sampled", samples = samples.len(), count = count);
        let samples = PlanSamples {
            best_cost,
            plan_space_size: count,
            samples,
        };
        self.samples = Some(samples.clone());
        Ok(Some(samples))
    }

    /// Costs the plan at `rank`. Plans over the cost threshold, and invalid plans when only
    /// valid ones are sampled, yield `None`.
    fn try_sample(&mut self, rank: u64, best_cost: f64) -> Result<Option<PlanSample>> {
        match self.unrank(rank) {
            Ok(plan) => {
                let cost = plan.cost.value();
                if !self.enumerator.accepts_cost(cost, best_cost) {
                    trace!(event = "sample_rejected", plan_id = rank + 1, cost = cost);
                    return Ok(None);
                }
                Ok(Some(PlanSample {
                    plan_id: rank + 1,
                    cost,
                }))
            }
            Err(err)
                if self.enumerator.sample_valid_plans
                    && OptimizerError::matches(&err, |e| {
                        matches!(e, OptimizerError::UnsatisfiedRequiredProperties { .. })
                    }) =>
            {
                trace!(event = "sample_invalid", plan_id = rank + 1);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The samples of the last run, if sampling was requested.
    pub fn samples(&self) -> Option<&PlanSamples> {
        self.samples.as_ref()
    }
}
