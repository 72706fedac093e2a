// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The search as direct mutual recursion on the calling thread.

use anyhow::{bail, Result};
use tracing::trace;

use super::search::{RequestState, RequestStep, Search};
use crate::cascades::context::{ContextLookup, OptContextId};
use crate::cascades::memo::{ExprId, ExprInfo, GroupId, TransitionAxis};
use crate::cost::Statistics;
use crate::error::OptimizerError;
use crate::nodes::{NodeType, OptimizationLevel};
use crate::physical_property::PhysicalPropertyBuilder;

const STACK_RED_ZONE: usize = 256 * 1024;
const STACK_GROW_SIZE: usize = 8 * 1024 * 1024;

impl<'a, T: NodeType, P: PhysicalPropertyBuilder<T>> Search<'a, T, P> {
    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.properties().max_recursion_depth {
            bail!(OptimizerError::RecursionLimitExceeded { depth });
        }
        Ok(())
    }

    pub(super) fn transition_group(
        &self,
        group_id: GroupId,
        axis: TransitionAxis,
        depth: usize,
    ) -> Result<()> {
        self.check_depth(depth)?;
        if self.is_cancelled() || !self.memo().begin_group_transition(group_id, axis) {
            return Ok(());
        }
        trace!(event = "task_begin", task = "transition_group", group_id = %group_id, axis = %axis);
        self.count_group_transition(axis);
        loop {
            let pending = self.memo().unstarted_exprs(group_id, axis);
            if pending.is_empty() {
                break;
            }
            for expr_id in pending {
                stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
                    self.transition_expr(expr_id, axis, depth + 1)
                })?;
                if self.is_cancelled() {
                    return Ok(());
                }
            }
        }
        self.memo().finish_group_transition(group_id, axis);
        trace!(event = "task_finish", task = "transition_group", group_id = %group_id, axis = %axis);
        Ok(())
    }

    fn transition_expr(&self, expr_id: ExprId, axis: TransitionAxis, depth: usize) -> Result<()> {
        if !self.memo().claim_expr_transition(expr_id, axis) {
            return Ok(());
        }
        self.count_expr_transition(axis);
        let expr = self.memo().expr(expr_id);
        for child in expr.children() {
            self.transition_group(*child, axis, depth + 1)?;
        }
        if self.is_cancelled() {
            return Ok(());
        }
        if expr.is_logical() {
            for rule_id in self.candidate_rules(&expr, axis) {
                self.apply_rule(expr_id, rule_id)?;
            }
        }
        self.memo().finish_expr_transition(expr_id, axis);
        Ok(())
    }

    /// Optimizes the group under `required`, returning the context holding the result. `None`
    /// means the path contributes nothing: the search was cancelled or the context is already
    /// being optimized further up the stack.
    pub(super) fn optimize_group(
        &self,
        group_id: GroupId,
        required: &P::Prop,
        stats_context: &[Statistics],
        origin: Option<ExprId>,
        depth: usize,
    ) -> Result<Option<OptContextId>> {
        self.check_depth(depth)?;
        if self.is_cancelled() {
            return Ok(None);
        }
        let ctx_id = match self
            .memo()
            .begin_context(group_id, required, stats_context, self.stage_idx())
        {
            ContextLookup::Optimized(ctx_id) => return Ok(Some(ctx_id)),
            ContextLookup::InFlight(ctx_id) => {
                trace!(event = "self_deadlock_avoided", group_id = %group_id, context = %ctx_id);
                return Ok(None);
            }
            ContextLookup::Started(ctx_id) => ctx_id,
        };
        trace!(event = "task_begin", task = "optimize_group", group_id = %group_id, context = %ctx_id);
        self.stats().incr_optimize_group();
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.optimize_context(ctx_id, origin, depth)
        });
        self.memo().finish_context(ctx_id);
        result?;
        trace!(event = "task_finish", task = "optimize_group", group_id = %group_id, context = %ctx_id);
        Ok(Some(ctx_id))
    }

    fn optimize_context(
        &self,
        ctx_id: OptContextId,
        origin: Option<ExprId>,
        depth: usize,
    ) -> Result<()> {
        let memo = self.memo();
        let context = memo.context(ctx_id);
        let parent = origin.map(|expr_id| memo.expr(expr_id));
        for level in OptimizationLevel::SCAN_ORDER {
            let mut idx = 0;
            // Enforcers added while scanning are picked up by the same scan.
            while let Some(expr_id) = memo.group_expr_at(context.group_id, idx) {
                idx += 1;
                if self.is_cancelled() {
                    return Ok(());
                }
                let expr = memo.expr(expr_id);
                if self.can_optimize_child(parent.as_ref(), &expr, &context.required, level) {
                    self.optimize_expr(&expr, ctx_id, depth + 1)?;
                }
            }
            if !self.properties().optimize_all_levels && memo.context_best(ctx_id).is_some() {
                break;
            }
        }
        Ok(())
    }

    fn optimize_expr(&self, expr: &ExprInfo<T>, ctx_id: OptContextId, depth: usize) -> Result<()> {
        trace!(event = "task_begin", task = "optimize_expr", expr_id = %expr.id, context = %ctx_id);
        self.stats().incr_optimize_expr();
        let context = self.memo().context(ctx_id);
        let builder = self.property_builder();
        for request in 0..builder.num_requests(expr.typ()) {
            if self.is_cancelled() {
                return Ok(());
            }
            if !builder.check_required(expr.typ(), &context.required, request) {
                continue;
            }
            let mut state = RequestState::new(request);
            loop {
                match self.next_child(expr, &context, &mut state) {
                    RequestStep::Ready => {
                        self.finish_request(expr, &context, &state)?;
                        break;
                    }
                    RequestStep::Pruned => break,
                    RequestStep::OptimizeChild { group_id, required } => {
                        let child = self.optimize_group(
                            group_id,
                            &required,
                            &state.stats_context,
                            Some(expr.id),
                            depth + 1,
                        )?;
                        if child.is_none() || !self.accept_child(&mut state, group_id, &required) {
                            break;
                        }
                    }
                }
            }
        }
        trace!(event = "task_finish", task = "optimize_expr", expr_id = %expr.id, context = %ctx_id);
        Ok(())
    }
}
