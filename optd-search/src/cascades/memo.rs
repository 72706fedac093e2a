// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

mod disjoint_set;

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::{bail, Result};
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

pub use disjoint_set::DisjointSet;

use super::context::{
    ContextLookup, ContextState, CostContext, CostContextId, OptContextId, OptimizationContext,
};
use crate::cost::{Cost, Statistics};
use crate::logical_property::LogicalPropertyBuilderAny;
use crate::nodes::{ArcPlanNode, NodeType, OptimizationLevel, PlanNode, PlanNodeOrGroup};
use crate::physical_property::PhysicalPropertyBuilder;
use crate::rules::{RuleId, RuleKind, RuleMatcher};

const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct GroupId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ExprId(pub usize);

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{}", self.0)
    }
}

impl Display for ExprId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransitionState {
    #[default]
    Unstarted,
    InProgress,
    Done,
}

/// The two independent state machines of groups and group expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransitionAxis {
    Exploration,
    Implementation,
}

impl TransitionAxis {
    pub fn rule_kind(self) -> RuleKind {
        match self {
            TransitionAxis::Exploration => RuleKind::Exploration,
            TransitionAxis::Implementation => RuleKind::Implementation,
        }
    }

    fn index(self) -> usize {
        match self {
            TransitionAxis::Exploration => 0,
            TransitionAxis::Implementation => 1,
        }
    }
}

impl Display for TransitionAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionAxis::Exploration => write!(f, "explore"),
            TransitionAxis::Implementation => write!(f, "implement"),
        }
    }
}

/// Equivalent to MExpr in Columbia/Cascades: an operator over child groups. It is also the
/// signature under which the memo deduplicates expressions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoPlanNode<T: NodeType> {
    pub typ: T,
    pub children: Vec<GroupId>,
}

pub type ArcMemoPlanNode<T> = Arc<MemoPlanNode<T>>;

impl<T: NodeType> Display for MemoPlanNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        write!(f, ")")
    }
}

/// Where a group expression came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExprOrigin {
    pub rule_id: Option<RuleId>,
    pub source: Option<ExprId>,
    /// Inserted as part of a larger expression rather than as an alternative of its own.
    pub intermediate: bool,
}

impl ExprOrigin {
    pub fn input() -> Self {
        Self::default()
    }

    pub fn rule(rule_id: RuleId, source: ExprId) -> Self {
        Self {
            rule_id: Some(rule_id),
            source: Some(source),
            intermediate: false,
        }
    }

    pub fn enforcer(source: ExprId) -> Self {
        Self {
            rule_id: None,
            source: Some(source),
            intermediate: false,
        }
    }
}

/// A snapshot of one group expression.
#[derive(Clone, Debug)]
pub struct ExprInfo<T: NodeType> {
    pub id: ExprId,
    pub group_id: GroupId,
    pub node: ArcMemoPlanNode<T>,
    pub origin: ExprOrigin,
}

impl<T: NodeType> ExprInfo<T> {
    pub fn typ(&self) -> &T {
        &self.node.typ
    }

    pub fn children(&self) -> &[GroupId] {
        &self.node.children
    }

    pub fn is_logical(&self) -> bool {
        self.node.typ.is_logical()
    }

    pub fn level(&self) -> OptimizationLevel {
        self.node.typ.optimization_level()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertResult {
    pub group_id: GroupId,
    pub expr_id: Option<ExprId>,
    /// Whether a new group expression was created.
    pub is_new: bool,
}

struct Group<Prop> {
    exprs: Vec<ExprId>,
    states: [TransitionState; 2],
    properties: Arc<[Box<dyn Any + Send + Sync + 'static>]>,
    stats: Option<Statistics>,
    is_scalar: bool,
    /// The winners table: (requirement, stage) to the context holding the best implementation.
    contexts: HashMap<(Prop, usize), OptContextId>,
    merged_into: Option<GroupId>,
}

struct GroupExpr<T: NodeType> {
    node: ArcMemoPlanNode<T>,
    group_id: GroupId,
    origin: ExprOrigin,
    states: [TransitionState; 2],
    applied_rules: HashSet<RuleId>,
    /// The best cost context per (context, request).
    cost_contexts: HashMap<(OptContextId, usize), CostContextId>,
    duplicate_of: Option<ExprId>,
}

struct MemoInner<T: NodeType, Prop> {
    groups: Vec<Group<Prop>>,
    exprs: Vec<GroupExpr<T>>,
    expr_index: HashMap<ArcMemoPlanNode<T>, ExprId>,
    duplicates: DisjointSet<GroupId>,
    contexts: Vec<OptimizationContext<Prop>>,
    cost_contexts: Vec<CostContext<Prop>>,
    /// Groups folded into another group since the last `merge_duplicates`.
    folded_since_merge: usize,
}

/// The memo: groups of equivalent expressions, their optimization contexts and cost
/// contexts. Everything is arena allocated and referenced by index; one reader-writer lock
/// guards the whole structure and is never held across a call into a rule or cost model.
///
/// Accessors taking a `GroupId`, `ExprId` or context id expect ids handed out by this memo
/// and panic on anything else. Use [`Memo::try_resolve`] to check a foreign id first.
pub struct Memo<T: NodeType, P: PhysicalPropertyBuilder<T>> {
    inner: RwLock<MemoInner<T, P::Prop>>,
    property_builders: Arc<[Box<dyn LogicalPropertyBuilderAny<T>>]>,
}

impl<T: NodeType, P: PhysicalPropertyBuilder<T>> Memo<T, P> {
    pub fn new(property_builders: Arc<[Box<dyn LogicalPropertyBuilderAny<T>>]>) -> Self {
        Self {
            inner: RwLock::new(MemoInner {
                groups: Vec::new(),
                exprs: Vec::new(),
                expr_index: HashMap::new(),
                duplicates: DisjointSet::new(),
                contexts: Vec::new(),
                cost_contexts: Vec::new(),
                folded_since_merge: 0,
            }),
            property_builders,
        }
    }

    /// Inserts `expr` into the memo and returns the group it ends up in. With a target group
    /// the expression is added there; if an identical expression already lives in another
    /// group, both groups are marked as duplicates of each other and merged.
    pub fn insert(
        &self,
        target: Option<GroupId>,
        expr: &PlanNodeOrGroup<T>,
        origin: ExprOrigin,
    ) -> Result<GroupId> {
        Ok(self.insert_with_result(target, expr, origin)?.group_id)
    }

    pub fn insert_with_result(
        &self,
        target: Option<GroupId>,
        expr: &PlanNodeOrGroup<T>,
        origin: ExprOrigin,
    ) -> Result<InsertResult> {
        let mut inner = self.inner.write();
        if let Some(target) = target {
            if inner.resolve(target).is_none() {
                bail!("target group {} does not exist", target);
            }
        }
        inner.insert(&self.property_builders, target, expr, origin)
    }

    /// The representative of `group_id`. Ids this memo never handed out map to themselves.
    pub fn resolve(&self, group_id: GroupId) -> GroupId {
        self.inner.read().resolve_unchecked(group_id)
    }

    /// The representative of `group_id`, or `None` if the memo has no such group.
    pub fn try_resolve(&self, group_id: GroupId) -> Option<GroupId> {
        self.inner.read().resolve(group_id)
    }

    pub fn num_groups(&self) -> usize {
        self.inner.read().duplicates.num_sets()
    }

    pub fn num_exprs(&self) -> usize {
        let inner = self.inner.read();
        inner
            .exprs
            .iter()
            .filter(|expr| expr.duplicate_of.is_none())
            .count()
    }

    /// Representative groups, in creation order.
    pub fn group_ids(&self) -> Vec<GroupId> {
        let inner = self.inner.read();
        (0..inner.groups.len())
            .map(GroupId)
            .filter(|id| inner.duplicates.is_representative(id))
            .collect()
    }

    pub fn group_exprs(&self, group_id: GroupId) -> Vec<ExprId> {
        let inner = self.inner.read();
        let group_id = inner.resolve_unchecked(group_id);
        inner.groups[group_id.0].exprs.clone()
    }

    /// The `idx`-th expression of a group. Expressions are only appended while a search phase
    /// runs, so scanning by index sees everything added behind the cursor.
    pub fn group_expr_at(&self, group_id: GroupId, idx: usize) -> Option<ExprId> {
        let inner = self.inner.read();
        let group_id = inner.resolve_unchecked(group_id);
        inner.groups[group_id.0].exprs.get(idx).copied()
    }

    pub fn get_expr_memoed(&self, expr_id: ExprId) -> ArcMemoPlanNode<T> {
        self.inner.read().exprs[expr_id.0].node.clone()
    }

    pub fn expr(&self, expr_id: ExprId) -> ExprInfo<T> {
        let inner = self.inner.read();
        let expr = &inner.exprs[expr_id.0];
        ExprInfo {
            id: expr_id,
            group_id: inner.resolve_unchecked(expr.group_id),
            node: expr.node.clone(),
            origin: expr.origin,
        }
    }

    pub fn get_group_id(&self, expr_id: ExprId) -> GroupId {
        let inner = self.inner.read();
        inner.resolve_unchecked(inner.exprs[expr_id.0].group_id)
    }

    pub fn is_scalar_group(&self, group_id: GroupId) -> bool {
        let inner = self.inner.read();
        inner.groups[inner.resolve_unchecked(group_id).0].is_scalar
    }

    pub fn group_properties(
        &self,
        group_id: GroupId,
    ) -> Arc<[Box<dyn Any + Send + Sync + 'static>]> {
        let inner = self.inner.read();
        inner.groups[inner.resolve_unchecked(group_id).0]
            .properties
            .clone()
    }

    pub fn group_property<LP: 'static>(&self, group_id: GroupId, idx: usize) -> Option<LP>
    where
        LP: Clone,
    {
        self.group_properties(group_id)
            .get(idx)
            .and_then(|prop| prop.downcast_ref::<LP>())
            .cloned()
    }

    pub fn group_stats(&self, group_id: GroupId) -> Option<Statistics> {
        let inner = self.inner.read();
        inner.groups[inner.resolve_unchecked(group_id).0].stats.clone()
    }

    pub fn set_group_stats(&self, group_id: GroupId, stats: Statistics) {
        let mut inner = self.inner.write();
        let group_id = inner.resolve_unchecked(group_id);
        inner.groups[group_id.0].stats = Some(stats);
    }

    pub fn group_state(&self, group_id: GroupId, axis: TransitionAxis) -> TransitionState {
        let inner = self.inner.read();
        inner.groups[inner.resolve_unchecked(group_id).0].states[axis.index()]
    }

    /// Moves an unstarted group to `InProgress`. Returns false if the group is already being
    /// transitioned or is done.
    pub fn begin_group_transition(&self, group_id: GroupId, axis: TransitionAxis) -> bool {
        let mut inner = self.inner.write();
        let group_id = inner.resolve_unchecked(group_id);
        let state = &mut inner.groups[group_id.0].states[axis.index()];
        if *state != TransitionState::Unstarted {
            return false;
        }
        *state = TransitionState::InProgress;
        true
    }

    pub fn finish_group_transition(&self, group_id: GroupId, axis: TransitionAxis) {
        let mut inner = self.inner.write();
        let group_id = inner.resolve_unchecked(group_id);
        inner.groups[group_id.0].states[axis.index()] = TransitionState::Done;
    }

    pub fn expr_state(&self, expr_id: ExprId, axis: TransitionAxis) -> TransitionState {
        self.inner.read().exprs[expr_id.0].states[axis.index()]
    }

    /// Moves an unstarted expression to `InProgress`, returning whether the caller got it.
    pub fn claim_expr_transition(&self, expr_id: ExprId, axis: TransitionAxis) -> bool {
        let mut inner = self.inner.write();
        let state = &mut inner.exprs[expr_id.0].states[axis.index()];
        if *state != TransitionState::Unstarted {
            return false;
        }
        *state = TransitionState::InProgress;
        true
    }

    pub fn finish_expr_transition(&self, expr_id: ExprId, axis: TransitionAxis) {
        self.inner.write().exprs[expr_id.0].states[axis.index()] = TransitionState::Done;
    }

    /// Expressions of the group that have not started the transition yet.
    pub fn unstarted_exprs(&self, group_id: GroupId, axis: TransitionAxis) -> Vec<ExprId> {
        let inner = self.inner.read();
        let group_id = inner.resolve_unchecked(group_id);
        inner.groups[group_id.0]
            .exprs
            .iter()
            .copied()
            .filter(|expr_id| {
                inner.exprs[expr_id.0].states[axis.index()] == TransitionState::Unstarted
            })
            .collect()
    }

    /// Marks `rule_id` as applied to the expression. Returns false if it already was.
    pub fn mark_rule_applied(&self, expr_id: ExprId, rule_id: RuleId) -> bool {
        self.inner.write().exprs[expr_id.0]
            .applied_rules
            .insert(rule_id)
    }

    pub fn is_rule_applied(&self, expr_id: ExprId, rule_id: RuleId) -> bool {
        self.inner.read().exprs[expr_id.0]
            .applied_rules
            .contains(&rule_id)
    }

    /// All bindings of `matcher` rooted at the expression. Unexpanded children are bound as
    /// group leaves; expanded children enumerate every matching expression of their group.
    pub fn bindings(&self, expr_id: ExprId, matcher: &RuleMatcher<T>) -> Vec<ArcPlanNode<T>> {
        self.inner.read().bindings(expr_id, matcher)
    }

    /// Resets the transition states of every group and expression, keeping the memo content.
    /// Called between search stages.
    pub fn reset_states(&self) {
        let mut inner = self.inner.write();
        for group in inner.groups.iter_mut() {
            group.states = Default::default();
        }
        for expr in inner.exprs.iter_mut() {
            expr.states = Default::default();
            expr.applied_rules.clear();
        }
    }

    /// Resets the group-level state of one axis so that a new transition pass revisits every
    /// group, while finished expressions stay finished.
    pub fn reset_group_states(&self, axis: TransitionAxis) {
        let mut inner = self.inner.write();
        for group in inner.groups.iter_mut() {
            group.states[axis.index()] = TransitionState::Unstarted;
        }
    }

    /// Re-derives every expression signature against the current group representatives,
    /// dropping expressions that became identical and merging groups that turn out to share an
    /// expression. Returns the number of groups folded since the previous call.
    pub fn merge_duplicates(&self) -> usize {
        let mut inner = self.inner.write();
        loop {
            let folded = inner.folded_since_merge;
            inner.rebuild_index(&self.property_builders);
            if inner.folded_since_merge == folded {
                break;
            }
        }
        let folded = inner.folded_since_merge;
        inner.folded_since_merge = 0;
        folded
    }

    /// Looks up the context for (group, requirement, stage), creating it in the `Optimizing`
    /// state if it does not exist.
    pub fn begin_context(
        &self,
        group_id: GroupId,
        required: &P::Prop,
        stats_context: &[Statistics],
        stage: usize,
    ) -> ContextLookup {
        let mut inner = self.inner.write();
        let group_id = inner.resolve_unchecked(group_id);
        let key = (required.clone(), stage);
        if let Some(&ctx_id) = inner.groups[group_id.0].contexts.get(&key) {
            return match inner.contexts[ctx_id.0].state {
                ContextState::Optimized => ContextLookup::Optimized(ctx_id),
                ContextState::New | ContextState::Optimizing => ContextLookup::InFlight(ctx_id),
            };
        }
        let ctx_id = OptContextId(inner.contexts.len());
        inner.contexts.push(OptimizationContext {
            id: ctx_id,
            group_id,
            required: required.clone(),
            stats_context: stats_context.to_vec(),
            stage,
            state: ContextState::Optimizing,
            best: None,
        });
        inner.groups[group_id.0].contexts.insert(key, ctx_id);
        ContextLookup::Started(ctx_id)
    }

    /// Looks up the context for (group, requirement, stage) without creating it.
    pub fn find_context(
        &self,
        group_id: GroupId,
        required: &P::Prop,
        stage: usize,
    ) -> Option<(OptContextId, ContextState)> {
        let inner = self.inner.read();
        let group_id = inner.resolve_unchecked(group_id);
        inner.groups[group_id.0]
            .contexts
            .get(&(required.clone(), stage))
            .map(|ctx_id| (*ctx_id, inner.contexts[ctx_id.0].state))
    }

    pub fn finish_context(&self, ctx_id: OptContextId) {
        self.inner.write().contexts[ctx_id.0].state = ContextState::Optimized;
    }

    pub fn context(&self, ctx_id: OptContextId) -> OptimizationContext<P::Prop> {
        let inner = self.inner.read();
        let mut ctx = inner.contexts[ctx_id.0].clone();
        ctx.group_id = inner.resolve_unchecked(ctx.group_id);
        ctx
    }

    pub fn context_best(&self, ctx_id: OptContextId) -> Option<CostContextId> {
        self.inner.read().contexts[ctx_id.0].best
    }

    pub fn cost_context(&self, cc_id: CostContextId) -> CostContext<P::Prop> {
        self.inner.read().cost_contexts[cc_id.0].clone()
    }

    /// The best implementation of `required` in the group over the contexts of every stage.
    pub fn lookup_best(
        &self,
        group_id: GroupId,
        required: &P::Prop,
    ) -> Option<(OptContextId, CostContextId)> {
        let inner = self.inner.read();
        inner.lookup_best(inner.resolve_unchecked(group_id), required)
    }

    /// Records that `request` of the expression was pruned under the context, unless the pair
    /// already has an entry.
    pub fn record_pruned(
        &self,
        expr_id: ExprId,
        ctx_id: OptContextId,
        request: usize,
        lower_bound: Cost,
    ) -> bool {
        let mut inner = self.inner.write();
        if inner.exprs[expr_id.0]
            .cost_contexts
            .contains_key(&(ctx_id, request))
        {
            return false;
        }
        let cc_id = CostContextId(inner.cost_contexts.len());
        inner.cost_contexts.push(CostContext {
            id: cc_id,
            expr_id,
            context: ctx_id,
            request,
            children: vec![],
            cost: lower_bound,
            operation_cost: Cost::zero(),
            derived: None,
            stats: None,
            pruned: true,
        });
        inner.exprs[expr_id.0]
            .cost_contexts
            .insert((ctx_id, request), cc_id);
        true
    }

    /// Whether the expression was already costed under the context with these child contexts.
    pub fn cost_context_exists(
        &self,
        expr_id: ExprId,
        ctx_id: OptContextId,
        children: &[Option<OptContextId>],
    ) -> bool {
        let inner = self.inner.read();
        inner.exprs[expr_id.0]
            .cost_contexts
            .values()
            .map(|cc_id| &inner.cost_contexts[cc_id.0])
            .any(|cc| !cc.pruned && cc.context == ctx_id && cc.children == children)
    }

    /// Keeps the better of `cost_context` and the existing entry for the same (context,
    /// request) of its expression and returns the id of the one kept.
    pub fn insert_cost_context(&self, mut cost_context: CostContext<P::Prop>) -> CostContextId {
        let mut inner = self.inner.write();
        let key = (cost_context.context, cost_context.request);
        let expr_id = cost_context.expr_id;
        let existing = inner.exprs[expr_id.0].cost_contexts.get(&key).copied();
        if let Some(existing) = existing {
            if !cost_context.is_better_than(&inner.cost_contexts[existing.0]) {
                return existing;
            }
        }
        let cc_id = CostContextId(inner.cost_contexts.len());
        cost_context.id = cc_id;
        inner.cost_contexts.push(cost_context);
        inner.exprs[expr_id.0].cost_contexts.insert(key, cc_id);
        if let Some(existing) = existing {
            let ctx = &mut inner.contexts[key.0 .0];
            if ctx.best == Some(existing) {
                ctx.best = Some(cc_id);
            }
        }
        cc_id
    }

    /// Compare-and-swap of the winners table: installs `cc_id` as the winner of the context if
    /// it is strictly better than the current one.
    pub fn update_best(&self, ctx_id: OptContextId, cc_id: CostContextId) -> bool {
        let mut inner = self.inner.write();
        let candidate = &inner.cost_contexts[cc_id.0];
        if candidate.pruned {
            return false;
        }
        let better = match inner.contexts[ctx_id.0].best {
            None => true,
            Some(best) => candidate.is_better_than(&inner.cost_contexts[best.0]),
        };
        if better {
            inner.contexts[ctx_id.0].best = Some(cc_id);
        }
        better
    }

    /// Every costed (not pruned) implementation of `required` by expressions of the group,
    /// over the contexts of every stage.
    pub fn implementations(
        &self,
        group_id: GroupId,
        required: &P::Prop,
    ) -> Vec<CostContext<P::Prop>> {
        let inner = self.inner.read();
        let group_id = inner.resolve_unchecked(group_id);
        let ctx_ids: HashSet<OptContextId> = inner.groups[group_id.0]
            .contexts
            .iter()
            .filter(|((prop, _), _)| prop == required)
            .map(|(_, ctx_id)| *ctx_id)
            .collect();
        inner.groups[group_id.0]
            .exprs
            .iter()
            .flat_map(|expr_id| inner.exprs[expr_id.0].cost_contexts.values())
            .map(|cc_id| &inner.cost_contexts[cc_id.0])
            .filter(|cc| !cc.pruned && ctx_ids.contains(&cc.context))
            .sorted_by_key(|cc| (cc.expr_id, cc.request, cc.id))
            .cloned()
            .collect()
    }

    /// Checks the structural invariants of the memo, panicking on violation.
    pub fn verify_integrity(&self) {
        let inner = self.inner.read();
        let mut signatures = HashMap::new();
        for (idx, group) in inner.groups.iter().enumerate() {
            let group_id = GroupId(idx);
            if group.merged_into.is_some() {
                assert!(group.exprs.is_empty(), "merged group {} still has expressions", group_id);
                continue;
            }
            for expr_id in &group.exprs {
                let expr = &inner.exprs[expr_id.0];
                assert_eq!(expr.group_id, group_id, "expression {} is in the wrong group", expr_id);
                assert!(expr.duplicate_of.is_none());
                let signature = MemoPlanNode {
                    typ: expr.node.typ.clone(),
                    children: expr
                        .node
                        .children
                        .iter()
                        .map(|child| inner.resolve_unchecked(*child))
                        .collect(),
                };
                if let Some(other) = signatures.insert((group_id, signature), *expr_id) {
                    panic!(
                        "expressions {} and {} are duplicates in group {}",
                        other, expr_id, group_id
                    );
                }
            }
        }
    }
}

impl<T: NodeType, Prop: Clone + Eq + Hash> MemoInner<T, Prop> {
    fn resolve(&self, group_id: GroupId) -> Option<GroupId> {
        self.duplicates.find(&group_id)
    }

    /// Ids handed out by the memo always resolve. Unknown ids fall through unchanged and
    /// fail on the first arena lookup.
    fn resolve_unchecked(&self, group_id: GroupId) -> GroupId {
        self.duplicates.find(&group_id).unwrap_or(group_id)
    }

    fn insert(
        &mut self,
        builders: &[Box<dyn LogicalPropertyBuilderAny<T>>],
        target: Option<GroupId>,
        expr: &PlanNodeOrGroup<T>,
        origin: ExprOrigin,
    ) -> Result<InsertResult> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.insert_inner(builders, target, expr, origin)
        })
    }

    fn insert_inner(
        &mut self,
        builders: &[Box<dyn LogicalPropertyBuilderAny<T>>],
        target: Option<GroupId>,
        expr: &PlanNodeOrGroup<T>,
        origin: ExprOrigin,
    ) -> Result<InsertResult> {
        let plan = match expr {
            PlanNodeOrGroup::Group(group_id) => {
                let Some(group_id) = self.resolve(*group_id) else {
                    bail!("group {} does not exist", group_id);
                };
                if let Some(target) = target {
                    self.add_possible_duplicate(builders, target, group_id);
                }
                return Ok(InsertResult {
                    group_id: self.resolve_unchecked(group_id),
                    expr_id: None,
                    is_new: false,
                });
            }
            PlanNodeOrGroup::PlanNode(plan) => plan,
        };

        let child_origin = ExprOrigin {
            intermediate: true,
            ..origin
        };
        let mut children = Vec::with_capacity(plan.children.len());
        for child in &plan.children {
            children.push(self.insert(builders, None, child, child_origin)?.group_id);
        }
        let node = Arc::new(MemoPlanNode {
            typ: plan.typ.clone(),
            children,
        });

        if let Some(&existing) = self.expr_index.get(&node) {
            let existing_group = self.resolve_unchecked(self.exprs[existing.0].group_id);
            if let Some(target) = target {
                self.add_possible_duplicate(builders, target, existing_group);
            }
            return Ok(InsertResult {
                group_id: self.resolve_unchecked(existing_group),
                expr_id: Some(existing),
                is_new: false,
            });
        }

        let group_id = match target {
            Some(target) => self.resolve_unchecked(target),
            None => self.new_group(builders, &node),
        };
        let expr_id = ExprId(self.exprs.len());
        self.exprs.push(GroupExpr {
            node: node.clone(),
            group_id,
            origin,
            states: Default::default(),
            applied_rules: HashSet::new(),
            cost_contexts: HashMap::new(),
            duplicate_of: None,
        });
        self.expr_index.insert(node, expr_id);
        self.groups[group_id.0].exprs.push(expr_id);
        trace!(event = "memo_insert", group_id = %group_id, expr_id = %expr_id, rule_id = ?origin.rule_id);
        Ok(InsertResult {
            group_id,
            expr_id: Some(expr_id),
            is_new: true,
        })
    }

    fn new_group(
        &mut self,
        builders: &[Box<dyn LogicalPropertyBuilderAny<T>>],
        node: &MemoPlanNode<T>,
    ) -> GroupId {
        let properties: Vec<Box<dyn Any + Send + Sync + 'static>> = builders
            .iter()
            .enumerate()
            .map(|(idx, builder)| {
                let children = node
                    .children
                    .iter()
                    .map(|child| self.groups[child.0].properties[idx].as_ref() as &dyn Any)
                    .collect_vec();
                builder.derive_any(&node.typ, &children)
            })
            .collect();
        let group_id = GroupId(self.groups.len());
        self.groups.push(Group {
            exprs: Vec::new(),
            states: Default::default(),
            properties: properties.into(),
            stats: None,
            is_scalar: node.typ.is_scalar(),
            contexts: HashMap::new(),
            merged_into: None,
        });
        self.duplicates.add(group_id);
        group_id
    }

    /// Two groups were found to contain the same expression. Merge them if their logical
    /// properties agree.
    fn add_possible_duplicate(
        &mut self,
        builders: &[Box<dyn LogicalPropertyBuilderAny<T>>],
        a: GroupId,
        b: GroupId,
    ) {
        let a = self.resolve_unchecked(a);
        let b = self.resolve_unchecked(b);
        if a == b {
            return;
        }
        let equivalent = builders.iter().enumerate().all(|(idx, builder)| {
            builder.eq_any(
                self.groups[a.0].properties[idx].as_ref(),
                self.groups[b.0].properties[idx].as_ref(),
            )
        });
        if !equivalent {
            warn!(event = "memo_duplicate_rejected", group_a = %a, group_b = %b);
            return;
        }
        let Some([rep, other]) = self.duplicates.union(&a, &b) else {
            return;
        };
        self.fold_group(other, rep);
    }

    /// Moves the expressions and contexts of `dup` into `rep`. `dup` becomes a permanent
    /// alias of `rep`.
    fn fold_group(&mut self, dup: GroupId, rep: GroupId) {
        trace!(event = "memo_merge_group", from = %dup, into = %rep);
        let exprs = std::mem::take(&mut self.groups[dup.0].exprs);
        let contexts = std::mem::take(&mut self.groups[dup.0].contexts);
        let dup_states = self.groups[dup.0].states;
        let dup_stats = self.groups[dup.0].stats.take();

        for axis in [TransitionAxis::Exploration, TransitionAxis::Implementation] {
            let idx = axis.index();
            let incomplete = dup_states[idx] != TransitionState::Done
                || exprs
                    .iter()
                    .any(|expr_id| self.exprs[expr_id.0].states[idx] != TransitionState::Done);
            if incomplete && self.groups[rep.0].states[idx] == TransitionState::Done {
                self.groups[rep.0].states[idx] = TransitionState::Unstarted;
            }
        }
        for expr_id in &exprs {
            self.exprs[expr_id.0].group_id = rep;
        }
        self.groups[rep.0].exprs.extend(exprs);
        if self.groups[rep.0].stats.is_none() {
            self.groups[rep.0].stats = dup_stats;
        }
        for (key, ctx_id) in contexts {
            self.contexts[ctx_id.0].group_id = rep;
            match self.groups[rep.0].contexts.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(ctx_id);
                }
                Entry::Occupied(mut entry) => {
                    let current = *entry.get();
                    let new_best = self.contexts[ctx_id.0].best;
                    let better = match (new_best, self.contexts[current.0].best) {
                        (Some(new), Some(old)) => {
                            self.cost_contexts[new.0].is_better_than(&self.cost_contexts[old.0])
                        }
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if better {
                        entry.insert(ctx_id);
                    }
                }
            }
        }
        self.groups[dup.0].merged_into = Some(rep);
        self.folded_since_merge += 1;
    }

    fn rebuild_index(&mut self, builders: &[Box<dyn LogicalPropertyBuilderAny<T>>]) {
        self.expr_index.clear();
        for idx in 0..self.exprs.len() {
            if self.exprs[idx].duplicate_of.is_some() {
                continue;
            }
            let expr_id = ExprId(idx);
            let node = &self.exprs[idx].node;
            let children = node
                .children
                .iter()
                .map(|child| self.resolve_unchecked(*child))
                .collect_vec();
            if children != node.children {
                let typ = node.typ.clone();
                self.exprs[idx].node = Arc::new(MemoPlanNode { typ, children });
            }
            let node = self.exprs[idx].node.clone();
            match self.expr_index.entry(node) {
                Entry::Vacant(entry) => {
                    entry.insert(expr_id);
                }
                Entry::Occupied(entry) => {
                    let existing = *entry.get();
                    let group_id = self.resolve_unchecked(self.exprs[idx].group_id);
                    self.exprs[idx].duplicate_of = Some(existing);
                    self.groups[group_id.0].exprs.retain(|id| *id != expr_id);
                    let existing_group = self.resolve_unchecked(self.exprs[existing.0].group_id);
                    trace!(event = "memo_duplicate_expr", expr_id = %expr_id, duplicate_of = %existing);
                    if existing_group != group_id {
                        self.add_possible_duplicate(builders, existing_group, group_id);
                    }
                }
            }
        }
    }

    fn lookup_best(
        &self,
        group_id: GroupId,
        required: &Prop,
    ) -> Option<(OptContextId, CostContextId)> {
        let mut best: Option<(OptContextId, CostContextId)> = None;
        for ((prop, _), ctx_id) in self.groups[group_id.0].contexts.iter() {
            if prop != required {
                continue;
            }
            let Some(cc_id) = self.contexts[ctx_id.0].best else {
                continue;
            };
            let replace = match best {
                None => true,
                Some((_, best_cc)) => {
                    self.cost_contexts[cc_id.0].is_better_than(&self.cost_contexts[best_cc.0])
                }
            };
            if replace {
                best = Some((*ctx_id, cc_id));
            }
        }
        best
    }

    fn bindings(&self, expr_id: ExprId, matcher: &RuleMatcher<T>) -> Vec<ArcPlanNode<T>> {
        let node = &self.exprs[expr_id.0].node;
        if !matcher.matches_top(&node.typ) {
            return vec![];
        }
        let child_matchers = matcher.children();
        let binds_rest = matches!(child_matchers.last(), Some(RuleMatcher::AnyMany));
        if child_matchers.len() > node.children.len() + usize::from(binds_rest)
            || (!binds_rest && child_matchers.len() != node.children.len())
        {
            return vec![];
        }
        let mut partials: Vec<Vec<PlanNodeOrGroup<T>>> = vec![vec![]];
        for (idx, child) in node.children.iter().enumerate() {
            let child = self.resolve_unchecked(*child);
            let options: Vec<PlanNodeOrGroup<T>> = match child_matchers.get(idx) {
                Some(child_matcher) if !child_matcher.is_leaf() => self.groups[child.0]
                    .exprs
                    .iter()
                    .flat_map(|child_expr| self.bindings(*child_expr, child_matcher))
                    .map(PlanNodeOrGroup::PlanNode)
                    .collect(),
                _ => vec![PlanNodeOrGroup::Group(child)],
            };
            if options.is_empty() {
                return vec![];
            }
            partials = partials
                .into_iter()
                .cartesian_product(options)
                .map(|(mut partial, option)| {
                    partial.push(option);
                    partial
                })
                .collect();
        }
        partials
            .into_iter()
            .map(|children| Arc::new(PlanNode::new(node.typ.clone(), children)))
            .collect()
    }
}

impl<T: NodeType, P: PhysicalPropertyBuilder<T>> Display for Memo<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        for (idx, group) in inner.groups.iter().enumerate() {
            let group_id = GroupId(idx);
            if let Some(rep) = group.merged_into {
                writeln!(f, "group {} merged into {}", group_id, rep)?;
                continue;
            }
            writeln!(
                f,
                "group {} explore={:?} implement={:?} stats={}",
                group_id,
                group.states[0],
                group.states[1],
                if group.stats.is_some() { "yes" } else { "no" }
            )?;
            for (prop_idx, builder) in self.property_builders.iter().enumerate() {
                writeln!(
                    f,
                    "  {}={}",
                    builder.property_name(),
                    builder.display(group.properties[prop_idx].as_ref())
                )?;
            }
            for expr_id in &group.exprs {
                let expr = &inner.exprs[expr_id.0];
                write!(f, "  expr {} {}", expr_id, expr.node)?;
                if let Some(rule_id) = expr.origin.rule_id {
                    write!(f, " rule={}", rule_id)?;
                }
                writeln!(f)?;
            }
            for ctx_id in group.contexts.values().sorted() {
                let ctx = &inner.contexts[ctx_id.0];
                write!(
                    f,
                    "  {} stage={} state={:?} required={:?}",
                    ctx_id, ctx.stage, ctx.state, ctx.required
                )?;
                match ctx.best {
                    Some(best) => {
                        let cc = &inner.cost_contexts[best.0];
                        writeln!(f, " best=expr {} cost={}", cc.expr_id, cc.cost)?
                    }
                    None => writeln!(f, " best=none")?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{join, scan, TestNode, TestPropertyBuilder, TestProps};
    use pretty_assertions::assert_eq;

    fn memo() -> Memo<TestNode, TestPropertyBuilder> {
        Memo::new(crate::testing::logical_property_builders())
    }

    #[test]
    fn idempotent_insert() {
        let memo = memo();
        let expr = join(scan("t1"), scan("t2"));
        let g1 = memo.insert(None, &expr, ExprOrigin::input()).unwrap();
        let g2 = memo.insert(None, &expr, ExprOrigin::input()).unwrap();
        assert_eq!(g1, g2);
        assert_eq!(memo.num_groups(), 3);
        assert_eq!(memo.num_exprs(), 3);
        memo.verify_integrity();
    }

    #[test]
    fn insert_into_target_group() {
        let memo = memo();
        let root = memo
            .insert(None, &join(scan("t1"), scan("t2")), ExprOrigin::input())
            .unwrap();
        let commuted = join(scan("t2"), scan("t1"));
        let result = memo
            .insert_with_result(Some(root), &commuted, ExprOrigin::rule(0, ExprId(2)))
            .unwrap();
        assert_eq!(result.group_id, root);
        assert!(result.is_new);
        assert_eq!(memo.group_exprs(root).len(), 2);
        let again = memo
            .insert_with_result(Some(root), &commuted, ExprOrigin::rule(0, ExprId(2)))
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(memo.group_exprs(root).len(), 2);
    }

    #[test]
    fn unknown_groups_are_rejected() {
        let memo = memo();
        let root = memo.insert(None, &scan("t1"), ExprOrigin::input()).unwrap();
        let unknown = GroupId(42);
        assert_eq!(memo.try_resolve(root), Some(root));
        assert_eq!(memo.try_resolve(unknown), None);
        assert_eq!(memo.resolve(unknown), unknown);
        let err = memo
            .insert(Some(unknown), &scan("t2"), ExprOrigin::input())
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        let err = memo
            .insert(None, &PlanNodeOrGroup::Group(unknown), ExprOrigin::input())
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert_eq!(memo.num_groups(), 1);
        assert_eq!(memo.num_exprs(), 1);
    }

    #[test]
    #[should_panic]
    fn accessors_panic_on_unknown_groups() {
        let memo = memo();
        memo.insert(None, &scan("t1"), ExprOrigin::input()).unwrap();
        memo.group_exprs(GroupId(42));
    }

    #[test]
    fn group_leaf_insert_is_noop() {
        let memo = memo();
        let root = memo.insert(None, &scan("t1"), ExprOrigin::input()).unwrap();
        let group = memo
            .insert(Some(root), &PlanNodeOrGroup::Group(root), ExprOrigin::input())
            .unwrap();
        assert_eq!(group, root);
        assert_eq!(memo.num_exprs(), 1);
        assert!(memo
            .insert(None, &PlanNodeOrGroup::Group(GroupId(42)), ExprOrigin::input())
            .is_err());
    }

    #[test]
    fn duplicate_groups_are_merged() {
        let memo = memo();
        // Two groups holding the same logical relation, built independently.
        let a = memo
            .insert(None, &join(scan("t1"), scan("t2")), ExprOrigin::input())
            .unwrap();
        let b = memo
            .insert(None, &join(scan("t2"), scan("t1")), ExprOrigin::input())
            .unwrap();
        assert_ne!(a, b);
        // A rule finds that `a` also contains the expression of `b`.
        let b_expr = memo.group_exprs(b)[0];
        let node = memo.get_expr_memoed(b_expr);
        let binding = PlanNode::new(
            node.typ.clone(),
            node.children.iter().map(|c| PlanNodeOrGroup::Group(*c)).collect(),
        );
        let merged = memo
            .insert(Some(a), &binding.into(), ExprOrigin::rule(0, ExprId(2)))
            .unwrap();
        assert_eq!(merged, a.min(b));
        assert_eq!(memo.resolve(a), memo.resolve(b));
        assert_eq!(memo.group_exprs(a).len(), 2);
        assert_eq!(memo.merge_duplicates(), 1);
        assert_eq!(memo.merge_duplicates(), 0);
        memo.verify_integrity();
    }

    #[test]
    fn non_equivalent_groups_are_not_merged() {
        let memo = memo();
        let a = memo.insert(None, &scan("t1"), ExprOrigin::input()).unwrap();
        let b = memo.insert(None, &scan("t2"), ExprOrigin::input()).unwrap();
        memo.insert(Some(a), &PlanNodeOrGroup::Group(b), ExprOrigin::input())
            .unwrap();
        assert_ne!(memo.resolve(a), memo.resolve(b));
    }

    #[test]
    fn merge_redirects_parents_and_drops_duplicates() {
        let memo = memo();
        let t1 = memo.insert(None, &scan("t1"), ExprOrigin::input()).unwrap();
        // A second group for the same relation, reached through a different parent.
        let alias = memo
            .insert(
                None,
                &PlanNode::leaf(TestNode::Scan("t1".into())).into(),
                ExprOrigin::input(),
            )
            .unwrap();
        assert_eq!(alias, t1, "identical leaves dedupe to one group");

        let j1 = memo
            .insert(None, &join(scan("t1"), scan("t2")), ExprOrigin::input())
            .unwrap();
        let t2 = memo.insert(None, &scan("t2"), ExprOrigin::input()).unwrap();
        let other = memo
            .insert(
                None,
                &PlanNode::new(TestNode::Join, vec![t2.into(), t1.into()]).into(),
                ExprOrigin::input(),
            )
            .unwrap();
        let parent = memo
            .insert(
                None,
                &PlanNode::new(TestNode::Join, vec![other.into(), scan("t3")]).into(),
                ExprOrigin::input(),
            )
            .unwrap();
        memo.insert(Some(j1), &PlanNodeOrGroup::Group(other), ExprOrigin::input())
            .unwrap();
        memo.merge_duplicates();
        let parent_expr = memo.group_exprs(parent)[0];
        assert_eq!(memo.expr(parent_expr).children()[0], memo.resolve(j1));
        memo.verify_integrity();
    }

    #[test]
    fn bindings_expand_children() {
        let memo = memo();
        let root = memo
            .insert(
                None,
                &join(join(scan("t1"), scan("t2")), scan("t3")),
                ExprOrigin::input(),
            )
            .unwrap();
        let matcher = RuleMatcher::MatchNode {
            typ: TestNode::Join,
            children: vec![
                RuleMatcher::MatchNode {
                    typ: TestNode::Join,
                    children: vec![RuleMatcher::Any, RuleMatcher::Any],
                },
                RuleMatcher::Any,
            ],
        };
        let expr_id = memo.group_exprs(root)[0];
        let bindings = memo.bindings(expr_id, &matcher);
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].child(0).is_materialized());
        assert!(!bindings[0].child(1).is_materialized());

        let flat = RuleMatcher::MatchNode {
            typ: TestNode::Join,
            children: vec![RuleMatcher::AnyMany],
        };
        assert_eq!(memo.bindings(expr_id, &flat).len(), 1);
        let scan_matcher = RuleMatcher::of_variant(&TestNode::Scan(String::new()), 0);
        assert!(memo.bindings(expr_id, &scan_matcher).is_empty());
    }

    #[test]
    fn winners_are_monotonic() {
        let memo = memo();
        let group = memo.insert(None, &scan("t1"), ExprOrigin::input()).unwrap();
        let expr_id = memo.group_exprs(group)[0];
        let required = TestProps::any();
        let ContextLookup::Started(ctx) = memo.begin_context(group, &required, &[], 0) else {
            panic!("context should be new");
        };
        assert_eq!(
            memo.begin_context(group, &required, &[], 0),
            ContextLookup::InFlight(ctx)
        );
        let cost_context = |request: usize, cost: f64| CostContext {
            id: CostContextId(0),
            expr_id,
            context: ctx,
            request,
            children: vec![],
            cost: Cost::new(cost),
            operation_cost: Cost::new(cost),
            derived: Some(TestProps::any()),
            stats: None,
            pruned: false,
        };
        let first = memo.insert_cost_context(cost_context(0, 10.0));
        assert!(memo.update_best(ctx, first));
        let worse = memo.insert_cost_context(cost_context(1, 20.0));
        assert!(!memo.update_best(ctx, worse));
        assert_eq!(memo.context_best(ctx), Some(first));
        let better = memo.insert_cost_context(cost_context(1, 5.0));
        assert!(memo.update_best(ctx, better));
        assert_eq!(memo.cost_context(memo.context_best(ctx).unwrap()).cost, Cost::new(5.0));
        memo.finish_context(ctx);
        assert_eq!(
            memo.begin_context(group, &required, &[], 0),
            ContextLookup::Optimized(ctx)
        );
        assert_eq!(memo.lookup_best(group, &required), Some((ctx, better)));
        assert_eq!(memo.implementations(group, &required).len(), 2);
    }
}
