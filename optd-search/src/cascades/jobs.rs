// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The recursive search as resumable jobs. Every job is a small state machine: a step either
//! finishes the job or spawns child jobs and suspends it until all of them completed.

use anyhow::Result;
use tracing::trace;

use super::context::OptContextId;
use super::engine::{RequestState, RequestStep, Search};
use super::memo::{ExprId, GroupId, TransitionAxis};
use crate::cost::Statistics;
use crate::nodes::{NodeType, OptimizationLevel};
use crate::physical_property::PhysicalPropertyBuilder;
use crate::rules::RuleId;

pub(crate) type JobId = usize;

/// Jobs that are shared by every requester instead of being spawned once per parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum JobKey {
    TransitionGroup(GroupId, TransitionAxis),
    OptimizeContext(OptContextId),
}

/// What a job asks the scheduler to run before it can resume.
pub(crate) enum JobSpec<Prop> {
    /// A job owned by the requesting job.
    Child(Job<Prop>),
    /// The job owning `key`. Requesters wait for the running owner if there is one.
    Shared(JobKey, Job<Prop>),
    /// Optimize a child group. The scheduler looks up or creates the context and waits for its
    /// owner; the requester reads the outcome from the memo when it resumes.
    OptimizeChild {
        group_id: GroupId,
        required: Prop,
        stats_context: Vec<Statistics>,
        origin: Option<ExprId>,
    },
}

pub(crate) enum JobStep<Prop> {
    Done,
    /// Suspend until every spawned job completed.
    Wait(Vec<JobSpec<Prop>>),
}

pub(crate) enum Job<Prop> {
    TransitionGroup(TransitionGroupJob),
    TransitionExpr(TransitionExprJob),
    Transformation(TransformationJob),
    OptimizeGroup(OptimizeGroupJob),
    OptimizeExpr(OptimizeExprJob<Prop>),
}

impl<Prop: Clone> Job<Prop> {
    pub fn name(&self) -> &'static str {
        match self {
            Job::TransitionGroup(_) => "transition_group",
            Job::TransitionExpr(_) => "transition_expr",
            Job::Transformation(_) => "transformation",
            Job::OptimizeGroup(_) => "optimize_group",
            Job::OptimizeExpr(_) => "optimize_expr",
        }
    }

    pub fn step<T, P>(&mut self, search: &Search<'_, T, P>) -> Result<JobStep<Prop>>
    where
        T: NodeType,
        P: PhysicalPropertyBuilder<T, Prop = Prop>,
    {
        match self {
            Job::TransitionGroup(job) => Ok(job.step(search)),
            Job::TransitionExpr(job) => Ok(job.step(search)),
            Job::Transformation(job) => job.step(search),
            Job::OptimizeGroup(job) => Ok(job.step(search)),
            Job::OptimizeExpr(job) => job.step(search),
        }
    }
}

/// Brings a group to done on one axis, transitioning its expressions as child jobs until no
/// unstarted expression is left.
pub(crate) struct TransitionGroupJob {
    group_id: GroupId,
    axis: TransitionAxis,
    started: bool,
}

impl TransitionGroupJob {
    pub fn new(group_id: GroupId, axis: TransitionAxis) -> Self {
        Self {
            group_id,
            axis,
            started: false,
        }
    }

    fn step<Prop, T, P>(&mut self, search: &Search<'_, T, P>) -> JobStep<Prop>
    where
        T: NodeType,
        P: PhysicalPropertyBuilder<T, Prop = Prop>,
    {
        let memo = search.memo();
        if !self.started {
            self.started = true;
            if search.is_cancelled() || !memo.begin_group_transition(self.group_id, self.axis) {
                return JobStep::Done;
            }
            trace!(event = "task_begin", task = "transition_group", group_id = %self.group_id, axis = %self.axis);
            search.count_group_transition(self.axis);
        }
        if search.is_cancelled() {
            return JobStep::Done;
        }
        let pending = memo.unstarted_exprs(self.group_id, self.axis);
        if pending.is_empty() {
            memo.finish_group_transition(self.group_id, self.axis);
            trace!(event = "task_finish", task = "transition_group", group_id = %self.group_id, axis = %self.axis);
            return JobStep::Done;
        }
        JobStep::Wait(
            pending
                .into_iter()
                .map(|expr_id| {
                    JobSpec::Child(Job::TransitionExpr(TransitionExprJob::new(expr_id, self.axis)))
                })
                .collect(),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransitionExprPhase {
    Start,
    Rules,
    Finish,
}

/// Transitions the child groups of an expression, then fires the rules of the axis on it.
pub(crate) struct TransitionExprJob {
    expr_id: ExprId,
    axis: TransitionAxis,
    phase: TransitionExprPhase,
}

impl TransitionExprJob {
    pub fn new(expr_id: ExprId, axis: TransitionAxis) -> Self {
        Self {
            expr_id,
            axis,
            phase: TransitionExprPhase::Start,
        }
    }

    fn step<Prop, T, P>(&mut self, search: &Search<'_, T, P>) -> JobStep<Prop>
    where
        T: NodeType,
        P: PhysicalPropertyBuilder<T, Prop = Prop>,
    {
        let memo = search.memo();
        if search.is_cancelled() {
            return JobStep::Done;
        }
        if self.phase == TransitionExprPhase::Start {
            if !memo.claim_expr_transition(self.expr_id, self.axis) {
                return JobStep::Done;
            }
            search.count_expr_transition(self.axis);
            self.phase = TransitionExprPhase::Rules;
            let children = memo.expr(self.expr_id).node.children.clone();
            if !children.is_empty() {
                return JobStep::Wait(
                    children
                        .into_iter()
                        .map(|child| {
                            let child = memo.resolve(child);
                            JobSpec::Shared(
                                JobKey::TransitionGroup(child, self.axis),
                                Job::TransitionGroup(TransitionGroupJob::new(child, self.axis)),
                            )
                        })
                        .collect(),
                );
            }
        }
        if self.phase == TransitionExprPhase::Rules {
            self.phase = TransitionExprPhase::Finish;
            let expr = memo.expr(self.expr_id);
            if expr.is_logical() {
                let rules = search.candidate_rules(&expr, self.axis);
                if !rules.is_empty() {
                    return JobStep::Wait(
                        rules
                            .into_iter()
                            .map(|rule_id| {
                                let job = TransformationJob::new(self.expr_id, rule_id);
                                JobSpec::Child(Job::Transformation(job))
                            })
                            .collect(),
                    );
                }
            }
        }
        memo.finish_expr_transition(self.expr_id, self.axis);
        JobStep::Done
    }
}

/// Fires one rule on one expression.
pub(crate) struct TransformationJob {
    expr_id: ExprId,
    rule_id: RuleId,
}

impl TransformationJob {
    pub fn new(expr_id: ExprId, rule_id: RuleId) -> Self {
        Self { expr_id, rule_id }
    }

    fn step<Prop, T, P>(&mut self, search: &Search<'_, T, P>) -> Result<JobStep<Prop>>
    where
        T: NodeType,
        P: PhysicalPropertyBuilder<T, Prop = Prop>,
    {
        trace!(event = "task_begin", task = "transformation", expr_id = %self.expr_id, rule_id = self.rule_id);
        let produced = search.apply_rule(self.expr_id, self.rule_id)?;
        trace!(event = "task_finish", task = "transformation", expr_id = %self.expr_id, produced = produced);
        Ok(JobStep::Done)
    }
}

/// Owns one optimization context: scans the optimization levels of the group and spawns an
/// expression job for every eligible physical expression, rescanning for enforcers added in
/// the meantime.
pub(crate) struct OptimizeGroupJob {
    ctx_id: OptContextId,
    origin: Option<ExprId>,
    level: usize,
    cursor: usize,
    started: bool,
}

impl OptimizeGroupJob {
    pub fn new(ctx_id: OptContextId, origin: Option<ExprId>) -> Self {
        Self {
            ctx_id,
            origin,
            level: 0,
            cursor: 0,
            started: false,
        }
    }

    fn step<Prop, T, P>(&mut self, search: &Search<'_, T, P>) -> JobStep<Prop>
    where
        Prop: Clone,
        T: NodeType,
        P: PhysicalPropertyBuilder<T, Prop = Prop>,
    {
        let memo = search.memo();
        if !self.started {
            self.started = true;
            trace!(event = "task_begin", task = "optimize_group", context = %self.ctx_id);
            search.stats().incr_optimize_group();
        }
        let context = memo.context(self.ctx_id);
        let parent = self.origin.map(|expr_id| memo.expr(expr_id));
        loop {
            let Some(level) = OptimizationLevel::SCAN_ORDER.get(self.level).copied() else {
                break;
            };
            if search.is_cancelled() {
                break;
            }
            let mut spawned = Vec::new();
            while let Some(expr_id) = memo.group_expr_at(context.group_id, self.cursor) {
                self.cursor += 1;
                let expr = memo.expr(expr_id);
                if search.can_optimize_child(parent.as_ref(), &expr, &context.required, level) {
                    spawned.push(JobSpec::Child(Job::OptimizeExpr(OptimizeExprJob::new(
                        expr_id,
                        self.ctx_id,
                    ))));
                }
            }
            if !spawned.is_empty() {
                return JobStep::Wait(spawned);
            }
            if !search.properties().optimize_all_levels
                && memo.context_best(self.ctx_id).is_some()
            {
                break;
            }
            self.level += 1;
            self.cursor = 0;
        }
        memo.finish_context(self.ctx_id);
        trace!(event = "task_finish", task = "optimize_group", context = %self.ctx_id);
        JobStep::Done
    }
}

/// Optimizes one expression under a context, request by request and child by child.
pub(crate) struct OptimizeExprJob<Prop> {
    expr_id: ExprId,
    ctx_id: OptContextId,
    next_request: usize,
    state: Option<RequestState<Prop>>,
    /// The child context requested before suspending.
    awaiting: Option<(GroupId, Prop)>,
    started: bool,
}

impl<Prop: Clone> OptimizeExprJob<Prop> {
    pub fn new(expr_id: ExprId, ctx_id: OptContextId) -> Self {
        Self {
            expr_id,
            ctx_id,
            next_request: 0,
            state: None,
            awaiting: None,
            started: false,
        }
    }

    fn step<T, P>(&mut self, search: &Search<'_, T, P>) -> Result<JobStep<Prop>>
    where
        T: NodeType,
        P: PhysicalPropertyBuilder<T, Prop = Prop>,
    {
        let memo = search.memo();
        let builder = search.property_builder();
        if !self.started {
            self.started = true;
            trace!(event = "task_begin", task = "optimize_expr", expr_id = %self.expr_id, context = %self.ctx_id);
            search.stats().incr_optimize_expr();
        }
        let expr = memo.expr(self.expr_id);
        let context = memo.context(self.ctx_id);
        loop {
            if search.is_cancelled() {
                return Ok(JobStep::Done);
            }
            if let Some((group_id, required)) = self.awaiting.take() {
                // An unfinished context is optimized by a job that waits on this one.
                let accepted = search.context_is_optimized(group_id, &required)
                    && self
                        .state
                        .as_mut()
                        .map_or(false, |state| search.accept_child(state, group_id, &required));
                if !accepted {
                    self.state = None;
                }
            }
            let Some(state) = self.state.as_mut() else {
                let request = self.next_request;
                if request >= builder.num_requests(expr.typ()) {
                    trace!(event = "task_finish", task = "optimize_expr", expr_id = %self.expr_id, context = %self.ctx_id);
                    return Ok(JobStep::Done);
                }
                self.next_request += 1;
                if builder.check_required(expr.typ(), &context.required, request) {
                    self.state = Some(RequestState::new(request));
                }
                continue;
            };
            match search.next_child(&expr, &context, state) {
                RequestStep::Ready => {
                    search.finish_request(&expr, &context, state)?;
                    self.state = None;
                }
                RequestStep::Pruned => self.state = None,
                RequestStep::OptimizeChild { group_id, required } => {
                    let spec = JobSpec::OptimizeChild {
                        group_id,
                        required: required.clone(),
                        stats_context: state.stats_context.clone(),
                        origin: Some(self.expr_id),
                    };
                    self.awaiting = Some((group_id, required));
                    return Ok(JobStep::Wait(vec![spec]));
                }
            }
        }
    }
}

struct JobSlot<Prop> {
    /// `None` while the job is running or when the slot is free.
    job: Option<Job<Prop>>,
    key: Option<JobKey>,
    /// Spawned or awaited jobs that have not completed yet.
    pending: usize,
    /// Jobs to resume when this one completes. A job may appear once per request.
    waiters: Vec<JobId>,
    /// The jobs this one is suspended on, for cycle detection.
    waiting_on: Vec<JobId>,
}

impl<Prop> Default for JobSlot<Prop> {
    fn default() -> Self {
        Self {
            job: None,
            key: None,
            pending: 0,
            waiters: Vec::new(),
            waiting_on: Vec::new(),
        }
    }
}

/// A pool of reusable job slots. Completed jobs give their slot back; when the pool runs dry
/// it grows and the caller is told so it can count the overflow.
pub(crate) struct JobFactory<Prop> {
    slots: Vec<JobSlot<Prop>>,
    free: Vec<JobId>,
}

impl<Prop> JobFactory<Prop> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| JobSlot::default()).collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    /// Stores `job` in a free slot. The flag is set if the pool had to grow.
    pub fn create(&mut self, job: Job<Prop>, key: Option<JobKey>) -> (JobId, bool) {
        let slot = JobSlot {
            job: Some(job),
            key,
            ..Default::default()
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = slot;
                (id, false)
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1, true)
            }
        }
    }

    pub fn release(&mut self, id: JobId) -> Option<JobKey> {
        let slot = std::mem::take(&mut self.slots[id]);
        self.free.push(id);
        slot.key
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn take_job(&mut self, id: JobId) -> Option<Job<Prop>> {
        self.slots[id].job.take()
    }

    pub fn put_job(&mut self, id: JobId, job: Job<Prop>) {
        self.slots[id].job = Some(job);
    }

    pub fn pending(&self, id: JobId) -> usize {
        self.slots[id].pending
    }

    /// Makes `waiter` wait for `job`.
    pub fn link(&mut self, waiter: JobId, job: JobId) {
        self.slots[job].waiters.push(waiter);
        self.slots[waiter].pending += 1;
        self.slots[waiter].waiting_on.push(job);
    }

    /// Detaches the waiters of a completed job, returning the ones that became ready.
    pub fn notify_waiters(&mut self, id: JobId) -> Vec<JobId> {
        let waiters = std::mem::take(&mut self.slots[id].waiters);
        let mut ready = Vec::new();
        for waiter in waiters {
            let slot = &mut self.slots[waiter];
            slot.pending -= 1;
            if let Some(pos) = slot.waiting_on.iter().position(|job| *job == id) {
                slot.waiting_on.swap_remove(pos);
            }
            if slot.pending == 0 {
                ready.push(waiter);
            }
        }
        ready
    }

    /// Whether `from` transitively waits for `target`.
    pub fn waits_for(&self, from: JobId, target: JobId) -> bool {
        let mut stack = vec![from];
        let mut visited = std::collections::HashSet::new();
        while let Some(job) = stack.pop() {
            if job == target {
                return true;
            }
            if visited.insert(job) {
                stack.extend(self.slots[job].waiting_on.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job<()> {
        Job::Transformation(TransformationJob::new(ExprId(0), 0))
    }

    #[test]
    fn factory_reuses_slots() {
        let mut factory = JobFactory::with_capacity(2);
        let (a, overflow_a) = factory.create(job(), None);
        let (b, overflow_b) = factory.create(job(), None);
        assert!(!overflow_a && !overflow_b);
        let (c, overflow_c) = factory.create(job(), None);
        assert!(overflow_c);
        assert_eq!(factory.capacity(), 3);
        factory.release(b);
        let (d, overflow_d) = factory.create(job(), Some(JobKey::OptimizeContext(OptContextId(1))));
        assert_eq!(d, b);
        assert!(!overflow_d);
        assert_eq!(factory.live(), 3);
        assert_eq!(factory.release(d), Some(JobKey::OptimizeContext(OptContextId(1))));
        assert_ne!(a, c);
    }

    #[test]
    fn waiters_and_cycles() {
        let mut factory = JobFactory::with_capacity(4);
        let (parent, _) = factory.create(job(), None);
        let (child, _) = factory.create(job(), None);
        let (grandchild, _) = factory.create(job(), None);
        factory.link(parent, child);
        factory.link(child, grandchild);
        assert!(factory.waits_for(parent, grandchild));
        assert!(!factory.waits_for(grandchild, parent));
        assert_eq!(factory.pending(parent), 1);
        assert_eq!(factory.notify_waiters(grandchild), vec![child]);
        assert!(!factory.waits_for(parent, grandchild));
        assert_eq!(factory.notify_waiters(child), vec![parent]);
        assert_eq!(factory.pending(parent), 0);
    }
}
