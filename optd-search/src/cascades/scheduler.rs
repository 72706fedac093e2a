// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Runs jobs to completion on one or more worker threads.
//!
//! Suspended jobs are resumed once every job they wait for has completed. Shared jobs (group
//! transitions and optimization contexts) have a single owner; later requesters wait for the
//! owner unless that would close a cycle of waiting jobs, in which case they continue without
//! the result, the same way the recursive search skips a context that is already in flight.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::context::ContextLookup;
use super::engine::Search;
use super::jobs::{Job, JobFactory, JobId, JobKey, JobSpec, JobStep, OptimizeGroupJob};
use crate::nodes::NodeType;
use crate::physical_property::PhysicalPropertyBuilder;

struct SchedulerState<Prop> {
    factory: JobFactory<Prop>,
    ready: VecDeque<JobId>,
    /// Jobs currently stepped by a worker.
    running: usize,
    owners: HashMap<JobKey, JobId>,
    error: Option<anyhow::Error>,
}

pub(crate) struct Scheduler<'s, 'a, T: NodeType, P: PhysicalPropertyBuilder<T>> {
    search: &'s Search<'a, T, P>,
    state: Mutex<SchedulerState<P::Prop>>,
    wakeup: Condvar,
}

impl<'s, 'a, T: NodeType, P: PhysicalPropertyBuilder<T>> Scheduler<'s, 'a, T, P> {
    pub fn new(search: &'s Search<'a, T, P>, capacity: usize) -> Self {
        Self {
            search,
            state: Mutex::new(SchedulerState {
                factory: JobFactory::with_capacity(capacity),
                ready: VecDeque::new(),
                running: 0,
                owners: HashMap::new(),
                error: None,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Runs `root` and everything it spawns. With a single worker the jobs run on the calling
    /// thread.
    pub fn run(self, root: JobSpec<P::Prop>, workers: usize) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.spawn(&mut state, None, root);
        }
        if workers <= 1 {
            self.work();
        } else {
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| self.work());
                }
            });
        }
        let mut state = self.state.into_inner();
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        if state.factory.live() > 0 && !self.search.is_cancelled() {
            warn!(event = "jobs_stranded", live = state.factory.live());
        }
        debug!(event = "scheduler_finish", capacity = state.factory.capacity());
        Ok(())
    }

    fn work(&self) {
        let mut state = self.state.lock();
        while state.error.is_none() {
            let Some(id) = state.ready.pop_front() else {
                if state.running == 0 {
                    break;
                }
                self.wakeup.wait(&mut state);
                continue;
            };
            let Some(mut job) = state.factory.take_job(id) else {
                continue;
            };
            state.running += 1;
            let step = MutexGuard::unlocked(&mut state, || job.step(self.search));
            state.running -= 1;
            match step {
                Ok(JobStep::Done) => self.complete(&mut state, id),
                Ok(JobStep::Wait(specs)) => {
                    state.factory.put_job(id, job);
                    for spec in specs {
                        self.spawn(&mut state, Some(id), spec);
                    }
                    if state.factory.pending(id) == 0 {
                        state.ready.push_back(id);
                    }
                }
                Err(err) => {
                    trace!(event = "job_failed", job = job.name(), job_id = id);
                    state.error = Some(err);
                }
            }
            self.wakeup.notify_all();
        }
        self.wakeup.notify_all();
    }

    fn complete(&self, state: &mut SchedulerState<P::Prop>, id: JobId) {
        let resumed = state.factory.notify_waiters(id);
        if let Some(key) = state.factory.release(id) {
            if state.owners.get(&key) == Some(&id) {
                state.owners.remove(&key);
            }
        }
        state.ready.extend(resumed);
    }

    fn spawn(
        &self,
        state: &mut SchedulerState<P::Prop>,
        parent: Option<JobId>,
        spec: JobSpec<P::Prop>,
    ) {
        match spec {
            JobSpec::Child(job) => {
                let id = self.create(state, job, None);
                if let Some(parent) = parent {
                    state.factory.link(parent, id);
                }
                state.ready.push_back(id);
            }
            JobSpec::Shared(key, job) => self.spawn_shared(state, parent, key, job),
            JobSpec::OptimizeChild {
                group_id,
                required,
                stats_context,
                origin,
            } => {
                if self.search.is_cancelled() {
                    return;
                }
                let lookup = self.search.memo().begin_context(
                    group_id,
                    &required,
                    &stats_context,
                    self.search.stage_idx(),
                );
                match lookup {
                    ContextLookup::Started(ctx_id) => self.spawn_shared(
                        state,
                        parent,
                        JobKey::OptimizeContext(ctx_id),
                        Job::OptimizeGroup(OptimizeGroupJob::new(ctx_id, origin)),
                    ),
                    ContextLookup::InFlight(ctx_id) => {
                        let owner = state.owners.get(&JobKey::OptimizeContext(ctx_id)).copied();
                        if let (Some(parent), Some(owner)) = (parent, owner) {
                            self.attach(state, parent, owner);
                        }
                    }
                    ContextLookup::Optimized(_) => {}
                }
            }
        }
    }

    fn spawn_shared(
        &self,
        state: &mut SchedulerState<P::Prop>,
        parent: Option<JobId>,
        key: JobKey,
        job: Job<P::Prop>,
    ) {
        if let Some(&owner) = state.owners.get(&key) {
            if let Some(parent) = parent {
                self.attach(state, parent, owner);
            }
            return;
        }
        let id = self.create(state, job, Some(key));
        state.owners.insert(key, id);
        if let Some(parent) = parent {
            state.factory.link(parent, id);
        }
        state.ready.push_back(id);
    }

    /// Makes `parent` wait for the running owner of a shared job, unless the owner already
    /// waits for `parent`.
    fn attach(&self, state: &mut SchedulerState<P::Prop>, parent: JobId, owner: JobId) {
        if parent == owner || state.factory.waits_for(owner, parent) {
            trace!(event = "job_cycle_avoided", job_id = parent, owner = owner);
            return;
        }
        state.factory.link(parent, owner);
    }

    fn create(
        &self,
        state: &mut SchedulerState<P::Prop>,
        job: Job<P::Prop>,
        key: Option<JobKey>,
    ) -> JobId {
        let name = job.name();
        let (id, overflow) = state.factory.create(job, key);
        self.search.stats().incr_job();
        if overflow {
            self.search.stats().incr_job_overflow();
            trace!(event = "job_pool_grown", capacity = state.factory.capacity());
        }
        trace!(event = "job_spawned", job = name, job_id = id);
        id
    }
}
