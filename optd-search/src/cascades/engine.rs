// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

mod extract;
mod recursive;
mod search;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use tracing::{debug, info};

pub(crate) use search::{RequestState, RequestStep, Search};

use super::memo::{ExprOrigin, GroupId, Memo};
use super::search_stage::{SearchStage, StageResult};
use super::stats::CascadesStats;
use super::tree_map::{PlanSamples, TreeMap};
use super::PhysicalPlan;
use crate::config::{EnumeratorConfig, OptimizerProperties, StatisticsConfig};
use crate::cost::CostModel;
use crate::error::OptimizerError;
use crate::logical_property::LogicalPropertyBuilderAny;
use crate::nodes::{ArcPlanNode, NodeType, PlanNodeOrGroup};
use crate::optimizer::Optimizer;
use crate::physical_property::PhysicalPropertyBuilder;
use crate::rules::RuleRegistry;

/// Lets the host cancel a running optimization from another thread. Cancellation is
/// cooperative: the search polls the flag at every recursive step and job resumption.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// The cascades search engine. One engine optimizes one query at a time; every call to
/// [`Engine::init`] starts over with an empty memo.
pub struct Engine<T: NodeType, P: PhysicalPropertyBuilder<T>> {
    memo: Memo<T, P>,
    rules: RuleRegistry<T>,
    cost: Arc<dyn CostModel<T>>,
    property_builder: Arc<P>,
    logical_property_builders: Arc<[Box<dyn LogicalPropertyBuilderAny<T>>]>,
    properties: OptimizerProperties,
    enumerator: EnumeratorConfig,
    statistics: StatisticsConfig,
    stages: Vec<SearchStage>,
    stats: CascadesStats,
    abort: AbortHandle,
    root: Option<(GroupId, P::Prop)>,
    deadline: Option<Instant>,
    tree_map: Option<TreeMap<P::Prop>>,
    samples: Option<PlanSamples>,
}

impl<T: NodeType, P: PhysicalPropertyBuilder<T>> Engine<T, P> {
    pub fn new(
        rules: RuleRegistry<T>,
        cost: Arc<dyn CostModel<T>>,
        property_builder: Arc<P>,
        logical_property_builders: Arc<[Box<dyn LogicalPropertyBuilderAny<T>>]>,
        properties: OptimizerProperties,
    ) -> Self {
        let stats = CascadesStats::new(rules.iter().map(|(_, rule)| rule.name()).collect());
        Self {
            memo: Memo::new(logical_property_builders.clone()),
            rules,
            cost,
            property_builder,
            logical_property_builders,
            properties,
            enumerator: EnumeratorConfig::default(),
            statistics: StatisticsConfig::default(),
            stages: SearchStage::default_stages(),
            stats,
            abort: AbortHandle::default(),
            root: None,
            deadline: None,
            tree_map: None,
            samples: None,
        }
    }

    pub fn with_stages(mut self, stages: Vec<SearchStage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_enumerator(mut self, enumerator: EnumeratorConfig) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn with_statistics_config(mut self, statistics: StatisticsConfig) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn memo(&self) -> &Memo<T, P> {
        &self.memo
    }

    pub fn rules(&self) -> &RuleRegistry<T> {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut RuleRegistry<T> {
        &mut self.rules
    }

    pub fn stats(&self) -> &CascadesStats {
        &self.stats
    }

    pub fn stages(&self) -> &[SearchStage] {
        &self.stages
    }

    pub fn set_stages(&mut self, stages: Vec<SearchStage>) {
        self.stages = stages;
    }

    pub fn properties(&self) -> &OptimizerProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut OptimizerProperties {
        &mut self.properties
    }

    pub fn enumerator_mut(&mut self) -> &mut EnumeratorConfig {
        &mut self.enumerator
    }

    pub fn property_builder(&self) -> &Arc<P> {
        &self.property_builder
    }

    pub fn cost_model(&self) -> &Arc<dyn CostModel<T>> {
        &self.cost
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn root_group(&self) -> Option<GroupId> {
        self.root.as_ref().map(|(group_id, _)| self.memo.resolve(*group_id))
    }

    /// Starts a new optimization: clears the memo and inserts the query as the root group.
    pub fn init(&mut self, root_rel: ArcPlanNode<T>, required: P::Prop) -> Result<GroupId> {
        self.memo = Memo::new(self.logical_property_builders.clone());
        self.stats = CascadesStats::new(self.rules.iter().map(|(_, rule)| rule.name()).collect());
        self.abort.reset();
        self.tree_map = None;
        self.samples = None;
        let group_id = self.memo.insert(
            None,
            &PlanNodeOrGroup::PlanNode(root_rel),
            ExprOrigin::input(),
        )?;
        self.root = Some((group_id, required));
        Ok(group_id)
    }

    /// Runs every search stage over the memo. A stage that runs out of budget simply
    /// contributes no plan.
    pub fn run(&mut self) -> Result<()> {
        let Some((root, required)) = self.root.clone() else {
            bail!(OptimizerError::NotInitialized);
        };
        if self.abort.is_aborted() {
            bail!(OptimizerError::Cancelled);
        }
        self.tree_map = None;
        self.samples = None;
        self.deadline = self.properties.timeout.map(|timeout| Instant::now() + timeout);
        let mut stages = std::mem::take(&mut self.stages);
        if stages.is_empty() {
            stages = SearchStage::default_stages();
        }
        let outcome = self.run_stages(&mut stages, root, &required);
        self.stages = stages;
        outcome
    }

    fn run_stages(
        &self,
        stages: &mut [SearchStage],
        root: GroupId,
        required: &P::Prop,
    ) -> Result<()> {
        for stage in stages.iter_mut() {
            stage.reset();
        }
        for stage_idx in 0..stages.len() {
            if stage_idx > 0 {
                if stages[stage_idx - 1].reached_cost_threshold() {
                    debug!(event = "search_terminated", reason = "cost_threshold", stage = stage_idx);
                    break;
                }
                self.memo.reset_states();
            }
            if self.abort.is_aborted() || self.deadline_passed() {
                debug!(event = "search_terminated", reason = "cancelled", stage = stage_idx);
                break;
            }
            stages[stage_idx].restart_timer();
            let result = self.run_stage(&stages[stage_idx], stage_idx, root, required)?;
            let stage = &mut stages[stage_idx];
            match result {
                Some(result) => stage.set_best(result),
                None if self.properties.panic_on_budget && stage.is_timed_out() => {
                    panic!("search stage {} ran out of budget without a plan", stage_idx)
                }
                None => {}
            }
        }
        Ok(())
    }

    fn run_stage(
        &self,
        stage: &SearchStage,
        stage_idx: usize,
        root: GroupId,
        required: &P::Prop,
    ) -> Result<Option<StageResult>> {
        debug!(event = "stage_begin", stage = stage_idx, groups = self.memo.num_groups());
        let search = Search::new(self, stage, stage_idx);
        search.explore(root)?;
        search.implement(root)?;
        let best = search.optimize(root, required)?;
        debug!(
            event = "stage_finish",
            stage = stage_idx,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            groups = self.memo.num_groups(),
            exprs = self.memo.num_exprs(),
            cost = ?best.map(|best| best.cost)
        );
        Ok(best)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }
}

impl<T: NodeType, P: PhysicalPropertyBuilder<T>> Optimizer<T, P> for Engine<T, P> {
    fn optimize(
        &mut self,
        root_rel: ArcPlanNode<T>,
        required: P::Prop,
    ) -> Result<PhysicalPlan<T, P::Prop>> {
        self.init(root_rel, required)?;
        self.run()?;
        if self.enumerator.samples > 0 {
            self.sample_plans()?;
        }
        let plan = self.extract_plan()?;
        info!(
            event = "optimize_finish",
            cost = %plan.cost,
            groups = self.memo.num_groups(),
            exprs = self.memo.num_exprs()
        );
        Ok(plan)
    }
}
