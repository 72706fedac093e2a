// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Dense numbering of every complete plan stored in the memo.
//!
//! A plan class is a group together with the properties it is required to deliver. Each class
//! has a list of alternatives (a costed group expression plus the classes of its children), and
//! the number of plans of a class is the sum over its alternatives of the product of the plan
//! counts of their children. A plan id is decoded by picking the alternative whose range holds
//! it and splitting the remainder among the children in mixed radix.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::context::CostContextId;
use super::memo::{ExprId, GroupId};
use crate::error::OptimizerError;

/// One costed implementation offered to the tree map by the memo.
#[derive(Clone, Debug)]
pub struct PlanLink<Prop> {
    pub expr_id: ExprId,
    pub cost_context: CostContextId,
    /// The class each child was optimized for, `None` for scalar children.
    pub children: Vec<Option<(GroupId, Prop)>>,
}

#[derive(Clone, Debug)]
struct PlanAlternative {
    expr_id: ExprId,
    cost_context: CostContextId,
    children: Vec<Option<usize>>,
    count: u64,
}

#[derive(Clone, Debug)]
struct PlanClass<Prop> {
    group_id: GroupId,
    required: Prop,
    alternatives: Vec<PlanAlternative>,
    count: u64,
}

/// A decoded plan id: which alternative was picked for every node of the plan.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlanChoice<Prop> {
    pub group_id: GroupId,
    /// What the parent requires from this node.
    pub required: Prop,
    pub expr_id: ExprId,
    pub cost_context: CostContextId,
    pub children: Vec<Option<PlanChoice<Prop>>>,
}

#[derive(Clone, Debug)]
pub struct TreeMap<Prop> {
    classes: Vec<PlanClass<Prop>>,
    root: usize,
}

struct TreeMapBuilder<Prop, F> {
    classes: Vec<PlanClass<Prop>>,
    index: HashMap<(GroupId, Prop), usize>,
    in_progress: HashSet<usize>,
    links: F,
}

impl<Prop, F> TreeMapBuilder<Prop, F>
where
    Prop: Clone + Eq + Hash,
    F: FnMut(GroupId, &Prop) -> Vec<PlanLink<Prop>>,
{
    /// Returns the class index and the oldest in-progress class it had to leave out, if any.
    fn class(&mut self, group_id: GroupId, required: Prop) -> (usize, Option<usize>) {
        stacker::maybe_grow(128 * 1024, 4 * 1024 * 1024, || {
            self.build_class(group_id, required)
        })
    }

    fn build_class(&mut self, group_id: GroupId, required: Prop) -> (usize, Option<usize>) {
        if let Some(&idx) = self.index.get(&(group_id, required.clone())) {
            let open = self.in_progress.contains(&idx).then_some(idx);
            return (idx, open);
        }
        let idx = self.classes.len();
        self.classes.push(PlanClass {
            group_id,
            required: required.clone(),
            alternatives: Vec::new(),
            count: 0,
        });
        self.index.insert((group_id, required.clone()), idx);
        self.in_progress.insert(idx);

        let mut seen = HashSet::new();
        let mut alternatives = Vec::new();
        let mut open: Option<usize> = None;
        for link in (self.links)(group_id, &required) {
            let key = (link.expr_id, link.children.clone());
            let mut children = Vec::with_capacity(link.children.len());
            let mut cyclic = false;
            for child in link.children {
                let child = child.map(|(child_group, child_required)| {
                    let (child, child_open) = self.class(child_group, child_required);
                    if let Some(child_open) = child_open {
                        open = Some(open.map_or(child_open, |open| open.min(child_open)));
                    }
                    child
                });
                cyclic |= child.map_or(false, |child| self.in_progress.contains(&child));
                children.push(child);
            }
            // A plan that contains itself is not a plan.
            if cyclic || !seen.insert(key) {
                continue;
            }
            let count = children
                .iter()
                .flatten()
                .fold(1u64, |acc, child| acc.saturating_mul(self.classes[*child].count));
            if count == 0 {
                continue;
            }
            alternatives.push(PlanAlternative {
                expr_id: link.expr_id,
                cost_context: link.cost_context,
                children,
                count,
            });
        }

        let class = &mut self.classes[idx];
        class.count = alternatives
            .iter()
            .fold(0u64, |acc, alternative| acc.saturating_add(alternative.count));
        class.alternatives = alternatives;
        self.in_progress.remove(&idx);
        // Plans cut because an ancestor was open are only missing on this path. The class
        // stays private to the ancestor and is rebuilt when reached from elsewhere.
        let open = open.filter(|&ancestor| ancestor < idx);
        if open.is_some() {
            self.index.remove(&(group_id, required));
        }
        (idx, open)
    }
}

impl<Prop: Clone + Eq + Hash> TreeMap<Prop> {
    /// Builds the tree map of the plans of `root` delivering `required`. `links` lists the
    /// costed implementations of a (group, required properties) pair.
    pub fn build<F>(root: GroupId, required: Prop, links: F) -> Self
    where
        F: FnMut(GroupId, &Prop) -> Vec<PlanLink<Prop>>,
    {
        let mut builder = TreeMapBuilder {
            classes: Vec::new(),
            index: HashMap::new(),
            in_progress: HashSet::new(),
            links,
        };
        let (root, _) = builder.class(root, required);
        Self {
            classes: builder.classes,
            root,
        }
    }

    /// Number of distinct complete plans, saturating at `u64::MAX`.
    pub fn count(&self) -> u64 {
        self.classes[self.root].count
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn root_group(&self) -> GroupId {
        self.classes[self.root].group_id
    }

    pub fn root_required(&self) -> &Prop {
        &self.classes[self.root].required
    }

    /// Decodes the 0-based plan id `rank`.
    pub fn unrank(&self, rank: u64) -> Result<PlanChoice<Prop>> {
        let count = self.count();
        if rank >= count {
            bail!(OptimizerError::PlanIdOutOfRange {
                plan_id: rank,
                count
            });
        }
        self.unrank_class(self.root, rank)
    }

    fn unrank_class(&self, class: usize, mut rank: u64) -> Result<PlanChoice<Prop>> {
        let class = &self.classes[class];
        for alternative in &class.alternatives {
            if rank >= alternative.count {
                rank -= alternative.count;
                continue;
            }
            let mut children = Vec::with_capacity(alternative.children.len());
            for child in &alternative.children {
                let Some(child) = child else {
                    children.push(None);
                    continue;
                };
                let radix = self.classes[*child].count;
                let child_rank = rank % radix;
                rank /= radix;
                children.push(Some(self.unrank_class(*child, child_rank)?));
            }
            return Ok(PlanChoice {
                group_id: class.group_id,
                required: class.required.clone(),
                expr_id: alternative.expr_id,
                cost_context: alternative.cost_context,
                children,
            });
        }
        bail!(OptimizerError::PlanIdOutOfRange {
            plan_id: rank,
            count: class.count
        })
    }
}

/// One sampled plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanSample {
    /// 1-based id of the plan in the tree map.
    pub plan_id: u64,
    pub cost: f64,
}

/// The sampled plan catalog handed to calibration tooling.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSamples {
    pub best_cost: f64,
    pub plan_space_size: u64,
    pub samples: Vec<PlanSample>,
}

impl PlanSamples {
    pub fn plan_ids(&self) -> Vec<u64> {
        self.samples.iter().map(|sample| sample.plan_id).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
