// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

mod ir;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use crate::nodes::{ArcPlanNode, NodeType, PlanNodeOrGroup};

pub use ir::RuleMatcher;

pub type RuleId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Logical to logical rewrites, applied while exploring.
    Exploration,
    /// Logical to physical rewrites, applied while implementing.
    Implementation,
}

/// A rule can be two kind:
/// 1. transformation rule fired to expand expression, generating new logical expressions
/// 2. implementation rule fired to generating corresponding physical expressions.
pub trait Rule<T: NodeType>: 'static + Send + Sync {
    fn matcher(&self) -> &RuleMatcher<T>;

    /// Produces alternatives for one binding. The binding is a tree shaped like the matcher
    /// whose unexpanded leaves reference memo groups. Every result is added to the group the
    /// binding was taken from.
    fn apply(&self, binding: ArcPlanNode<T>) -> Result<Vec<PlanNodeOrGroup<T>>>;

    fn name(&self) -> &'static str;

    fn is_impl_rule(&self) -> bool {
        false
    }

    fn kind(&self) -> RuleKind {
        if self.is_impl_rule() {
            RuleKind::Implementation
        } else {
            RuleKind::Exploration
        }
    }
}

/// The rules of one optimizer instance, keyed by a stable id (the registration order).
pub struct RuleRegistry<T: NodeType> {
    rules: Vec<Arc<dyn Rule<T>>>,
    disabled: HashSet<RuleId>,
}

impl<T: NodeType> RuleRegistry<T> {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            disabled: HashSet::new(),
        }
    }

    pub fn register(&mut self, rule: Arc<dyn Rule<T>>) -> RuleId {
        self.rules.push(rule);
        self.rules.len() - 1
    }

    pub fn with_rule(mut self, rule: Arc<dyn Rule<T>>) -> Self {
        self.register(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, rule_id: RuleId) -> &Arc<dyn Rule<T>> {
        &self.rules[rule_id]
    }

    pub fn find(&self, name: &str) -> Option<RuleId> {
        self.rules.iter().position(|rule| rule.name() == name)
    }

    pub fn disable(&mut self, rule_id: RuleId) {
        self.disabled.insert(rule_id);
    }

    pub fn enable(&mut self, rule_id: RuleId) {
        self.disabled.remove(&rule_id);
    }

    pub fn is_enabled(&self, rule_id: RuleId) -> bool {
        !self.disabled.contains(&rule_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &Arc<dyn Rule<T>>)> {
        self.rules.iter().enumerate()
    }

    /// Ids of every registered rule of the given kind, enabled or not.
    pub fn ids_of_kind(&self, kind: RuleKind) -> Vec<RuleId> {
        self.iter()
            .filter(|(_, rule)| rule.kind() == kind)
            .map(|(id, _)| id)
            .collect()
    }

    /// Enabled rules of `kind` whose pattern may apply to an operator of type `typ`.
    pub fn candidates<'a>(
        &'a self,
        typ: &'a T,
        kind: RuleKind,
    ) -> impl Iterator<Item = RuleId> + 'a {
        self.iter()
            .filter(move |(id, rule)| {
                rule.kind() == kind && self.is_enabled(*id) && rule.matcher().matches_top(typ)
            })
            .map(|(id, _)| id)
    }
}
