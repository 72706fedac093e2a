// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Tree-shaped plans exchanged with the search engine. Leaves may point back into the memo.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cascades::GroupId;

/// Coarse priority band of a physical operator. Expressions in the `High` band of a group are
/// optimized before the ones in the `Low` band.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptimizationLevel {
    #[default]
    Low,
    High,
}

impl OptimizationLevel {
    /// Bands in the order they are scanned.
    pub const SCAN_ORDER: [OptimizationLevel; 2] =
        [OptimizationLevel::High, OptimizationLevel::Low];
}

/// The operator payload of the host system. The search engine never looks inside it except
/// through the methods below.
pub trait NodeType:
    PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync
{
    /// Logical operators are explored and implemented, physical ones are costed.
    fn is_logical(&self) -> bool;

    /// Scalar operators live in their own groups and are never optimized on their own.
    fn is_scalar(&self) -> bool {
        false
    }

    /// Enforcers are synthesized by the engine and always sit on top of their own group.
    fn is_enforcer(&self) -> bool {
        false
    }

    fn optimization_level(&self) -> OptimizationLevel {
        OptimizationLevel::Low
    }

    /// Rejects physical parent/child pairs that can never form a valid plan, e.g. an operator
    /// destroying the very property its parent relies on.
    fn accepts_child(&self, _child: &Self) -> bool {
        true
    }
}

pub type ArcPlanNode<T> = Arc<PlanNode<T>>;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum PlanNodeOrGroup<T: NodeType> {
    PlanNode(ArcPlanNode<T>),
    Group(GroupId),
}

impl<T: NodeType> PlanNodeOrGroup<T> {
    pub fn is_materialized(&self) -> bool {
        matches!(self, PlanNodeOrGroup::PlanNode(_))
    }

    pub fn unwrap_typ(&self) -> Option<&T> {
        match self {
            PlanNodeOrGroup::PlanNode(node) => Some(&node.typ),
            PlanNodeOrGroup::Group(_) => None,
        }
    }

    pub fn unwrap_plan_node(&self) -> Option<ArcPlanNode<T>> {
        match self {
            PlanNodeOrGroup::PlanNode(node) => Some(node.clone()),
            PlanNodeOrGroup::Group(_) => None,
        }
    }

    pub fn unwrap_group(&self) -> Option<GroupId> {
        match self {
            PlanNodeOrGroup::PlanNode(_) => None,
            PlanNodeOrGroup::Group(group_id) => Some(*group_id),
        }
    }
}

impl<T: NodeType> From<ArcPlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(node: ArcPlanNode<T>) -> Self {
        PlanNodeOrGroup::PlanNode(node)
    }
}

impl<T: NodeType> From<PlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(node: PlanNode<T>) -> Self {
        PlanNodeOrGroup::PlanNode(Arc::new(node))
    }
}

impl<T: NodeType> From<GroupId> for PlanNodeOrGroup<T> {
    fn from(group_id: GroupId) -> Self {
        PlanNodeOrGroup::Group(group_id)
    }
}

impl<T: NodeType> Display for PlanNodeOrGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanNodeOrGroup::PlanNode(node) => write!(f, "{}", node),
            PlanNodeOrGroup::Group(group_id) => write!(f, "{}", group_id),
        }
    }
}

/// A tree of operators whose leaves may reference existing memo groups.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PlanNode<T: NodeType> {
    pub typ: T,
    pub children: Vec<PlanNodeOrGroup<T>>,
}

impl<T: NodeType> PlanNode<T> {
    pub fn new(typ: T, children: Vec<PlanNodeOrGroup<T>>) -> Self {
        Self { typ, children }
    }

    pub fn leaf(typ: T) -> Self {
        Self {
            typ,
            children: vec![],
        }
    }

    pub fn child(&self, idx: usize) -> &PlanNodeOrGroup<T> {
        &self.children[idx]
    }

    pub fn into_arc(self) -> ArcPlanNode<T> {
        Arc::new(self)
    }
}

impl<T: NodeType> Display for PlanNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        write!(f, ")")
    }
}
