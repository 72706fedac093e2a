// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use super::memo::{ExprId, GroupId};
use crate::cost::Cost;
use crate::nodes::NodeType;

/// A node of an extracted plan. Every node carries the memo location it was taken from, its
/// total cost and the physical properties it delivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalPlan<T: NodeType, Prop> {
    pub typ: T,
    pub children: Vec<Arc<PhysicalPlan<T, Prop>>>,
    pub group_id: GroupId,
    pub expr_id: ExprId,
    pub cost: Cost,
    pub properties: Prop,
}

impl<T: NodeType, Prop> PhysicalPlan<T, Prop> {
    pub fn child(&self, idx: usize) -> &PhysicalPlan<T, Prop> {
        &self.children[idx]
    }

    /// Breadth-first walk over the plan.
    pub fn nodes(&self) -> Vec<&PhysicalPlan<T, Prop>> {
        let mut nodes = vec![self];
        let mut idx = 0;
        while idx < nodes.len() {
            let node = nodes[idx];
            nodes.extend(node.children.iter().map(|child| child.as_ref()));
            idx += 1;
        }
        nodes
    }

    pub fn is_physical(&self) -> bool {
        !self.typ.is_logical() && self.children.iter().all(|child| child.is_physical())
    }

    /// The plan as an s-expression of operators, without costs.
    pub fn shape(&self) -> String {
        if self.children.is_empty() {
            return format!("({})", self.typ);
        }
        let children = self
            .children
            .iter()
            .map(|child| child.shape())
            .collect::<Vec<_>>()
            .join(" ");
        format!("({} {})", self.typ, children)
    }

    fn fmt_indented(&self, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result
    where
        Prop: Debug,
    {
        writeln!(
            f,
            "{:indent$}{} {} cost={} props={:?}",
            "",
            self.typ,
            self.group_id,
            self.cost,
            self.properties,
            indent = depth * 2
        )?;
        for child in &self.children {
            child.fmt_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl<T: NodeType, Prop: Debug> Display for PhysicalPlan<T, Prop> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_indented(f, 0)
    }
}
