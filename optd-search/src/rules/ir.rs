// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::mem::Discriminant;

use crate::nodes::NodeType;

/// The shape of the bindings a rule wants to see. The top of a matcher is always a node
/// matcher; it doubles as the coarse applicability test of the rule.
pub enum RuleMatcher<T: NodeType> {
    /// Match a node of type `typ`.
    MatchNode { typ: T, children: Vec<Self> },
    /// Match a node with the same enum variant as `typ_discriminant`.
    MatchDiscriminant {
        typ_discriminant: Discriminant<T>,
        children: Vec<Self>,
    },
    /// Bind one child group as a leaf without expanding it.
    Any,
    /// Bind all remaining child groups as leaves. Must be the last child matcher.
    AnyMany,
}

impl<T: NodeType> RuleMatcher<T> {
    /// Matches any node with the same variant as `typ`, binding `arity` children as group leaves.
    pub fn of_variant(typ: &T, arity: usize) -> Self {
        RuleMatcher::MatchDiscriminant {
            typ_discriminant: std::mem::discriminant(typ),
            children: (0..arity).map(|_| RuleMatcher::Any).collect(),
        }
    }

    /// Whether a node of type `typ` may start a binding of this matcher.
    pub fn matches_top(&self, typ: &T) -> bool {
        match self {
            RuleMatcher::MatchNode { typ: expected, .. } => expected == typ,
            RuleMatcher::MatchDiscriminant {
                typ_discriminant, ..
            } => std::mem::discriminant(typ) == *typ_discriminant,
            RuleMatcher::Any | RuleMatcher::AnyMany => false,
        }
    }

    pub fn children(&self) -> &[RuleMatcher<T>] {
        match self {
            RuleMatcher::MatchNode { children, .. }
            | RuleMatcher::MatchDiscriminant { children, .. } => children,
            RuleMatcher::Any | RuleMatcher::AnyMany => &[],
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, RuleMatcher::Any | RuleMatcher::AnyMany)
    }
}
