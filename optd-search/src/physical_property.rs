// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::nodes::NodeType;

/// What a property dimension asks the engine to do for a candidate implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnforcingType {
    /// The candidate cannot be used under this requirement, not even below an enforcer.
    Prohibited,
    /// An enforcer must be placed above the candidate.
    Required,
    /// The candidate is usable as is, an enforced variant is valid too.
    Optional,
    /// Nothing to do.
    Unnecessary,
}

impl EnforcingType {
    pub fn is_prohibited(self) -> bool {
        self == EnforcingType::Prohibited
    }

    /// Whether an enforcer should be added to the group.
    pub fn needs_enforcer(self) -> bool {
        matches!(self, EnforcingType::Required | EnforcingType::Optional)
    }

    /// Whether the candidate itself may be costed under the requirement.
    pub fn can_optimize(self) -> bool {
        matches!(self, EnforcingType::Optional | EnforcingType::Unnecessary)
    }
}

/// The independently enforced dimensions of a physical requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyDimension {
    Order,
    Distribution,
    Rewindability,
    PartitionPropagation,
}

impl PropertyDimension {
    pub const ALL: [PropertyDimension; 4] = [
        PropertyDimension::Order,
        PropertyDimension::Distribution,
        PropertyDimension::Rewindability,
        PropertyDimension::PartitionPropagation,
    ];
}

impl Display for PropertyDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PropertyDimension::Order => "order",
            PropertyDimension::Distribution => "distribution",
            PropertyDimension::Rewindability => "rewindability",
            PropertyDimension::PartitionPropagation => "partition_propagation",
        };
        write!(f, "{}", name)
    }
}

/// The protocol through which the engine requests, derives and enforces physical properties.
///
/// `Prop` is the same for both derived and required property. A requirement is a descriptor of
/// everything the parent needs (order, distribution, rewindability, partition propagation,
/// required columns, CTE dependencies); a derived value describes what a plan delivers.
pub trait PhysicalPropertyBuilder<T: NodeType>: 'static + Send + Sync + Sized {
    type Prop: 'static + Send + Sync + Sized + Clone + Debug + Eq + Hash;

    /// The requirement that asks for nothing.
    fn any(&self) -> Self::Prop;

    /// Number of alternative ways the operator can push requirements down to its children.
    fn num_requests(&self, _typ: &T) -> usize {
        1
    }

    /// Required properties of child `child_idx` under optimization request `request`.
    /// `derived_children` holds what the already optimized (non-scalar) children deliver.
    fn required_child(
        &self,
        typ: &T,
        required: &Self::Prop,
        request: usize,
        child_idx: usize,
        derived_children: &[Self::Prop],
    ) -> Self::Prop;

    /// What a physical operator delivers given what its non-scalar children deliver.
    fn derive(&self, typ: &T, children: &[Self::Prop]) -> Self::Prop;

    fn satisfies(&self, derived: &Self::Prop, required: &Self::Prop) -> bool;

    fn enforcing_type(
        &self,
        dimension: PropertyDimension,
        typ: &T,
        derived: &Self::Prop,
        required: &Self::Prop,
    ) -> EnforcingType;

    /// Enforcer operators for one dimension. Each one is placed over the group it enforces.
    fn enforce(&self, dimension: PropertyDimension, required: &Self::Prop, derived: &Self::Prop)
        -> Vec<T>;

    /// Checked before any child is optimized. Vetoing here is what keeps an enforcer from
    /// optimizing its own group under the same requirement.
    fn check_required(&self, _typ: &T, _required: &Self::Prop, _request: usize) -> bool {
        true
    }

    /// Checked when a group expression is about to be optimized under a parent.
    fn may_optimize(&self, _parent: Option<&T>, _child: &T, _required: &Self::Prop) -> bool {
        true
    }

    /// Checked after enforcement, with the derived properties of the chosen children.
    fn valid_context(&self, _typ: &T, _required: &Self::Prop, _children: &[Self::Prop]) -> bool {
        true
    }

    fn property_name(&self) -> &'static str;
}
