// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use anyhow::Result;

use crate::cascades::PhysicalPlan;
use crate::nodes::{ArcPlanNode, NodeType};
use crate::physical_property::PhysicalPropertyBuilder;

pub trait Optimizer<T: NodeType, P: PhysicalPropertyBuilder<T>> {
    /// Finds the cheapest physical plan of `root_rel` that delivers `required`.
    fn optimize(
        &mut self,
        root_rel: ArcPlanNode<T>,
        required: P::Prop,
    ) -> Result<PhysicalPlan<T, P::Prop>>;
}
