// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::any::Any;
use std::fmt::Debug;

use crate::nodes::NodeType;

/// Type-erased [`LogicalPropertyBuilder`], so that a memo can hold builders of different
/// property types side by side.
pub trait LogicalPropertyBuilderAny<T: NodeType>: 'static + Send + Sync {
    fn derive_any(&self, typ: &T, children: &[&dyn Any]) -> Box<dyn Any + Send + Sync + 'static>;
    fn eq_any(&self, a: &dyn Any, b: &dyn Any) -> bool;
    fn display(&self, prop: &dyn Any) -> String;
    fn property_name(&self) -> &'static str;
}

/// Derives a logical property of a group (output columns, keys, ...) from the operator of one
/// of its expressions and the properties of its child groups. All expressions of a group must
/// derive the same value.
pub trait LogicalPropertyBuilder<T: NodeType>: 'static + Send + Sync + Sized {
    type Prop: 'static + Send + Sync + Sized + Clone + Debug + PartialEq;
    fn derive(&self, typ: &T, children: &[&Self::Prop]) -> Self::Prop;
    fn property_name(&self) -> &'static str;
}

impl<T: NodeType, P: LogicalPropertyBuilder<T>> LogicalPropertyBuilderAny<T> for P {
    fn derive_any(&self, typ: &T, children: &[&dyn Any]) -> Box<dyn Any + Send + Sync + 'static> {
        let children: Vec<&P::Prop> = children
            .iter()
            .map(|child| {
                child
                    .downcast_ref::<P::Prop>()
                    .expect("Failed to downcast child")
            })
            .collect();
        Box::new(self.derive(typ, &children))
    }

    fn eq_any(&self, a: &dyn Any, b: &dyn Any) -> bool {
        match (a.downcast_ref::<P::Prop>(), b.downcast_ref::<P::Prop>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn display(&self, prop: &dyn Any) -> String {
        match prop.downcast_ref::<P::Prop>() {
            Some(prop) => format!("{:?}", prop),
            None => "<unknown>".to_string(),
        }
    }

    fn property_name(&self) -> &'static str {
        LogicalPropertyBuilder::property_name(self)
    }
}
