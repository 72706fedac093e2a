// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

#![allow(clippy::new_without_default)]

pub mod cascades;
pub mod config;
pub mod cost;
pub mod error;
pub mod logical_property;
pub mod nodes;
pub mod optimizer;
pub mod physical_property;
pub mod rules;
pub mod testing;
