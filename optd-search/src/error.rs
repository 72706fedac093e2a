// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use thiserror::Error;

use crate::cascades::GroupId;

/// Failures callers may want to tell apart. They travel inside [`anyhow::Error`] and can be
/// recovered with `downcast_ref::<OptimizerError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizerError {
    #[error("no plan found satisfying the required properties")]
    NoPlanFound,
    #[error("plan alternative {plan_id} requested, but only {count} alternatives exist")]
    InvalidPlanAlternative { plan_id: u64, count: u64 },
    #[error("plan id {plan_id} is out of range, the plan space has {count} plans")]
    PlanIdOutOfRange { plan_id: u64, count: u64 },
    #[error("recursion depth {depth} exceeded while optimizing")]
    RecursionLimitExceeded { depth: usize },
    #[error("plan rooted at group {group_id} does not satisfy its required properties")]
    UnsatisfiedRequiredProperties { group_id: GroupId },
    #[error("optimization cancelled")]
    Cancelled,
    #[error("optimizer is not initialized with a query")]
    NotInitialized,
}

impl OptimizerError {
    /// Whether `err` carries the given kind of failure.
    pub fn matches(err: &anyhow::Error, f: impl Fn(&OptimizerError) -> bool) -> bool {
        err.downcast_ref::<OptimizerError>().map_or(false, f)
    }
}
