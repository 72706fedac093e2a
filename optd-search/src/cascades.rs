// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The cascades search: memo, optimization contexts, search stages and the engine driving
//! them, either recursively or through the job scheduler.

mod context;
mod engine;
mod jobs;
mod memo;
mod plan;
mod scheduler;
mod search_stage;
mod stats;
mod tree_map;

pub use context::{
    ContextLookup, ContextState, CostContext, CostContextId, OptContextId, OptimizationContext,
};
pub use engine::{AbortHandle, Engine};
pub use memo::{
    ArcMemoPlanNode, DisjointSet, ExprId, ExprInfo, ExprOrigin, GroupId, InsertResult, Memo,
    MemoPlanNode, TransitionAxis, TransitionState,
};
pub use plan::PhysicalPlan;
pub use search_stage::{SearchStage, StageResult};
pub use stats::{CascadesStats, OptimizerTrace, StatsSnapshot};
pub use tree_map::{PlanChoice, PlanLink, PlanSample, PlanSamples, TreeMap};
