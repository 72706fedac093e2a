// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of initial job slots.
pub const DEFAULT_JOBS_CAP: usize = 5000;
/// Estimated number of jobs needed per memo group.
pub const DEFAULT_JOBS_PER_GROUP: usize = 20;

/// How the recursive search is executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchMode {
    /// Direct mutual recursion on the calling thread.
    #[default]
    Recursive,
    /// A job graph executed by a pool of `workers` threads.
    Jobs { workers: usize },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerProperties {
    pub search_mode: SearchMode,
    pub jobs_per_group: usize,
    pub max_jobs: usize,
    /// Disable cost-bound pruning during optimization.
    pub disable_pruning: bool,
    /// Scan every optimization level of a group, even after a higher level found a plan.
    pub optimize_all_levels: bool,
    /// Depth at which the recursive search gives up.
    pub max_recursion_depth: usize,
    /// Record a trace of every rule application and winner decision.
    pub enable_tracing: bool,
    /// Panic when a search stage runs out of budget, used in tests.
    pub panic_on_budget: bool,
    /// Budget for the whole optimization, across all stages.
    #[serde(with = "duration_millis")]
    pub timeout: Option<Duration>,
}

impl Default for OptimizerProperties {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::Recursive,
            jobs_per_group: DEFAULT_JOBS_PER_GROUP,
            max_jobs: DEFAULT_JOBS_CAP,
            disable_pruning: false,
            optimize_all_levels: false,
            max_recursion_depth: 10_000,
            enable_tracing: false,
            panic_on_budget: false,
            timeout: None,
        }
    }
}

impl OptimizerProperties {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            search_mode: SearchMode::Jobs { workers },
            ..Default::default()
        }
    }
}

/// Knobs of plan enumeration and sampling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumeratorConfig {
    /// Build the plan space index and honor `plan_id`.
    pub enumerate: bool,
    /// 1-based id of the plan alternative to extract instead of the cheapest plan; 0 extracts
    /// the cheapest plan.
    pub plan_id: u64,
    /// Number of plans to sample after optimization; 0 disables sampling.
    pub samples: u64,
    /// Accept a sample only if its cost is within this factor of the best cost; 0 accepts all.
    pub cost_threshold: f64,
    /// Skip samples whose plan turns out to violate its required properties.
    pub sample_valid_plans: bool,
    /// Seed of the sampler; a random seed is used when absent.
    pub seed: Option<u64>,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self {
            enumerate: false,
            plan_id: 0,
            samples: 0,
            cost_threshold: 0.0,
            sample_valid_plans: true,
            seed: None,
        }
    }
}

impl EnumeratorConfig {
    pub fn sampling(samples: u64) -> Self {
        Self {
            enumerate: true,
            samples,
            ..Default::default()
        }
    }

    pub fn forced_plan(plan_id: u64) -> Self {
        Self {
            enumerate: true,
            plan_id,
            ..Default::default()
        }
    }

    pub fn accepts_cost(&self, cost: f64, best_cost: f64) -> bool {
        self.cost_threshold <= 0.0 || cost <= best_cost * self.cost_threshold
    }
}

/// Knobs forwarded to statistics derivation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub damping_factor_filter: f64,
    pub damping_factor_join: f64,
    pub damping_factor_groupby: f64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            damping_factor_filter: 0.75,
            damping_factor_join: 0.01,
            damping_factor_groupby: 0.75,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .map(|duration| duration.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize_partial_properties() {
        let props: OptimizerProperties = serde_json::from_str(
            r#"{
                "search_mode": { "mode": "jobs", "workers": 4 },
                "disable_pruning": true,
                "timeout": 250
            }"#,
        )
        .unwrap();
        assert_eq!(props.search_mode, SearchMode::Jobs { workers: 4 });
        assert!(props.disable_pruning);
        assert_eq!(props.timeout, Some(Duration::from_millis(250)));
        assert_eq!(props.jobs_per_group, DEFAULT_JOBS_PER_GROUP);
    }

    #[test]
    fn cost_threshold() {
        let mut config = EnumeratorConfig::sampling(10);
        assert!(config.accepts_cost(1000.0, 1.0));
        config.cost_threshold = 2.0;
        assert!(config.accepts_cost(2.0, 1.0));
        assert!(!config.accepts_cost(2.5, 1.0));
    }
}
