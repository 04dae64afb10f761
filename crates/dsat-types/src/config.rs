//! Search configuration consumed when a search method is constructed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::errors::{DsatError, DsatResult};

/// Metrics reported by DeepSpeed autotuning where a lower value is better.
pub const SMALLER_IS_BETTER_METRICS: &[&str] = &["forward", "backward", "latency"];

/// Metrics reported by DeepSpeed autotuning where a higher value is better.
pub const LARGER_IS_BETTER_METRICS: &[&str] = &["throughput", "FLOPS_per_gpu"];

/// Whether we are maximizing or minimizing the searcher metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl ObjectiveDirection {
    /// Direction for one of the metrics DeepSpeed knows how to report.
    pub fn for_metric(metric: &str) -> Option<Self> {
        if SMALLER_IS_BETTER_METRICS.contains(&metric) {
            Some(Self::Minimize)
        } else if LARGER_IS_BETTER_METRICS.contains(&metric) {
            Some(Self::Maximize)
        } else {
            None
        }
    }

    pub fn smaller_is_better(self) -> bool {
        matches!(self, Self::Minimize)
    }

    /// True when `candidate` strictly improves on `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// Strategy-specific knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SearchMethodConfig {
    /// Randomized bisection with aggressive lineage pruning.
    Random {
        /// Maximum number of trials spent optimizing one random configuration.
        trials_per_random_config: usize,
        /// Trials to run without improvement before stopping. `None` disables it.
        early_stopping: Option<usize>,
    },
    /// Exact bisection over each randomly generated configuration.
    Binary {
        /// Scales the estimated ceiling of the initial batch size interval.
        search_range_factor: f64,
    },
    /// Asynchronous successive halving, using binary search trials as the resource.
    Asha {
        /// `R`: maximum resource per lineage.
        max_resource: usize,
        /// `r`: minimum resource per lineage.
        min_resource: usize,
        /// `s`: early stopping rate.
        early_stopping_rate: u32,
        /// `eta`: reduction factor between rungs.
        divisor: usize,
        search_range_factor: f64,
    },
}

impl SearchMethodConfig {
    pub fn random() -> Self {
        Self::Random {
            trials_per_random_config: 5,
            early_stopping: None,
        }
    }

    pub fn binary() -> Self {
        Self::Binary {
            search_range_factor: 1.0,
        }
    }

    pub fn asha() -> Self {
        Self::Asha {
            max_resource: 16,
            min_resource: 1,
            early_stopping_rate: 0,
            divisor: 2,
            search_range_factor: 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Random { .. } => "random",
            Self::Binary { .. } => "binary",
            Self::Asha { .. } => "asha",
        }
    }

    fn validate(&self) -> DsatResult<()> {
        match self {
            Self::Random {
                trials_per_random_config,
                ..
            } => {
                if *trials_per_random_config == 0 {
                    return Err(DsatError::config(
                        "trials_per_random_config must be at least 1",
                    ));
                }
            }
            Self::Binary {
                search_range_factor,
            } => validate_range_factor(*search_range_factor)?,
            Self::Asha {
                max_resource,
                min_resource,
                divisor,
                search_range_factor,
                ..
            } => {
                validate_range_factor(*search_range_factor)?;
                if *divisor < 2 {
                    return Err(DsatError::config("asha divisor must be at least 2"));
                }
                if *min_resource == 0 {
                    return Err(DsatError::config("asha min_resource must be at least 1"));
                }
                if max_resource < min_resource {
                    return Err(DsatError::config(format!(
                        "asha max_resource ({max_resource}) must not be smaller than min_resource ({min_resource})"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_range_factor(factor: f64) -> DsatResult<()> {
    if !factor.is_finite() || factor <= 0.0 {
        return Err(DsatError::config(format!(
            "search_range_factor must be positive, got {factor}"
        )));
    }
    Ok(())
}

impl Default for SearchMethodConfig {
    fn default() -> Self {
        Self::random()
    }
}

/// Top-level configuration for an autotuning search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Upper bound on trials ever created, the profiling trial included.
    pub max_trials: usize,

    /// How many trials may run at once.
    pub max_concurrent_trials: usize,

    /// Optional cap on slots occupied by running trials.
    pub max_slots: Option<usize>,

    /// ZeRO stages the search may pick from.
    pub zero_stages: BTreeSet<u8>,

    /// Metric name to optimize (e.g. "throughput", "latency").
    pub metric: String,

    pub direction: ObjectiveDirection,

    pub start_profile_step: u64,
    pub end_profile_step: u64,

    pub random_seed: u64,

    /// Submit the best configuration as a full experiment once the search ends.
    pub run_full_experiment: bool,

    /// Directory against which a `deepspeed_config` path is resolved.
    pub model_dir: Option<PathBuf>,

    pub method: SearchMethodConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_trials: 64,
            max_concurrent_trials: 16,
            max_slots: None,
            zero_stages: [1, 2, 3].into_iter().collect(),
            metric: "throughput".to_string(),
            direction: ObjectiveDirection::Maximize,
            start_profile_step: 3,
            end_profile_step: 5,
            random_seed: 42,
            run_full_experiment: false,
            model_dir: None,
            method: SearchMethodConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn new(method: SearchMethodConfig) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_max_concurrent_trials(mut self, n: usize) -> Self {
        self.max_concurrent_trials = n;
        self
    }

    pub fn with_max_slots(mut self, slots: usize) -> Self {
        self.max_slots = Some(slots);
        self
    }

    pub fn with_zero_stages(mut self, stages: impl IntoIterator<Item = u8>) -> Self {
        self.zero_stages = stages.into_iter().collect();
        self
    }

    /// Use one of the known DeepSpeed metrics, deriving its direction.
    pub fn with_metric(mut self, metric: &str) -> DsatResult<Self> {
        let direction = ObjectiveDirection::for_metric(metric).ok_or_else(|| {
            let valid: Vec<&str> = SMALLER_IS_BETTER_METRICS
                .iter()
                .chain(LARGER_IS_BETTER_METRICS)
                .copied()
                .collect();
            DsatError::config(format!("metric must be one of {valid:?}, not {metric}"))
        })?;
        self.metric = metric.to_string();
        self.direction = direction;
        Ok(self)
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.metric = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_profile_steps(mut self, start: u64, end: u64) -> Self {
        self.start_profile_step = start;
        self.end_profile_step = end;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_run_full_experiment(mut self, enabled: bool) -> Self {
        self.run_full_experiment = enabled;
        self
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = Some(dir.into());
        self
    }

    pub fn smaller_is_better(&self) -> bool {
        self.direction.smaller_is_better()
    }

    /// Number of trials which fit in the concurrency and slot limits at once.
    pub fn concurrent_trial_capacity(&self, slots_per_trial: usize) -> usize {
        let mut capacity = self.max_concurrent_trials;
        if let Some(max_slots) = self.max_slots {
            capacity = capacity.min(max_slots / slots_per_trial.max(1));
        }
        capacity
    }

    /// Check the configuration against the slot count of the submitted experiment.
    pub fn validate(&self, slots_per_trial: usize) -> DsatResult<()> {
        if self.max_trials < 2 {
            return Err(DsatError::config(
                "max_trials must be at least 2 (profiling trial plus one search trial)",
            ));
        }
        if self.max_concurrent_trials == 0 {
            return Err(DsatError::config("max_concurrent_trials must be at least 1"));
        }
        if slots_per_trial == 0 {
            return Err(DsatError::config("slots_per_trial must be at least 1"));
        }
        if let Some(max_slots) = self.max_slots {
            if max_slots < slots_per_trial {
                return Err(DsatError::config(format!(
                    "max_slots ({max_slots}) cannot fit a single trial of {slots_per_trial} slots"
                )));
            }
        }
        if self.zero_stages.is_empty() {
            return Err(DsatError::config("zero_stages must not be empty"));
        }
        if let Some(stage) = self.zero_stages.iter().find(|s| **s > 3) {
            return Err(DsatError::config(format!(
                "invalid zero stage {stage}, must be one of 0, 1, 2, 3"
            )));
        }
        if self.end_profile_step <= self.start_profile_step {
            return Err(DsatError::config(format!(
                "end_profile_step ({}) must exceed start_profile_step ({})",
                self.end_profile_step, self.start_profile_step
            )));
        }
        if self.metric.is_empty() {
            return Err(DsatError::config("metric must not be empty"));
        }
        self.method.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SearchConfig::default();
        assert!(config.validate(1).is_ok());
        assert_eq!(config.max_trials, 64);
        assert_eq!(config.metric, "throughput");
        assert!(!config.smaller_is_better());
    }

    #[test]
    fn metric_direction_is_derived() {
        let config = SearchConfig::default().with_metric("latency").unwrap();
        assert!(config.smaller_is_better());

        let config = config.with_metric("FLOPS_per_gpu").unwrap();
        assert_eq!(config.direction, ObjectiveDirection::Maximize);

        assert!(SearchConfig::default().with_metric("accuracy").is_err());
    }

    #[test]
    fn improves_respects_direction() {
        assert!(ObjectiveDirection::Maximize.improves(2.0, 1.0));
        assert!(!ObjectiveDirection::Maximize.improves(1.0, 1.0));
        assert!(ObjectiveDirection::Minimize.improves(0.5, 1.0));
    }

    #[test]
    fn rejects_bad_limits() {
        assert!(SearchConfig::default().with_max_trials(1).validate(1).is_err());
        assert!(SearchConfig::default()
            .with_max_concurrent_trials(0)
            .validate(1)
            .is_err());
        assert!(SearchConfig::default().with_max_slots(2).validate(4).is_err());
        assert!(SearchConfig::default()
            .with_zero_stages([1, 4])
            .validate(1)
            .is_err());
        assert!(SearchConfig::default()
            .with_zero_stages(Vec::new())
            .validate(1)
            .is_err());
        assert!(SearchConfig::default()
            .with_profile_steps(5, 5)
            .validate(1)
            .is_err());
    }

    #[test]
    fn rejects_bad_method_knobs() {
        let asha = SearchMethodConfig::Asha {
            max_resource: 16,
            min_resource: 1,
            early_stopping_rate: 0,
            divisor: 1,
            search_range_factor: 1.0,
        };
        assert!(SearchConfig::new(asha).validate(1).is_err());

        let binary = SearchMethodConfig::Binary {
            search_range_factor: 0.0,
        };
        assert!(SearchConfig::new(binary).validate(1).is_err());

        let random = SearchMethodConfig::Random {
            trials_per_random_config: 0,
            early_stopping: None,
        };
        assert!(SearchConfig::new(random).validate(1).is_err());
    }

    #[test]
    fn concurrency_capacity_honors_slots() {
        let config = SearchConfig::default()
            .with_max_concurrent_trials(8)
            .with_max_slots(12);
        assert_eq!(config.concurrent_trial_capacity(4), 3);
        assert_eq!(config.concurrent_trial_capacity(1), 8);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{
            "max_trials": 20,
            "method": {"name": "binary", "search_range_factor": 2.0}
        }"#;
        let config: SearchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_trials, 20);
        assert_eq!(config.max_concurrent_trials, 16);
        assert_eq!(config.method.name(), "binary");
        assert!(config.validate(1).is_ok());
    }
}
