use dsat_search::{DsatSearchMethod, JsonFileSubmitter};
use dsat_types::{DsatResult, SearchConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use crate::cluster::ClusterConfig;

/// Everything a simulated search run needs, loadable from one JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub search: SearchConfig,
    /// The submitted experiment: `hyperparameters` and `resources.slots_per_trial`.
    pub experiment: Value,
    pub cluster: ClusterConfig,
    pub driver_seed: u64,
    /// Trial completions after which a run counts as stalled.
    pub max_steps: usize,
    /// Where to write the final searcher state, if anywhere.
    pub checkpoint_dir: Option<PathBuf>,
    /// File receiving the best experiment config. Setting it turns on
    /// `run_full_experiment`.
    pub submit_to: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            search: SearchConfig::default().with_max_concurrent_trials(4),
            experiment: json!({
                "name": "gpt2-medium-dsat",
                "resources": {"slots_per_trial": 2},
                "hyperparameters": {
                    "deepspeed_config": {
                        "train_micro_batch_size_per_gpu": 1,
                        "gradient_accumulation_steps": 1,
                        "fp16": {"enabled": true},
                        "optimizer": {"type": "AdamW", "params": {"lr": 1e-4}},
                    },
                    "model_name": "gpt2-medium",
                },
            }),
            cluster: ClusterConfig::default(),
            driver_seed: 0,
            max_steps: 10_000,
            checkpoint_dir: None,
            submit_to: None,
        }
    }
}

impl SimulationConfig {
    pub fn from_path(path: &Path) -> DsatResult<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// The search method for this run, with a file submitter installed when `submit_to`
    /// is set.
    pub fn search_method(&self) -> DsatResult<DsatSearchMethod> {
        let Some(path) = &self.submit_to else {
            return DsatSearchMethod::new(self.search.clone(), self.experiment.clone());
        };
        let search = self.search.clone().with_run_full_experiment(true);
        Ok(DsatSearchMethod::new(search, self.experiment.clone())?
            .with_submitter(JsonFileSubmitter::new(path)))
    }
}
