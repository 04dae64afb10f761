//! Handing the best configuration off as a regular training experiment.

use dsat_types::hparams::{merge_values, strip_autotuning_keys};
use dsat_types::{DsatError, DsatResult, HParams};
use serde_json::{json, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Creates a full experiment from a finished search.
pub trait ExperimentSubmitter {
    fn submit(&mut self, config: &Value, model_dir: Option<&Path>) -> DsatResult<()>;
}

impl<F> ExperimentSubmitter for F
where
    F: FnMut(&Value, Option<&Path>) -> DsatResult<()>,
{
    fn submit(&mut self, config: &Value, model_dir: Option<&Path>) -> DsatResult<()> {
        self(config, model_dir)
    }
}

/// Writes the experiment config to a JSON file for a later submission step.
#[derive(Debug, Clone)]
pub struct JsonFileSubmitter {
    path: PathBuf,
}

impl JsonFileSubmitter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write_failed(&self, err: io::Error) -> DsatError {
        DsatError::Submission(format!("cannot write {}: {err}", self.path.display()))
    }
}

impl ExperimentSubmitter for JsonFileSubmitter {
    fn submit(&mut self, config: &Value, model_dir: Option<&Path>) -> DsatResult<()> {
        let body = serde_json::to_vec_pretty(config)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.write_failed(err))?;
        }
        fs::write(&self.path, body).map_err(|err| self.write_failed(err))?;
        info!(
            path = %self.path.display(),
            model_dir = ?model_dir,
            "wrote best experiment config"
        );
        Ok(())
    }
}

/// The submitted experiment config with its hyperparameters replaced by the best trial's,
/// minus the keys that force autotuning.
pub fn best_experiment_config(submitted: &Value, best_hparams: &HParams) -> Value {
    let mut config = submitted.clone();
    let hparams = Value::Object(strip_autotuning_keys(best_hparams));
    merge_values(&mut config, &json!({ "hyperparameters": hparams }));
    config
}
