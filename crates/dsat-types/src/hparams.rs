//! DeepSpeed hyperparameter layout and helpers.
//!
//! Trials carry an opaque hyperparameter map. The values the search controls live under
//! [`OVERWRITE_KEY`] and are merged over the base DeepSpeed config to obtain the
//! effective config a trial runs with.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{DsatError, DsatResult};

/// Opaque hyperparameter map attached to every trial.
pub type HParams = Map<String, Value>;

/// Hyperparameter holding the base DeepSpeed config (inline object or file path).
pub const CONFIG_KEY: &str = "deepspeed_config";
/// Hyperparameter holding values merged over the base DeepSpeed config.
pub const OVERWRITE_KEY: &str = "overwrite_deepspeed_args";
/// Flag telling the training harness to run in autotuning mode.
pub const USE_DSAT_MODE_KEY: &str = "_use_dsat_mode";

pub const AUTOTUNING_KEY: &str = "autotuning";
pub const MBS_KEY: &str = "train_micro_batch_size_per_gpu";
pub const GAS_KEY: &str = "gradient_accumulation_steps";
pub const TRAIN_BATCH_SIZE_KEY: &str = "train_batch_size";
pub const ZERO_OPTIMIZATION_KEY: &str = "zero_optimization";
pub const GAS_DEFAULT: u64 = 1;
pub const MODEL_INFO_PROFILING_PATH: &str = "model_info.json";

/// Recursively merge `overlay` into `base`. Objects merge key by key, anything else
/// in `overlay` replaces the value in `base`.
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            merge_maps(base_map, overlay_map);
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

pub fn merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match base.get_mut(key) {
            Some(existing) => merge_values(existing, value),
            None => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Mutable access to the overwrite map, creating it when absent.
pub fn overwrite_mut(hparams: &mut HParams) -> DsatResult<&mut Map<String, Value>> {
    let entry = hparams
        .entry(OVERWRITE_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    entry
        .as_object_mut()
        .ok_or_else(|| DsatError::invalid_hparams(format!("`{OVERWRITE_KEY}` must be a map")))
}

/// Merge `overrides` into the overwrite map of `hparams`.
pub fn apply_overrides(hparams: &mut HParams, overrides: &Value) -> DsatResult<()> {
    let overrides = overrides
        .as_object()
        .ok_or_else(|| DsatError::invalid_hparams("overrides must be a map"))?;
    merge_maps(overwrite_mut(hparams)?, overrides);
    Ok(())
}

pub fn set_micro_batch_size(hparams: &mut HParams, mbs: u64) -> DsatResult<()> {
    overwrite_mut(hparams)?.insert(MBS_KEY.to_string(), json!(mbs));
    Ok(())
}

/// Read a base DeepSpeed config from a JSON file.
pub fn load_ds_config_file(path: &Path) -> DsatResult<Value> {
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;
    if !value.is_object() {
        return Err(DsatError::config(format!(
            "DeepSpeed config {} is not a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// The base DeepSpeed config named by `hparams`: inline objects are used directly,
/// paths are read relative to `model_dir`.
pub fn resolve_base_ds_config(hparams: &HParams, model_dir: Option<&Path>) -> DsatResult<Value> {
    match hparams.get(CONFIG_KEY) {
        Some(Value::Object(inline)) => Ok(Value::Object(inline.clone())),
        Some(Value::String(path)) => {
            let full_path = match model_dir {
                Some(dir) => dir.join(path),
                None => Path::new(path).to_path_buf(),
            };
            load_ds_config_file(&full_path)
        }
        Some(other) => Err(DsatError::invalid_hparams(format!(
            "`{CONFIG_KEY}` must be a map or a path, found {other}"
        ))),
        None => Err(DsatError::invalid_hparams(format!(
            "expected `{CONFIG_KEY}` in the hyperparameters"
        ))),
    }
}

/// Effective DeepSpeed config: `base` with the overwrite map of `hparams` merged over it.
pub fn effective_ds_config(hparams: &HParams, base: &Value) -> Value {
    let mut ds_config = base.clone();
    if let Some(overwrite) = hparams.get(OVERWRITE_KEY) {
        merge_values(&mut ds_config, overwrite);
    }
    ds_config
}

pub fn zero_stage(ds_config: &Value) -> u8 {
    ds_config
        .get(ZERO_OPTIMIZATION_KEY)
        .and_then(|zero| zero.get("stage"))
        .and_then(Value::as_u64)
        .map(|stage| stage.min(u8::MAX as u64) as u8)
        .unwrap_or(0)
}

pub fn fp16_enabled(ds_config: &Value) -> bool {
    ds_config
        .get("fp16")
        .and_then(|fp16| fp16.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn micro_batch_size(ds_config: &Value) -> DsatResult<u64> {
    ds_config
        .get(MBS_KEY)
        .ok_or_else(|| {
            DsatError::invalid_hparams(format!("the DeepSpeed config must contain `{MBS_KEY}`"))
        })?
        .as_u64()
        .ok_or_else(|| DsatError::invalid_hparams(format!("`{MBS_KEY}` must be an integer")))
}

/// Batch size fields consistent with `slots`: `train_batch_size = mbs * gas * slots`.
pub fn batch_config(ds_config: &Value, slots: usize) -> DsatResult<Map<String, Value>> {
    let mbs = micro_batch_size(ds_config)?;
    let gas = match ds_config.get(GAS_KEY) {
        None => GAS_DEFAULT,
        // Hugging Face configs leave this to the trainer.
        Some(Value::String(s)) if s == "auto" => GAS_DEFAULT,
        Some(value) => value.as_u64().ok_or_else(|| {
            DsatError::invalid_hparams(format!("`{GAS_KEY}` must be an integer or \"auto\""))
        })?,
    };
    let mut batch = Map::new();
    batch.insert(TRAIN_BATCH_SIZE_KEY.to_string(), json!(mbs * gas * slots as u64));
    batch.insert(MBS_KEY.to_string(), json!(mbs));
    batch.insert(GAS_KEY.to_string(), json!(gas));
    Ok(batch)
}

/// Per-stage options sampled for each new random configuration. Each stage inherits the
/// options of the stages below it.
pub fn zero_search_space(stage: u8) -> BTreeMap<&'static str, Vec<Value>> {
    let mut space = BTreeMap::new();
    if stage >= 1 {
        let buckets = vec![json!(50_000_000u64), json!(500_000_000u64), json!(1_000_000_000u64)];
        space.insert("reduce_bucket_size", buckets.clone());
        space.insert("allgather_bucket_size", buckets);
    }
    if stage >= 2 {
        let flags = vec![json!(true), json!(false)];
        space.insert("overlap_comm", flags.clone());
        space.insert("reduce_scatter", flags.clone());
        space.insert("contiguous_gradients", flags);
    }
    if stage >= 3 {
        space.insert("allgather_partitions", vec![json!(true), json!(false)]);
    }
    space
}

/// A random `zero_optimization` section for `stage`.
pub fn random_zero_optim_config<R: Rng + ?Sized>(stage: u8, rng: &mut R) -> Value {
    let mut config = Map::new();
    for (key, choices) in zero_search_space(stage) {
        if let Some(choice) = choices.choose(rng) {
            config.insert(key.to_string(), choice.clone());
        }
    }
    config.insert("stage".to_string(), json!(stage));
    Value::Object(config)
}

/// Overrides which make DeepSpeed profile the model and exit after one step.
pub fn model_profile_info_overrides() -> Value {
    json!({
        MBS_KEY: 1,
        ZERO_OPTIMIZATION_KEY: {"stage": 3},
        AUTOTUNING_KEY: {
            "enabled": true,
            "model_info_path": MODEL_INFO_PROFILING_PATH,
            "model_info": {"profile": true},
        },
    })
}

/// Overrides which put DeepSpeed into autotuning mode for ordinary search trials.
pub fn autotuning_overrides(start_profile_step: u64, end_profile_step: u64, metric: &str) -> Value {
    json!({
        AUTOTUNING_KEY: {
            "enabled": true,
            "start_profile_step": start_profile_step,
            "end_profile_step": end_profile_step,
            "metric": metric,
        },
    })
}

/// Hyperparameters with the autotuning-only keys removed, suitable for a regular run.
pub fn strip_autotuning_keys(hparams: &HParams) -> HParams {
    let mut stripped = hparams.clone();
    stripped.remove(USE_DSAT_MODE_KEY);
    if let Some(Value::Object(overwrite)) = stripped.get_mut(OVERWRITE_KEY) {
        overwrite.remove(AUTOTUNING_KEY);
    }
    stripped
}
