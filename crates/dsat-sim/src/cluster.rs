//! Synthetic accelerators answering trials with metrics or out-of-memory failures.

use dsat_search::{MemoryModel, ModelProfileInfo};
use dsat_types::hparams::{
    effective_ds_config, fp16_enabled, micro_batch_size, resolve_base_ds_config, zero_stage,
    AUTOTUNING_KEY,
};
use dsat_types::{DsatResult, ExitedReason, HParams, Metrics};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Model and hardware parameters of the simulated cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub num_params: u64,
    pub trainable_num_params: u64,
    /// Activation bytes per sample as the profiler measures them.
    pub activation_mem_per_gpu: u64,
    pub gpu_mem: u64,
    /// Ratio of real to profiled activation memory. Above 1 the profiler underestimates.
    pub activation_overhead: f64,
    pub step_overhead_ms: f64,
    pub per_sample_ms: f64,
    /// Step time multiplier for ZeRO stages 0 to 3.
    pub stage_slowdown: [f64; 4],
    /// Relative amplitude of uniform noise applied to step times.
    pub noise: f64,
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_params: 350_000_000,
            trainable_num_params: 350_000_000,
            activation_mem_per_gpu: 300_000_000,
            gpu_mem: 16 * 1024 * 1024 * 1024,
            activation_overhead: 1.15,
            step_overhead_ms: 40.0,
            per_sample_ms: 12.0,
            stage_slowdown: [1.0, 1.04, 1.1, 1.35],
            noise: 0.02,
            seed: 0,
        }
    }
}

impl ClusterConfig {
    pub fn profile_info(&self) -> ModelProfileInfo {
        ModelProfileInfo {
            num_params: self.num_params,
            trainable_num_params: self.trainable_num_params,
            activation_mem_per_gpu: self.activation_mem_per_gpu,
            gpu_mem: self.gpu_mem,
        }
    }
}

/// What running a trial produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Validated(Metrics),
    Exited(ExitedReason),
}

#[derive(Debug, Clone)]
pub struct SimulatedCluster {
    config: ClusterConfig,
    slots_per_trial: usize,
    rng: ChaCha8Rng,
}

impl SimulatedCluster {
    pub fn new(config: ClusterConfig, slots_per_trial: usize) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            slots_per_trial: slots_per_trial.max(1),
            rng,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn memory_model(&self, fp16: bool) -> MemoryModel {
        MemoryModel::new(self.config.profile_info(), fp16, self.slots_per_trial)
    }

    /// Bytes per device actually needed to train with `mbs` samples at `stage`.
    pub fn required_mem(&self, stage: u8, fp16: bool, mbs: u64) -> u64 {
        let states = self
            .memory_model(fp16)
            .mem_per_gpu(stage)
            .saturating_sub(self.config.activation_mem_per_gpu);
        let activations =
            (self.config.activation_mem_per_gpu as f64 * self.config.activation_overhead * mbs as f64)
                .ceil() as u64;
        states.saturating_add(activations)
    }

    /// Largest micro batch size that fits at `stage`, or 0 when none does.
    pub fn max_fitting_mbs(&self, stage: u8, fp16: bool) -> u64 {
        let states = self.required_mem(stage, fp16, 0);
        let Some(available) = self.config.gpu_mem.checked_sub(states) else {
            return 0;
        };
        let per_sample =
            self.config.activation_mem_per_gpu as f64 * self.config.activation_overhead;
        let mut mbs = (available as f64 / per_sample) as u64 + 1;
        while mbs > 0 && self.required_mem(stage, fp16, mbs) > self.config.gpu_mem {
            mbs -= 1;
        }
        mbs
    }

    fn profile_metrics(&self) -> Metrics {
        let info = self.config.profile_info();
        Metrics::from([
            ("num_params".to_string(), info.num_params as f64),
            ("trainable_num_params".to_string(), info.trainable_num_params as f64),
            ("activation_mem_per_gpu".to_string(), info.activation_mem_per_gpu as f64),
            ("gpu_mem".to_string(), info.gpu_mem as f64),
        ])
    }

    fn step_time_ms(&mut self, stage: u8, mbs: u64) -> f64 {
        let slowdown = self.config.stage_slowdown[usize::from(stage.min(3))];
        let mut step_ms =
            (self.config.step_overhead_ms + self.config.per_sample_ms * mbs as f64) * slowdown;
        if self.config.noise > 0.0 {
            step_ms *= 1.0 + self.config.noise * self.rng.gen_range(-1.0..=1.0);
        }
        step_ms
    }

    /// Run one trial with the given hyperparameters.
    pub fn run_trial(&mut self, hparams: &HParams, model_dir: Option<&Path>) -> DsatResult<TrialOutcome> {
        let base = resolve_base_ds_config(hparams, model_dir)?;
        let ds_config = effective_ds_config(hparams, &base);
        let stage = zero_stage(&ds_config);
        let fp16 = fp16_enabled(&ds_config);
        let mbs = micro_batch_size(&ds_config)?;

        let required = self.required_mem(stage, fp16, mbs);
        if required > self.config.gpu_mem {
            debug!(stage, mbs, required, gpu_mem = self.config.gpu_mem, "simulated OOM");
            return Ok(TrialOutcome::Exited(ExitedReason::Errored));
        }

        let profiling = ds_config
            .pointer(&format!("/{AUTOTUNING_KEY}/model_info/profile"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if profiling {
            return Ok(TrialOutcome::Validated(self.profile_metrics()));
        }

        let step_ms = self.step_time_ms(stage, mbs);
        let step_secs = step_ms / 1000.0;
        let samples = (mbs * self.slots_per_trial as u64) as f64;
        let flops_per_gpu = 6.0 * self.config.num_params as f64 * mbs as f64 / step_secs;
        Ok(TrialOutcome::Validated(Metrics::from([
            ("throughput".to_string(), samples / step_secs),
            ("latency".to_string(), step_ms),
            ("FLOPS_per_gpu".to_string(), flops_per_gpu),
        ])))
    }
}
