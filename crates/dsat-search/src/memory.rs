//! Per-stage memory estimates derived from the profiling trial.

use dsat_types::{DsatError, DsatResult, Metrics};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Measurements reported by the model profile info trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfileInfo {
    pub num_params: u64,
    pub trainable_num_params: u64,
    pub activation_mem_per_gpu: u64,
    pub gpu_mem: u64,
}

impl ModelProfileInfo {
    pub fn from_metrics(metrics: &Metrics) -> DsatResult<Self> {
        let info = Self {
            num_params: read_count(metrics, "num_params")?,
            trainable_num_params: read_count(metrics, "trainable_num_params")?,
            activation_mem_per_gpu: read_count(metrics, "activation_mem_per_gpu")?,
            gpu_mem: read_count(metrics, "gpu_mem")?,
        };
        if info.activation_mem_per_gpu == 0 {
            return Err(DsatError::profile_info(
                "activation_mem_per_gpu must be positive",
            ));
        }
        Ok(info)
    }
}

fn read_count(metrics: &Metrics, key: &str) -> DsatResult<u64> {
    let value = metrics
        .get(key)
        .copied()
        .ok_or_else(|| DsatError::profile_info(format!("missing `{key}`")))?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(DsatError::profile_info(format!(
            "`{key}` must be a non-negative integer, got {value}"
        )));
    }
    Ok(value as u64)
}

/// Closed-form ZeRO memory partitioning for one model on `slots` devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryModel {
    pub info: ModelProfileInfo,
    pub fp16: bool,
    pub slots: usize,
}

impl MemoryModel {
    pub fn new(info: ModelProfileInfo, fp16: bool, slots: usize) -> Self {
        Self {
            info,
            fp16,
            slots: slots.max(1),
        }
    }

    fn params_mem(&self) -> u64 {
        let bytes = if self.fp16 { 2 } else { 4 };
        self.info.num_params * bytes
    }

    fn gradients_mem(&self) -> u64 {
        self.info.trainable_num_params * 4
    }

    fn optimizer_mem(&self) -> u64 {
        // fp32 master weights only exist under fp16, plus two Adam moments
        let master = if self.fp16 { 4 } else { 0 };
        self.info.trainable_num_params * (master + 8)
    }

    /// Estimated per-device bytes for `stage`, activation memory included.
    pub fn mem_per_gpu(&self, stage: u8) -> u64 {
        let slots = self.slots as u64;
        let params = self.params_mem();
        let grads = self.gradients_mem();
        let optim = self.optimizer_mem();
        let states = match stage {
            0 => params + grads + optim,
            1 => params + grads + optim / slots,
            2 => params + (grads + optim) / slots,
            _ => (params + grads + optim) / slots,
        };
        states + self.info.activation_mem_per_gpu
    }

    /// Largest micro batch size expected to fit at `stage`, never below 1.
    pub fn approx_max_mbs(&self, stage: u8) -> u64 {
        let mem = self.mem_per_gpu(stage);
        if self.info.gpu_mem <= mem {
            return 1;
        }
        ((self.info.gpu_mem - mem) / self.info.activation_mem_per_gpu).max(1)
    }

    pub fn mem_per_gpu_by_stage(&self) -> BTreeMap<u8, u64> {
        (0..=3).map(|stage| (stage, self.mem_per_gpu(stage))).collect()
    }

    pub fn approx_max_mbs_by_stage(&self) -> BTreeMap<u8, u64> {
        (0..=3).map(|stage| (stage, self.approx_max_mbs(stage))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn info() -> ModelProfileInfo {
        ModelProfileInfo {
            num_params: 1_000,
            trainable_num_params: 1_000,
            activation_mem_per_gpu: 100,
            gpu_mem: 20_000,
        }
    }

    #[test]
    fn parses_profile_metrics() {
        let m = metrics(&[
            ("num_params", 1_000.0),
            ("trainable_num_params", 800.0),
            ("activation_mem_per_gpu", 64.0),
            ("gpu_mem", 1e6),
        ]);
        let parsed = ModelProfileInfo::from_metrics(&m).unwrap();
        assert_eq!(parsed.trainable_num_params, 800);
        assert_eq!(parsed.gpu_mem, 1_000_000);
    }

    #[test]
    fn rejects_malformed_profile_metrics() {
        let missing = metrics(&[("num_params", 1.0)]);
        assert!(matches!(
            ModelProfileInfo::from_metrics(&missing),
            Err(DsatError::ProfileInfo { .. })
        ));

        let negative = metrics(&[
            ("num_params", -1.0),
            ("trainable_num_params", 1.0),
            ("activation_mem_per_gpu", 1.0),
            ("gpu_mem", 1.0),
        ]);
        assert!(ModelProfileInfo::from_metrics(&negative).is_err());

        let zero_activation = metrics(&[
            ("num_params", 1.0),
            ("trainable_num_params", 1.0),
            ("activation_mem_per_gpu", 0.0),
            ("gpu_mem", 1.0),
        ]);
        assert!(ModelProfileInfo::from_metrics(&zero_activation).is_err());
    }

    #[test]
    fn stage_memory_decreases_with_sharding() {
        let model = MemoryModel::new(info(), false, 4);
        // params 4000, grads 4000, optimizer 8000
        assert_eq!(model.mem_per_gpu(0), 16_000 + 100);
        assert_eq!(model.mem_per_gpu(1), 4_000 + 4_000 + 2_000 + 100);
        assert_eq!(model.mem_per_gpu(2), 4_000 + 3_000 + 100);
        assert_eq!(model.mem_per_gpu(3), 4_000 + 100);

        let by_stage = model.mem_per_gpu_by_stage();
        assert!(by_stage[&0] > by_stage[&1]);
        assert!(by_stage[&2] > by_stage[&3]);
    }

    #[test]
    fn fp16_changes_parameter_and_optimizer_bytes() {
        let model = MemoryModel::new(info(), true, 1);
        // params 2000, grads 4000, optimizer 12000
        assert_eq!(model.mem_per_gpu(0), 18_000 + 100);
    }

    #[test]
    fn approx_max_mbs_has_floor_of_one() {
        let model = MemoryModel::new(info(), false, 4);
        assert_eq!(model.approx_max_mbs(3), (20_000 - 4_100) / 100);
        assert_eq!(model.approx_max_mbs(0), (20_000 - 16_100) / 100);

        let tight = MemoryModel::new(
            ModelProfileInfo {
                gpu_mem: 1_000,
                ..info()
            },
            false,
            1,
        );
        assert_eq!(tight.approx_max_mbs(0), 1);
    }
}
