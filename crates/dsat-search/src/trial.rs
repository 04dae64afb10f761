//! Trial records and the search bookkeeping attached to them.

use chrono::{DateTime, Utc};
use dsat_types::{HParams, Metrics, Operation, RequestId};
use serde::{Deserialize, Serialize};

/// Unique trial identifier, shared with the driver as the request id.
pub type TrialId = RequestId;

/// Distinguishes the profiling run from ordinary search trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialKind {
    /// Measures parameter counts and memory; never a candidate result.
    ModelProfileInfo,
    /// Probes one batch size for one configuration.
    Autotuning,
}

/// Inclusive micro batch size bounds a lineage is narrowing, plus strategy extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchData {
    /// Plain bisection bounds used by the random and binary strategies.
    Bounds { lo: u64, hi: u64 },
    /// Bisection bounds plus the ASHA rung the lineage currently occupies.
    Rung { lo: u64, hi: u64, curr_rung: usize },
}

impl SearchData {
    pub fn bounds(lo: u64, hi: u64) -> Self {
        Self::Bounds { lo, hi }
    }

    pub fn rung(lo: u64, hi: u64, curr_rung: usize) -> Self {
        Self::Rung { lo, hi, curr_rung }
    }

    pub fn lo(&self) -> u64 {
        match self {
            Self::Bounds { lo, .. } | Self::Rung { lo, .. } => *lo,
        }
    }

    pub fn hi(&self) -> u64 {
        match self {
            Self::Bounds { hi, .. } | Self::Rung { hi, .. } => *hi,
        }
    }

    pub fn curr_rung(&self) -> Option<usize> {
        match self {
            Self::Bounds { .. } => None,
            Self::Rung { curr_rung, .. } => Some(*curr_rung),
        }
    }

    pub fn with_lo(mut self, new_lo: u64) -> Self {
        match &mut self {
            Self::Bounds { lo, .. } | Self::Rung { lo, .. } => *lo = new_lo,
        }
        self
    }

    pub fn with_hi(mut self, new_hi: u64) -> Self {
        match &mut self {
            Self::Bounds { hi, .. } | Self::Rung { hi, .. } => *hi = new_hi,
        }
        self
    }

    pub(crate) fn promote(&mut self) {
        if let Self::Rung { curr_rung, .. } = self {
            *curr_rung += 1;
        }
    }

    /// True when no batch size is left to try.
    pub fn is_empty(&self) -> bool {
        self.lo() > self.hi()
    }

    pub fn midpoint(&self) -> u64 {
        self.lo() + (self.hi() - self.lo()) / 2
    }

    /// Bounds for the next trial after trying `mbs`: a success raises the floor past it,
    /// a failure drops the ceiling below it.
    pub fn narrowed(&self, mbs: u64, succeeded: bool) -> Self {
        if succeeded {
            self.with_lo(mbs + 1)
        } else {
            self.with_hi(mbs.saturating_sub(1))
        }
    }
}

/// A single run of one DeepSpeed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub request_id: TrialId,
    pub kind: TrialKind,
    pub hparams: HParams,

    /// Effective DeepSpeed config, fixed at creation.
    pub ds_config: serde_json::Value,
    pub stage: u8,
    pub mbs: u64,
    pub fp16: bool,

    /// Training steps to run before validating.
    pub length: u64,
    pub slots_per_trial: usize,
    pub search_data: Option<SearchData>,

    pub parent: Option<TrialId>,
    pub children: Vec<TrialId>,
    pub lineage_root: TrialId,

    pub metric: Metrics,
    pub error: bool,
    pub running: bool,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn is_model_profile_info(&self) -> bool {
        self.kind == TrialKind::ModelProfileInfo
    }

    pub fn completed(&self) -> bool {
        self.error || !self.metric.is_empty()
    }

    /// Value of `metric_name` in the reported metrics. Profiling runs never report one.
    pub fn searcher_metric_val(&self, metric_name: &str) -> Option<f64> {
        if self.is_model_profile_info() {
            return None;
        }
        self.metric.get(metric_name).copied()
    }

    pub fn mark_running(&mut self) {
        self.running = true;
    }

    pub fn mark_completed(&mut self, metric: Metrics) {
        self.metric = metric;
        self.running = false;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.error = true;
        self.running = false;
        self.finished_at = Some(Utc::now());
    }

    /// The `Create` and `ValidateAfter` pair that launches this trial.
    pub fn create_and_val_ops(&self) -> Vec<Operation> {
        vec![
            Operation::Create {
                request_id: self.request_id,
                hparams: self.hparams.clone(),
                checkpoint: None,
            },
            Operation::ValidateAfter {
                request_id: self.request_id,
                length: self.length,
            },
        ]
    }
}
