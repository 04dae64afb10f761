//! Driver protocol: the events a search method reacts to and the operations it emits.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use uuid::Uuid;

use crate::errors::DsatResult;
use crate::hparams::HParams;

/// Identifier of a trial request, assigned once and never reused.
pub type RequestId = Uuid;

/// Measured values reported by a validated trial.
pub type Metrics = BTreeMap<String, f64>;

/// Operations a search method hands back to its driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Launch a new trial with the given hyperparameters.
    Create {
        request_id: RequestId,
        hparams: HParams,
        checkpoint: Option<RequestId>,
    },
    /// Train the trial for `length` steps, then validate. Always follows a `Create`.
    ValidateAfter { request_id: RequestId, length: u64 },
    /// The trial will receive no further work.
    Close { request_id: RequestId },
    /// End the whole search.
    Shutdown { failure: bool },
}

impl Operation {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Create { request_id, .. }
            | Self::ValidateAfter { request_id, .. }
            | Self::Close { request_id } => Some(*request_id),
            Self::Shutdown { .. } => None,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }
}

/// Why a trial stopped before reporting a validation metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitedReason {
    /// The trial crashed, typically by running out of accelerator memory.
    Errored,
    /// The hyperparameters were rejected by the trial.
    InvalidHp,
    /// A user stopped the trial.
    UserCanceled,
}

impl std::fmt::Display for ExitedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Errored => write!(f, "ERRORED"),
            Self::InvalidHp => write!(f, "INVALID_HP"),
            Self::UserCanceled => write!(f, "USER_CANCELED"),
        }
    }
}

/// Bookkeeping the driver keeps about the trials it has executed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearcherState {
    pub trials_created: BTreeSet<RequestId>,
    pub trials_closed: BTreeSet<RequestId>,
    pub failures: BTreeSet<RequestId>,
}

impl SearcherState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trials created but not yet closed.
    pub fn num_open_trials(&self) -> usize {
        self.trials_created.difference(&self.trials_closed).count()
    }
}

/// Callback surface the orchestration runtime drives.
///
/// Every callback runs to completion before the next one is delivered; events for one
/// trial arrive in causal order (created, validated or exited early, closed).
pub trait SearchMethod {
    /// Operations to run when the search starts.
    fn initial_operations(&mut self, state: &SearcherState) -> DsatResult<Vec<Operation>>;

    fn on_trial_created(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> DsatResult<Vec<Operation>>;

    fn on_validation_completed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        metric: Metrics,
        train_length: u64,
    ) -> DsatResult<Vec<Operation>>;

    fn on_trial_exited_early(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        exited_reason: ExitedReason,
    ) -> DsatResult<Vec<Operation>>;

    fn on_trial_closed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> DsatResult<Vec<Operation>>;

    /// Fraction of the search completed, for reporting only.
    fn progress(&self, state: &SearcherState) -> f64;

    fn save_method_state(&self, path: &Path) -> DsatResult<()>;

    fn load_method_state(&mut self, path: &Path) -> DsatResult<()>;
}
