//! An in-process orchestration runtime for search methods.

use dsat_types::{
    DsatError, DsatResult, ExitedReason, HParams, Metrics, Operation, RequestId, SearchConfig,
    SearchMethod, SearcherState,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::cluster::{SimulatedCluster, TrialOutcome};

/// Limits the driver enforces on whatever search method it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverLimits {
    pub max_trials: usize,
    pub max_concurrent_trials: usize,
    pub max_slots: Option<usize>,
    pub slots_per_trial: usize,
}

impl DriverLimits {
    pub fn new(config: &SearchConfig, slots_per_trial: usize) -> Self {
        Self {
            max_trials: config.max_trials,
            max_concurrent_trials: config.max_concurrent_trials,
            max_slots: config.max_slots,
            slots_per_trial,
        }
    }
}

/// Everything that happened during a run, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SimEvent {
    Created {
        request_id: RequestId,
        hparams: HParams,
    },
    Validated {
        request_id: RequestId,
        metrics: Metrics,
    },
    ExitedEarly {
        request_id: RequestId,
        reason: ExitedReason,
    },
    Closed {
        request_id: RequestId,
    },
    Shutdown {
        failure: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub steps: usize,
    pub trials_created: usize,
    pub trials_failed: usize,
    /// The `failure` flag of the shutdown, if the search shut down.
    pub failure: Option<bool>,
}

#[derive(Debug, Clone)]
struct InFlightTrial {
    request_id: RequestId,
    hparams: HParams,
    length: Option<u64>,
}

/// Executes operations and feeds trial results back, one completed trial per step.
#[derive(Debug, Clone)]
pub struct SimulationDriver {
    cluster: SimulatedCluster,
    limits: DriverLimits,
    model_dir: Option<PathBuf>,
    state: SearcherState,
    rng: ChaCha8Rng,
    in_flight: Vec<InFlightTrial>,
    events: Vec<SimEvent>,
    steps: usize,
    shutdown: Option<bool>,
}

impl SimulationDriver {
    pub fn new(
        cluster: SimulatedCluster,
        config: &SearchConfig,
        slots_per_trial: usize,
        seed: u64,
    ) -> Self {
        Self::with_limits(cluster, DriverLimits::new(config, slots_per_trial), seed)
            .with_model_dir(config.model_dir.clone())
    }

    pub fn with_limits(cluster: SimulatedCluster, limits: DriverLimits, seed: u64) -> Self {
        Self {
            cluster,
            limits,
            model_dir: None,
            state: SearcherState::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            in_flight: Vec::new(),
            events: Vec::new(),
            steps: 0,
            shutdown: None,
        }
    }

    pub fn with_model_dir(mut self, model_dir: Option<PathBuf>) -> Self {
        self.model_dir = model_dir;
        self
    }

    pub fn state(&self) -> &SearcherState {
        &self.state
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    pub fn cluster(&self) -> &SimulatedCluster {
        &self.cluster
    }

    /// Hyperparameters of every created trial, in creation order.
    pub fn dispatched_hparams(&self) -> Vec<&HParams> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SimEvent::Created { hparams, .. } => Some(hparams),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown(&self) -> Option<bool> {
        self.shutdown
    }

    pub fn report(&self) -> SimulationReport {
        SimulationReport {
            steps: self.steps,
            trials_created: self.state.trials_created.len(),
            trials_failed: self.state.failures.len(),
            failure: self.shutdown,
        }
    }

    /// Deliver the initial operations of `method`.
    pub fn start(&mut self, method: &mut dyn SearchMethod) -> DsatResult<()> {
        let ops = method.initial_operations(&self.state)?;
        self.apply(method, ops)
    }

    /// Complete one in-flight trial, chosen at random, and apply the resulting operations.
    /// Returns `false` once the search has shut down.
    pub fn step(&mut self, method: &mut dyn SearchMethod) -> DsatResult<bool> {
        if self.shutdown.is_some() {
            return Ok(false);
        }
        let ready: Vec<usize> = self
            .in_flight
            .iter()
            .enumerate()
            .filter(|(_, trial)| trial.length.is_some())
            .map(|(index, _)| index)
            .collect();
        if ready.is_empty() {
            return Err(DsatError::Internal(format!(
                "search stalled with {} open trials and no work scheduled",
                self.state.num_open_trials()
            )));
        }

        let index = ready[self.rng.gen_range(0..ready.len())];
        let trial = self.in_flight.remove(index);
        self.steps += 1;

        let outcome = self
            .cluster
            .run_trial(&trial.hparams, self.model_dir.as_deref())?;
        match outcome {
            TrialOutcome::Validated(metrics) => {
                self.events.push(SimEvent::Validated {
                    request_id: trial.request_id,
                    metrics: metrics.clone(),
                });
                let ops = method.on_validation_completed(
                    &self.state,
                    trial.request_id,
                    metrics,
                    trial.length.unwrap_or_default(),
                )?;
                self.apply(method, ops)?;
            }
            TrialOutcome::Exited(reason) => {
                self.events.push(SimEvent::ExitedEarly {
                    request_id: trial.request_id,
                    reason,
                });
                self.state.failures.insert(trial.request_id);
                let mut ops = method.on_trial_exited_early(&self.state, trial.request_id, reason)?;
                // the runtime closes exited trials itself
                ops.push(Operation::Close {
                    request_id: trial.request_id,
                });
                self.apply(method, ops)?;
            }
        }
        Ok(self.shutdown.is_none())
    }

    /// Run until the search shuts down, failing if it takes more than `max_steps` steps.
    pub fn run(
        &mut self,
        method: &mut dyn SearchMethod,
        max_steps: usize,
    ) -> DsatResult<SimulationReport> {
        if self.events.is_empty() {
            self.start(method)?;
        }
        while self.step(method)? {
            if self.steps >= max_steps {
                return Err(DsatError::Internal(format!(
                    "search did not shut down within {max_steps} steps"
                )));
            }
        }
        let report = self.report();
        info!(
            steps = report.steps,
            trials_created = report.trials_created,
            trials_failed = report.trials_failed,
            failure = ?report.failure,
            "simulation finished"
        );
        Ok(report)
    }

    fn apply(&mut self, method: &mut dyn SearchMethod, ops: Vec<Operation>) -> DsatResult<()> {
        let mut pending: VecDeque<Operation> = ops.into();
        while let Some(op) = pending.pop_front() {
            if self.shutdown.is_some() {
                break;
            }
            match op {
                Operation::Create {
                    request_id,
                    hparams,
                    ..
                } => {
                    if !self.state.trials_created.insert(request_id) {
                        return Err(DsatError::Internal(format!(
                            "trial {request_id} was created twice"
                        )));
                    }
                    debug!(trial_id = %request_id, "created trial");
                    self.events.push(SimEvent::Created {
                        request_id,
                        hparams: hparams.clone(),
                    });
                    self.in_flight.push(InFlightTrial {
                        request_id,
                        hparams,
                        length: None,
                    });
                    self.check_limits()?;
                    pending.extend(method.on_trial_created(&self.state, request_id)?);
                }
                Operation::ValidateAfter { request_id, length } => {
                    let trial = self
                        .in_flight
                        .iter_mut()
                        .find(|trial| trial.request_id == request_id)
                        .ok_or(DsatError::UnknownTrial(request_id))?;
                    trial.length = Some(length);
                }
                Operation::Close { request_id } => {
                    if !self.state.trials_created.contains(&request_id) {
                        return Err(DsatError::UnknownTrial(request_id));
                    }
                    if !self.state.trials_closed.insert(request_id) {
                        continue;
                    }
                    self.in_flight.retain(|trial| trial.request_id != request_id);
                    self.events.push(SimEvent::Closed { request_id });
                    pending.extend(method.on_trial_closed(&self.state, request_id)?);
                }
                Operation::Shutdown { failure } => {
                    info!(failure, "search requested shutdown");
                    self.events.push(SimEvent::Shutdown { failure });
                    self.shutdown = Some(failure);
                }
            }
        }
        Ok(())
    }

    fn check_limits(&self) -> DsatResult<()> {
        let limits = &self.limits;
        let created = self.state.trials_created.len();
        if created > limits.max_trials {
            return Err(DsatError::Internal(format!(
                "{created} trials created, limit is {}",
                limits.max_trials
            )));
        }
        let open = self.state.num_open_trials();
        if open > limits.max_concurrent_trials {
            return Err(DsatError::Internal(format!(
                "{open} trials open at once, limit is {}",
                limits.max_concurrent_trials
            )));
        }
        if let Some(max_slots) = limits.max_slots {
            let slots = open * limits.slots_per_trial;
            if slots > max_slots {
                return Err(DsatError::Internal(format!(
                    "{slots} slots in use, limit is {max_slots}"
                )));
            }
        }
        Ok(())
    }
}
