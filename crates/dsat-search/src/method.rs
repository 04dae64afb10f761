//! The event-driven search method shared by every strategy.

use dsat_types::{
    DsatResult, ExitedReason, Metrics, Operation, RequestId, SearchConfig, SearchMethod,
    SearcherState,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::strategy;
use crate::submit::{best_experiment_config, ExperimentSubmitter};
use crate::tracker::TrialTracker;
use crate::trial::{Trial, TrialId};

/// Everything a strategy reads or mutates: the trial registry and the search RNG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchContext {
    pub tracker: TrialTracker,
    pub rng: ChaCha8Rng,
}

impl SearchContext {
    pub fn new(tracker: TrialTracker, seed: u64) -> Self {
        Self {
            tracker,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

/// Strategy hooks the base search method delegates to.
///
/// Returned trials are created but not registered; the caller registers them in order
/// while the trial budget allows.
pub trait SearchStrategy: Send + Sync {
    /// Human-readable strategy name.
    fn name(&self) -> &str;

    /// Follow-up trials once `last` reported a metric. Called for the profiling trial too,
    /// which is where the initial batch of lineages is created.
    fn trials_after_validation_completed(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
    ) -> DsatResult<Vec<Trial>>;

    /// Follow-up trials once `last` exited early with a resource failure.
    fn trials_after_early_exit(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
        reason: ExitedReason,
    ) -> DsatResult<Vec<Trial>>;

    /// Take the next trial to dispatch off the queue.
    fn choose_next_trial_from_queue(&self, ctx: &mut SearchContext) -> DsatResult<Option<TrialId>> {
        Ok(ctx.tracker.pop_queue_front())
    }

    fn early_stopping_triggered(&self, _ctx: &SearchContext) -> bool {
        false
    }
}

/// Drives a [`SearchStrategy`] through the driver protocol.
pub struct DsatSearchMethod {
    ctx: SearchContext,
    strategy: Box<dyn SearchStrategy>,
    exp_config: Value,
    submitter: Option<Box<dyn ExperimentSubmitter>>,
}

impl DsatSearchMethod {
    /// Build the search for `exp_config` with the strategy named in `config.method`.
    pub fn new(config: SearchConfig, exp_config: Value) -> DsatResult<Self> {
        let strategy = strategy::from_config(&config.method);
        Self::with_strategy(config, exp_config, strategy)
    }

    pub fn with_strategy(
        config: SearchConfig,
        exp_config: Value,
        strategy: Box<dyn SearchStrategy>,
    ) -> DsatResult<Self> {
        let seed = config.random_seed;
        let tracker = TrialTracker::new(config, &exp_config)?;
        info!(
            strategy = strategy.name(),
            max_trials = tracker.config().max_trials,
            slots_per_trial = tracker.slots_per_trial(),
            "initialized autotuning search"
        );
        Ok(Self {
            ctx: SearchContext::new(tracker, seed),
            strategy,
            exp_config,
            submitter: None,
        })
    }

    /// Receives the best configuration when `run_full_experiment` is set.
    pub fn with_submitter(mut self, submitter: impl ExperimentSubmitter + 'static) -> Self {
        self.submitter = Some(Box::new(submitter));
        self
    }

    pub fn tracker(&self) -> &TrialTracker {
        &self.ctx.tracker
    }

    pub fn context(&self) -> &SearchContext {
        &self.ctx
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    fn shutdown_reason(&self) -> Option<&'static str> {
        let tracker = &self.ctx.tracker;
        if tracker.model_profile_info_trial().map_or(false, |trial| trial.error) {
            return Some(
                "error in the model profile info trial; the base configuration must run with \
                 train_micro_batch_size_per_gpu = 1",
            );
        }
        if self.strategy.early_stopping_triggered(&self.ctx) {
            return Some("early stopping criteria met");
        }
        if tracker.num_completed_trials() >= tracker.config().max_trials {
            return Some("all trials completed");
        }
        None
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_reason().is_some()
    }

    fn register_trials(&mut self, trials: Vec<Trial>) -> DsatResult<()> {
        for trial in trials {
            if !self.ctx.tracker.has_capacity() {
                debug!(trial_id = %trial.request_id, "trial budget reached, dropping new trial");
                break;
            }
            self.ctx.tracker.queue_and_register_trial(trial)?;
        }
        Ok(())
    }

    fn log_memory_model(&self) -> DsatResult<()> {
        let model = self.ctx.tracker.memory_model()?;
        info!(
            approx_max_mbs_per_stage = ?model.approx_max_mbs_by_stage(),
            mem_per_gpu_per_stage = ?model.mem_per_gpu_by_stage(),
            gpu_mem = model.info.gpu_mem,
            "resolved model profile info"
        );
        Ok(())
    }

    fn submit_best_config(&mut self) {
        let tracker = &self.ctx.tracker;
        let Some(best) = tracker.best_trial().and_then(|id| tracker.get(id).ok()) else {
            return;
        };
        let config = best_experiment_config(&self.exp_config, &best.hparams);
        let model_dir = tracker.config().model_dir.clone();
        match self.submitter.as_mut() {
            Some(submitter) => {
                if let Err(err) = submitter.submit(&config, model_dir.as_deref()) {
                    warn!(error = %err, "failed to submit the best configuration");
                }
            }
            None => warn!("run_full_experiment is set but no experiment submitter is configured"),
        }
    }
}

impl SearchMethod for DsatSearchMethod {
    fn initial_operations(&mut self, _state: &SearcherState) -> DsatResult<Vec<Operation>> {
        let tracker = &mut self.ctx.tracker;
        let profile = tracker.create_model_profile_info_trial()?;
        let ops = profile.create_and_val_ops();
        let id = profile.request_id;
        tracker.queue_and_register_trial(profile)?;
        tracker.pop_queue_front();
        tracker.mark_running(id)?;
        info!(trial_id = %id, "launching model profile info trial");
        Ok(ops)
    }

    fn on_trial_created(
        &mut self,
        _state: &SearcherState,
        _request_id: RequestId,
    ) -> DsatResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn on_validation_completed(
        &mut self,
        _state: &SearcherState,
        request_id: RequestId,
        metric: Metrics,
        _train_length: u64,
    ) -> DsatResult<Vec<Operation>> {
        self.ctx.tracker.update_trial_metric(request_id, metric)?;
        if self.ctx.tracker.get(request_id)?.is_model_profile_info() {
            self.log_memory_model()?;
        }

        if self.ctx.tracker.has_capacity() && !self.should_shutdown() {
            let new_trials = self
                .strategy
                .trials_after_validation_completed(&mut self.ctx, request_id)?;
            self.register_trials(new_trials)?;
        }

        // every trial is closed after its single validation
        Ok(vec![Operation::Close { request_id }])
    }

    fn on_trial_exited_early(
        &mut self,
        _state: &SearcherState,
        request_id: RequestId,
        exited_reason: ExitedReason,
    ) -> DsatResult<Vec<Operation>> {
        self.ctx.tracker.report_trial_early_exit(request_id)?;

        if exited_reason != ExitedReason::Errored {
            info!(
                trial_id = %request_id,
                reason = %exited_reason,
                "shutting down: unexpected early exit"
            );
            return Ok(vec![Operation::Shutdown {
                failure: self.ctx.tracker.should_be_failure(),
            }]);
        }

        if self.ctx.tracker.has_capacity() && !self.should_shutdown() {
            let new_trials =
                self.strategy
                    .trials_after_early_exit(&mut self.ctx, request_id, exited_reason)?;
            self.register_trials(new_trials)?;
        }
        Ok(Vec::new())
    }

    fn on_trial_closed(
        &mut self,
        _state: &SearcherState,
        _request_id: RequestId,
    ) -> DsatResult<Vec<Operation>> {
        if let Some(reason) = self.shutdown_reason() {
            info!(reason = reason, "shutting down");
            if self.ctx.tracker.config().run_full_experiment {
                self.submit_best_config();
            }
            return Ok(vec![Operation::Shutdown {
                failure: self.ctx.tracker.should_be_failure(),
            }]);
        }

        let mut ops = Vec::new();
        while self.ctx.tracker.can_run_more_trials() {
            let Some(next) = self.strategy.choose_next_trial_from_queue(&mut self.ctx)? else {
                break;
            };
            self.ctx.tracker.mark_running(next)?;
            let trial = self.ctx.tracker.get(next)?;
            debug!(trial_id = %next, stage = trial.stage, mbs = trial.mbs, "dispatching trial");
            ops.extend(trial.create_and_val_ops());
        }
        Ok(ops)
    }

    fn progress(&self, state: &SearcherState) -> f64 {
        state.trials_closed.len() as f64 / self.ctx.tracker.config().max_trials as f64
    }

    fn save_method_state(&self, path: &Path) -> DsatResult<()> {
        checkpoint::save_method_state(&self.ctx, path)
    }

    fn load_method_state(&mut self, path: &Path) -> DsatResult<()> {
        self.ctx = checkpoint::load_method_state(path)?;
        info!(
            path = %path.display(),
            trials = self.ctx.tracker.len(),
            "restored searcher state from checkpoint"
        );
        Ok(())
    }
}
