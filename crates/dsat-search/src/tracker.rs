//! Authoritative registry of every trial a search has created.

use dsat_types::hparams::{
    self, apply_overrides, autotuning_overrides, batch_config, effective_ds_config,
    model_profile_info_overrides, resolve_base_ds_config,
};
use dsat_types::{DsatError, DsatResult, HParams, Metrics, SearchConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::memory::{MemoryModel, ModelProfileInfo};
use crate::trial::{SearchData, Trial, TrialId, TrialKind};

/// Owns all trials, the dispatch queue and the aggregates derived from their results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialTracker {
    config: SearchConfig,
    slots_per_trial: usize,

    /// Hyperparameters every trial starts from, autotuning mode already injected.
    base_hparams: HParams,
    base_ds_config: Value,

    trials: HashMap<TrialId, Trial>,
    /// Registration order, used for every iteration over `trials`.
    order: Vec<TrialId>,
    queue: VecDeque<TrialId>,

    model_profile_info_trial: Option<TrialId>,
    memory_model: Option<MemoryModel>,

    successful_stages: BTreeSet<u8>,
    num_trials_since_best_result: usize,
}

impl TrialTracker {
    /// Build a tracker for the experiment described by `exp_config`, which must carry
    /// `hyperparameters` and may carry `resources.slots_per_trial`.
    pub fn new(config: SearchConfig, exp_config: &Value) -> DsatResult<Self> {
        let slots_per_trial = match exp_config
            .get("resources")
            .and_then(|resources| resources.get("slots_per_trial"))
        {
            None => 1,
            Some(value) => value.as_u64().ok_or_else(|| {
                DsatError::config("resources.slots_per_trial must be a non-negative integer")
            })? as usize,
        };
        config.validate(slots_per_trial)?;

        let mut base_hparams = exp_config
            .get("hyperparameters")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| DsatError::config("experiment config must contain `hyperparameters`"))?;
        let base_ds_config = resolve_base_ds_config(&base_hparams, config.model_dir.as_deref())?;

        apply_overrides(
            &mut base_hparams,
            &autotuning_overrides(
                config.start_profile_step,
                config.end_profile_step,
                &config.metric,
            ),
        )?;
        base_hparams.insert(hparams::USE_DSAT_MODE_KEY.to_string(), Value::Bool(true));

        Ok(Self {
            config,
            slots_per_trial,
            base_hparams,
            base_ds_config,
            trials: HashMap::new(),
            order: Vec::new(),
            queue: VecDeque::new(),
            model_profile_info_trial: None,
            memory_model: None,
            successful_stages: BTreeSet::new(),
            num_trials_since_best_result: 0,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn slots_per_trial(&self) -> usize {
        self.slots_per_trial
    }

    pub fn base_hparams(&self) -> &HParams {
        &self.base_hparams
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn contains(&self, id: TrialId) -> bool {
        self.trials.contains_key(&id)
    }

    pub fn get(&self, id: TrialId) -> DsatResult<&Trial> {
        self.trials.get(&id).ok_or(DsatError::UnknownTrial(id))
    }

    fn get_mut(&mut self, id: TrialId) -> DsatResult<&mut Trial> {
        self.trials.get_mut(&id).ok_or(DsatError::UnknownTrial(id))
    }

    /// All trials in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Trial> + '_ {
        self.order.iter().filter_map(move |id| self.trials.get(id))
    }

    /// Queued trials, front first.
    pub fn queued(&self) -> impl Iterator<Item = &Trial> + '_ {
        self.queue.iter().filter_map(move |id| self.trials.get(id))
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn model_profile_info_trial(&self) -> Option<&Trial> {
        self.model_profile_info_trial
            .and_then(|id| self.trials.get(&id))
    }

    pub fn successful_stages(&self) -> &BTreeSet<u8> {
        &self.successful_stages
    }

    pub fn num_trials_since_best_result(&self) -> usize {
        self.num_trials_since_best_result
    }

    /// Create a trial whose batch size fields agree with the slot count. The trial is
    /// neither registered nor queued.
    pub fn create_trial(
        &self,
        hparams: HParams,
        search_data: Option<SearchData>,
        parent: Option<TrialId>,
    ) -> DsatResult<Trial> {
        let lineage_root = match parent {
            Some(parent_id) => Some(self.get(parent_id)?.lineage_root),
            None => None,
        };
        // DeepSpeed exits after `end_profile_step + 1` global steps.
        self.build_trial(
            TrialKind::Autotuning,
            hparams,
            search_data,
            parent,
            lineage_root,
            self.config.end_profile_step + 1,
        )
    }

    /// Create the profiling trial and remember it as such.
    pub fn create_model_profile_info_trial(&mut self) -> DsatResult<Trial> {
        let mut hparams = self.base_hparams.clone();
        apply_overrides(&mut hparams, &model_profile_info_overrides())?;
        let trial = self.build_trial(TrialKind::ModelProfileInfo, hparams, None, None, None, 1)?;
        self.model_profile_info_trial = Some(trial.request_id);
        Ok(trial)
    }

    fn build_trial(
        &self,
        kind: TrialKind,
        mut hparams: HParams,
        search_data: Option<SearchData>,
        parent: Option<TrialId>,
        lineage_root: Option<TrialId>,
        length: u64,
    ) -> DsatResult<Trial> {
        let ds_config = effective_ds_config(&hparams, &self.base_ds_config);
        let batch = batch_config(&ds_config, self.slots_per_trial)?;
        apply_overrides(&mut hparams, &Value::Object(batch))?;

        let ds_config = effective_ds_config(&hparams, &self.base_ds_config);
        let request_id = Uuid::new_v4();
        Ok(Trial {
            request_id,
            kind,
            stage: hparams::zero_stage(&ds_config),
            mbs: hparams::micro_batch_size(&ds_config)?,
            fp16: hparams::fp16_enabled(&ds_config),
            hparams,
            ds_config,
            length,
            slots_per_trial: self.slots_per_trial,
            search_data,
            parent,
            children: Vec::new(),
            lineage_root: lineage_root.unwrap_or(request_id),
            metric: Metrics::new(),
            error: false,
            running: false,
            created_at: chrono::Utc::now(),
            finished_at: None,
        })
    }

    /// True while another trial may be registered without exceeding `max_trials`.
    pub fn has_capacity(&self) -> bool {
        self.trials.len() < self.config.max_trials
    }

    /// Register `trial`, link it under its parent and append it to the queue.
    pub fn queue_and_register_trial(&mut self, trial: Trial) -> DsatResult<()> {
        if self.trials.contains_key(&trial.request_id) {
            return Err(DsatError::Internal(format!(
                "trial {} registered twice",
                trial.request_id
            )));
        }
        if let Some(duplicate) = self
            .iter()
            .find(|other| other.completed() && other.hparams == trial.hparams)
        {
            warn!(
                trial_id = %trial.request_id,
                duplicate_of = %duplicate.request_id,
                "queueing a trial identical to a completed one"
            );
        }
        if let Some(parent_id) = trial.parent {
            self.get_mut(parent_id)?.children.push(trial.request_id);
        }

        let id = trial.request_id;
        self.trials.insert(id, trial);
        self.order.push(id);
        self.queue.push_back(id);
        Ok(())
    }

    pub fn pop_queue_front(&mut self) -> Option<TrialId> {
        self.queue.pop_front()
    }

    /// Take `id` out of the queue wherever it sits.
    pub fn remove_from_queue(&mut self, id: TrialId) -> bool {
        match self.queue.iter().position(|queued| *queued == id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Forget a trial that was never dispatched, so it does not count toward `max_trials`.
    pub fn discard_trial(&mut self, id: TrialId) -> DsatResult<()> {
        let trial = self.get(id)?;
        if trial.running || trial.completed() || !trial.children.is_empty() {
            return Err(DsatError::Internal(format!(
                "cannot discard trial {id} once it has been dispatched"
            )));
        }
        let parent = trial.parent;

        self.remove_from_queue(id);
        self.trials.remove(&id);
        self.order.retain(|other| *other != id);
        if let Some(parent_id) = parent {
            self.get_mut(parent_id)?.children.retain(|child| *child != id);
        }
        debug!(trial_id = %id, "discarded queued trial");
        Ok(())
    }

    pub fn mark_running(&mut self, id: TrialId) -> DsatResult<()> {
        self.get_mut(id)?.mark_running();
        Ok(())
    }

    /// Attach reported metrics. The profiling trial's metrics resolve the memory model;
    /// any other trial marks its stage successful and feeds the since-best counter.
    /// An empty map is rejected, since it would leave the trial unresolved.
    pub fn update_trial_metric(&mut self, id: TrialId, metric: Metrics) -> DsatResult<()> {
        let (is_profile, fp16, stage) = {
            let trial = self.get(id)?;
            (trial.is_model_profile_info(), trial.fp16, trial.stage)
        };
        if metric.is_empty() {
            return Err(DsatError::InvalidMetrics(id));
        }
        if is_profile {
            let info = ModelProfileInfo::from_metrics(&metric)?;
            self.memory_model = Some(MemoryModel::new(info, fp16, self.slots_per_trial));
            self.get_mut(id)?.mark_completed(metric);
            return Ok(());
        }

        self.get_mut(id)?.mark_completed(metric);
        self.successful_stages.insert(stage);
        if self.best_trial() == Some(id) {
            self.num_trials_since_best_result = 0;
        } else {
            self.num_trials_since_best_result += 1;
        }
        Ok(())
    }

    pub fn report_trial_early_exit(&mut self, id: TrialId) -> DsatResult<()> {
        self.get(id)?;
        // Failures only count against early stopping once there is a result to beat.
        if self.best_trial().is_some() {
            self.num_trials_since_best_result += 1;
        }
        self.get_mut(id)?.mark_failed();
        Ok(())
    }

    /// The memory model, available once the profiling trial has reported.
    pub fn memory_model(&self) -> DsatResult<&MemoryModel> {
        self.memory_model.as_ref().ok_or(DsatError::ProfileNotResolved)
    }

    pub fn approx_max_mbs(&self, stage: u8) -> DsatResult<u64> {
        Ok(self.memory_model()?.approx_max_mbs(stage))
    }

    fn best_of<'a>(&'a self, trials: impl Iterator<Item = &'a Trial>) -> Option<&'a Trial> {
        let metric = self.config.metric.as_str();
        let direction = self.config.direction;
        let mut best: Option<(&Trial, f64)> = None;
        for trial in trials {
            let Some(value) = trial.searcher_metric_val(metric) else {
                continue;
            };
            match best {
                Some((_, incumbent)) if !direction.improves(value, incumbent) => {}
                _ => best = Some((trial, value)),
            }
        }
        best.map(|(trial, _)| trial)
    }

    /// Best trial within each stage that has one.
    pub fn best_trials_by_stage(&self) -> BTreeMap<u8, TrialId> {
        (0..=3u8)
            .filter_map(|stage| {
                self.best_of(self.iter().filter(|trial| trial.stage == stage))
                    .map(|trial| (stage, trial.request_id))
            })
            .collect()
    }

    pub fn best_trial_for_stage(&self, stage: u8) -> Option<&Trial> {
        self.best_of(self.iter().filter(|trial| trial.stage == stage))
    }

    /// Best trial over all stages. Ties keep the earlier trial.
    pub fn best_trial(&self) -> Option<TrialId> {
        let by_stage = self.best_trials_by_stage();
        self.best_of(by_stage.values().filter_map(|id| self.trials.get(id)))
            .map(|trial| trial.request_id)
    }

    pub fn num_running_trials(&self) -> usize {
        self.trials.values().filter(|trial| trial.running).count()
    }

    pub fn num_completed_trials(&self) -> usize {
        self.trials.values().filter(|trial| trial.completed()).count()
    }

    /// Whether a queued trial may be dispatched under the trial, concurrency and slot caps.
    pub fn can_run_more_trials(&self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        let running = self.num_running_trials();
        if running + self.num_completed_trials() >= self.config.max_trials {
            return false;
        }
        if running >= self.config.max_concurrent_trials {
            return false;
        }
        match self.config.max_slots {
            Some(max_slots) => {
                let occupied = running * self.slots_per_trial;
                max_slots.saturating_sub(occupied) / self.slots_per_trial > 0
            }
            None => true,
        }
    }

    /// The search failed if profiling failed or no autotuning trial ever succeeded.
    pub fn should_be_failure(&self) -> bool {
        let profile_failed = self
            .model_profile_info_trial()
            .map_or(false, |trial| trial.error);
        let every_trial_failed = self
            .iter()
            .filter(|trial| trial.completed() && !trial.is_model_profile_info())
            .all(|trial| trial.error);
        profile_failed || every_trial_failed
    }

    /// Root plus all descendants of the lineage containing `id`, breadth first.
    pub fn lineage_set(&self, id: TrialId) -> DsatResult<Vec<TrialId>> {
        let root = self.get(id)?.lineage_root;
        let mut lineage = Vec::new();
        let mut frontier = VecDeque::from([root]);
        while let Some(next) = frontier.pop_front() {
            lineage.push(next);
            frontier.extend(self.get(next)?.children.iter().copied());
        }
        Ok(lineage)
    }

    pub fn num_completed_trials_in_lineage(&self, id: TrialId) -> DsatResult<usize> {
        let mut count = 0;
        for member in self.lineage_set(id)? {
            if self.get(member)?.completed() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Whether `id` or any of its ancestors errored.
    pub fn error_in_direct_history(&self, id: TrialId) -> DsatResult<bool> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let trial = self.get(current)?;
            if trial.error {
                return Ok(true);
            }
            cursor = trial.parent;
        }
        Ok(false)
    }

    /// Follow children down from `id` to the most recent trial of its branch.
    pub fn latest_trial_in_lineage(&self, id: TrialId) -> DsatResult<TrialId> {
        let mut current = id;
        while let Some(child) = self.get(current)?.children.first() {
            current = *child;
        }
        Ok(current)
    }

    /// Move every trial in the lineage of `id` up one rung.
    pub fn promote_lineage(&mut self, id: TrialId) -> DsatResult<()> {
        for member in self.lineage_set(id)? {
            if let Some(data) = self.get_mut(member)?.search_data.as_mut() {
                data.promote();
            }
        }
        Ok(())
    }

    /// Largest micro batch size which produced the searcher metric at `stage`.
    pub fn largest_successful_mbs(&self, stage: u8) -> Option<u64> {
        let metric = self.config.metric.as_str();
        self.iter()
            .filter(|trial| trial.stage == stage && trial.searcher_metric_val(metric).is_some())
            .map(|trial| trial.mbs)
            .max()
    }

    pub fn metric_value(&self, id: TrialId) -> DsatResult<Option<f64>> {
        Ok(self.get(id)?.searcher_metric_val(&self.config.metric))
    }
}
