use dsat_types::hparams::set_micro_batch_size;
use dsat_types::{DsatError, DsatResult, ExitedReason};
use rand::Rng;
use rand_distr::{Binomial, Distribution};
use std::collections::BTreeSet;
use tracing::debug;

use super::{child_trial, choose_stage, initial_trial_count, random_zero_hparams};
use crate::method::{SearchContext, SearchStrategy};
use crate::trial::{SearchData, Trial, TrialId};

/// Random search over configurations with a randomized bisection on batch size.
///
/// Lineages are cut short aggressively using results from other lineages, and the next
/// batch size is drawn around the midpoint instead of at it so concurrent lineages spread out.
#[derive(Debug, Clone)]
pub struct RandomStrategy {
    trials_per_random_config: usize,
    early_stopping: Option<usize>,
}

impl RandomStrategy {
    pub fn new(trials_per_random_config: usize, early_stopping: Option<usize>) -> Self {
        Self {
            trials_per_random_config,
            early_stopping,
        }
    }

    /// Whether the lineage of `id` cannot produce anything worth running.
    pub fn should_stop_lineage(&self, ctx: &SearchContext, id: TrialId) -> DsatResult<bool> {
        let tracker = &ctx.tracker;
        let trial = tracker.get(id)?;
        let Some(data) = trial.search_data else {
            return Ok(false);
        };

        let failed_on_min_mbs = trial.error && trial.mbs <= data.lo();
        let exceeded_trial_budget =
            tracker.num_completed_trials_in_lineage(id)? >= self.trials_per_random_config;

        // stage 3 is never preferable once stage 1 or 2 runs
        let low_stage_succeeded = tracker
            .successful_stages()
            .iter()
            .any(|stage| matches!(*stage, 1 | 2));
        let redundant_stage_three = trial.stage == 3 && low_stage_succeeded;

        let outrun_by_same_stage = tracker.error_in_direct_history(id)?
            && tracker.iter().any(|other| {
                other.stage == trial.stage
                    && other
                        .searcher_metric_val(&tracker.config().metric)
                        .is_some()
                    && other.mbs >= data.hi()
            });

        Ok(failed_on_min_mbs || exceeded_trial_budget || redundant_stage_three || outrun_by_same_stage)
    }

    fn random_mbs<R: Rng + ?Sized>(data: &SearchData, rng: &mut R) -> DsatResult<u64> {
        let spread = data.hi().saturating_sub(data.lo());
        let binomial = Binomial::new(spread, 0.5)
            .map_err(|err| DsatError::Internal(format!("invalid binomial parameters: {err}")))?;
        Ok(data.lo() + binomial.sample(rng))
    }

    /// Start a new lineage, seeded from the best trial of its stage when there is one.
    pub fn random_trial(&self, ctx: &mut SearchContext) -> DsatResult<Trial> {
        let tracker = &ctx.tracker;
        let preferred: BTreeSet<u8> = tracker
            .successful_stages()
            .iter()
            .copied()
            .filter(|stage| matches!(*stage, 1 | 2) && tracker.config().zero_stages.contains(stage))
            .collect();
        let candidates = if preferred.is_empty() {
            tracker.config().zero_stages.clone()
        } else {
            preferred
        };
        let stage = choose_stage(&candidates, &mut ctx.rng)?;

        let tracker = &ctx.tracker;
        let seeded = tracker
            .best_trial_for_stage(stage)
            .and_then(|best| best.search_data.map(|data| (best.mbs, data)));
        let data = match seeded {
            Some((best_mbs, best_data)) => {
                let lo = best_mbs + 1;
                let largest = tracker.largest_successful_mbs(stage).unwrap_or(best_mbs);
                let hi = largest.max(best_data.hi()).max(2 * lo);
                best_data.with_lo(lo).with_hi(hi)
            }
            None => SearchData::bounds(1, tracker.approx_max_mbs(stage)?),
        };

        let mut hparams = random_zero_hparams(ctx, stage)?;
        let mbs = Self::random_mbs(&data, &mut ctx.rng)?;
        set_micro_batch_size(&mut hparams, mbs)?;
        ctx.tracker.create_trial(hparams, Some(data), None)
    }

    fn trial_after_success(&self, ctx: &mut SearchContext, last: TrialId) -> DsatResult<Trial> {
        let (mbs, search_data) = {
            let trial = ctx.tracker.get(last)?;
            (trial.mbs, trial.search_data)
        };
        let data = match search_data {
            Some(data) if !self.should_stop_lineage(ctx, last)? => data,
            _ => return self.random_trial(ctx),
        };

        let mut next = data.with_lo(mbs + 1);
        // the initial ceiling estimate was too low
        if next.is_empty() {
            next = next.with_hi(next.hi() * 2);
        }
        let next_mbs = Self::random_mbs(&next, &mut ctx.rng)?;
        child_trial(ctx, last, next, next_mbs)
    }

    fn trial_after_failure(&self, ctx: &mut SearchContext, last: TrialId) -> DsatResult<Trial> {
        let (mbs, search_data) = {
            let trial = ctx.tracker.get(last)?;
            (trial.mbs, trial.search_data)
        };
        let data = match search_data {
            Some(data) if !self.should_stop_lineage(ctx, last)? => data,
            _ => {
                debug!(trial_id = %last, "stopping lineage after failure");
                return self.random_trial(ctx);
            }
        };

        let next = data.with_hi(mbs.saturating_sub(1));
        let next_mbs = Self::random_mbs(&next, &mut ctx.rng)?;
        child_trial(ctx, last, next, next_mbs)
    }
}

impl SearchStrategy for RandomStrategy {
    fn name(&self) -> &str {
        "random"
    }

    fn trials_after_validation_completed(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
    ) -> DsatResult<Vec<Trial>> {
        if ctx.tracker.get(last)?.is_model_profile_info() {
            return (0..initial_trial_count(ctx))
                .map(|_| self.random_trial(ctx))
                .collect();
        }
        Ok(vec![self.trial_after_success(ctx, last)?])
    }

    fn trials_after_early_exit(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
        _reason: ExitedReason,
    ) -> DsatResult<Vec<Trial>> {
        Ok(vec![self.trial_after_failure(ctx, last)?])
    }

    /// Replace queued trials whose lineage became pointless while they waited.
    fn choose_next_trial_from_queue(&self, ctx: &mut SearchContext) -> DsatResult<Option<TrialId>> {
        while let Some(next) = ctx.tracker.pop_queue_front() {
            if !self.should_stop_lineage(ctx, next)? {
                return Ok(Some(next));
            }
            debug!(trial_id = %next, "replacing queued trial from a stopped lineage");
            ctx.tracker.discard_trial(next)?;
            let replacement = self.random_trial(ctx)?;
            ctx.tracker.queue_and_register_trial(replacement)?;
        }
        Ok(None)
    }

    fn early_stopping_triggered(&self, ctx: &SearchContext) -> bool {
        self.early_stopping
            .map_or(false, |limit| ctx.tracker.num_trials_since_best_result() >= limit)
    }
}
