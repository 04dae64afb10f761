use dsat_types::{DsatResult, ExitedReason};
use tracing::debug;

use super::{
    child_trial, choose_stage, initial_trial_count, next_search_data, random_zero_hparams,
    root_trial, scaled_ceiling,
};
use crate::method::{SearchContext, SearchStrategy};
use crate::trial::{SearchData, Trial, TrialId};

/// Exact bisection on batch size over randomly generated configurations.
///
/// Each lineage runs until its interval collapses and is then replaced by a new random
/// configuration.
#[derive(Debug, Clone)]
pub struct BinaryStrategy {
    search_range_factor: f64,
}

impl BinaryStrategy {
    pub fn new(search_range_factor: f64) -> Self {
        Self {
            search_range_factor,
        }
    }

    pub fn random_trial(&self, ctx: &mut SearchContext) -> DsatResult<Trial> {
        let stages = ctx.tracker.config().zero_stages.clone();
        let stage = choose_stage(&stages, &mut ctx.rng)?;
        let hparams = random_zero_hparams(ctx, stage)?;
        let data = SearchData::bounds(1, scaled_ceiling(ctx, stage, self.search_range_factor)?);
        root_trial(ctx, hparams, data, data.midpoint())
    }

    fn next_trial(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
        succeeded: bool,
    ) -> DsatResult<Trial> {
        match next_search_data(ctx, last, succeeded)? {
            Some(data) if !data.is_empty() => child_trial(ctx, last, data, data.midpoint()),
            _ => {
                debug!(trial_id = %last, "binary search finished, starting a new lineage");
                self.random_trial(ctx)
            }
        }
    }
}

impl SearchStrategy for BinaryStrategy {
    fn name(&self) -> &str {
        "binary"
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
        Ok(vec![self.next_trial(ctx, last, true)?])
    }

    fn trials_after_early_exit(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
        _reason: ExitedReason,
    ) -> DsatResult<Vec<Trial>> {
        Ok(vec![self.next_trial(ctx, last, false)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{metric, resolved_context, search_config};

    fn dispatch(ctx: &mut SearchContext, trial: Trial) -> TrialId {
        let id = trial.request_id;
        ctx.tracker.queue_and_register_trial(trial).unwrap();
        ctx.tracker.remove_from_queue(id);
        ctx.tracker.mark_running(id).unwrap();
        id
    }

    #[test]
    fn fresh_lineage_starts_at_midpoint_of_scaled_range() {
        let strategy = BinaryStrategy::new(0.1);
        let mut ctx = resolved_context(search_config().with_zero_stages([3]));
        let trial = strategy.random_trial(&mut ctx).unwrap();
        // 319 * 0.1
        assert_eq!(trial.search_data, Some(SearchData::bounds(1, 31)));
        assert_eq!(trial.mbs, 16);
    }

    #[test]
    fn bisection_over_one_to_fifteen() {
        let strategy = BinaryStrategy::new(1.0);
        let mut ctx = resolved_context(search_config().with_zero_stages([1]));
        let hparams = random_zero_hparams(&mut ctx, 1).unwrap();
        let root = root_trial(&ctx, hparams, SearchData::bounds(1, 15), 8).unwrap();
        let mut last = dispatch(&mut ctx, root);

        // 8 fails, 4 succeeds, 6 fails, then 5
        ctx.tracker.report_trial_early_exit(last).unwrap();
        let next = strategy
            .trials_after_early_exit(&mut ctx, last, ExitedReason::Errored)
            .unwrap()
            .remove(0);
        assert_eq!((next.search_data, next.mbs), (Some(SearchData::bounds(1, 7)), 4));
        last = dispatch(&mut ctx, next);

        ctx.tracker
            .update_trial_metric(last, metric("throughput", 4.0))
            .unwrap();
        let next = strategy
            .trials_after_validation_completed(&mut ctx, last)
            .unwrap()
            .remove(0);
        assert_eq!((next.search_data, next.mbs), (Some(SearchData::bounds(5, 7)), 6));
        last = dispatch(&mut ctx, next);

        ctx.tracker.report_trial_early_exit(last).unwrap();
        let next = strategy
            .trials_after_early_exit(&mut ctx, last, ExitedReason::Errored)
            .unwrap()
            .remove(0);
        assert_eq!((next.search_data, next.mbs), (Some(SearchData::bounds(5, 5)), 5));
        last = dispatch(&mut ctx, next);

        ctx.tracker
            .update_trial_metric(last, metric("throughput", 5.0))
            .unwrap();
        assert_eq!(ctx.tracker.num_completed_trials_in_lineage(last).unwrap(), 4);
        assert_eq!(ctx.tracker.get(ctx.tracker.best_trial().unwrap()).unwrap().mbs, 5);

        // the interval is exhausted, so the lineage is replaced
        let next = strategy
            .trials_after_validation_completed(&mut ctx, last)
            .unwrap()
            .remove(0);
        assert_eq!(next.parent, None);
    }

    #[test]
    fn validation_without_searcher_metric_still_raises_the_floor() {
        let strategy = BinaryStrategy::new(1.0);
        let mut ctx = resolved_context(search_config().with_zero_stages([1]));
        let hparams = random_zero_hparams(&mut ctx, 1).unwrap();
        let root = root_trial(&ctx, hparams, SearchData::bounds(1, 15), 8).unwrap();
        let id = dispatch(&mut ctx, root);

        // the searcher metric is throughput, so this result cannot be ranked
        ctx.tracker.update_trial_metric(id, metric("latency", 3.0)).unwrap();
        let next = strategy
            .trials_after_validation_completed(&mut ctx, id)
            .unwrap()
            .remove(0);
        assert_eq!(next.parent, Some(id));
        assert_eq!((next.search_data, next.mbs), (Some(SearchData::bounds(9, 15)), 12));
    }

    #[test]
    fn lineages_resolve_within_logarithmic_trials() {
        let strategy = BinaryStrategy::new(1.0);
        for ceiling in 1..=64u64 {
            let mut ctx = resolved_context(search_config().with_zero_stages([1]));
            let max_trials = (u64::BITS - ceiling.leading_zeros()) as usize;
            for largest_fit in 0..=ceiling {
                let hparams = random_zero_hparams(&mut ctx, 1).unwrap();
                let data = SearchData::bounds(1, ceiling);
                let mut trial = root_trial(&ctx, hparams, data, data.midpoint()).unwrap();
                let mut trials = 0;
                let mut found = 0;
                loop {
                    let mbs = trial.mbs;
                    let id = dispatch(&mut ctx, trial);
                    trials += 1;
                    let next = if mbs > largest_fit {
                        ctx.tracker.report_trial_early_exit(id).unwrap();
                        strategy.trials_after_early_exit(&mut ctx, id, ExitedReason::Errored)
                    } else {
                        found = found.max(mbs);
                        ctx.tracker
                            .update_trial_metric(id, metric("throughput", mbs as f64))
                            .unwrap();
                        strategy.trials_after_validation_completed(&mut ctx, id)
                    };
                    trial = next.unwrap().remove(0);
                    if trial.parent.is_none() {
                        break;
                    }
                }
                assert!(
                    trials <= max_trials,
                    "[1, {ceiling}] with fit {largest_fit} took {trials} trials"
                );
                assert_eq!(found, largest_fit, "[1, {ceiling}]");
            }
        }
    }

    #[test]
    fn failure_at_floor_starts_new_lineage() {
        let strategy = BinaryStrategy::new(1.0);
        let mut ctx = resolved_context(search_config());
        let hparams = random_zero_hparams(&mut ctx, 2).unwrap();
        let root = root_trial(&ctx, hparams, SearchData::bounds(1, 1), 1).unwrap();
        let id = dispatch(&mut ctx, root);
        ctx.tracker.report_trial_early_exit(id).unwrap();

        let next = strategy
            .trials_after_early_exit(&mut ctx, id, ExitedReason::Errored)
            .unwrap()
            .remove(0);
        assert_eq!(next.parent, None);
        assert_eq!(next.search_data.unwrap().lo(), 1);
    }

    #[test]
    fn profile_completion_creates_one_lineage_per_slot_group() {
        let strategy = BinaryStrategy::new(1.0);
        let mut ctx = resolved_context(search_config().with_max_slots(4));
        let profile = ctx.tracker.model_profile_info_trial().unwrap().request_id;
        let trials = strategy
            .trials_after_validation_completed(&mut ctx, profile)
            .unwrap();
        assert_eq!(trials.len(), 2);
        assert!(trials.iter().all(|trial| trial.parent.is_none()));
    }
}
